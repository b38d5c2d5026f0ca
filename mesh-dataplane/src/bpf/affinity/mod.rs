use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use mesh_dataplane_common::affinity::{AffinityKey, AffinityValue};
use mesh_dataplane_common::service::{BackendKey, BackendValue, FrontendKey, FrontendValue};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bpf::context::{MapContext, Table};
use crate::bpf::service::{
    Affinity, BackendSelector, Flow, NatState, ServiceFlags, ServiceKey, ServiceRecord,
    SourceRangeKey,
};
use crate::bpf::{BpfMap, SharedBpfMap, SharedKernelMap, SweepStats};
use crate::clock::Clock;
use crate::metrics::SWEEP_METRICS;
use crate::{Error, Result};

const SWEEP_BATCH: usize = 1024;

pub type AffinityMap = SharedKernelMap<AffinityKey, AffinityValue>;
pub type KernelAffinityTable<C> = AffinityTable<AffinityMap, C>;

pub fn load_map(ctx: &MapContext) -> Result<AffinityMap> {
    info!("loading affinity map");
    ctx.open_shared_hash(Table::Affinity)
}

/// Read access to the frontend table needed to validate and assign sticky
/// backends.
pub trait ServiceLookup: Send + Sync {
    fn lookup(&self, key: &ServiceKey) -> Result<Option<ServiceRecord>>;
    fn select(
        &self,
        flow: &Flow,
        selector: &dyn BackendSelector,
        external: bool,
    ) -> Result<BackendKey>;
}

impl<F, B, S> ServiceLookup for NatState<F, B, S>
where
    F: BpfMap<Key = FrontendKey, Value = FrontendValue> + Send,
    B: BpfMap<Key = BackendKey, Value = BackendValue> + Send,
    S: BpfMap<Key = SourceRangeKey, Value = u32> + Send,
{
    fn lookup(&self, key: &ServiceKey) -> Result<Option<ServiceRecord>> {
        Ok(self.lock()?.lookup(key))
    }

    fn select(
        &self,
        flow: &Flow,
        selector: &dyn BackendSelector,
        external: bool,
    ) -> Result<BackendKey> {
        self.lock()?.select(flow, selector, external)
    }
}

/// Sticky client to backend assignments.
pub struct AffinityTable<M, C>
where
    M: SharedBpfMap<Key = AffinityKey, Value = AffinityValue>,
    C: Clock,
{
    map: M,
    clock: C,
}

impl<M, C> AffinityTable<M, C>
where
    M: SharedBpfMap<Key = AffinityKey, Value = AffinityValue>,
    C: Clock,
{
    pub fn new(map: M, clock: C) -> Self {
        Self { map, clock }
    }

    /// Returns the client's sticky backend for `flow.service`, assigning a
    /// new one through `selector` when there is no valid entry. A hit
    /// refreshes the entry's timestamp.
    pub fn get_or_assign(
        &self,
        flow: &Flow,
        services: &dyn ServiceLookup,
        selector: &dyn BackendSelector,
        external: bool,
    ) -> Result<BackendKey> {
        let record = services
            .lookup(&flow.service)?
            .ok_or(Error::NoService(flow.service))?;
        let Affinity::ClientIp { timeout } = record.flags.affinity else {
            return services.select(flow, selector, external);
        };

        let key = affinity_key(flow.src, &flow.service);
        let now = self.clock.now_ns()?;
        if let Some(current) = self.map.get(&key)?
            && is_valid(&current, &record, now, timeout, external)
        {
            self.map.update(
                key,
                AffinityValue {
                    ts_ns: now,
                    ..current
                },
            )?;
            return Ok(BackendKey {
                id: current.id,
                ordinal: current.ordinal,
            });
        }

        let backend = services.select(flow, selector, external)?;
        self.map.update(
            key,
            AffinityValue {
                ts_ns: now,
                id: backend.id,
                ordinal: backend.ordinal,
            },
        )?;
        debug!(service = %flow.service, client = %flow.src, ordinal = backend.ordinal, "assigned sticky backend");
        Ok(backend)
    }

    /// Drops every entry for `service`.
    pub fn invalidate(&self, service: &ServiceKey) -> Result<usize> {
        let frontend = FrontendKey::from(*service);
        let mut removed = 0;
        for key in self.map.keys()? {
            if key.frontend == frontend && self.map.remove_if(&key, &|_| true)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn delete(&self, client: Ipv4Addr, service: &ServiceKey) -> Result<()> {
        self.map.delete(&affinity_key(client, service))
    }

    /// Removes entries among `keys` that are past their service's timeout,
    /// that point at a replaced backend group, or whose service is gone.
    /// Each removal re-checks the record so a concurrent refresh wins.
    pub fn sweep_keys(&self, keys: &[AffinityKey], services: &dyn ServiceLookup) -> Result<SweepStats> {
        let now = self.clock.now_ns()?;
        let mut stats = SweepStats::default();
        for key in keys {
            stats.scanned += 1;
            let record = match ServiceKey::try_from(key.frontend) {
                Ok(service) => services.lookup(&service)?,
                Err(_) => None,
            };
            let expired = |v: &AffinityValue| match &record {
                Some(ServiceRecord {
                    id,
                    flags:
                        ServiceFlags {
                            affinity: Affinity::ClientIp { timeout },
                            ..
                        },
                    ..
                }) => v.id != *id || now.saturating_sub(v.ts_ns) > timeout.as_nanos() as u64,
                _ => true,
            };
            if self.map.remove_if(key, &expired)? {
                stats.removed += 1;
            }
        }
        Ok(stats)
    }

    pub fn sweep(&self, services: &dyn ServiceLookup, cancel: &CancellationToken) -> Result<SweepStats> {
        let keys = self.map.keys()?;
        let mut stats = SweepStats::default();
        for batch in keys.chunks(SWEEP_BATCH) {
            if cancel.is_cancelled() {
                stats.interrupted = true;
                break;
            }
            let s = self.sweep_keys(batch, services)?;
            stats.scanned += s.scanned;
            stats.removed += s.removed;
        }
        Ok(stats)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.map.keys()?.len())
    }

    pub fn dump(&self) -> Result<Vec<(AffinityKey, AffinityValue)>> {
        let mut entries: Vec<_> = self.map.get_state()?.into_iter().collect();
        entries.sort_by_key(|(k, _)| *k);
        Ok(entries)
    }
}

fn affinity_key(client: Ipv4Addr, service: &ServiceKey) -> AffinityKey {
    AffinityKey {
        client_ip: client.to_bits(),
        frontend: FrontendKey::from(*service),
    }
}

fn is_valid(
    value: &AffinityValue,
    record: &ServiceRecord,
    now: u64,
    timeout: Duration,
    external: bool,
) -> bool {
    value.id == record.id
        && value.ordinal < record.candidates(external)
        && now.saturating_sub(value.ts_ns) <= timeout.as_nanos() as u64
}

pub async fn run_sweeper<M, C>(
    table: Arc<AffinityTable<M, C>>,
    services: Arc<dyn ServiceLookup>,
    period: Duration,
    cancel: CancellationToken,
) -> Result<()>
where
    M: SharedBpfMap<Key = AffinityKey, Value = AffinityValue>,
    C: Clock,
{
    info!("starting affinity sweep task");
    let mut ticker = interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match table.sweep(services.as_ref(), &cancel) {
                    Ok(stats) => {
                        let remaining = table.len().unwrap_or_default();
                        SWEEP_METRICS.record("affinity", stats.removed, remaining);
                    }
                    Err(e) => error!(%e, "error sweeping affinity table"),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use mesh_dataplane_common::Protocol;

    use super::*;
    use crate::bpf::MemMap;
    use crate::bpf::service::state::test::{MemNatTable, backends, new_nat_table};
    use crate::bpf::service::{FixedOrdinal, RandomSelector};
    use crate::clock::ManualClock;

    type MemNatState = NatState<
        MemMap<FrontendKey, FrontendValue>,
        MemMap<BackendKey, BackendValue>,
        MemMap<SourceRangeKey, u32>,
    >;

    fn service() -> ServiceKey {
        ServiceKey::new(Ipv4Addr::new(10, 101, 0, 20), 80, Protocol::Tcp)
    }

    type MemAffinityTable = AffinityTable<MemMap<AffinityKey, AffinityValue>, ManualClock>;

    fn setup(timeout: u64) -> (MemNatState, MemAffinityTable, ManualClock) {
        let mut table: MemNatTable = new_nat_table(64);
        let flags = ServiceFlags {
            affinity: Affinity::ClientIp {
                timeout: Duration::from_secs(timeout),
            },
            ..Default::default()
        };
        table.upsert(service(), &backends(4), flags).unwrap();
        let clock = ManualClock::new(1_000_000_000);
        let affinity = AffinityTable::new(MemMap::new("affinity", 16), clock.clone());
        (NatState::new(table), affinity, clock)
    }

    fn flow(port: u16) -> Flow {
        Flow::new(Ipv4Addr::new(10, 65, 2, 2), port, service())
    }

    #[test]
    fn test_sticky_within_timeout() -> crate::Result<()> {
        let (nat, affinity, clock) = setup(60);
        let first = affinity.get_or_assign(&flow(1000), &nat, &RandomSelector, false)?;
        for port in 1001..1050 {
            clock.advance(Duration::from_secs(30));
            // sliding expiry keeps the entry alive well past one timeout
            let next = affinity.get_or_assign(&flow(port), &nat, &RandomSelector, false)?;
            assert_eq!(next, first);
        }
        assert_eq!(affinity.dump()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_expired_entry_is_reassigned() -> crate::Result<()> {
        let (nat, affinity, clock) = setup(60);
        let first = affinity.get_or_assign(&flow(1000), &nat, &FixedOrdinal(1), false)?;
        assert_eq!(first.ordinal, 1);
        clock.advance(Duration::from_secs(61));
        let next = affinity.get_or_assign(&flow(1000), &nat, &FixedOrdinal(2), false)?;
        assert_eq!(next.ordinal, 2);
        Ok(())
    }

    #[test]
    fn test_replaced_group_invalidates_entry() -> crate::Result<()> {
        let (nat, affinity, _clock) = setup(60);
        let first = affinity.get_or_assign(&flow(1000), &nat, &FixedOrdinal(0), false)?;
        let flags = nat.lock()?.lookup(&service()).unwrap().flags;
        nat.lock()?.upsert(service(), &backends(2), flags)?;
        let next = affinity.get_or_assign(&flow(1000), &nat, &FixedOrdinal(0), false)?;
        assert_ne!(first.id, next.id);
        Ok(())
    }

    #[test]
    fn test_deleted_entry_allows_new_pick() -> crate::Result<()> {
        let (nat, affinity, _clock) = setup(60);
        affinity.get_or_assign(&flow(1000), &nat, &FixedOrdinal(0), false)?;
        affinity.delete(flow(1000).src, &service())?;
        let next = affinity.get_or_assign(&flow(1000), &nat, &FixedOrdinal(3), false)?;
        assert_eq!(next.ordinal, 3);
        Ok(())
    }

    #[test]
    fn test_sweep_and_invalidate() -> crate::Result<()> {
        let (nat, affinity, clock) = setup(60);
        affinity.get_or_assign(&flow(1000), &nat, &FixedOrdinal(0), false)?;
        let other = Flow::new(Ipv4Addr::new(10, 65, 2, 3), 1000, service());
        affinity.get_or_assign(&other, &nat, &FixedOrdinal(0), false)?;

        let cancel = CancellationToken::new();
        assert_eq!(affinity.sweep(&nat, &cancel)?.removed, 0);
        clock.advance(Duration::from_secs(61));
        affinity.get_or_assign(&other, &nat, &FixedOrdinal(0), false)?;
        let stats = affinity.sweep(&nat, &cancel)?;
        assert_eq!((stats.scanned, stats.removed), (2, 1));

        assert_eq!(affinity.invalidate(&service())?, 1);
        assert!(affinity.dump()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_sweep_removes_entries_of_deleted_service() -> crate::Result<()> {
        let (nat, affinity, _clock) = setup(60);
        affinity.get_or_assign(&flow(1000), &nat, &FixedOrdinal(0), false)?;
        nat.lock()?.delete(&service())?;
        let stats = affinity.sweep(&nat, &CancellationToken::new())?;
        assert_eq!(stats.removed, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_removes_expired_entry() -> crate::Result<()> {
        let (nat, affinity, clock) = setup(60);
        affinity.get_or_assign(&flow(1000), &nat, &FixedOrdinal(0), false)?;
        let affinity = Arc::new(affinity);
        let cancel = CancellationToken::new();
        let period = Duration::from_secs(10);
        let handle = tokio::spawn(run_sweeper(
            affinity.clone(),
            Arc::new(nat),
            period,
            cancel.clone(),
        ));

        tokio::time::sleep(period * 2).await;
        assert_eq!(affinity.len()?, 1);
        clock.advance(Duration::from_secs(61));
        tokio::time::sleep(period * 2).await;
        assert_eq!(affinity.len()?, 0);

        cancel.cancel();
        handle.await.unwrap()?;
        Ok(())
    }

    #[test]
    fn test_cancelled_sweep_stops() -> crate::Result<()> {
        let (nat, affinity, _clock) = setup(60);
        affinity.get_or_assign(&flow(1000), &nat, &FixedOrdinal(0), false)?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = affinity.sweep(&nat, &cancel)?;
        assert!(stats.interrupted);
        assert_eq!(stats.removed, 0);
        Ok(())
    }
}
