mod entry;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use mesh_dataplane_common::conntrack::{CT_KIND_NAT, ConntrackKey, ConntrackValue};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use entry::{
    ConnState, LegState, NatTranslation, Packet, TcpFlags, Timeouts, established,
};

use crate::bpf::context::{MapContext, Table};
use crate::bpf::{SharedBpfMap, SharedKernelMap, SweepStats};
use crate::clock::Clock;
use crate::metrics::SWEEP_METRICS;
use crate::Result;

const SWEEP_BATCH: usize = 4096;

pub type ConntrackMap = SharedKernelMap<ConntrackKey, ConntrackValue>;
pub type KernelConntrackTable<C> = ConntrackTable<ConntrackMap, C>;

pub fn load_map(ctx: &MapContext) -> Result<ConntrackMap> {
    info!("loading conntrack map");
    ctx.open_shared_hash(Table::Conntrack)
}

/// Outcome of comparing the interface a packet arrived on with the one
/// recorded for its direction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rpf {
    Match,
    Mismatch { expected: u32 },
    /// No interface recorded yet for that direction
    Unknown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Observation {
    pub created: bool,
    pub rpf: Rpf,
}

/// Per-flow state shared with the packet path. All writes are single
/// record updates so the sweep never holds up traffic.
pub struct ConntrackTable<M, C>
where
    M: SharedBpfMap<Key = ConntrackKey, Value = ConntrackValue>,
    C: Clock,
{
    map: M,
    clock: C,
    timeouts: Timeouts,
}

impl<M, C> ConntrackTable<M, C>
where
    M: SharedBpfMap<Key = ConntrackKey, Value = ConntrackValue>,
    C: Clock,
{
    pub fn new(map: M, clock: C, timeouts: Timeouts) -> Self {
        Self {
            map,
            clock,
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Records a packet the way the packet processor does: creates the
    /// entry on the first packet and updates the direction's leg after.
    /// The whole read-modify-write happens under the record's lock.
    pub fn record_packet(&self, pkt: &Packet, nat: Option<NatTranslation>) -> Result<Observation> {
        let key = pkt.key();
        let a_to_b = key.is_a_to_b(pkt.src.ip().to_bits(), pkt.src.port());
        let now = self.clock.now_ns()?;
        let mut rpf = Rpf::Unknown;
        let created = self.map.upsert(key, &mut |current| {
            let mut value = match current {
                Some(v) => *v,
                None => new_entry(now, nat),
            };
            rpf = rpf_of(&value, a_to_b, pkt.ifindex);
            entry::apply_packet(&mut value, pkt, a_to_b, current.is_none(), now);
            value
        })?;
        Ok(Observation { created, rpf })
    }

    pub fn get(&self, key: &ConntrackKey) -> Result<Option<ConntrackValue>> {
        self.map.get(key)
    }

    /// Checks the interface a packet from `src:src_port` arrived on against
    /// the one recorded for that direction. Only reports; dropping is up
    /// to the packet processor.
    pub fn rpf_check(&self, key: &ConntrackKey, src: Ipv4Addr, src_port: u16, ifindex: u32) -> Result<Rpf> {
        let Some(value) = self.map.get(key)? else {
            return Ok(Rpf::Unknown);
        };
        Ok(rpf_of(&value, key.is_a_to_b(src.to_bits(), src_port), ifindex))
    }

    /// Removes the expired entries among `keys`. Each removal re-reads the
    /// record, so an entry refreshed since the scan started survives.
    pub fn sweep_keys(&self, keys: &[ConntrackKey]) -> Result<SweepStats> {
        let now = self.clock.now_ns()?;
        let mut stats = SweepStats::default();
        for key in keys {
            stats.scanned += 1;
            if self
                .map
                .remove_if(key, &|v| self.timeouts.is_expired(key, v, now))?
            {
                stats.removed += 1;
            }
        }
        Ok(stats)
    }

    /// Full pass over the table in batches, stopping early on cancellation.
    pub fn sweep(&self, cancel: &CancellationToken) -> Result<SweepStats> {
        let keys = self.map.keys()?;
        let mut stats = SweepStats::default();
        for batch in keys.chunks(SWEEP_BATCH) {
            if cancel.is_cancelled() {
                stats.interrupted = true;
                break;
            }
            let s = self.sweep_keys(batch)?;
            stats.scanned += s.scanned;
            stats.removed += s.removed;
        }
        Ok(stats)
    }

    /// Inserts established flows derived from `template` until the table
    /// reports it is full. Returns how many were added.
    pub fn fill(&self, template: &ConntrackKey) -> Result<usize> {
        let now = self.clock.now_ns()?;
        let value = established(now, 0);
        let mut added = 0usize;
        let mut offset: u64 = 0;
        while added < self.map.max_entries() as usize {
            let port = (offset % 65535) as u16 + 1;
            let addr = template.addr_b.wrapping_add((offset / 65535) as u32);
            offset += 1;
            let key = ConntrackKey::new(template.protocol, template.addr_a, port, addr, template.port_b);
            if self.map.get(&key)?.is_some() {
                continue;
            }
            match self.map.update(key, value) {
                Ok(()) => added += 1,
                Err(e) if e.is_capacity() => break,
                Err(e) => return Err(e),
            }
        }
        debug!(added, "filled conntrack table");
        Ok(added)
    }

    /// Removes every entry.
    pub fn flush(&self) -> Result<usize> {
        self.map.clear()
    }

    pub fn dump(&self) -> Result<Vec<(ConntrackKey, ConntrackValue)>> {
        let mut entries: Vec<_> = self.map.get_state()?.into_iter().collect();
        entries.sort_by_key(|(k, _)| *k);
        Ok(entries)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.map.keys()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn now_ns(&self) -> Result<u64> {
        self.clock.now_ns()
    }
}

fn new_entry(now: u64, nat: Option<NatTranslation>) -> ConntrackValue {
    let mut v = ConntrackValue {
        created_ns: now,
        ..Default::default()
    };
    if let Some(nat) = nat {
        v.kind = CT_KIND_NAT;
        v.orig_ip = nat.orig.ip().to_bits();
        v.orig_port = nat.orig.port();
        v.xlated_ip = nat.xlated.ip().to_bits();
        v.xlated_port = nat.xlated.port();
    }
    v
}

fn rpf_of(value: &ConntrackValue, a_to_b: bool, ifindex: u32) -> Rpf {
    let leg = if a_to_b { &value.a_to_b } else { &value.b_to_a };
    match leg.ifindex {
        0 => Rpf::Unknown,
        i if i == ifindex => Rpf::Match,
        expected => Rpf::Mismatch { expected },
    }
}

/// Ages out idle entries every `scan_period` until cancelled.
pub async fn run_sweeper<M, C>(
    table: Arc<ConntrackTable<M, C>>,
    scan_period: Duration,
    cancel: CancellationToken,
) -> Result<()>
where
    M: SharedBpfMap<Key = ConntrackKey, Value = ConntrackValue>,
    C: Clock,
{
    info!("starting conntrack sweep task");
    let mut ticker = interval(scan_period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match table.sweep(&cancel) {
                    Ok(stats) => {
                        let remaining = table.len().unwrap_or_default();
                        SWEEP_METRICS.record("conntrack", stats.removed, remaining);
                    }
                    Err(e) => error!(%e, "error sweeping conntrack"),
                }
            }
        }
    }

    Ok(())
}
