use std::sync::{Arc, Mutex, MutexGuard};

use ipnetwork::Ipv4Network;
use mesh_dataplane_common::Id;
use mesh_dataplane_common::service::{BackendKey, BackendValue, FrontendKey, FrontendValue};
use tracing::{debug, warn};

use crate::bpf::service::{
    Backend, BackendSelector, Flow, ServiceFlags, ServiceKey, SourceRangeKey, SourceRanges,
    TrafficPolicy,
};
use crate::bpf::{BpfMap, BpfState};
use crate::metrics::NAT_METRICS;
use crate::{Error, Result};

const FIRST_ID: Id = 128;

/// What a frontend key currently resolves to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceRecord {
    pub id: Id,
    pub count: u32,
    pub local_count: u32,
    pub flags: ServiceFlags,
}

impl ServiceRecord {
    /// Ordinals eligible for a packet. Local-only services restrict
    /// external traffic to the local prefix of the backend list.
    pub fn candidates(&self, external: bool) -> u32 {
        if external && self.flags.traffic_policy == TrafficPolicy::Local {
            self.local_count
        } else {
            self.count
        }
    }
}

/// Frontend, backend and source-range tables kept consistent with each
/// other. A frontend only ever points at a fully written backend group.
pub struct NatTable<F, B, S>
where
    F: BpfMap<Key = FrontendKey, Value = FrontendValue>,
    B: BpfMap<Key = BackendKey, Value = BackendValue>,
    S: BpfMap<Key = SourceRangeKey, Value = u32>,
{
    frontends: BpfState<F>,
    backends: B,
    ranges: S,
    backend_cache: ahash::HashMap<Id, Vec<BackendValue>>,
    range_cache: ahash::HashMap<Id, Vec<Ipv4Network>>,
    /// Groups whose frontend is gone but whose entries could not be removed yet.
    orphans: ahash::HashMap<Id, (u32, Vec<Ipv4Network>)>,
    next_id: Id,
}

impl<F, B, S> NatTable<F, B, S>
where
    F: BpfMap<Key = FrontendKey, Value = FrontendValue>,
    B: BpfMap<Key = BackendKey, Value = BackendValue>,
    S: BpfMap<Key = SourceRangeKey, Value = u32>,
{
    /// Builds the table view from the current map contents. Backend groups
    /// no frontend references are queued for collection.
    pub fn load(frontends: F, backends: B, ranges: S) -> Result<Self> {
        let frontends = BpfState::load(frontends)?;
        let live: ahash::HashMap<Id, u32> = frontends
            .cache()
            .values()
            .map(|v| (v.id, v.count))
            .collect();

        let mut grouped: ahash::HashMap<Id, Vec<(u32, BackendValue)>> = Default::default();
        for (key, value) in backends.get_state()? {
            grouped.entry(key.id).or_default().push((key.ordinal, value));
        }
        let mut range_cache: ahash::HashMap<Id, Vec<Ipv4Network>> = Default::default();
        for key in ranges.get_state()?.into_keys() {
            range_cache.entry(key.id).or_default().push(key.net);
        }

        let mut backend_cache = ahash::HashMap::default();
        let mut orphans = ahash::HashMap::default();
        for (id, mut entries) in grouped {
            entries.sort_by_key(|(ordinal, _)| *ordinal);
            if live.contains_key(&id) {
                backend_cache.insert(id, entries.into_iter().map(|(_, v)| v).collect());
            } else {
                let count = entries.last().map(|(o, _)| o + 1).unwrap_or(0);
                orphans.insert(id, (count, range_cache.remove(&id).unwrap_or_default()));
            }
        }
        range_cache.retain(|id, nets| {
            if live.contains_key(id) {
                nets.sort();
                true
            } else {
                orphans
                    .entry(*id)
                    .or_insert_with(|| (0, Vec::new()))
                    .1
                    .append(nets);
                false
            }
        });
        // a frontend with zero backends still owns its id
        for (id, _) in live.iter() {
            backend_cache.entry(*id).or_default();
        }
        let next_id = live
            .keys()
            .chain(orphans.keys())
            .max()
            .map(|id| id.wrapping_add(1).max(FIRST_ID))
            .unwrap_or(FIRST_ID);

        Ok(Self {
            frontends,
            backends,
            ranges,
            backend_cache,
            range_cache,
            orphans,
            next_id,
        })
    }

    /// Points `key` at a freshly written backend group. The old group is
    /// removed only after the frontend has been swapped over. Re-submitting
    /// identical backends and flags leaves the table untouched.
    pub fn upsert(&mut self, key: ServiceKey, backends: &[Backend], flags: ServiceFlags) -> Result<Id> {
        let mut ordered = backends.to_vec();
        // local backends first so that local-only traffic can use a prefix
        ordered.sort_by_key(|b| !b.local);
        let local_count = ordered.iter().filter(|b| b.local).count();
        let values: Vec<BackendValue> = ordered.iter().map(BackendValue::from).collect();
        let count =
            u32::try_from(values.len()).map_err(|e| Error::ConversionError(e.to_string()))?;
        let local_count =
            u32::try_from(local_count).map_err(|e| Error::ConversionError(e.to_string()))?;
        let mut nets = match &flags.source_ranges {
            SourceRanges::Any => Vec::new(),
            SourceRanges::Only(nets) => nets.clone(),
        };
        nets.sort();
        nets.dedup();
        let flags = ServiceFlags {
            source_ranges: if nets.is_empty() {
                SourceRanges::Any
            } else {
                SourceRanges::Only(nets.clone())
            },
            ..flags
        };

        let fkey = FrontendKey::from(key);
        let previous = self.frontends.get_from_cache(&fkey).copied();
        if let Some(current) = previous
            && current.local_count == local_count
            && self.backend_cache.get(&current.id) == Some(&values)
            && ServiceFlags::from_value(&current, self.range_cache.get(&current.id)) == flags
        {
            return Ok(current.id);
        }

        let id = self.allocate_id()?;
        self.write_group(id, &values, &nets)?;

        let value = FrontendValue {
            id,
            count,
            local_count,
            flags: flags.bits(),
            affinity_timeout_s: flags.affinity_timeout_s(),
        };
        if let Err(e) = self.frontends.update(fkey, value) {
            self.discard_group(id, count, &nets);
            return Err(e);
        }
        debug!(%key, id, count, "updated frontend");
        self.backend_cache.insert(id, values);
        if !nets.is_empty() {
            self.range_cache.insert(id, nets);
        }
        NAT_METRICS.upserts.inc();

        if let Some(previous) = previous {
            self.release_group(previous.id);
        }
        Ok(id)
    }

    /// Removes the frontend first and its backend group afterwards.
    pub fn delete(&mut self, key: &ServiceKey) -> Result<Option<ServiceRecord>> {
        let fkey = FrontendKey::from(*key);
        let Some(current) = self.frontends.get_from_cache(&fkey).copied() else {
            return Ok(None);
        };
        let record = self.record(&current);
        self.frontends.delete(&fkey)?;
        self.release_group(current.id);
        NAT_METRICS.deletes.inc();
        Ok(Some(record))
    }

    pub fn lookup(&self, key: &ServiceKey) -> Option<ServiceRecord> {
        self.frontends
            .get_from_cache(&FrontendKey::from(*key))
            .map(|v| self.record(v))
    }

    pub fn keys(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self
            .frontends
            .cache()
            .keys()
            .filter_map(|k| ServiceKey::try_from(*k).ok())
            .collect();
        keys.sort();
        keys
    }

    pub fn backend(&self, id: Id, ordinal: u32) -> Result<BackendValue> {
        let group = self
            .backend_cache
            .get(&id)
            .ok_or(Error::UnknownBackendGroup(id))?;
        group.get(ordinal as usize).copied().ok_or_else(|| {
            Error::InconsistentUpdate(format!(
                "ordinal {ordinal} out of range for group {id} with {} backends",
                group.len()
            ))
        })
    }

    pub fn backends(&self, id: Id) -> Option<&[BackendValue]> {
        self.backend_cache.get(&id).map(|v| v.as_slice())
    }

    /// Picks a backend for `flow` with the given policy.
    pub fn select(
        &self,
        flow: &Flow,
        selector: &dyn BackendSelector,
        external: bool,
    ) -> Result<BackendKey> {
        let record = self.lookup(&flow.service).ok_or(Error::NoService(flow.service))?;
        let candidates = record.candidates(external);
        if candidates == 0 {
            return Err(Error::NoBackends(flow.service));
        }
        let ordinal = selector.select(flow, candidates);
        if ordinal >= candidates {
            return Err(Error::InconsistentUpdate(format!(
                "selector returned ordinal {ordinal} of {candidates}"
            )));
        }
        Ok(BackendKey {
            id: record.id,
            ordinal,
        })
    }

    /// Retries removal of backend groups left behind by failed deletes or by
    /// a previous instance. Returns how many groups were fully removed.
    pub fn gc(&mut self) -> Result<usize> {
        let pending: Vec<(Id, (u32, Vec<Ipv4Network>))> = self.orphans.drain().collect();
        let mut collected = 0;
        for (id, (count, nets)) in pending {
            match self.delete_group_entries(id, count, &nets) {
                Ok(()) => collected += 1,
                Err(e) => {
                    warn!(%e, id, "failed to collect backend group");
                    self.orphans.insert(id, (count, nets));
                }
            }
        }
        Ok(collected)
    }

    pub fn pending_orphans(&self) -> usize {
        self.orphans.len()
    }

    /// Reads the kernel tables back and checks that every frontend resolves
    /// to a complete backend group and no unowned group is reachable.
    pub fn verify(&self) -> Result<()> {
        let frontends = self.frontends.map().get_state()?;
        let backends = self.backends.get_state()?;
        for (key, value) in frontends.iter() {
            for ordinal in 0..value.count {
                if !backends.contains_key(&BackendKey {
                    id: value.id,
                    ordinal,
                }) {
                    return Err(Error::InconsistentUpdate(format!(
                        "frontend {key:?} is missing ordinal {ordinal} of group {}",
                        value.id
                    )));
                }
            }
        }
        for key in backends.keys() {
            let owned = frontends
                .values()
                .any(|v| v.id == key.id && key.ordinal < v.count);
            if !owned && !self.orphans.contains_key(&key.id) {
                return Err(Error::InconsistentUpdate(format!(
                    "backend {key:?} has no frontend"
                )));
            }
        }
        Ok(())
    }

    fn record(&self, value: &FrontendValue) -> ServiceRecord {
        ServiceRecord {
            id: value.id,
            count: value.count,
            local_count: value.local_count,
            flags: ServiceFlags::from_value(value, self.range_cache.get(&value.id)),
        }
    }

    fn allocate_id(&mut self) -> Result<Id> {
        let start = self.next_id;
        loop {
            let id = self.next_id;
            self.next_id = match self.next_id.wrapping_add(1) {
                0 => FIRST_ID,
                next => next,
            };
            if !self.backend_cache.contains_key(&id) && !self.orphans.contains_key(&id) {
                return Ok(id);
            }
            if self.next_id == start {
                return Err(Error::Other("backend group ids exhausted".into()));
            }
        }
    }

    /// Writes ordinals `0..values.len()` and the source ranges of group `id`.
    /// Anything written is removed again if a write fails.
    fn write_group(&mut self, id: Id, values: &[BackendValue], nets: &[Ipv4Network]) -> Result<()> {
        for (ordinal, value) in values.iter().enumerate() {
            let key = BackendKey {
                id,
                ordinal: ordinal as u32,
            };
            if let Err(e) = self.backends.update(key, *value) {
                self.discard_group(id, ordinal as u32, &[]);
                return Err(e);
            }
        }
        for (i, net) in nets.iter().enumerate() {
            if let Err(e) = self.ranges.update(SourceRangeKey { id, net: *net }, 1) {
                self.discard_group(id, values.len() as u32, &nets[..i]);
                return Err(e);
            }
        }
        Ok(())
    }

    fn discard_group(&mut self, id: Id, count: u32, nets: &[Ipv4Network]) {
        if let Err(e) = self.delete_group_entries(id, count, nets) {
            warn!(%e, id, "failed to roll back backend group, queued for collection");
            self.orphans.insert(id, (count, nets.to_vec()));
        }
    }

    fn release_group(&mut self, id: Id) {
        let count = self
            .backend_cache
            .remove(&id)
            .map(|v| v.len() as u32)
            .unwrap_or(0);
        let nets = self.range_cache.remove(&id).unwrap_or_default();
        if let Err(e) = self.delete_group_entries(id, count, &nets) {
            warn!(%e, id, "failed to delete backend group, queued for collection");
            self.orphans.insert(id, (count, nets));
        }
    }

    fn delete_group_entries(&mut self, id: Id, count: u32, nets: &[Ipv4Network]) -> Result<()> {
        for net in nets {
            self.ranges.delete(&SourceRangeKey { id, net: *net })?;
        }
        for ordinal in 0..count {
            self.backends.delete(&BackendKey { id, ordinal })?;
        }
        Ok(())
    }
}

/// Shared handle to a NAT table. One writer at a time per table; other
/// tables are independent.
pub struct NatState<F, B, S>
where
    F: BpfMap<Key = FrontendKey, Value = FrontendValue>,
    B: BpfMap<Key = BackendKey, Value = BackendValue>,
    S: BpfMap<Key = SourceRangeKey, Value = u32>,
{
    inner: Arc<Mutex<NatTable<F, B, S>>>,
}

impl<F, B, S> Clone for NatState<F, B, S>
where
    F: BpfMap<Key = FrontendKey, Value = FrontendValue>,
    B: BpfMap<Key = BackendKey, Value = BackendValue>,
    S: BpfMap<Key = SourceRangeKey, Value = u32>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F, B, S> NatState<F, B, S>
where
    F: BpfMap<Key = FrontendKey, Value = FrontendValue>,
    B: BpfMap<Key = BackendKey, Value = BackendValue>,
    S: BpfMap<Key = SourceRangeKey, Value = u32>,
{
    pub fn new(table: NatTable<F, B, S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(table)),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, NatTable<F, B, S>>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("nat table lock poisoned".into()))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::net::Ipv4Addr;

    use mesh_dataplane_common::Protocol;

    use super::*;
    use crate::bpf::MemMap;
    use crate::bpf::service::FixedOrdinal;

    pub(crate) type MemNatTable = NatTable<
        MemMap<FrontendKey, FrontendValue>,
        MemMap<BackendKey, BackendValue>,
        MemMap<SourceRangeKey, u32>,
    >;

    pub(crate) fn new_nat_table(backend_size: u32) -> MemNatTable {
        NatTable::load(
            MemMap::new("nat_fe", 64),
            MemMap::new("nat_be", backend_size),
            MemMap::new("nat_srcs", 64),
        )
        .unwrap()
    }

    pub(crate) fn backends(n: u8) -> Vec<Backend> {
        (0..n)
            .map(|i| Backend::new(Ipv4Addr::new(10, 65, 0, 10 + i), 8080, false))
            .collect()
    }

    fn key() -> ServiceKey {
        ServiceKey::new(Ipv4Addr::new(10, 101, 0, 10), 80, Protocol::Tcp)
    }

    #[test]
    fn test_upsert_writes_full_group() -> crate::Result<()> {
        let mut table = new_nat_table(64);
        let id = table.upsert(key(), &backends(3), ServiceFlags::default())?;
        let record = table.lookup(&key()).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.count, 3);
        for ordinal in 0..3 {
            table.backend(id, ordinal)?;
        }
        table.verify()?;
        Ok(())
    }

    #[test]
    fn test_update_with_same_backends_keeps_id() -> crate::Result<()> {
        let mut table = new_nat_table(64);
        let first = table.upsert(key(), &backends(2), ServiceFlags::default())?;
        let second = table.upsert(key(), &backends(2), ServiceFlags::default())?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_update_replaces_group() -> crate::Result<()> {
        let mut table = new_nat_table(64);
        let old = table.upsert(key(), &backends(3), ServiceFlags::default())?;
        let new = table.upsert(key(), &backends(1), ServiceFlags::default())?;
        assert_ne!(old, new);
        assert!(matches!(
            table.backend(old, 0),
            Err(Error::UnknownBackendGroup(id)) if id == old
        ));
        let state = table.backends.get_state()?;
        assert_eq!(state.len(), 1);
        assert!(state.keys().all(|k| k.id == new));
        table.verify()?;
        Ok(())
    }

    #[test]
    fn test_delete_removes_frontend_and_backends() -> crate::Result<()> {
        let mut table = new_nat_table(64);
        table.upsert(key(), &backends(2), ServiceFlags::default())?;
        let removed = table.delete(&key())?.unwrap();
        assert_eq!(removed.count, 2);
        assert!(table.lookup(&key()).is_none());
        assert!(table.backends.get_state()?.is_empty());
        assert!(table.delete(&key())?.is_none());
        Ok(())
    }

    #[test]
    fn test_capacity_leaves_existing_service_untouched() -> crate::Result<()> {
        let mut table = new_nat_table(4);
        let id = table.upsert(key(), &backends(3), ServiceFlags::default())?;
        // the replacement group needs 3 more slots while the old one is still live
        let err = table
            .upsert(key(), &backends(2), ServiceFlags::default())
            .unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(table.lookup(&key()).unwrap().id, id);
        assert_eq!(table.backends.get_state()?.len(), 3);
        table.verify()?;
        Ok(())
    }

    #[test]
    fn test_tcp_and_udp_keys_coexist() -> crate::Result<()> {
        let mut table = new_nat_table(64);
        let udp = ServiceKey::new(key().ip, key().port, Protocol::Udp);
        table.upsert(key(), &backends(1), ServiceFlags::default())?;
        table.upsert(udp, &backends(2), ServiceFlags::default())?;
        assert_eq!(table.lookup(&key()).unwrap().count, 1);
        assert_eq!(table.lookup(&udp).unwrap().count, 2);
        Ok(())
    }

    #[test]
    fn test_service_without_backends() -> crate::Result<()> {
        let mut table = new_nat_table(64);
        table.upsert(key(), &[], ServiceFlags::default())?;
        assert_eq!(table.lookup(&key()).unwrap().count, 0);
        let flow = Flow::new(Ipv4Addr::new(1, 1, 1, 1), 4000, key());
        assert!(matches!(
            table.select(&flow, &FixedOrdinal(0), false),
            Err(Error::NoBackends(_))
        ));
        Ok(())
    }

    #[test]
    fn test_local_policy_orders_local_backends_first() -> crate::Result<()> {
        let mut table = new_nat_table(64);
        let mut list = backends(3);
        list[2].local = true;
        let flags = ServiceFlags {
            traffic_policy: TrafficPolicy::Local,
            ..Default::default()
        };
        let id = table.upsert(key(), &list, flags)?;
        let record = table.lookup(&key()).unwrap();
        assert_eq!(record.local_count, 1);
        assert_eq!(record.candidates(true), 1);
        assert_eq!(record.candidates(false), 3);
        assert_eq!(table.backend(id, 0)?, BackendValue::from(&list[2]));
        Ok(())
    }

    #[test]
    fn test_source_ranges_follow_group() -> crate::Result<()> {
        let mut table = new_nat_table(64);
        let flags = ServiceFlags {
            source_ranges: SourceRanges::Only(vec!["10.0.0.0/8".parse().unwrap()]),
            ..Default::default()
        };
        let old = table.upsert(key(), &backends(1), flags.clone())?;
        let new = table.upsert(key(), &backends(2), flags.clone())?;
        let ranges = table.ranges.get_state()?;
        assert_eq!(ranges.len(), 1);
        assert!(ranges.keys().all(|k| k.id == new && k.id != old));
        assert_eq!(table.lookup(&key()).unwrap().flags, flags);
        Ok(())
    }

    #[test]
    fn test_load_collects_unowned_groups() -> crate::Result<()> {
        let fe_map = MemMap::new("nat_fe", 8);
        let be_map = MemMap::new("nat_be", 8);
        let fkey = FrontendKey::from(key());
        crate::bpf::SharedBpfMap::update(
            &fe_map,
            fkey,
            FrontendValue {
                id: 200,
                count: 1,
                local_count: 0,
                flags: 0,
                affinity_timeout_s: 0,
            },
        )?;
        let value = BackendValue::new(1, 80);
        crate::bpf::SharedBpfMap::update(&be_map, BackendKey { id: 200, ordinal: 0 }, value)?;
        crate::bpf::SharedBpfMap::update(&be_map, BackendKey { id: 150, ordinal: 0 }, value)?;

        let mut table = NatTable::load(fe_map, be_map, MemMap::new("nat_srcs", 8))?;
        assert_eq!(table.pending_orphans(), 1);
        assert_eq!(table.gc()?, 1);
        assert_eq!(table.backends.get_state()?.len(), 1);
        // new ids never collide with adopted ones
        let id = table.upsert(key(), &backends(1), ServiceFlags::default())?;
        assert!(id > 200);
        Ok(())
    }
}
