use ahash::HashMap;
use mesh_dataplane_common::route::{RouteKey, RouteValue};
use tracing::{debug, info};

use super::RouteEntry;
use crate::Result;
use crate::bpf::{BpfMap, BpfState};

/// Changes made by one reconcile of the route table.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RouteDiff {
    pub upserted: usize,
    pub removed: usize,
}

impl RouteDiff {
    pub fn is_empty(&self) -> bool {
        self.upserted == 0 && self.removed == 0
    }
}

pub struct RouteTableState<M>
where
    M: BpfMap<Key = RouteKey, Value = RouteValue>,
{
    state: BpfState<M>,
}

impl<M> RouteTableState<M>
where
    M: BpfMap<Key = RouteKey, Value = RouteValue>,
{
    pub fn load(map: M) -> Result<Self> {
        Ok(Self {
            state: BpfState::load(map)?,
        })
    }

    /// Makes the table hold exactly `entries`. New and changed entries are
    /// written before stale ones are removed so a lookup never falls through
    /// to a less specific prefix during the update.
    pub fn apply(&mut self, entries: &[RouteEntry]) -> Result<RouteDiff> {
        let desired: HashMap<RouteKey, RouteValue> =
            entries.iter().map(|e| (e.key(), e.value())).collect();

        let mut diff = RouteDiff::default();
        for (key, value) in &desired {
            if self.state.get_from_cache(key) == Some(value) {
                continue;
            }
            self.state.update(*key, *value)?;
            diff.upserted += 1;
        }

        let stale: Vec<RouteKey> = self
            .state
            .cache()
            .keys()
            .filter(|k| !desired.contains_key(k))
            .copied()
            .collect();
        for key in stale {
            debug!(addr = key.addr, prefix_len = key.prefix_len, "removing route");
            self.state.delete(&key)?;
            diff.removed += 1;
        }

        if !diff.is_empty() {
            info!(
                upserted = diff.upserted,
                removed = diff.removed,
                "route table updated"
            );
        }
        Ok(diff)
    }

    /// Entries currently held, in dump order.
    pub fn entries(&self) -> Result<Vec<RouteEntry>> {
        let mut keys: Vec<&RouteKey> = self.state.cache().keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|k| RouteEntry::from_map(k, &self.state.cache()[k]))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.cache().is_empty()
    }
}
