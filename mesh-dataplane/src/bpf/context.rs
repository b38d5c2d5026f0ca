use std::fmt::Display;
use std::mem::size_of;
use std::path::PathBuf;

use aya::Pod;
use aya::maps::{HashMap, LpmTrie, Map, MapData};
use mesh_dataplane_common::affinity::{AffinityKey, AffinityValue};
use mesh_dataplane_common::conntrack::{ConntrackKey, ConntrackValue};
use mesh_dataplane_common::route::RouteValue;
use mesh_dataplane_common::service::{
    BackendKey, BackendValue, FrontendKey, FrontendValue, SourceRangeData,
};

use crate::Result;
use crate::bpf::{KernelLpmMap, KernelMap, LpmKeyed, SharedKernelMap};

/// Every table the dataplane pins. The names double as the kernel map names
/// declared by the program object, so they stay under 16 bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Table {
    NatFrontend,
    NatBackend,
    SourceRanges,
    Affinity,
    Conntrack,
    Routes,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::NatFrontend,
        Table::NatBackend,
        Table::SourceRanges,
        Table::Affinity,
        Table::Conntrack,
        Table::Routes,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::NatFrontend => "mesh_nat_fe",
            Table::NatBackend => "mesh_nat_be",
            Table::SourceRanges => "mesh_nat_srcs",
            Table::Affinity => "mesh_nat_aff",
            Table::Conntrack => "mesh_ct",
            Table::Routes => "mesh_routes",
        }
    }

    /// Key size as the kernel sees it. Trie keys carry a leading u32 prefix length.
    pub fn key_size(&self) -> u32 {
        let size = match self {
            Table::NatFrontend => size_of::<FrontendKey>(),
            Table::NatBackend => size_of::<BackendKey>(),
            Table::SourceRanges => size_of::<u32>() + size_of::<SourceRangeData>(),
            Table::Affinity => size_of::<AffinityKey>(),
            Table::Conntrack => size_of::<ConntrackKey>(),
            Table::Routes => size_of::<u32>() * 2,
        };
        size as u32
    }

    pub fn value_size(&self) -> u32 {
        let size = match self {
            Table::NatFrontend => size_of::<FrontendValue>(),
            Table::NatBackend => size_of::<BackendValue>(),
            Table::SourceRanges => size_of::<u32>(),
            Table::Affinity => size_of::<AffinityValue>(),
            Table::Conntrack => size_of::<ConntrackValue>(),
            Table::Routes => size_of::<RouteValue>(),
        };
        size as u32
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableSizes {
    pub nat_frontend: u32,
    pub nat_backend: u32,
    pub source_ranges: u32,
    pub affinity: u32,
    pub conntrack: u32,
    pub routes: u32,
}

impl Default for TableSizes {
    fn default() -> Self {
        Self {
            nat_frontend: 65536,
            nat_backend: 262144,
            source_ranges: 16384,
            affinity: 65536,
            conntrack: 512000,
            routes: 262144,
        }
    }
}

impl TableSizes {
    pub fn of(&self, table: Table) -> u32 {
        match table {
            Table::NatFrontend => self.nat_frontend,
            Table::NatBackend => self.nat_backend,
            Table::SourceRanges => self.source_ranges,
            Table::Affinity => self.affinity,
            Table::Conntrack => self.conntrack,
            Table::Routes => self.routes,
        }
    }

    pub fn set(&mut self, table: Table, max_entries: u32) {
        let slot = match table {
            Table::NatFrontend => &mut self.nat_frontend,
            Table::NatBackend => &mut self.nat_backend,
            Table::SourceRanges => &mut self.source_ranges,
            Table::Affinity => &mut self.affinity,
            Table::Conntrack => &mut self.conntrack,
            Table::Routes => &mut self.routes,
        };
        *slot = max_entries;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MapSpec {
    pub table: Table,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
}

/// Where and how big every table is. Handed to each table constructor in
/// place of any process-wide map registry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MapContext {
    pub bpf_fs: PathBuf,
    pub namespace: String,
    pub repin: bool,
    pub sizes: TableSizes,
}

impl MapContext {
    pub fn new(bpf_fs: impl Into<PathBuf>, namespace: impl Into<String>) -> Self {
        Self {
            bpf_fs: bpf_fs.into(),
            namespace: namespace.into(),
            repin: false,
            sizes: TableSizes::default(),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.bpf_fs.join(&self.namespace)
    }

    /// Directory the program object's maps are pinned into by name.
    pub fn pin_dir(&self) -> PathBuf {
        self.root().join("maps")
    }

    pub fn map_path(&self, table: Table) -> PathBuf {
        self.pin_dir().join(table.name())
    }

    pub fn tc_dir(&self) -> PathBuf {
        self.root().join("tc")
    }

    pub fn spec(&self, table: Table) -> MapSpec {
        MapSpec {
            table,
            key_size: table.key_size(),
            value_size: table.value_size(),
            max_entries: self.sizes.of(table),
        }
    }

    pub fn specs(&self) -> Vec<MapSpec> {
        Table::ALL.iter().map(|t| self.spec(*t)).collect()
    }

    pub fn open_hash<K: Pod, V: Pod>(&self, table: Table) -> Result<KernelMap<HashMap<MapData, K, V>>> {
        let map: HashMap<MapData, K, V> = self.open_hash_raw(table)?;
        Ok(KernelMap::new(table.name(), self.sizes.of(table), map))
    }

    pub fn open_shared_hash<K: Pod, V: Pod>(&self, table: Table) -> Result<SharedKernelMap<K, V>> {
        let map: HashMap<MapData, K, V> = self.open_hash_raw(table)?;
        Ok(SharedKernelMap::new(table.name(), self.sizes.of(table), map))
    }

    pub fn open_lpm<K: LpmKeyed, V: Pod>(&self, table: Table) -> Result<KernelLpmMap<K, V>> {
        let data = MapData::from_pin(self.map_path(table))?;
        let map: LpmTrie<MapData, K::Data, V> = Map::LpmTrie(data).try_into()?;
        Ok(KernelLpmMap::new(table.name(), self.sizes.of(table), map))
    }

    fn open_hash_raw<K: Pod, V: Pod>(&self, table: Table) -> Result<HashMap<MapData, K, V>> {
        let data = MapData::from_pin(self.map_path(table))?;
        Ok(Map::HashMap(data).try_into()?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_paths_are_namespaced() {
        let a = MapContext::new("/sys/fs/bpf", "mesh");
        let b = MapContext::new("/sys/fs/bpf", "other");
        assert_eq!(
            a.map_path(Table::Conntrack),
            PathBuf::from("/sys/fs/bpf/mesh/maps/mesh_ct")
        );
        for table in Table::ALL {
            assert_ne!(a.map_path(table), b.map_path(table));
        }
    }

    #[test]
    fn test_table_names_fit_kernel_limit() {
        for table in Table::ALL {
            assert!(table.name().len() < 16, "{table}");
        }
    }

    #[test]
    fn test_spec_uses_context_sizes() {
        let mut ctx = MapContext::new("/sys/fs/bpf", "mesh");
        ctx.sizes.conntrack = 10;
        let spec = ctx.spec(Table::Conntrack);
        assert_eq!(spec.max_entries, 10);
        assert_eq!(spec.key_size, 16);
        assert_eq!(spec.value_size, 64);
    }

    #[test]
    fn test_set_size() {
        let mut sizes = TableSizes::default();
        for (i, table) in Table::ALL.into_iter().enumerate() {
            sizes.set(table, i as u32 + 1);
        }
        for (i, table) in Table::ALL.into_iter().enumerate() {
            assert_eq!(sizes.of(table), i as u32 + 1);
        }
    }
}
