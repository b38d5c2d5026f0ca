pub mod affinity;
pub mod conntrack;
pub mod context;
pub mod hooks;
pub mod loader;
pub mod pin;
pub mod routes;
pub mod service;

use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use aya::Pod;
use aya::maps::lpm_trie::Key as LpmKey;
use aya::maps::{HashMap, LpmTrie, MapData, MapError};
use aya::sys::SyscallError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::{Error, Result};

/// Single-writer access to a table. Used for tables that are only mutated by
/// the reconciler that owns them.
pub trait BpfMap {
    type Key;
    type Value;
    fn update(&mut self, key: Self::Key, value: Self::Value) -> Result<()>;
    fn delete(&mut self, key: &Self::Key) -> Result<()>;
    fn get(&self, key: &Self::Key) -> Result<Self::Value>;
    fn get_state(&self) -> Result<ahash::HashMap<Self::Key, Self::Value>>;
}

/// Shared access to a table written concurrently by the packet path and by
/// background sweeps. Every operation is atomic for a single record only.
pub trait SharedBpfMap: Send + Sync {
    type Key;
    type Value;
    fn update(&self, key: Self::Key, value: Self::Value) -> Result<()>;
    fn delete(&self, key: &Self::Key) -> Result<()>;
    fn get(&self, key: &Self::Key) -> Result<Option<Self::Value>>;
    /// Read-modify-write of one record. `f` sees the current value, if any,
    /// and returns the value to store. Returns whether the record was created.
    fn upsert(
        &self,
        key: Self::Key,
        f: &mut dyn FnMut(Option<&Self::Value>) -> Self::Value,
    ) -> Result<bool>;
    /// Removes the record only if `pred` still holds for its current value.
    fn remove_if(&self, key: &Self::Key, pred: &dyn Fn(&Self::Value) -> bool) -> Result<bool>;
    fn keys(&self) -> Result<Vec<Self::Key>>;
    fn get_state(&self) -> Result<ahash::HashMap<Self::Key, Self::Value>>;
    fn max_entries(&self) -> u32;

    fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for key in self.keys()? {
            if self.remove_if(&key, &|_| true)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Result of one pass of an aging sweep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepStats {
    pub scanned: usize,
    pub removed: usize,
    /// The pass stopped early because of cancellation.
    pub interrupted: bool,
}

/// Teaches the trie-backed tables how to turn their userspace key into the
/// kernel's prefix/data key and back.
pub trait LpmKeyed: Sized {
    type Data: Pod;
    fn to_lpm(&self) -> LpmKey<Self::Data>;
    fn from_lpm(key: &LpmKey<Self::Data>) -> Result<Self>;
}

/// A pinned kernel map together with the name and size it was created with,
/// so that a full map is reported as a capacity error for that table.
pub struct KernelMap<M> {
    name: &'static str,
    max_entries: u32,
    map: M,
}

impl<M> KernelMap<M> {
    pub fn new(name: &'static str, max_entries: u32, map: M) -> Self {
        Self {
            name,
            max_entries,
            map,
        }
    }

    fn classify(&self, e: MapError) -> Error {
        classify_map_error(self.name, self.max_entries, e)
    }
}

pub(crate) fn classify_map_error(name: &'static str, max_entries: u32, e: MapError) -> Error {
    if let MapError::SyscallError(SyscallError { io_error, .. }) = &e
        && io_error.raw_os_error() == Some(nix::libc::E2BIG)
    {
        return Error::Capacity {
            table: name,
            max_entries,
        };
    }
    e.into()
}

fn is_missing(e: &MapError) -> bool {
    match e {
        MapError::KeyNotFound => true,
        MapError::SyscallError(SyscallError { io_error, .. }) => {
            io_error.raw_os_error() == Some(nix::libc::ENOENT)
        }
        _ => false,
    }
}

/// Deleting an absent key is not an error for any table.
fn ignore_missing(res: std::result::Result<(), MapError>) -> Result<()> {
    match res {
        Ok(()) => Ok(()),
        Err(e) if is_missing(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl<K: Pod + Eq + Hash, V: Pod> BpfMap for KernelMap<HashMap<MapData, K, V>> {
    type Key = K;
    type Value = V;
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.map
            .insert(key, value, 0)
            .map_err(|e| self.classify(e))
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        ignore_missing(self.map.remove(key))
    }
    fn get(&self, key: &K) -> Result<V> {
        Ok(self.map.get(key, 0)?)
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        let mut map = ahash::HashMap::default();
        for v in self.map.iter() {
            let (k, v) = v?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

/// Pinned trie map addressed through a userspace key type.
pub struct KernelLpmMap<K: LpmKeyed, V> {
    name: &'static str,
    max_entries: u32,
    map: LpmTrie<MapData, K::Data, V>,
    _key: PhantomData<K>,
}

impl<K: LpmKeyed, V> KernelLpmMap<K, V> {
    pub fn new(name: &'static str, max_entries: u32, map: LpmTrie<MapData, K::Data, V>) -> Self {
        Self {
            name,
            max_entries,
            map,
            _key: PhantomData,
        }
    }
}

impl<K, V> BpfMap for KernelLpmMap<K, V>
where
    K: LpmKeyed + Eq + Hash,
    V: Pod,
{
    type Key = K;
    type Value = V;
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.map
            .insert(&key.to_lpm(), value, 0)
            .map_err(|e| classify_map_error(self.name, self.max_entries, e))
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        ignore_missing(self.map.remove(&key.to_lpm()))
    }
    fn get(&self, key: &K) -> Result<V> {
        Ok(self.map.get(&key.to_lpm(), 0)?)
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        let mut map = ahash::HashMap::default();
        for v in self.map.iter() {
            let (k, v) = v?;
            map.insert(K::from_lpm(&k)?, v);
        }
        Ok(map)
    }
}

/// Kernel hash map shared between tasks. The mutex only serialises the
/// syscalls issued from this process; the kernel updates records atomically.
pub struct SharedKernelMap<K, V> {
    name: &'static str,
    max_entries: u32,
    map: Mutex<HashMap<MapData, K, V>>,
}

impl<K, V> SharedKernelMap<K, V> {
    pub fn new(name: &'static str, max_entries: u32, map: HashMap<MapData, K, V>) -> Self {
        Self {
            name,
            max_entries,
            map: Mutex::new(map),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<MapData, K, V>>> {
        self.map
            .lock()
            .map_err(|_| Error::Other(format!("{} map lock poisoned", self.name)))
    }
}

impl<K, V> SharedBpfMap for SharedKernelMap<K, V>
where
    K: Pod + Eq + Hash + Send,
    V: Pod + Send,
{
    type Key = K;
    type Value = V;
    fn update(&self, key: K, value: V) -> Result<()> {
        self.lock()?
            .insert(key, value, 0)
            .map_err(|e| classify_map_error(self.name, self.max_entries, e))
    }
    fn delete(&self, key: &K) -> Result<()> {
        ignore_missing(self.lock()?.remove(key))
    }
    fn get(&self, key: &K) -> Result<Option<V>> {
        match self.lock()?.get(key, 0) {
            Ok(v) => Ok(Some(v)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
    fn upsert(&self, key: K, f: &mut dyn FnMut(Option<&V>) -> V) -> Result<bool> {
        let mut map = self.lock()?;
        let current = match map.get(&key, 0) {
            Ok(v) => Some(v),
            Err(MapError::KeyNotFound) => None,
            Err(e) => return Err(e.into()),
        };
        let created = current.is_none();
        let value = f(current.as_ref());
        map.insert(key, value, 0)
            .map_err(|e| classify_map_error(self.name, self.max_entries, e))?;
        Ok(created)
    }
    fn remove_if(&self, key: &K, pred: &dyn Fn(&V) -> bool) -> Result<bool> {
        let mut map = self.lock()?;
        let current = match map.get(key, 0) {
            Ok(v) => v,
            Err(MapError::KeyNotFound) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !pred(&current) {
            return Ok(false);
        }
        match map.remove(key) {
            Ok(()) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
    fn keys(&self) -> Result<Vec<K>> {
        let map = self.lock()?;
        let mut keys = Vec::new();
        for k in map.keys() {
            keys.push(k?);
        }
        Ok(keys)
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        let map = self.lock()?;
        let mut state = ahash::HashMap::default();
        for v in map.iter() {
            let (k, v) = v?;
            state.insert(k, v);
        }
        Ok(state)
    }
    fn max_entries(&self) -> u32 {
        self.max_entries
    }
}

impl<K: Pod + Eq + Hash, V: Pod> BpfMap for ahash::HashMap<K, V> {
    type Key = K;
    type Value = V;
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }
    fn get(&self, key: &K) -> Result<V> {
        match <ahash::HashMap<K, V>>::get(self, key) {
            Some(i) => Ok(*i),
            None => Err(MapError::KeyNotFound.into()),
        }
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.clone())
    }
}

/// Bounded in-memory table with per-record locking, used wherever a kernel
/// map is not available.
pub struct MemMap<K, V> {
    name: &'static str,
    max_entries: u32,
    len: AtomicUsize,
    map: DashMap<K, V>,
}

impl<K: Eq + Hash + Clone, V: Clone> MemMap<K, V> {
    pub fn new(name: &'static str, max_entries: u32) -> Self {
        Self {
            name,
            max_entries,
            len: AtomicUsize::new(0),
            map: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> SharedBpfMap for MemMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    type Key = K;
    type Value = V;
    fn update(&self, key: K, value: V) -> Result<()> {
        match self.map.entry(key) {
            Entry::Occupied(mut o) => {
                o.insert(value);
            }
            Entry::Vacant(v) => {
                if self.len.fetch_add(1, Ordering::SeqCst) >= self.max_entries as usize {
                    self.len.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::Capacity {
                        table: self.name,
                        max_entries: self.max_entries,
                    });
                }
                v.insert(value);
            }
        }
        Ok(())
    }
    fn delete(&self, key: &K) -> Result<()> {
        if self.map.remove(key).is_some() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
    fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.map.get(key).map(|v| v.value().clone()))
    }
    fn upsert(&self, key: K, f: &mut dyn FnMut(Option<&V>) -> V) -> Result<bool> {
        match self.map.entry(key) {
            Entry::Occupied(mut o) => {
                let value = f(Some(o.get()));
                o.insert(value);
                Ok(false)
            }
            Entry::Vacant(v) => {
                if self.len.fetch_add(1, Ordering::SeqCst) >= self.max_entries as usize {
                    self.len.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::Capacity {
                        table: self.name,
                        max_entries: self.max_entries,
                    });
                }
                v.insert(f(None));
                Ok(true)
            }
        }
    }
    fn remove_if(&self, key: &K, pred: &dyn Fn(&V) -> bool) -> Result<bool> {
        if self.map.remove_if(key, |_, v| pred(v)).is_some() {
            self.len.fetch_sub(1, Ordering::SeqCst);
            return Ok(true);
        }
        Ok(false)
    }
    fn keys(&self) -> Result<Vec<K>> {
        Ok(self.map.iter().map(|e| e.key().clone()).collect())
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self
            .map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }
    fn max_entries(&self) -> u32 {
        self.max_entries
    }
}

impl<K, V> BpfMap for MemMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    type Key = K;
    type Value = V;
    fn update(&mut self, key: K, value: V) -> Result<()> {
        SharedBpfMap::update(self, key, value)
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        SharedBpfMap::delete(self, key)
    }
    fn get(&self, key: &K) -> Result<V> {
        SharedBpfMap::get(self, key)?.ok_or_else(|| MapError::KeyNotFound.into())
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        SharedBpfMap::get_state(self)
    }
}

/// Userspace cache in front of a table. Skips writes whose value is already
/// present so that repeated reconciliation does not churn the kernel map.
pub struct BpfState<M>
where
    M: BpfMap,
    M::Key: Hash + Eq + Clone,
    M::Value: Clone + PartialEq,
{
    cache: ahash::HashMap<M::Key, M::Value>,
    bpf_map: M,
}

impl<M> BpfState<M>
where
    M: BpfMap,
    M::Key: Hash + Eq + Clone,
    M::Value: Clone + PartialEq,
{
    pub fn new(bpf_map: M) -> Self {
        let cache = ahash::HashMap::default();
        Self { cache, bpf_map }
    }

    /// Seeds the cache from whatever the map already holds, e.g. after the
    /// map was adopted from a previous instance.
    pub fn load(bpf_map: M) -> Result<Self> {
        let cache = bpf_map.get_state()?;
        Ok(Self { cache, bpf_map })
    }

    pub fn update(&mut self, key: M::Key, value: M::Value) -> Result<()> {
        if let Some(current) = self.cache.get(&key)
            && *current == value
        {
            return Ok(());
        };
        self.bpf_map.update(key.clone(), value.clone())?;
        self.cache.insert(key, value);
        Ok(())
    }

    pub fn delete(&mut self, key: &M::Key) -> Result<()> {
        self.bpf_map.delete(key)?;
        self.cache.remove(key);
        Ok(())
    }

    pub fn get_from_cache(&self, key: &M::Key) -> Option<&M::Value> {
        self.cache.get(key)
    }

    pub fn cache(&self) -> &ahash::HashMap<M::Key, M::Value> {
        &self.cache
    }

    pub fn map(&self) -> &M {
        &self.bpf_map
    }
}
