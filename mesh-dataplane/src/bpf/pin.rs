use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use aya::maps::MapData;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::bpf::context::{MapContext, MapSpec, Table};
use crate::{Error, Result};

const LOCK_RETRY: Duration = Duration::from_millis(250);

/// What the kernel reports about a pinned map.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PinnedInfo {
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
}

impl PinnedInfo {
    /// A pin can be adopted only if the layout the programs expect is unchanged.
    pub fn matches(&self, spec: &MapSpec) -> bool {
        self.key_size == spec.key_size
            && self.value_size == spec.value_size
            && self.max_entries == spec.max_entries
    }
}

/// Access to the persistent pin location.
pub trait PinStore: Send + Sync {
    fn probe(&self, path: &Path) -> Result<Option<PinnedInfo>>;
    fn unpin(&self, path: &Path) -> Result<()>;
}

pub struct BpffsPinStore;

impl PinStore for BpffsPinStore {
    fn probe(&self, path: &Path) -> Result<Option<PinnedInfo>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = MapData::from_pin(path)?;
        let info = data.info()?;
        Ok(Some(PinnedInfo {
            id: info.id(),
            key_size: info.key_size(),
            value_size: info.value_size(),
            max_entries: info.max_entries(),
        }))
    }

    fn unpin(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PinDecision {
    /// Keep the pinned map with this id; the loader will reuse it.
    Adopt { id: u32 },
    /// The loader creates a new map. `replaced` is the id of a pin that was removed.
    Fresh { replaced: Option<u32> },
}

/// Decides the fate of one table's pin before the program object is loaded.
/// The loader reuses whatever is pinned under the table's name, so anything
/// not adopted is unpinned here.
pub fn prepare(store: &dyn PinStore, ctx: &MapContext, spec: &MapSpec) -> Result<PinDecision> {
    let path = ctx.map_path(spec.table);
    let Some(pinned) = store.probe(&path)? else {
        return Ok(PinDecision::Fresh { replaced: None });
    };
    if ctx.repin {
        if pinned.matches(spec) {
            info!(table = %spec.table, id = pinned.id, "adopting pinned map");
            return Ok(PinDecision::Adopt { id: pinned.id });
        }
        warn!(
            table = %spec.table,
            id = pinned.id,
            "pinned map layout changed, recreating"
        );
    }
    store.unpin(&path)?;
    Ok(PinDecision::Fresh {
        replaced: Some(pinned.id),
    })
}

pub fn prepare_all(store: &dyn PinStore, ctx: &MapContext) -> Result<Vec<(Table, PinDecision)>> {
    ctx.specs()
        .iter()
        .map(|spec| Ok((spec.table, prepare(store, ctx, spec)?)))
        .collect()
}

/// Checks, after loading, that every adopted map is still the same kernel
/// object and that every table is now pinned.
pub fn verify(
    store: &dyn PinStore,
    ctx: &MapContext,
    decisions: &[(Table, PinDecision)],
) -> Result<()> {
    for (table, decision) in decisions {
        let pinned = store
            .probe(&ctx.map_path(*table))?
            .ok_or_else(|| Error::MapNotFound {
                name: table.name().to_string(),
            })?;
        if let PinDecision::Adopt { id } = decision
            && pinned.id != *id
        {
            return Err(Error::Other(format!(
                "map {table} changed while adopting: expected id {id}, found {}",
                pinned.id
            )));
        }
    }
    Ok(())
}

/// Exclusive ownership of the pinned state for the lifetime of the agent.
pub struct OwnerLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl OwnerLock {
    /// Takes the lock, waiting up to `wait` for a previous owner to exit.
    pub async fn acquire(path: &Path, wait: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait;
        let mut logged = false;
        loop {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(path)?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                        _lock: lock,
                    });
                }
                Err((_, Errno::EAGAIN)) if Instant::now() < deadline => {
                    if !logged {
                        info!(path = %path.display(), "waiting for previous owner to exit");
                        logged = true;
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err((_, Errno::EAGAIN)) => {
                    return Err(Error::Other(format!(
                        "{} is held by another instance",
                        path.display()
                    )));
                }
                Err((_, e)) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Pin location backed by memory. `create` behaves like the loader:
    /// an existing pin is reused, otherwise a map with a new id appears.
    #[derive(Default)]
    pub struct MemPinStore {
        pins: Mutex<HashMap<PathBuf, PinnedInfo>>,
        next_id: AtomicU32,
    }

    impl MemPinStore {
        pub fn create(&self, ctx: &MapContext, spec: &MapSpec) -> u32 {
            let mut pins = self.pins.lock().unwrap();
            let entry = pins.entry(ctx.map_path(spec.table)).or_insert_with(|| PinnedInfo {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                key_size: spec.key_size,
                value_size: spec.value_size,
                max_entries: spec.max_entries,
            });
            entry.id
        }

        pub fn load_all(&self, ctx: &MapContext) -> Vec<u32> {
            ctx.specs().iter().map(|s| self.create(ctx, s)).collect()
        }
    }

    impl PinStore for MemPinStore {
        fn probe(&self, path: &Path) -> Result<Option<PinnedInfo>> {
            Ok(self.pins.lock().unwrap().get(path).copied())
        }

        fn unpin(&self, path: &Path) -> Result<()> {
            self.pins.lock().unwrap().remove(path);
            Ok(())
        }
    }

    fn restart(store: &MemPinStore, ctx: &MapContext) -> Vec<u32> {
        let decisions = prepare_all(store, ctx).unwrap();
        let ids = store.load_all(ctx);
        verify(store, ctx, &decisions).unwrap();
        ids
    }

    #[test]
    fn test_repin_keeps_ids() {
        let store = MemPinStore::default();
        let mut ctx = MapContext::new("/sys/fs/bpf", "mesh");
        ctx.repin = true;
        let first = restart(&store, &ctx);
        let second = restart(&store, &ctx);
        assert_eq!(first, second);
    }

    #[test]
    fn test_without_repin_ids_change() {
        let store = MemPinStore::default();
        let ctx = MapContext::new("/sys/fs/bpf", "mesh");
        let first = restart(&store, &ctx);
        let decisions = prepare_all(&store, &ctx).unwrap();
        assert!(decisions.iter().all(|(_, d)| matches!(
            d,
            PinDecision::Fresh { replaced: Some(_) }
        )));
        let second = store.load_all(&ctx);
        for (a, b) in first.iter().zip(&second) {
            assert_ne!(a, b);
        }
    }

    #[test]
    fn test_resized_table_is_recreated() {
        let store = MemPinStore::default();
        let mut ctx = MapContext::new("/sys/fs/bpf", "mesh");
        ctx.repin = true;
        let first = restart(&store, &ctx);

        ctx.sizes.conntrack /= 2;
        let decisions = prepare_all(&store, &ctx).unwrap();
        for (table, decision) in &decisions {
            match table {
                Table::Conntrack => assert!(matches!(decision, PinDecision::Fresh { .. })),
                _ => assert!(matches!(decision, PinDecision::Adopt { .. })),
            }
        }
        let second = store.load_all(&ctx);
        let changed = first.iter().zip(&second).filter(|(a, b)| a != b).count();
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let store = MemPinStore::default();
        let mut a = MapContext::new("/sys/fs/bpf", "a");
        a.repin = true;
        let mut b = MapContext::new("/sys/fs/bpf", "b");
        b.repin = true;
        let ids_a = restart(&store, &a);
        let ids_b = restart(&store, &b);
        assert!(ids_a.iter().all(|id| !ids_b.contains(id)));
        assert_eq!(ids_a, restart(&store, &a));
    }

    #[test]
    fn test_verify_detects_replaced_map() {
        let store = MemPinStore::default();
        let mut ctx = MapContext::new("/sys/fs/bpf", "mesh");
        ctx.repin = true;
        restart(&store, &ctx);
        let decisions = prepare_all(&store, &ctx).unwrap();
        store.unpin(&ctx.map_path(Table::Routes)).unwrap();
        store.load_all(&ctx);
        assert!(verify(&store, &ctx, &decisions).is_err());
    }

    #[tokio::test]
    async fn test_owner_lock_is_exclusive() {
        let path = std::env::temp_dir().join(format!("mesh-dataplane-{}.lock", std::process::id()));
        let first = OwnerLock::acquire(&path, Duration::ZERO).await.unwrap();
        assert!(OwnerLock::acquire(&path, Duration::ZERO).await.is_err());
        drop(first);
        let second = OwnerLock::acquire(&path, Duration::ZERO).await.unwrap();
        assert_eq!(second.path(), path);
        drop(second);
        let _ = std::fs::remove_file(path);
    }
}
