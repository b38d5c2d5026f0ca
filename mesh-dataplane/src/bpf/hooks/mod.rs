mod backend;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use backend::{
    AyaTcBackend, DISPATCH_PROGRAM, Direction, HookPresence, TcBackend, jump_dir,
    list_jump_tables, parse_jump_dir,
};

use crate::Result;
use crate::metrics::HOOK_METRICS;

#[derive(Clone, Debug)]
pub struct HookConfig {
    pub reconcile_interval: Duration,
    pub cleanup_interval: Duration,
    /// Most dispatch tables removed by one cleanup pass
    pub cleanup_batch: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(5),
            cleanup_batch: 16,
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl HookConfig {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.backoff_initial
            .saturating_mul(1 << exp)
            .min(self.backoff_max)
    }
}

/// Decides which interfaces get hooks.
#[derive(Clone, Debug, Default)]
pub struct IfaceMatcher {
    pub workload_prefixes: Vec<String>,
    pub host_ifaces: Vec<String>,
}

impl IfaceMatcher {
    pub fn matches(&self, iface: &str) -> bool {
        self.host_ifaces.iter().any(|h| h == iface)
            || self
                .workload_prefixes
                .iter()
                .any(|p| iface.starts_with(p.as_str()))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookState {
    Absent,
    Attached,
    /// Hooks were attached once and have since been found missing
    Missing,
    Reattached,
}

impl HookState {
    fn was_attached(&self) -> bool {
        !matches!(self, HookState::Absent)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Trigger {
    InterfaceAdded(String),
    InterfaceRemoved(String),
    /// The interface went down and came back up
    InterfaceFlap(String),
    /// Explicit request to check one interface, or all of them
    Notify(Option<String>),
    Tick,
}

struct IfaceHooks {
    state: HookState,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Default for IfaceHooks {
    fn default() -> Self {
        Self {
            state: HookState::Absent,
            failures: 0,
            retry_at: None,
        }
    }
}

/// Keeps every relevant interface hooked. Work on different interfaces runs
/// concurrently; work on one interface is serialized by its own lock.
pub struct HookManager<B: TcBackend> {
    backend: Arc<B>,
    matcher: IfaceMatcher,
    config: HookConfig,
    ifaces: DashMap<String, Arc<Mutex<IfaceHooks>>>,
}

impl<B: TcBackend + 'static> HookManager<B> {
    pub fn new(backend: Arc<B>, matcher: IfaceMatcher, config: HookConfig) -> Self {
        Self {
            backend,
            matcher,
            config,
            ifaces: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn matcher(&self) -> &IfaceMatcher {
        &self.matcher
    }

    pub async fn state(&self, iface: &str) -> Option<HookState> {
        let slot = self.ifaces.get(iface).map(|s| s.value().clone())?;
        let hooks = slot.lock().await;
        Some(hooks.state)
    }

    pub fn tracked(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ifaces.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Makes sure both hooks and both dispatch tables of `iface` exist.
    /// Failures are logged and retried later with backoff; `force` skips
    /// the backoff wait.
    pub async fn ensure(&self, iface: &str, force: bool) -> HookState {
        if !self.backend.iface_exists(iface) {
            self.forget(iface);
            return HookState::Absent;
        }
        let slot = self
            .ifaces
            .entry(iface.to_string())
            .or_default()
            .value()
            .clone();
        let mut hooks = slot.lock().await;

        if !force
            && let Some(at) = hooks.retry_at
            && Instant::now() < at
        {
            return hooks.state;
        }

        let presence = match self.backend.probe(iface) {
            Ok(p) => p,
            Err(e) => {
                self.failed(&mut hooks, iface, &e);
                return hooks.state;
            }
        };
        if presence.all_complete() {
            if hooks.state == HookState::Absent {
                hooks.state = HookState::Attached;
            }
            hooks.failures = 0;
            hooks.retry_at = None;
            return hooks.state;
        }

        let was = hooks.state;
        if was.was_attached() && was != HookState::Missing {
            warn!(iface, ?presence, "hooks missing, reattaching");
            hooks.state = HookState::Missing;
        }

        match self.install(iface, presence) {
            Ok(()) => {
                if was.was_attached() {
                    HOOK_METRICS.reattached.inc();
                    info!(iface, "hooks reattached");
                    hooks.state = HookState::Reattached;
                } else {
                    HOOK_METRICS.attached.inc();
                    info!(iface, "hooks attached");
                    hooks.state = HookState::Attached;
                }
                hooks.failures = 0;
                hooks.retry_at = None;
            }
            Err(e) => self.failed(&mut hooks, iface, &e),
        }
        hooks.state
    }

    /// Installs whatever is missing. Directions installed by this call are
    /// detached again if a later one fails.
    fn install(&self, iface: &str, presence: HookPresence) -> Result<()> {
        let mut installed = Vec::new();
        for dir in Direction::BOTH {
            if presence.is_complete(dir) {
                continue;
            }
            // a filter left by an earlier run has no table behind it
            if presence.hook(dir) {
                self.backend.detach(iface, dir)?;
            }
            if let Err(e) = self.backend.install(iface, dir) {
                for done in installed {
                    if let Err(e) = self.backend.detach(iface, done) {
                        warn!(iface, ?done, %e, "failed to roll back hook");
                    }
                }
                return Err(e);
            }
            if !presence.hook(dir) {
                installed.push(dir);
            }
        }
        Ok(())
    }

    fn failed(&self, hooks: &mut IfaceHooks, iface: &str, e: &crate::Error) {
        hooks.failures = hooks.failures.saturating_add(1);
        let delay = self.config.backoff(hooks.failures);
        hooks.retry_at = Some(Instant::now() + delay);
        warn!(iface, %e, failures = hooks.failures, retry_in = ?delay, "failed to attach hooks");
    }

    /// Stops tracking an interface. Its dispatch tables are left for the
    /// cleanup pass.
    pub fn forget(&self, iface: &str) {
        if self.ifaces.remove(iface).is_some() {
            debug!(iface, "interface removed");
        }
    }

    pub async fn reconcile_all(self: &Arc<Self>, force: bool) {
        let mut tasks = JoinSet::new();
        for iface in self.tracked() {
            let this = self.clone();
            tasks.spawn(async move {
                this.ensure(&iface, force).await;
            });
        }
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(%e, "hook reconcile task failed");
            }
        }
    }

    /// Removes up to `cleanup_batch` dispatch tables whose interface is no
    /// longer tracked.
    pub fn collect_garbage(&self) -> Result<usize> {
        let owners = self.backend.jump_owners()?;
        let mut removed = 0;
        for iface in owners
            .iter()
            .filter(|i| !self.ifaces.contains_key(i.as_str()))
            .take(self.config.cleanup_batch)
        {
            match self.backend.remove_jump(iface) {
                Ok(()) => removed += 1,
                Err(e) => warn!(iface, %e, "failed to remove dispatch table"),
            }
        }
        HOOK_METRICS.collected.inc_by(removed as u64);
        Ok(removed)
    }

    pub async fn handle(self: &Arc<Self>, trigger: Trigger) {
        match trigger {
            Trigger::InterfaceAdded(iface)
            | Trigger::InterfaceFlap(iface)
            | Trigger::Notify(Some(iface)) => {
                if self.matcher.matches(&iface) {
                    self.ensure(&iface, true).await;
                }
            }
            Trigger::InterfaceRemoved(iface) => self.forget(&iface),
            Trigger::Notify(None) => self.reconcile_all(true).await,
            Trigger::Tick => self.reconcile_all(false).await,
        }
    }

    /// Serves triggers until cancelled. A trigger being handled when
    /// cancellation arrives is finished first.
    pub async fn run(
        self: Arc<Self>,
        mut triggers: mpsc::Receiver<Trigger>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!("starting hook manager");
        let mut reconcile = interval(self.config.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = interval_at(
            Instant::now() + self.config.cleanup_interval,
            self.config.cleanup_interval,
        );
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(trigger) = triggers.recv() => self.handle(trigger).await,
                _ = reconcile.tick() => self.handle(Trigger::Tick).await,
                _ = cleanup.tick() => match self.collect_garbage() {
                    Ok(0) => {}
                    Ok(n) => info!(removed = n, "collected orphaned dispatch tables"),
                    Err(e) => warn!(%e, "dispatch table cleanup failed"),
                },
            }
        }
        info!("hook manager stopped");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Error;

    #[derive(Default)]
    struct MemTc {
        ifaces: BTreeMap<String, HookPresence>,
        jumps: BTreeSet<(String, Direction)>,
        filters: BTreeMap<(String, Direction), usize>,
        fail: Option<Direction>,
        fail_count: usize,
    }

    /// Interfaces, hooks and dispatch tables held in memory.
    #[derive(Default)]
    pub struct MemTcBackend {
        inner: std::sync::Mutex<MemTc>,
        installs: AtomicUsize,
    }

    impl MemTcBackend {
        pub fn add_iface(&self, iface: &str) {
            let mut tc = self.inner.lock().unwrap();
            tc.ifaces.entry(iface.to_string()).or_default();
        }

        /// Deleting an interface takes its hooks with it but not its pins.
        pub fn delete_iface(&self, iface: &str) {
            let mut tc = self.inner.lock().unwrap();
            tc.ifaces.remove(iface);
            tc.filters.retain(|(i, _), _| i != iface);
        }

        pub fn remove_hook(&self, iface: &str, dir: Direction) {
            let mut tc = self.inner.lock().unwrap();
            tc.filters.remove(&(iface.to_string(), dir));
            if let Some(p) = tc.ifaces.get_mut(iface) {
                let jump = p.jump(dir);
                p.set(dir, false, jump);
            }
        }

        pub fn remove_jumps(&self, iface: &str) {
            let mut tc = self.inner.lock().unwrap();
            for dir in Direction::BOTH {
                tc.jumps.remove(&(iface.to_string(), dir));
            }
        }

        /// Makes installs in `dir` fail `count` times.
        pub fn fail_installs(&self, dir: Direction, count: usize) {
            let mut tc = self.inner.lock().unwrap();
            tc.fail = Some(dir);
            tc.fail_count = count;
        }

        pub fn installs(&self) -> usize {
            self.installs.load(Ordering::SeqCst)
        }

        pub fn presence(&self, iface: &str) -> HookPresence {
            self.probe(iface).unwrap()
        }

        pub fn jump_count(&self) -> usize {
            self.inner.lock().unwrap().jumps.len()
        }

        /// Dispatch filters attached to one hook point.
        pub fn filter_count(&self, iface: &str, dir: Direction) -> usize {
            let tc = self.inner.lock().unwrap();
            tc.filters.get(&(iface.to_string(), dir)).copied().unwrap_or(0)
        }
    }

    impl TcBackend for MemTcBackend {
        fn iface_exists(&self, iface: &str) -> bool {
            self.inner.lock().unwrap().ifaces.contains_key(iface)
        }

        fn probe(&self, iface: &str) -> Result<HookPresence> {
            let tc = self.inner.lock().unwrap();
            let mut presence = tc.ifaces.get(iface).copied().unwrap_or_default();
            for dir in Direction::BOTH {
                let jump = tc.jumps.contains(&(iface.to_string(), dir));
                let hook = presence.hook(dir);
                presence.set(dir, hook, jump);
            }
            Ok(presence)
        }

        fn install(&self, iface: &str, dir: Direction) -> Result<()> {
            let mut tc = self.inner.lock().unwrap();
            if tc.fail == Some(dir) && tc.fail_count > 0 {
                tc.fail_count -= 1;
                return Err(Error::Hook(format!("injected failure on {iface}")));
            }
            let Some(p) = tc.ifaces.get_mut(iface) else {
                return Err(Error::Hook(format!("no interface {iface}")));
            };
            p.set(dir, true, true);
            tc.jumps.insert((iface.to_string(), dir));
            // attaching never replaces a filter already on the hook
            *tc.filters.entry((iface.to_string(), dir)).or_default() += 1;
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn detach(&self, iface: &str, dir: Direction) -> Result<()> {
            let mut tc = self.inner.lock().unwrap();
            tc.filters.remove(&(iface.to_string(), dir));
            if let Some(p) = tc.ifaces.get_mut(iface) {
                let jump = p.jump(dir);
                p.set(dir, false, jump);
            }
            Ok(())
        }

        fn jump_owners(&self) -> Result<Vec<String>> {
            let tc = self.inner.lock().unwrap();
            let owners: BTreeSet<String> = tc.jumps.iter().map(|(i, _)| i.clone()).collect();
            Ok(owners.into_iter().collect())
        }

        fn remove_jump(&self, iface: &str) -> Result<()> {
            self.remove_jumps(iface);
            Ok(())
        }
    }

    fn manager(backend: &Arc<MemTcBackend>) -> Arc<HookManager<MemTcBackend>> {
        let matcher = IfaceMatcher {
            workload_prefixes: vec!["cali".into()],
            host_ifaces: vec!["eth0".into()],
        };
        Arc::new(HookManager::new(
            backend.clone(),
            matcher,
            HookConfig::default(),
        ))
    }

    #[test]
    fn test_backoff_is_bounded() {
        let config = HookConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(5), Duration::from_millis(3200));
        assert_eq!(config.backoff(9), Duration::from_secs(30));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_matcher() {
        let matcher = IfaceMatcher {
            workload_prefixes: vec!["cali".into()],
            host_ifaces: vec!["eth0".into()],
        };
        assert!(matcher.matches("cali1234"));
        assert!(matcher.matches("eth0"));
        assert!(!matcher.matches("eth1"));
        assert!(!matcher.matches("lo"));
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let backend = Arc::new(MemTcBackend::default());
        backend.add_iface("cali1");
        let hooks = manager(&backend);

        assert_eq!(hooks.ensure("cali1", false).await, HookState::Attached);
        assert!(backend.presence("cali1").all_complete());
        assert_eq!(backend.installs(), 2);

        for _ in 0..5 {
            assert_eq!(hooks.ensure("cali1", true).await, HookState::Attached);
        }
        assert_eq!(backend.installs(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_same_iface() {
        let backend = Arc::new(MemTcBackend::default());
        backend.add_iface("cali1");
        let hooks = manager(&backend);

        let mut tasks = JoinSet::new();
        for _ in 0..10 {
            let hooks = hooks.clone();
            tasks.spawn(async move { hooks.ensure("cali1", true).await });
        }
        while let Some(state) = tasks.join_next().await {
            assert_eq!(state.unwrap(), HookState::Attached);
        }
        assert_eq!(backend.installs(), 2);
    }

    #[tokio::test]
    async fn test_missing_ingress_hook_is_reattached() {
        let backend = Arc::new(MemTcBackend::default());
        backend.add_iface("cali1");
        let hooks = manager(&backend);
        hooks.ensure("cali1", false).await;

        backend.remove_hook("cali1", Direction::Ingress);
        assert!(!backend.presence("cali1").ingress);
        hooks.handle(Trigger::Tick).await;

        assert_eq!(hooks.state("cali1").await, Some(HookState::Reattached));
        assert!(backend.presence("cali1").all_complete());
        assert_eq!(backend.installs(), 3);
    }

    #[tokio::test]
    async fn test_removed_dispatch_layer_is_recovered() {
        let backend = Arc::new(MemTcBackend::default());
        backend.add_iface("eth0");
        let hooks = manager(&backend);
        hooks.ensure("eth0", false).await;

        backend.remove_jumps("eth0");
        assert_eq!(backend.jump_count(), 0);
        hooks.handle(Trigger::Notify(Some("eth0".into()))).await;

        assert_eq!(hooks.state("eth0").await, Some(HookState::Reattached));
        assert!(backend.presence("eth0").all_complete());
        assert_eq!(backend.jump_count(), 2);
    }

    #[tokio::test]
    async fn test_restart_with_orphaned_hook_keeps_one_filter() {
        let backend = Arc::new(MemTcBackend::default());
        backend.add_iface("cali1");
        manager(&backend).ensure("cali1", false).await;

        // the next run finds the hooks attached but the pinned tables gone
        backend.remove_jumps("cali1");
        let hooks = manager(&backend);
        assert_eq!(hooks.ensure("cali1", false).await, HookState::Attached);
        assert!(backend.presence("cali1").all_complete());
        for dir in Direction::BOTH {
            assert_eq!(backend.filter_count("cali1", dir), 1, "{dir:?}");
        }

        hooks.ensure("cali1", true).await;
        for dir in Direction::BOTH {
            assert_eq!(backend.filter_count("cali1", dir), 1, "{dir:?}");
        }
    }

    #[tokio::test]
    async fn test_failed_install_rolls_back() {
        let backend = Arc::new(MemTcBackend::default());
        backend.add_iface("cali1");
        backend.fail_installs(Direction::Egress, 1);
        let hooks = manager(&backend);

        assert_eq!(hooks.ensure("cali1", false).await, HookState::Absent);
        let presence = backend.presence("cali1");
        assert!(!presence.ingress);
        assert!(!presence.egress);

        assert_eq!(hooks.ensure("cali1", true).await, HookState::Attached);
        assert!(backend.presence("cali1").all_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off() {
        let backend = Arc::new(MemTcBackend::default());
        backend.add_iface("cali1");
        backend.fail_installs(Direction::Ingress, 2);
        let hooks = manager(&backend);

        assert_eq!(hooks.ensure("cali1", false).await, HookState::Absent);
        // still inside the 200ms backoff: no attempt is made
        assert_eq!(hooks.ensure("cali1", false).await, HookState::Absent);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(hooks.ensure("cali1", false).await, HookState::Absent);
        // second failure doubles the wait
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(hooks.ensure("cali1", false).await, HookState::Absent);
        assert_eq!(backend.installs(), 0);
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(hooks.ensure("cali1", false).await, HookState::Attached);
    }

    #[tokio::test]
    async fn test_irrelevant_interfaces_ignored() {
        let backend = Arc::new(MemTcBackend::default());
        backend.add_iface("lo");
        let hooks = manager(&backend);
        hooks.handle(Trigger::InterfaceAdded("lo".into())).await;
        assert_eq!(backend.installs(), 0);
        assert!(hooks.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_interface_is_forgotten() {
        let backend = Arc::new(MemTcBackend::default());
        backend.add_iface("cali1");
        let hooks = manager(&backend);
        hooks.ensure("cali1", false).await;
        backend.delete_iface("cali1");
        hooks.handle(Trigger::Tick).await;
        assert!(hooks.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_collection_is_throttled() {
        let backend = Arc::new(MemTcBackend::default());
        let hooks = manager(&backend);
        for i in 0..40 {
            let iface = format!("cali{i}");
            backend.add_iface(&iface);
            hooks.handle(Trigger::InterfaceAdded(iface)).await;
        }
        backend.add_iface("eth0");
        hooks.handle(Trigger::InterfaceAdded("eth0".into())).await;
        assert_eq!(backend.jump_count(), 82);

        for i in 0..40 {
            let iface = format!("cali{i}");
            backend.delete_iface(&iface);
            hooks.handle(Trigger::InterfaceRemoved(iface)).await;
        }
        assert_eq!(hooks.collect_garbage().unwrap(), 16);
        assert_eq!(hooks.collect_garbage().unwrap(), 16);
        assert_eq!(hooks.collect_garbage().unwrap(), 8);
        assert_eq!(hooks.collect_garbage().unwrap(), 0);
        assert_eq!(backend.jump_owners().unwrap(), vec!["eth0".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_repairs_within_reconcile_interval() {
        let backend = Arc::new(MemTcBackend::default());
        let hooks = manager(&backend);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(hooks.clone().run(rx, cancel.clone()));

        backend.add_iface("cali1");
        tx.send(Trigger::InterfaceAdded("cali1".into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hooks.state("cali1").await, Some(HookState::Attached));

        backend.remove_hook("cali1", Direction::Ingress);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(hooks.state("cali1").await, Some(HookState::Reattached));
        assert!(backend.presence("cali1").all_complete());

        backend.delete_iface("cali1");
        tx.send(Trigger::InterfaceRemoved("cali1".into())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(backend.jump_count(), 0);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
