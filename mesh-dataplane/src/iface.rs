use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::bpf::hooks::Trigger;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Link {
    pub index: u32,
    pub up: bool,
}

pub trait LinkSource: Send + Sync {
    fn links(&self) -> Result<BTreeMap<String, Link>>;
}

/// Reads links from the kernel's interface list and their state from sysfs.
pub struct SysLinks {
    sys_class_net: PathBuf,
}

impl Default for SysLinks {
    fn default() -> Self {
        Self {
            sys_class_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl SysLinks {
    fn is_up(&self, name: &str) -> bool {
        match std::fs::read_to_string(self.sys_class_net.join(name).join("operstate")) {
            // tunnel devices report "unknown" while passing traffic
            Ok(state) => !matches!(state.trim(), "down" | "lowerlayerdown" | "notpresent"),
            Err(_) => false,
        }
    }
}

impl LinkSource for SysLinks {
    fn links(&self) -> Result<BTreeMap<String, Link>> {
        let ifaces = nix::net::if_::if_nameindex()?;
        Ok(ifaces
            .iter()
            .map(|iface| {
                let name = iface.name().to_string_lossy().into_owned();
                let link = Link {
                    index: iface.index(),
                    up: self.is_up(&name),
                };
                (name, link)
            })
            .collect())
    }
}

/// Triggers that turn `prev` into `next`. An interface that was recreated
/// under the same name is reported as removed and added again.
pub fn diff(prev: &BTreeMap<String, Link>, next: &BTreeMap<String, Link>) -> Vec<Trigger> {
    let mut triggers = Vec::new();
    for (name, old) in prev {
        match next.get(name) {
            None => triggers.push(Trigger::InterfaceRemoved(name.clone())),
            Some(new) if new.index != old.index => {
                triggers.push(Trigger::InterfaceRemoved(name.clone()));
                triggers.push(Trigger::InterfaceAdded(name.clone()));
            }
            Some(new) if new.up && !old.up => {
                triggers.push(Trigger::InterfaceFlap(name.clone()));
            }
            Some(_) => {}
        }
    }
    for name in next.keys() {
        if !prev.contains_key(name) {
            triggers.push(Trigger::InterfaceAdded(name.clone()));
        }
    }
    triggers
}

/// Polls `source` and forwards interface changes to the hook manager.
/// Every interface present at start is reported as added.
pub async fn run_watcher<S: LinkSource>(
    source: S,
    period: Duration,
    triggers: mpsc::Sender<Trigger>,
    cancel: CancellationToken,
) -> Result<()> {
    info!("starting interface watcher");
    let mut known = BTreeMap::new();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let links = match source.links() {
                    Ok(links) => links,
                    Err(e) => {
                        warn!(%e, "failed to list interfaces");
                        continue;
                    }
                };
                for trigger in diff(&known, &links) {
                    debug!(?trigger, "interface change");
                    if triggers.send(trigger).await.is_err() {
                        info!("hook manager gone, stopping interface watcher");
                        return Ok(());
                    }
                }
                known = links;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn links(entries: &[(&str, u32, bool)]) -> BTreeMap<String, Link> {
        entries
            .iter()
            .map(|(n, index, up)| {
                (
                    n.to_string(),
                    Link {
                        index: *index,
                        up: *up,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_diff() {
        let prev = links(&[("eth0", 2, true), ("cali1", 10, false), ("cali2", 11, true)]);
        let next = links(&[("eth0", 2, true), ("cali1", 10, true), ("cali2", 12, true), ("cali3", 13, true)]);
        assert_eq!(
            diff(&prev, &next),
            vec![
                Trigger::InterfaceFlap("cali1".into()),
                Trigger::InterfaceRemoved("cali2".into()),
                Trigger::InterfaceAdded("cali2".into()),
                Trigger::InterfaceAdded("cali3".into()),
            ]
        );
        assert_eq!(
            diff(&next, &links(&[("eth0", 2, false)])),
            vec![
                Trigger::InterfaceRemoved("cali1".into()),
                Trigger::InterfaceRemoved("cali2".into()),
                Trigger::InterfaceRemoved("cali3".into()),
            ]
        );
        assert!(diff(&next, &next).is_empty());
    }

    #[derive(Clone, Default)]
    struct FakeLinks(Arc<Mutex<BTreeMap<String, Link>>>);

    impl LinkSource for FakeLinks {
        fn links(&self) -> Result<BTreeMap<String, Link>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_reports_changes() {
        let source = FakeLinks::default();
        *source.0.lock().unwrap() = links(&[("eth0", 2, true)]);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(
            source.clone(),
            Duration::from_secs(1),
            tx,
            cancel.clone(),
        ));

        assert_eq!(rx.recv().await, Some(Trigger::InterfaceAdded("eth0".into())));
        source.0.lock().unwrap().insert("cali1".into(), Link { index: 7, up: true });
        assert_eq!(rx.recv().await, Some(Trigger::InterfaceAdded("cali1".into())));
        source.0.lock().unwrap().remove("cali1");
        assert_eq!(rx.recv().await, Some(Trigger::InterfaceRemoved("cali1".into())));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
