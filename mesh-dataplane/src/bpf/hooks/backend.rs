use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use aya::maps::ProgramArray;
use aya::programs::{ProgramFd, SchedClassifier, TcAttachType, tc};
use aya::{Ebpf, EbpfLoader};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{Error, Result};

pub const DISPATCH_PROGRAM: &str = "mesh_dispatch";
const JUMP_MAP: &str = "jump";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    /// Suffix of the per-interface dispatch table directory.
    pub fn suffix(&self) -> &'static str {
        match self {
            Direction::Ingress => "igr",
            Direction::Egress => "egr",
        }
    }

    fn attach_type(&self) -> TcAttachType {
        match self {
            Direction::Ingress => TcAttachType::Ingress,
            Direction::Egress => TcAttachType::Egress,
        }
    }

    fn tc_name(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

/// Which of an interface's hooks and dispatch tables currently exist.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HookPresence {
    pub ingress: bool,
    pub egress: bool,
    pub ingress_jump: bool,
    pub egress_jump: bool,
}

impl HookPresence {
    pub fn hook(&self, dir: Direction) -> bool {
        match dir {
            Direction::Ingress => self.ingress,
            Direction::Egress => self.egress,
        }
    }

    pub fn jump(&self, dir: Direction) -> bool {
        match dir {
            Direction::Ingress => self.ingress_jump,
            Direction::Egress => self.egress_jump,
        }
    }

    pub fn set(&mut self, dir: Direction, hook: bool, jump: bool) {
        match dir {
            Direction::Ingress => {
                self.ingress = hook;
                self.ingress_jump = jump;
            }
            Direction::Egress => {
                self.egress = hook;
                self.egress_jump = jump;
            }
        }
    }

    pub fn is_complete(&self, dir: Direction) -> bool {
        self.hook(dir) && self.jump(dir)
    }

    pub fn all_complete(&self) -> bool {
        Direction::BOTH.iter().all(|d| self.is_complete(*d))
    }
}

/// Kernel side of hook management. Every call must be idempotent.
pub trait TcBackend: Send + Sync {
    fn iface_exists(&self, iface: &str) -> bool;
    fn probe(&self, iface: &str) -> Result<HookPresence>;
    /// Installs the dispatch table and hook for one direction, pointing the
    /// table at the current program. Callers detach any hook already present.
    fn install(&self, iface: &str, dir: Direction) -> Result<()>;
    fn detach(&self, iface: &str, dir: Direction) -> Result<()>;
    /// Interfaces that own at least one pinned dispatch table.
    fn jump_owners(&self) -> Result<Vec<String>>;
    fn remove_jump(&self, iface: &str) -> Result<()>;
}

pub fn jump_dir(tc_dir: &Path, iface: &str, dir: Direction) -> PathBuf {
    tc_dir.join(format!("{iface}_{}", dir.suffix()))
}

/// Splits a dispatch directory name back into its interface and direction.
pub fn parse_jump_dir(name: &str) -> Option<(&str, Direction)> {
    let (iface, suffix) = name.rsplit_once('_')?;
    let dir = match suffix {
        "igr" => Direction::Ingress,
        "egr" => Direction::Egress,
        _ => return None,
    };
    (!iface.is_empty()).then_some((iface, dir))
}

/// Every dispatch table directory under `tc_dir`, sorted by interface then
/// direction. Directories whose jump map is already gone are included so
/// they can still be collected.
pub fn list_jump_tables(tc_dir: &Path) -> Result<Vec<(String, Direction)>> {
    let entries = match std::fs::read_dir(tc_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut tables = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match parse_jump_dir(name) {
            Some((iface, dir)) => {
                tables.insert((iface.to_string(), dir));
            }
            None => warn!(name, "unexpected entry in dispatch table directory"),
        }
    }
    Ok(tables.into_iter().collect())
}

/// Attaches a small per-interface dispatch program whose pinned `jump`
/// table tail-calls into the main dataplane programs.
pub struct AyaTcBackend {
    tc_dir: PathBuf,
    dispatch_object: PathBuf,
    ingress: ProgramFd,
    egress: ProgramFd,
    loaded: Mutex<HashMap<(String, Direction), Ebpf>>,
}

impl AyaTcBackend {
    /// `ingress` and `egress` are the main programs every dispatch table points at.
    pub fn new(
        tc_dir: PathBuf,
        dispatch_object: PathBuf,
        ingress: ProgramFd,
        egress: ProgramFd,
    ) -> Result<Self> {
        std::fs::create_dir_all(&tc_dir)?;
        Ok(Self {
            tc_dir,
            dispatch_object,
            ingress,
            egress,
            loaded: Mutex::new(HashMap::new()),
        })
    }

    fn target(&self, dir: Direction) -> &ProgramFd {
        match dir {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }

    fn loaded(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, Direction), Ebpf>>> {
        self.loaded
            .lock()
            .map_err(|_| Error::Hook("dispatch program registry poisoned".into()))
    }

    fn load_dispatch(&self, iface: &str, dir: Direction) -> Result<Ebpf> {
        let pin_dir = jump_dir(&self.tc_dir, iface, dir);
        std::fs::create_dir_all(&pin_dir)?;
        let mut ebpf = EbpfLoader::new()
            .map_pin_path(&pin_dir)
            .load_file(&self.dispatch_object)?;

        let map = ebpf
            .map_mut(JUMP_MAP)
            .ok_or_else(|| Error::MapNotFound {
                name: JUMP_MAP.into(),
            })?;
        let mut jump = ProgramArray::try_from(map)?;
        jump.set(0, self.target(dir), 0)?;

        // error adding clsact to the interface if it is already added is harmless
        let _ = tc::qdisc_add_clsact(iface);
        attach_tc_bpf_program(&mut ebpf, iface, DISPATCH_PROGRAM, dir.attach_type())?;
        Ok(ebpf)
    }

    fn filter_present(&self, iface: &str, dir: Direction) -> Result<bool> {
        let output = Command::new("tc")
            .args(["-j", "filter", "show", "dev", iface, dir.tc_name()])
            .output()?;
        if !output.status.success() {
            debug!(
                iface,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "tc filter show failed"
            );
            return Ok(false);
        }
        Ok(has_dispatch_filter(&output.stdout))
    }
}

impl TcBackend for AyaTcBackend {
    fn iface_exists(&self, iface: &str) -> bool {
        nix::net::if_::if_nametoindex(iface).is_ok()
    }

    fn probe(&self, iface: &str) -> Result<HookPresence> {
        let mut presence = HookPresence::default();
        for dir in Direction::BOTH {
            let hook = self.filter_present(iface, dir)?;
            let jump = jump_dir(&self.tc_dir, iface, dir).join(JUMP_MAP).exists();
            presence.set(dir, hook, jump);
        }
        Ok(presence)
    }

    fn install(&self, iface: &str, dir: Direction) -> Result<()> {
        // drop the previous attachment first so its link cannot outlive the new one
        let previous = self.loaded()?.remove(&(iface.to_string(), dir));
        drop(previous);
        let ebpf = self.load_dispatch(iface, dir)?;
        self.loaded()?.insert((iface.to_string(), dir), ebpf);
        Ok(())
    }

    fn detach(&self, iface: &str, dir: Direction) -> Result<()> {
        let previous = self.loaded()?.remove(&(iface.to_string(), dir));
        drop(previous);
        if let Err(e) = tc::qdisc_detach_program(iface, dir.attach_type(), DISPATCH_PROGRAM) {
            debug!(iface, %e, "dispatch program was not attached");
        }
        Ok(())
    }

    fn jump_owners(&self) -> Result<Vec<String>> {
        let owners: BTreeSet<String> = list_jump_tables(&self.tc_dir)?
            .into_iter()
            .map(|(iface, _)| iface)
            .collect();
        Ok(owners.into_iter().collect())
    }

    fn remove_jump(&self, iface: &str) -> Result<()> {
        for dir in Direction::BOTH {
            let previous = self.loaded()?.remove(&(iface.to_string(), dir));
            drop(previous);
            match std::fs::remove_dir_all(jump_dir(&self.tc_dir, iface, dir)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn attach_tc_bpf_program(
    ebpf: &mut Ebpf,
    iface: &str,
    name: &str,
    attach_type: TcAttachType,
) -> Result<()> {
    let program: &mut SchedClassifier = ebpf
        .program_mut(name)
        .ok_or_else(|| Error::EbpfProgramError(format!("failed to load program {name}")))?
        .try_into()?;
    if let Err(e) = program.load()
        && !matches!(e, aya::programs::ProgramError::AlreadyLoaded)
    {
        return Err(e.into());
    };
    if let Err(e) = program.attach(iface, attach_type)
        && !matches!(e, aya::programs::ProgramError::AlreadyAttached)
    {
        return Err(e.into());
    }
    Ok(())
}

/// Looks for the dispatch program in `tc -j filter show` output.
fn has_dispatch_filter(json: &[u8]) -> bool {
    let Ok(Value::Array(filters)) = serde_json::from_slice::<Value>(json) else {
        return false;
    };
    filters.iter().any(|f| {
        f.get("options")
            .and_then(|o| o.get("bpf_name"))
            .and_then(Value::as_str)
            .is_some_and(|name| name.starts_with(DISPATCH_PROGRAM))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_jump_dir() {
        assert_eq!(
            parse_jump_dir("cali12345_igr"),
            Some(("cali12345", Direction::Ingress))
        );
        assert_eq!(
            parse_jump_dir("eth0_1_egr"),
            Some(("eth0_1", Direction::Egress))
        );
        assert_eq!(parse_jump_dir("eth0"), None);
        assert_eq!(parse_jump_dir("_igr"), None);
        assert_eq!(parse_jump_dir("eth0_xdp"), None);
    }

    #[test]
    fn test_jump_dir_layout() {
        let dir = jump_dir(Path::new("/sys/fs/bpf/mesh/tc"), "eth0", Direction::Egress);
        assert_eq!(dir, PathBuf::from("/sys/fs/bpf/mesh/tc/eth0_egr"));
    }

    #[test]
    fn test_list_jump_tables() {
        let tc_dir = std::env::temp_dir().join(format!("mesh-tc-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&tc_dir);
        assert!(list_jump_tables(&tc_dir).unwrap().is_empty());

        for (iface, dir) in [("eth0", Direction::Egress), ("eth0", Direction::Ingress), ("cali1", Direction::Ingress)] {
            let path = jump_dir(&tc_dir, iface, dir);
            std::fs::create_dir_all(&path).unwrap();
            std::fs::write(path.join(JUMP_MAP), b"").unwrap();
        }
        std::fs::create_dir_all(jump_dir(&tc_dir, "cali2", Direction::Egress)).unwrap();
        std::fs::create_dir_all(tc_dir.join("stray")).unwrap();

        assert_eq!(
            list_jump_tables(&tc_dir).unwrap(),
            vec![
                ("cali1".to_string(), Direction::Ingress),
                ("cali2".to_string(), Direction::Egress),
                ("eth0".to_string(), Direction::Ingress),
                ("eth0".to_string(), Direction::Egress),
            ]
        );
        let _ = std::fs::remove_dir_all(&tc_dir);
    }

    #[test]
    fn test_has_dispatch_filter() {
        let attached = br#"[{"protocol":"all","pref":49152,"kind":"bpf","chain":0},
            {"protocol":"all","pref":49152,"kind":"bpf","chain":0,"options":{"handle":"0x1",
            "bpf_name":"mesh_dispatch","direct-action":true,"not_in_hw":true,"prog":{"id":42}}}]"#;
        assert!(has_dispatch_filter(attached));
        let other = br#"[{"kind":"bpf","options":{"bpf_name":"cali_tc_preamble"}}]"#;
        assert!(!has_dispatch_filter(other));
        assert!(!has_dispatch_filter(b"[]"));
        assert!(!has_dispatch_filter(b"not json"));
    }
}
