use std::fs::File;
use std::path::Path;

use aya::programs::cgroup_sock_addr::CgroupSockAddrLinkId;
use aya::programs::{CgroupAttachMode, CgroupSockAddr, ProgramFd, SchedClassifier};
use aya::{Ebpf, EbpfLoader};
use tracing::{info, warn};

use crate::bpf::context::MapContext;
use crate::config::DataplaneOptions;
use crate::markbits::MarkBits;
use crate::{Error, Result};

pub const INGRESS_PROGRAM: &str = "mesh_tc_ingress";
pub const EGRESS_PROGRAM: &str = "mesh_tc_egress";
pub const CONNECT_PROGRAM: &str = "mesh_connect4";
const CGROUP_SYS_DIR: &str = "/sys/fs/cgroup";
const UNPRIVILEGED_BPF_SYSCTL: &str = "/proc/sys/kernel/unprivileged_bpf_disabled";

/// The loaded dataplane object. Its tables are pinned under the context's
/// pin directory, so a pin left in place by `pin::prepare` is reused.
pub struct Dataplane {
    ebpf: Ebpf,
    _connect_link: Option<CgroupSockAddrLinkId>,
}

impl Dataplane {
    pub fn load(
        ctx: &MapContext,
        options: &DataplaneOptions,
        marks: &MarkBits,
        object: &Path,
    ) -> Result<Self> {
        let tunnel = options.tunnel.code();
        let dsr = u8::from(options.dsr());
        let mask = marks.mask();

        std::fs::create_dir_all(ctx.pin_dir())?;
        let mut loader = EbpfLoader::new();
        loader.map_pin_path(ctx.pin_dir());
        for spec in ctx.specs() {
            loader.set_max_entries(spec.table.name(), spec.max_entries);
        }
        loader
            .set_global("MESH_TUNNEL", &tunnel, false)
            .set_global("MESH_DSR", &dsr, false)
            .set_global("MESH_MARK_MASK", &mask, false);

        info!(object = %object.display(), "loading dataplane programs");
        let mut ebpf = loader.load_file(object)?;
        if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
            warn!(%e, "failed to init ebpf logger");
        }

        let connect_link = if options.connect_time_lb {
            let cgroup = File::open(CGROUP_SYS_DIR)?;
            Some(attach_cgroup_connect_bpf_program(
                &mut ebpf,
                cgroup,
                CONNECT_PROGRAM,
                CgroupAttachMode::Single,
            )?)
        } else {
            None
        };

        Ok(Self {
            ebpf,
            _connect_link: connect_link,
        })
    }

    /// Loads the main tc programs and returns handles the per-interface
    /// dispatch tables can point at.
    pub fn tc_programs(&mut self) -> Result<(ProgramFd, ProgramFd)> {
        Ok((
            load_tc_program(&mut self.ebpf, INGRESS_PROGRAM)?,
            load_tc_program(&mut self.ebpf, EGRESS_PROGRAM)?,
        ))
    }
}

fn load_tc_program(ebpf: &mut Ebpf, name: &str) -> Result<ProgramFd> {
    let program: &mut SchedClassifier = ebpf
        .program_mut(name)
        .ok_or_else(|| Error::EbpfProgramError(format!("failed to load program {name}")))?
        .try_into()?;
    if let Err(e) = program.load()
        && !matches!(e, aya::programs::ProgramError::AlreadyLoaded)
    {
        return Err(e.into());
    };
    Ok(program.fd()?.try_clone()?)
}

fn attach_cgroup_connect_bpf_program(
    ebpf: &mut Ebpf,
    cgroup: File,
    name: &str,
    attach_mode: CgroupAttachMode,
) -> Result<CgroupSockAddrLinkId> {
    let program: &mut CgroupSockAddr = ebpf
        .program_mut(name)
        .ok_or_else(|| Error::EbpfProgramError(format!("failed to load program {name}")))?
        .try_into()?;
    if let Err(e) = program.load()
        && !matches!(e, aya::programs::ProgramError::AlreadyLoaded)
    {
        return Err(e.into());
    };
    info!("attaching connect-time load balancer");
    Ok(program.attach(cgroup, attach_mode)?)
}

/// Keeps unprivileged users away from the pinned tables. Best effort.
pub fn disable_unprivileged_bpf() {
    match std::fs::write(UNPRIVILEGED_BPF_SYSCTL, "1") {
        Ok(()) => info!("set kernel.unprivileged_bpf_disabled=1"),
        Err(e) => warn!(%e, "failed to set kernel.unprivileged_bpf_disabled"),
    }
}
