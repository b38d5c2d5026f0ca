use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use mesh_dataplane_common::Protocol;

use crate::bpf::context::{MapContext, TableSizes};
use crate::bpf::hooks::{HookConfig, IfaceMatcher};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    Agent(AgentArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Path to the bpf fs for bpf maps
    #[arg(long, env = "MESH_BPF_FS", default_value = "/sys/fs/bpf")]
    pub bpf_fs: PathBuf,

    /// Directory under the bpf fs that holds this dataplane's pins
    #[arg(long, env = "MESH_MAP_NAMESPACE", default_value = "mesh")]
    pub map_namespace: String,

    /// Adopt maps pinned by a previous instance instead of recreating them
    #[arg(long, env = "MESH_BPF_MAP_REPIN_ENABLED", default_value_t = false)]
    pub map_repin_enabled: bool,

    /// Lock held while this instance owns the pinned state
    #[arg(long, env = "MESH_LOCK_FILE", default_value = "/run/mesh-dataplane.lock")]
    pub lock_file: PathBuf,

    /// How long to wait for a previous owner to release the lock
    #[arg(long, env = "MESH_LOCK_WAIT", default_value = "30s", value_parser = parse_duration)]
    pub lock_wait: Duration,

    /// Dataplane program object
    #[arg(
        long,
        env = "MESH_BPF_OBJECT",
        default_value = "/usr/lib/mesh-dataplane/mesh-dataplane.o"
    )]
    pub bpf_object: PathBuf,

    /// Per-interface dispatch program object
    #[arg(
        long,
        env = "MESH_BPF_DISPATCH_OBJECT",
        default_value = "/usr/lib/mesh-dataplane/mesh-dispatch.o"
    )]
    pub bpf_dispatch_object: PathBuf,

    /// Metrics listener for agent
    #[arg(long, env = "MESH_METRICS_ADDRESS", default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,

    /// Desired state document written by the orchestrator
    #[arg(
        long,
        env = "MESH_DESIRED_STATE",
        default_value = "/var/run/mesh/desired-state.json"
    )]
    pub desired_state: PathBuf,

    #[arg(long, env = "MESH_DESIRED_STATE_POLL", default_value = "1s", value_parser = parse_duration)]
    pub desired_state_poll: Duration,

    /// Prefix of workload interface names
    #[arg(
        long,
        env = "MESH_WORKLOAD_IFACE_PREFIX",
        default_value = "cali",
        value_delimiter = ','
    )]
    pub workload_iface_prefix: Vec<String>,

    /// Host-facing interfaces
    #[arg(long, env = "MESH_HOST_IFACE", default_value = "eth0", value_delimiter = ',')]
    pub host_iface: Vec<String>,

    /// Packet mark bits the dataplane may use
    #[arg(long, env = "MESH_MARK_MASK", default_value = "0xffff0000", value_parser = parse_mask)]
    pub mark_mask: u32,

    #[arg(long, env = "MESH_TUNNEL", value_enum, default_value_t = TunnelKind::None)]
    pub tunnel: TunnelKind,

    #[arg(
        long,
        env = "MESH_EXTERNAL_SERVICE_MODE",
        value_enum,
        default_value_t = ExternalServiceMode::Tunnel
    )]
    pub external_service_mode: ExternalServiceMode,

    /// Balance services when sockets connect instead of per packet
    #[arg(long, env = "MESH_CONNECT_TIME_LB", default_value_t = false)]
    pub connect_time_lb: bool,

    /// Protocols that are load balanced
    #[arg(
        long,
        env = "MESH_PROTOCOL",
        value_enum,
        default_values_t = [ProtocolArg::Tcp, ProtocolArg::Udp, ProtocolArg::Sctp],
        value_delimiter = ','
    )]
    pub protocol: Vec<ProtocolArg>,

    #[arg(long, env = "MESH_NAT_FE_SIZE", default_value_t = TableSizes::default().nat_frontend)]
    pub nat_fe_size: u32,

    #[arg(long, env = "MESH_NAT_BE_SIZE", default_value_t = TableSizes::default().nat_backend)]
    pub nat_be_size: u32,

    #[arg(long, env = "MESH_NAT_SRC_SIZE", default_value_t = TableSizes::default().source_ranges)]
    pub nat_src_size: u32,

    #[arg(long, env = "MESH_AFFINITY_SIZE", default_value_t = TableSizes::default().affinity)]
    pub affinity_size: u32,

    #[arg(long, env = "MESH_CT_SIZE", default_value_t = TableSizes::default().conntrack)]
    pub ct_size: u32,

    #[arg(long, env = "MESH_ROUTE_SIZE", default_value_t = TableSizes::default().routes)]
    pub route_size: u32,

    /// Period of the conntrack aging sweep
    #[arg(long, env = "MESH_CT_SCAN_PERIOD", default_value = "10s", value_parser = parse_duration)]
    pub ct_scan_period: Duration,

    /// Period of the affinity aging sweep
    #[arg(long, env = "MESH_AFFINITY_SCAN_PERIOD", default_value = "10s", value_parser = parse_duration)]
    pub affinity_scan_period: Duration,

    /// How often every hooked interface is verified
    #[arg(long, env = "MESH_RECONCILE_INTERVAL", default_value = "1s", value_parser = parse_duration)]
    pub reconcile_interval: Duration,

    /// How often orphaned dispatch tables are collected
    #[arg(long, env = "MESH_CLEANUP_INTERVAL", default_value = "5s", value_parser = parse_duration)]
    pub cleanup_interval: Duration,

    /// Most dispatch tables collected per cleanup pass
    #[arg(long, env = "MESH_CLEANUP_BATCH", default_value_t = 16)]
    pub cleanup_batch: usize,
}

impl AgentArgs {
    pub fn map_context(&self) -> MapContext {
        let mut ctx = MapContext::new(&self.bpf_fs, &self.map_namespace);
        ctx.repin = self.map_repin_enabled;
        ctx.sizes = TableSizes {
            nat_frontend: self.nat_fe_size,
            nat_backend: self.nat_be_size,
            source_ranges: self.nat_src_size,
            affinity: self.affinity_size,
            conntrack: self.ct_size,
            routes: self.route_size,
        };
        ctx
    }

    pub fn options(&self) -> DataplaneOptions {
        DataplaneOptions {
            protocols: self.protocol.iter().map(|p| Protocol::from(*p)).collect(),
            tunnel: self.tunnel,
            external_service_mode: self.external_service_mode,
            connect_time_lb: self.connect_time_lb,
        }
    }

    pub fn hook_config(&self) -> HookConfig {
        HookConfig {
            reconcile_interval: self.reconcile_interval,
            cleanup_interval: self.cleanup_interval,
            cleanup_batch: self.cleanup_batch,
            ..Default::default()
        }
    }

    pub fn iface_matcher(&self) -> IfaceMatcher {
        IfaceMatcher {
            workload_prefixes: self.workload_iface_prefix.clone(),
            host_ifaces: self.host_iface.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum TunnelKind {
    #[default]
    None,
    Ipip,
    Vxlan,
    Wireguard,
}

impl TunnelKind {
    /// Value handed to the programs through the object's globals.
    pub fn code(&self) -> u8 {
        match self {
            TunnelKind::None => 0,
            TunnelKind::Ipip => 1,
            TunnelKind::Vxlan => 2,
            TunnelKind::Wireguard => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum ExternalServiceMode {
    /// Forward to remote backends through the overlay
    #[default]
    Tunnel,
    /// Backends answer clients directly
    Dsr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ProtocolArg {
    Tcp,
    Udp,
    Sctp,
}

impl From<ProtocolArg> for Protocol {
    fn from(value: ProtocolArg) -> Self {
        match value {
            ProtocolArg::Tcp => Protocol::Tcp,
            ProtocolArg::Udp => Protocol::Udp,
            ProtocolArg::Sctp => Protocol::Sctp,
        }
    }
}

/// Every dataplane behaviour switch, validated at parse time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataplaneOptions {
    pub protocols: Vec<Protocol>,
    pub tunnel: TunnelKind,
    pub external_service_mode: ExternalServiceMode,
    pub connect_time_lb: bool,
}

impl Default for DataplaneOptions {
    fn default() -> Self {
        Self {
            protocols: vec![Protocol::Tcp, Protocol::Udp, Protocol::Sctp],
            tunnel: TunnelKind::None,
            external_service_mode: ExternalServiceMode::Tunnel,
            connect_time_lb: false,
        }
    }
}

impl DataplaneOptions {
    pub fn dsr(&self) -> bool {
        self.external_service_mode == ExternalServiceMode::Dsr
    }
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let offset = s
        .rfind(|c: char| c.is_ascii_digit())
        .ok_or_else(|| format!("{s} does not contain a duration value"))?;
    let (magnitude, unit) = s.split_at(offset + 1);
    let magnitude = magnitude.parse::<u64>().map_err(|e| e.to_string())?;
    let ms = match unit {
        "ms" => 1,
        "s" => 1000,
        "m" => 1000 * 60,
        "h" => 1000 * 60 * 60,
        _ => return Err(format!("invalid duration unit {unit:?} (expected ms, s, m or h)")),
    };
    magnitude
        .checked_mul(ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("{s} overflows"))
}

pub fn parse_mask(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid mark mask {s}: {e}"))
}
