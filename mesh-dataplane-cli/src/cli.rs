use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about = "A cli for inspecting the pinned mesh-dataplane tables", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub maps: MapArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Debug, Args)]
pub struct MapArgs {
    /// Root of the bpf filesystem
    #[arg(long, env = "MESH_BPF_FS", default_value = "/sys/fs/bpf", global = true)]
    pub bpf_fs: PathBuf,

    /// Namespace the agent pins its tables under
    #[arg(long, env = "MESH_MAP_NAMESPACE", default_value = "mesh", global = true)]
    pub map_namespace: String,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Used to interact with the route table
    #[command(subcommand)]
    Routes(RouteCommands),

    /// Used to interact with the NAT frontend and backend tables
    #[command(subcommand)]
    Nat(NatCommands),

    /// Used to interact with the affinity table
    #[command(subcommand)]
    Affinity(AffinityCommands),

    /// Used to interact with the conntrack table
    #[command(subcommand)]
    Conntrack(ConntrackCommands),

    /// Used to inspect per-interface dispatch tables
    #[command(subcommand)]
    Jump(JumpCommands),
}

#[derive(Clone, Subcommand, Debug)]
pub enum RouteCommands {
    /// Print every route, one per line
    Dump,
}

#[derive(Clone, Subcommand, Debug)]
pub enum NatCommands {
    /// List frontends and the backends they resolve to
    Dump,
}

#[derive(Clone, Subcommand, Debug)]
pub enum AffinityCommands {
    /// List sticky assignments
    Dump,
    /// Remove the assignment of a client to a service
    Delete {
        #[arg(long)]
        client: Ipv4Addr,
        #[arg(long)]
        ip: Ipv4Addr,
        #[arg(long)]
        port: u16,
        #[arg(long, default_value = "tcp")]
        protocol: String,
    },
}

#[derive(Clone, Subcommand, Debug)]
pub enum ConntrackCommands {
    /// List tracked flows
    Dump,
    /// Insert established flows until the table is full
    Fill {
        #[arg(long, default_value = "10.65.0.2")]
        src: Ipv4Addr,
        #[arg(long, default_value = "10.65.1.2")]
        dst: Ipv4Addr,
        #[arg(long, default_value_t = 80)]
        dst_port: u16,
        #[arg(long, default_value = "tcp")]
        protocol: String,
    },
    /// Remove every tracked flow
    Clean,
}

#[derive(Clone, Subcommand, Debug)]
pub enum JumpCommands {
    /// List dispatch tables by interface and direction
    List,
}
