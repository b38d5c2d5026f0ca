mod affinity;
mod cli;
mod conntrack;
mod jump;
mod routes;
mod service;

use anyhow::anyhow;
use clap::Parser;
use mesh_dataplane::bpf::context::{MapContext, Table};
use mesh_dataplane::bpf::pin::{BpffsPinStore, PinStore};
use mesh_dataplane_common::Protocol;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands, MapArgs};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_subscriber();
    let ctx = map_context(&cli.maps)?;
    match cli.command {
        Commands::Routes(cmd) => routes::run(&ctx, cmd)?,
        Commands::Nat(cmd) => service::run(&ctx, cmd)?,
        Commands::Affinity(cmd) => affinity::run(&ctx, cmd)?,
        Commands::Conntrack(cmd) => conntrack::run(&ctx, cmd)?,
        Commands::Jump(cmd) => jump::run(&ctx, cmd)?,
    };
    Ok(())
}

/// Context whose table sizes are the ones the agent actually pinned.
fn map_context(args: &MapArgs) -> anyhow::Result<MapContext> {
    let mut ctx = MapContext::new(&args.bpf_fs, &args.map_namespace);
    for table in Table::ALL {
        if let Some(info) = BpffsPinStore.probe(&ctx.map_path(table))? {
            debug!(%table, max_entries = info.max_entries, "found pinned table");
            ctx.sizes.set(table, info.max_entries);
        }
    }
    Ok(ctx)
}

pub(crate) fn protocol(value: &str) -> anyhow::Result<Protocol> {
    Protocol::try_from(value).map_err(|e| anyhow!("{value}: {e}"))
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_dataplane=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
