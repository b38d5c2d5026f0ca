use mesh_dataplane::bpf::context::MapContext;
use mesh_dataplane::bpf::routes::{self, RouteTableState};

use crate::cli::RouteCommands;

pub(crate) fn run(ctx: &MapContext, cmd: RouteCommands) -> anyhow::Result<()> {
    match cmd {
        RouteCommands::Dump => dump(ctx)?,
    }
    Ok(())
}

fn dump(ctx: &MapContext) -> anyhow::Result<()> {
    let table = RouteTableState::load(routes::load_map(ctx)?)?;
    for line in routes::dump(&table.entries()?) {
        println!("{line}");
    }
    Ok(())
}
