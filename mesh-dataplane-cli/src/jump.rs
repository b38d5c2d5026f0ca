use std::collections::BTreeMap;

use mesh_dataplane::bpf::context::MapContext;
use mesh_dataplane::bpf::hooks::{self, Direction};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::cli::JumpCommands;

pub(crate) fn run(ctx: &MapContext, cmd: JumpCommands) -> anyhow::Result<()> {
    match cmd {
        JumpCommands::List => list(ctx)?,
    }
    Ok(())
}

#[derive(Tabled)]
#[tabled(rename_all = "UPPERCASE")]
struct JumpRow {
    interface: String,
    ingress: bool,
    egress: bool,
}

fn list(ctx: &MapContext) -> anyhow::Result<()> {
    let tables = hooks::list_jump_tables(&ctx.tc_dir())?;
    let mut rows: BTreeMap<String, JumpRow> = BTreeMap::new();
    for (iface, dir) in &tables {
        let row = rows.entry(iface.clone()).or_insert_with(|| JumpRow {
            interface: iface.clone(),
            ingress: false,
            egress: false,
        });
        match dir {
            Direction::Ingress => row.ingress = true,
            Direction::Egress => row.egress = true,
        }
    }
    println!("{}", Table::new(rows.into_values()).with(Style::modern()));
    println!("{} dispatch tables", tables.len());
    Ok(())
}
