use std::borrow::Cow;
use std::net::Ipv4Addr;

use mesh_dataplane::bpf::context::MapContext;
use mesh_dataplane::bpf::service::{self, ServiceKey, ServiceRecord};
use mesh_dataplane_common::service::BackendValue;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::cli::NatCommands;

pub(crate) fn run(ctx: &MapContext, cmd: NatCommands) -> anyhow::Result<()> {
    match cmd {
        NatCommands::Dump => dump(ctx)?,
    }
    Ok(())
}

struct FrontendRow {
    key: ServiceKey,
    record: ServiceRecord,
    backends: Vec<BackendValue>,
}

impl Tabled for FrontendRow {
    const LENGTH: usize = 5;

    fn fields(&self) -> Vec<Cow<'_, str>> {
        let mut backends = String::new();
        for (ordinal, be) in self.backends.iter().enumerate() {
            let marker = if (ordinal as u32) < self.record.local_count { " (local)" } else { "" };
            backends.push_str(&format!(
                "{ordinal}: {}:{}{marker}\n",
                Ipv4Addr::from_bits(be.ip),
                be.port
            ));
        }
        vec![
            Cow::Owned(self.key.to_string()),
            Cow::Owned(self.record.id.to_string()),
            Cow::Owned(format!("{}/{}", self.record.local_count, self.record.count)),
            Cow::Owned(format!("{:#x}", self.record.flags.bits())),
            Cow::Owned(backends),
        ]
    }

    fn headers() -> Vec<Cow<'static, str>> {
        vec![
            Cow::Borrowed("FRONTEND"),
            Cow::Borrowed("ID"),
            Cow::Borrowed("LOCAL/COUNT"),
            Cow::Borrowed("FLAGS"),
            Cow::Borrowed("BACKENDS"),
        ]
    }
}

fn dump(ctx: &MapContext) -> anyhow::Result<()> {
    let table = service::load(ctx)?;
    let rows: Vec<FrontendRow> = table
        .keys()
        .into_iter()
        .filter_map(|key| {
            let record = table.lookup(&key)?;
            let backends = table.backends(record.id).unwrap_or_default().to_vec();
            Some(FrontendRow {
                key,
                record,
                backends,
            })
        })
        .collect();

    println!("{}", Table::new(rows).with(Style::modern()));
    if table.pending_orphans() > 0 {
        println!("{} backend groups without a frontend", table.pending_orphans());
    }
    Ok(())
}
