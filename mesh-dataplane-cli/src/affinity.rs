use std::borrow::Cow;
use std::net::Ipv4Addr;

use mesh_dataplane::bpf::affinity::{self, AffinityTable};
use mesh_dataplane::bpf::context::MapContext;
use mesh_dataplane::bpf::service::ServiceKey;
use mesh_dataplane::clock::{Clock, MonotonicClock};
use mesh_dataplane_common::affinity::{AffinityKey, AffinityValue};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::cli::AffinityCommands;

pub(crate) fn run(ctx: &MapContext, cmd: AffinityCommands) -> anyhow::Result<()> {
    let table = AffinityTable::new(affinity::load_map(ctx)?, MonotonicClock);
    match cmd {
        AffinityCommands::Dump => {
            let now = MonotonicClock.now_ns()?;
            let rows: Vec<AffinityRow> = table
                .dump()?
                .into_iter()
                .map(|(key, value)| AffinityRow { key, value, now })
                .collect();
            println!("{}", Table::new(rows).with(Style::modern()));
        }
        AffinityCommands::Delete {
            client,
            ip,
            port,
            protocol,
        } => {
            let service = ServiceKey::new(ip, port, crate::protocol(&protocol)?);
            table.delete(client, &service)?;
            println!("deleted affinity of {client} to {service}");
        }
    }
    Ok(())
}

struct AffinityRow {
    key: AffinityKey,
    value: AffinityValue,
    now: u64,
}

impl Tabled for AffinityRow {
    const LENGTH: usize = 4;

    fn fields(&self) -> Vec<Cow<'_, str>> {
        let service = ServiceKey::try_from(self.key.frontend)
            .map(|s| s.to_string())
            .unwrap_or_else(|_| format!("{:?}", self.key.frontend));
        vec![
            Cow::Owned(Ipv4Addr::from_bits(self.key.client_ip).to_string()),
            Cow::Owned(service),
            Cow::Owned(format!("{}/{}", self.value.id, self.value.ordinal)),
            Cow::Owned(format!(
                "{}s",
                self.now.saturating_sub(self.value.ts_ns) / 1_000_000_000
            )),
        ]
    }

    fn headers() -> Vec<Cow<'static, str>> {
        vec![
            Cow::Borrowed("CLIENT"),
            Cow::Borrowed("SERVICE"),
            Cow::Borrowed("ID/ORDINAL"),
            Cow::Borrowed("IDLE"),
        ]
    }
}
