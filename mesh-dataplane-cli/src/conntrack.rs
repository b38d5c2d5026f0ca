use std::borrow::Cow;
use std::net::{Ipv4Addr, SocketAddrV4};

use mesh_dataplane::bpf::conntrack::{
    self, ConnState, ConntrackTable, LegState, NatTranslation, Timeouts,
};
use mesh_dataplane::bpf::context::MapContext;
use mesh_dataplane::clock::MonotonicClock;
use mesh_dataplane_common::Protocol;
use mesh_dataplane_common::conntrack::{ConntrackKey, ConntrackValue};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::cli::ConntrackCommands;

pub(crate) fn run(ctx: &MapContext, cmd: ConntrackCommands) -> anyhow::Result<()> {
    let table = ConntrackTable::new(
        conntrack::load_map(ctx)?,
        MonotonicClock,
        Timeouts::default(),
    );
    match cmd {
        ConntrackCommands::Dump => {
            let now = table.now_ns()?;
            let rows: Vec<ConnectionRow> = table
                .dump()?
                .into_iter()
                .map(|(key, value)| ConnectionRow { key, value, now })
                .collect();
            println!("{}", Table::new(rows).with(Style::modern()));
        }
        ConntrackCommands::Fill {
            src,
            dst,
            dst_port,
            protocol,
        } => {
            let protocol = crate::protocol(&protocol)?;
            let template = ConntrackKey::new(protocol as u8, src.to_bits(), 1, dst.to_bits(), dst_port);
            let added = table.fill(&template)?;
            println!("inserted {added} entries, table holds {}", table.len()?);
        }
        ConntrackCommands::Clean => {
            let removed = table.flush()?;
            println!("removed {removed} entries");
        }
    }
    Ok(())
}

struct ConnectionRow {
    key: ConntrackKey,
    value: ConntrackValue,
    now: u64,
}

impl Tabled for ConnectionRow {
    const LENGTH: usize = 7;

    fn fields(&self) -> Vec<Cow<'_, str>> {
        let proto = Protocol::try_from(self.key.protocol)
            .map(|p| p.to_string())
            .unwrap_or_else(|_| self.key.protocol.to_string());
        let a = SocketAddrV4::new(Ipv4Addr::from_bits(self.key.addr_a), self.key.port_a);
        let b = SocketAddrV4::new(Ipv4Addr::from_bits(self.key.addr_b), self.key.port_b);
        let nat = NatTranslation::of(&self.value)
            .map(|n| format!("{} -> {}", n.orig, n.xlated))
            .unwrap_or_default();
        vec![
            Cow::Owned(proto),
            Cow::Owned(a.to_string()),
            Cow::Owned(b.to_string()),
            Cow::Owned(format!("{:?}", ConnState::of(&self.value))),
            Cow::Owned(format!(
                "{}@{} / {}@{}",
                LegState::of(&self.value.a_to_b),
                self.value.a_to_b.ifindex,
                LegState::of(&self.value.b_to_a),
                self.value.b_to_a.ifindex,
            )),
            Cow::Owned(format!(
                "{}s",
                self.now.saturating_sub(self.value.last_seen_ns) / 1_000_000_000
            )),
            Cow::Owned(nat),
        ]
    }

    fn headers() -> Vec<Cow<'static, str>> {
        vec![
            Cow::Borrowed("PROTO"),
            Cow::Borrowed("A"),
            Cow::Borrowed("B"),
            Cow::Borrowed("STATE"),
            Cow::Borrowed("LEGS"),
            Cow::Borrowed("LAST_SEEN"),
            Cow::Borrowed("NAT"),
        ]
    }
}
