mod state;

use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::Ipv4Addr;

use aya::maps::lpm_trie::Key as LpmKey;
use ipnetwork::Ipv4Network;
use mesh_dataplane_common::route::{
    ROUTE_HOST, ROUTE_IN_POOL, ROUTE_LOCAL, ROUTE_NAT_OUT, ROUTE_TUNNEL, ROUTE_WORKLOAD, RouteKey,
    RouteValue,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use state::{RouteDiff, RouteTableState};

use crate::bpf::context::{MapContext, Table};
use crate::bpf::{KernelLpmMap, LpmKeyed};
use crate::Result;

pub type RouteMap = KernelLpmMap<RouteKey, RouteValue>;

pub fn load_map(ctx: &MapContext) -> Result<RouteMap> {
    ctx.open_lpm(Table::Routes)
}

impl LpmKeyed for RouteKey {
    type Data = u32;

    fn to_lpm(&self) -> LpmKey<u32> {
        LpmKey::new(self.prefix_len, self.addr.to_be())
    }

    fn from_lpm(key: &LpmKey<u32>) -> Result<Self> {
        Ok(RouteKey {
            addr: u32::from_be(key.data()),
            prefix_len: key.prefix_len(),
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LocalWorkload {
    pub addr: Ipv4Addr,
    #[serde(default)]
    pub ifindex: Option<u32>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoteBlock {
    pub cidr: Ipv4Network,
    /// Address of the host that owns the block
    pub host: Ipv4Addr,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LocalHostAddr {
    pub addr: Ipv4Addr,
    #[serde(default)]
    pub ifindex: Option<u32>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpPool {
    pub cidr: Ipv4Network,
    #[serde(default)]
    pub nat_outgoing: bool,
}

/// Current address assignments the route table is derived from.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInputs {
    #[serde(default)]
    pub local_workloads: Vec<LocalWorkload>,
    #[serde(default)]
    pub remote_workloads: Vec<RemoteBlock>,
    #[serde(default)]
    pub local_hosts: Vec<LocalHostAddr>,
    #[serde(default)]
    pub remote_hosts: Vec<Ipv4Addr>,
    #[serde(default)]
    pub pools: Vec<IpPool>,
    /// Overlay address of this host; only routed when a tunnel is in use
    #[serde(default)]
    pub tunnel_addr: Option<Ipv4Addr>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteKind {
    /// A pool prefix with nothing more specific behind it
    Pool,
    LocalWorkload { ifindex: Option<u32> },
    RemoteWorkload { next_hop: Ipv4Addr },
    /// The local host's overlay address
    Tunnel,
    LocalHost { ifindex: Option<u32> },
    RemoteHost,
}

impl RouteKind {
    /// Lower wins when two inputs claim the same CIDR.
    fn precedence(&self) -> u8 {
        match self {
            RouteKind::LocalWorkload { .. } => 0,
            RouteKind::RemoteWorkload { .. } => 1,
            RouteKind::Tunnel => 2,
            RouteKind::LocalHost { .. } => 3,
            RouteKind::RemoteHost => 4,
            RouteKind::Pool => 5,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(
            self,
            RouteKind::LocalWorkload { .. } | RouteKind::Tunnel | RouteKind::LocalHost { .. }
        )
    }

    pub fn is_workload(&self) -> bool {
        matches!(
            self,
            RouteKind::LocalWorkload { .. } | RouteKind::RemoteWorkload { .. }
        )
    }

    pub fn is_host(&self) -> bool {
        matches!(
            self,
            RouteKind::Tunnel | RouteKind::LocalHost { .. } | RouteKind::RemoteHost
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouteEntry {
    pub cidr: Ipv4Network,
    pub kind: RouteKind,
    pub in_pool: bool,
    pub nat_out: bool,
}

impl RouteEntry {
    pub fn key(&self) -> RouteKey {
        RouteKey {
            addr: self.cidr.network().to_bits(),
            prefix_len: self.cidr.prefix() as u32,
        }
    }

    pub fn value(&self) -> RouteValue {
        let mut flags = 0;
        if self.kind.is_local() {
            flags |= ROUTE_LOCAL;
        }
        if self.kind.is_workload() {
            flags |= ROUTE_WORKLOAD;
        }
        if self.kind.is_host() {
            flags |= ROUTE_HOST;
        }
        if self.kind == RouteKind::Tunnel {
            flags |= ROUTE_TUNNEL;
        }
        if self.in_pool {
            flags |= ROUTE_IN_POOL;
        }
        if self.nat_out {
            flags |= ROUTE_NAT_OUT;
        }
        let (next_hop, ifindex) = match self.kind {
            RouteKind::RemoteWorkload { next_hop } => (next_hop.to_bits(), 0),
            RouteKind::LocalWorkload { ifindex } | RouteKind::LocalHost { ifindex } => {
                (0, ifindex.unwrap_or(0))
            }
            _ => (0, 0),
        };
        RouteValue {
            flags,
            next_hop,
            ifindex,
        }
    }

    /// Rebuilds an entry from a kernel map record.
    pub fn from_map(key: &RouteKey, value: &RouteValue) -> Result<Self> {
        let cidr = Ipv4Network::new(
            Ipv4Addr::from_bits(key.addr),
            u8::try_from(key.prefix_len)
                .map_err(|e| crate::Error::ConversionError(e.to_string()))?,
        )?;
        let ifindex = (value.ifindex != 0).then_some(value.ifindex);
        let local = value.flags & ROUTE_LOCAL != 0;
        let kind = if value.flags & ROUTE_TUNNEL != 0 {
            RouteKind::Tunnel
        } else if value.flags & ROUTE_WORKLOAD != 0 {
            if local {
                RouteKind::LocalWorkload { ifindex }
            } else {
                RouteKind::RemoteWorkload {
                    next_hop: Ipv4Addr::from_bits(value.next_hop),
                }
            }
        } else if value.flags & ROUTE_HOST != 0 {
            if local {
                RouteKind::LocalHost { ifindex }
            } else {
                RouteKind::RemoteHost
            }
        } else {
            RouteKind::Pool
        };
        Ok(Self {
            cidr,
            kind,
            in_pool: value.flags & ROUTE_IN_POOL != 0,
            nat_out: value.flags & ROUTE_NAT_OUT != 0,
        })
    }
}

impl Display for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let locality = if self.kind.is_local() { "local" } else { "remote" };
        write!(f, "{}: {locality}", self.cidr)?;
        if self.kind.is_workload() {
            write!(f, " workload")?;
        } else if self.kind.is_host() {
            write!(f, " host")?;
        }
        if self.in_pool {
            write!(f, " in-pool")?;
        }
        if self.nat_out {
            write!(f, " nat-out")?;
        }
        match self.kind {
            RouteKind::LocalWorkload { ifindex: Some(i) } => write!(f, " idx {i}"),
            RouteKind::LocalWorkload { ifindex: None } => write!(f, " idx -"),
            RouteKind::LocalHost { ifindex: Some(i) } => write!(f, " idx {i}"),
            RouteKind::RemoteWorkload { next_hop } => write!(f, " nh {next_hop}"),
            _ => Ok(()),
        }
    }
}

/// Computes the full route table. The output depends only on `inputs`
/// (never on their order) and is sorted by address then prefix length.
pub fn build(inputs: &RouteInputs) -> Vec<RouteEntry> {
    let mut claims: BTreeMap<(u32, u8), (Ipv4Network, RouteKind)> = BTreeMap::new();
    let mut claim = |cidr: Ipv4Network, kind: RouteKind| {
        let cidr = normalize(cidr);
        let slot = (cidr.network().to_bits(), cidr.prefix());
        match claims.get(&slot) {
            Some((_, existing)) if !wins(&kind, existing) => {
                debug!(%cidr, ?kind, ?existing, "address already classified");
            }
            _ => {
                claims.insert(slot, (cidr, kind));
            }
        }
    };

    for w in &inputs.local_workloads {
        claim(host_net(w.addr), RouteKind::LocalWorkload { ifindex: w.ifindex });
    }
    for b in &inputs.remote_workloads {
        claim(b.cidr, RouteKind::RemoteWorkload { next_hop: b.host });
    }
    if let Some(addr) = inputs.tunnel_addr {
        claim(host_net(addr), RouteKind::Tunnel);
    }
    for h in &inputs.local_hosts {
        claim(host_net(h.addr), RouteKind::LocalHost { ifindex: h.ifindex });
    }
    for addr in &inputs.remote_hosts {
        claim(host_net(*addr), RouteKind::RemoteHost);
    }
    for pool in &inputs.pools {
        claim(pool.cidr, RouteKind::Pool);
    }

    claims
        .into_values()
        .map(|(cidr, kind)| {
            let (in_pool, nat_out) = if kind.is_host() {
                (false, false)
            } else {
                pool_membership(&inputs.pools, &cidr)
            };
            RouteEntry {
                cidr,
                kind,
                in_pool,
                nat_out,
            }
        })
        .collect()
}

/// Canonical text form: one entry per line in table order.
pub fn dump(entries: &[RouteEntry]) -> Vec<String> {
    entries.iter().map(|e| e.to_string()).collect()
}

fn wins(new: &RouteKind, existing: &RouteKind) -> bool {
    // ties keep the smaller value so the result is independent of input order
    match new.precedence().cmp(&existing.precedence()) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => tie_key(new) < tie_key(existing),
    }
}

fn tie_key(kind: &RouteKind) -> (u32, u32) {
    match kind {
        RouteKind::LocalWorkload { ifindex } | RouteKind::LocalHost { ifindex } => {
            (0, ifindex.unwrap_or(u32::MAX))
        }
        RouteKind::RemoteWorkload { next_hop } => (next_hop.to_bits(), 0),
        _ => (0, 0),
    }
}

fn pool_membership(pools: &[IpPool], cidr: &Ipv4Network) -> (bool, bool) {
    let mut in_pool = false;
    let mut nat_out = false;
    for pool in pools {
        if pool.cidr.prefix() <= cidr.prefix() && pool.cidr.contains(cidr.network()) {
            in_pool = true;
            nat_out |= pool.nat_outgoing;
        }
    }
    (in_pool, nat_out)
}

fn host_net(addr: Ipv4Addr) -> Ipv4Network {
    Ipv4Network::from(addr)
}

fn normalize(cidr: Ipv4Network) -> Ipv4Network {
    Ipv4Network::new(cidr.network(), cidr.prefix()).unwrap_or(cidr)
}

#[cfg(test)]
mod test {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn three_nodes(nat_outgoing: bool) -> RouteInputs {
        RouteInputs {
            local_workloads: vec![
                LocalWorkload {
                    addr: ip("10.65.0.2"),
                    ifindex: Some(11),
                },
                LocalWorkload {
                    addr: ip("10.65.0.3"),
                    ifindex: Some(12),
                },
                // reserved address with no interface yet
                LocalWorkload {
                    addr: ip("10.65.0.4"),
                    ifindex: None,
                },
            ],
            remote_workloads: vec![
                RemoteBlock {
                    cidr: "10.65.1.0/26".parse().unwrap(),
                    host: ip("172.17.0.3"),
                },
                RemoteBlock {
                    cidr: "10.65.2.0/26".parse().unwrap(),
                    host: ip("172.17.0.4"),
                },
            ],
            local_hosts: vec![
                LocalHostAddr {
                    addr: ip("172.17.0.2"),
                    ifindex: Some(2),
                },
                LocalHostAddr {
                    addr: ip("111.222.0.1"),
                    ifindex: None,
                },
            ],
            remote_hosts: vec![
                ip("172.17.0.3"),
                ip("172.17.0.4"),
                ip("111.222.1.1"),
                ip("111.222.2.1"),
            ],
            pools: vec![IpPool {
                cidr: "10.65.0.0/16".parse().unwrap(),
                nat_outgoing,
            }],
            tunnel_addr: None,
        }
    }

    #[test]
    fn test_three_node_dump() {
        let lines = dump(&build(&three_nodes(true)));
        assert_eq!(
            lines,
            vec![
                "10.65.0.0/16: remote in-pool nat-out",
                "10.65.0.2/32: local workload in-pool nat-out idx 11",
                "10.65.0.3/32: local workload in-pool nat-out idx 12",
                "10.65.0.4/32: local workload in-pool nat-out idx -",
                "10.65.1.0/26: remote workload in-pool nat-out nh 172.17.0.3",
                "10.65.2.0/26: remote workload in-pool nat-out nh 172.17.0.4",
                "111.222.0.1/32: local host",
                "111.222.1.1/32: remote host",
                "111.222.2.1/32: remote host",
                "172.17.0.2/32: local host idx 2",
                "172.17.0.3/32: remote host",
                "172.17.0.4/32: remote host",
            ]
        );
    }

    #[test]
    fn test_nat_outgoing_disabled() {
        let entries = build(&three_nodes(false));
        assert!(entries.iter().all(|e| !e.nat_out));
        assert!(entries.iter().filter(|e| e.in_pool).count() == 6);
    }

    #[test]
    fn test_tunnel_address_is_local_host() {
        let mut inputs = three_nodes(true);
        inputs.tunnel_addr = Some(ip("10.65.0.1"));
        let lines = dump(&build(&inputs));
        assert_eq!(lines[1], "10.65.0.1/32: local host");
        assert_eq!(lines.len(), 13);
    }

    #[test]
    fn test_build_is_order_independent() {
        let inputs = three_nodes(true);
        let mut shuffled = inputs.clone();
        shuffled.local_workloads.reverse();
        shuffled.remote_hosts.reverse();
        shuffled.local_hosts.reverse();
        assert_eq!(build(&inputs), build(&shuffled));
        assert_eq!(build(&inputs), build(&inputs));
    }

    #[test]
    fn test_address_classified_once() {
        let mut inputs = three_nodes(true);
        // the same address reported as both a remote host and a local workload
        inputs.remote_hosts.push(ip("10.65.0.2"));
        let entries = build(&inputs);
        let matching: Vec<_> = entries
            .iter()
            .filter(|e| e.cidr.network() == ip("10.65.0.2"))
            .collect();
        assert_eq!(matching.len(), 1);
        assert!(matches!(matching[0].kind, RouteKind::LocalWorkload { .. }));
    }

    #[test]
    fn test_map_round_trip_preserves_dump() {
        for entry in build(&three_nodes(true)) {
            let back = RouteEntry::from_map(&entry.key(), &entry.value()).unwrap();
            assert_eq!(back, entry);
        }
    }
}
