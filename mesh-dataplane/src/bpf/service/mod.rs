mod select;
pub(crate) mod state;
mod sync;

use std::fmt::Display;
use std::net::Ipv4Addr;
use std::time::Duration;

use aya::maps::lpm_trie::Key as LpmKey;
use aya::maps::{HashMap, MapData};
use ipnetwork::Ipv4Network;
use mesh_dataplane_common::service::{
    BackendKey, BackendValue, FLAG_AFFINITY, FLAG_DSR, FLAG_EXTERNAL_LOCAL, FLAG_SOURCE_RANGES,
    FrontendKey, FrontendValue, SourceRangeData,
};
use mesh_dataplane_common::{Id, Protocol};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use select::{BackendSelector, FixedOrdinal, Flow, FlowHash, RandomSelector};
pub use state::{NatState, NatTable, ServiceRecord};
pub use sync::{
    DesiredFrontend, EndpointSpec, PortSpec, ServiceSpec, ServiceSyncer, SyncStats,
};

use crate::bpf::context::{MapContext, Table};
use crate::bpf::{KernelLpmMap, KernelMap, LpmKeyed};
use crate::{Error, Result};

pub type FrontendMap = KernelMap<HashMap<MapData, FrontendKey, FrontendValue>>;
pub type BackendMap = KernelMap<HashMap<MapData, BackendKey, BackendValue>>;
pub type SourceRangeMap = KernelLpmMap<SourceRangeKey, u32>;
pub type KernelNatTable = NatTable<FrontendMap, BackendMap, SourceRangeMap>;

/// Opens the pinned frontend, backend and source-range tables and rebuilds
/// the userspace view from their current contents.
pub fn load(ctx: &MapContext) -> Result<KernelNatTable> {
    info!("loading nat frontend map");
    let frontends: FrontendMap = ctx.open_hash(Table::NatFrontend)?;
    info!("loading nat backend map");
    let backends: BackendMap = ctx.open_hash(Table::NatBackend)?;
    info!("loading nat source range map");
    let ranges: SourceRangeMap = ctx.open_lpm(Table::SourceRanges)?;
    NatTable::load(frontends, backends, ranges)
}

/// One exposed service address.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
}

impl ServiceKey {
    pub fn new(ip: Ipv4Addr, port: u16, protocol: Protocol) -> Self {
        Self { ip, port, protocol }
    }

    pub fn node_port(port: u16, protocol: Protocol) -> Self {
        Self::new(Ipv4Addr::BROADCAST, port, protocol)
    }
}

impl Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.port, self.protocol)
    }
}

impl From<ServiceKey> for FrontendKey {
    fn from(value: ServiceKey) -> Self {
        FrontendKey::new(value.ip.to_bits(), value.port, value.protocol)
    }
}

impl TryFrom<FrontendKey> for ServiceKey {
    type Error = Error;

    fn try_from(value: FrontendKey) -> Result<Self> {
        let protocol = Protocol::try_from(value.protocol)
            .map_err(|e| Error::ConversionError(format!("{e}: {}", value.protocol)))?;
        Ok(ServiceKey::new(
            Ipv4Addr::from_bits(value.ip),
            value.port,
            protocol,
        ))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Backend {
    pub ip: Ipv4Addr,
    pub port: u16,
    /// Runs on this node
    pub local: bool,
}

impl Backend {
    pub fn new(ip: Ipv4Addr, port: u16, local: bool) -> Self {
        Self { ip, port, local }
    }
}

impl From<&Backend> for BackendValue {
    fn from(value: &Backend) -> Self {
        BackendValue::new(value.ip.to_bits(), value.port)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum TrafficPolicy {
    #[default]
    Cluster,
    /// External traffic may only reach backends on this node.
    Local,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Affinity {
    #[default]
    None,
    ClientIp {
        timeout: Duration,
    },
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum SourceRanges {
    #[default]
    Any,
    Only(Vec<Ipv4Network>),
}

/// Per-key behaviour stored alongside the backend group.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceFlags {
    pub traffic_policy: TrafficPolicy,
    pub affinity: Affinity,
    pub source_ranges: SourceRanges,
    pub dsr: bool,
}

impl ServiceFlags {
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.traffic_policy == TrafficPolicy::Local {
            bits |= FLAG_EXTERNAL_LOCAL;
        }
        if matches!(self.source_ranges, SourceRanges::Only(_)) {
            bits |= FLAG_SOURCE_RANGES;
        }
        if matches!(self.affinity, Affinity::ClientIp { .. }) {
            bits |= FLAG_AFFINITY;
        }
        if self.dsr {
            bits |= FLAG_DSR;
        }
        bits
    }

    pub fn affinity_timeout_s(&self) -> u32 {
        match self.affinity {
            Affinity::None => 0,
            Affinity::ClientIp { timeout } => timeout.as_secs().min(u32::MAX as u64) as u32,
        }
    }

    pub(crate) fn from_value(value: &FrontendValue, ranges: Option<&Vec<Ipv4Network>>) -> Self {
        let traffic_policy = if value.flags & FLAG_EXTERNAL_LOCAL != 0 {
            TrafficPolicy::Local
        } else {
            TrafficPolicy::Cluster
        };
        let affinity = if value.flags & FLAG_AFFINITY != 0 {
            Affinity::ClientIp {
                timeout: Duration::from_secs(value.affinity_timeout_s as u64),
            }
        } else {
            Affinity::None
        };
        let source_ranges = match ranges {
            Some(r) if value.flags & FLAG_SOURCE_RANGES != 0 => SourceRanges::Only(r.clone()),
            _ => SourceRanges::Any,
        };
        Self {
            traffic_policy,
            affinity,
            source_ranges,
            dsr: value.flags & FLAG_DSR != 0,
        }
    }
}

/// Userspace form of a source-range trie key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SourceRangeKey {
    pub id: Id,
    pub net: Ipv4Network,
}

impl LpmKeyed for SourceRangeKey {
    type Data = SourceRangeData;

    fn to_lpm(&self) -> LpmKey<SourceRangeData> {
        let data = SourceRangeData {
            id: self.id.to_be(),
            addr: self.net.network().to_bits().to_be(),
        };
        LpmKey::new(32 + self.net.prefix() as u32, data)
    }

    fn from_lpm(key: &LpmKey<SourceRangeData>) -> Result<Self> {
        let data = key.data();
        let prefix = key
            .prefix_len()
            .checked_sub(32)
            .and_then(|p| u8::try_from(p).ok())
            .ok_or_else(|| {
                Error::ConversionError(format!("bad source range prefix {}", key.prefix_len()))
            })?;
        let net = Ipv4Network::new(Ipv4Addr::from_bits(u32::from_be(data.addr)), prefix)?;
        Ok(Self {
            id: u32::from_be(data.id),
            net,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_flags_round_trip_through_value() {
        let flags = ServiceFlags {
            traffic_policy: TrafficPolicy::Local,
            affinity: Affinity::ClientIp {
                timeout: Duration::from_secs(10800),
            },
            source_ranges: SourceRanges::Only(vec!["10.0.0.0/8".parse().unwrap()]),
            dsr: false,
        };
        let value = FrontendValue {
            id: 1,
            count: 0,
            local_count: 0,
            flags: flags.bits(),
            affinity_timeout_s: flags.affinity_timeout_s(),
        };
        let ranges = vec!["10.0.0.0/8".parse().unwrap()];
        assert_eq!(ServiceFlags::from_value(&value, Some(&ranges)), flags);
    }

    #[test]
    fn test_source_range_lpm_key() {
        let key = SourceRangeKey {
            id: 7,
            net: "192.168.4.0/22".parse().unwrap(),
        };
        let lpm = key.to_lpm();
        assert_eq!(lpm.prefix_len(), 54);
        assert_eq!(SourceRangeKey::from_lpm(&lpm).unwrap(), key);
    }

    #[test]
    fn test_service_key_display() {
        let key = ServiceKey::new(Ipv4Addr::new(10, 1, 2, 3), 80, Protocol::Tcp);
        assert_eq!(key.to_string(), "10.1.2.3:80/TCP");
        let fe = FrontendKey::from(key);
        assert_eq!(ServiceKey::try_from(fe).unwrap(), key);
    }
}
