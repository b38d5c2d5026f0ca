use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use mesh_dataplane_common::Protocol;
use mesh_dataplane_common::service::{BackendKey, BackendValue, FrontendKey, FrontendValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bpf::BpfMap;
use crate::bpf::service::{
    Affinity, Backend, NatTable, ServiceFlags, ServiceKey, SourceRangeKey, SourceRanges,
    TrafficPolicy,
};
use crate::{Error, Result};

/// A service as handed over by the orchestrator. The set of addresses that
/// are filled in decides which frontends it gets: cluster IP, external IPs,
/// load balancer IPs and node ports are additive.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// `namespace/name`, also used to pick a winner when two services claim
    /// the same frontend
    pub name: String,
    #[serde(default)]
    pub cluster_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub external_ips: Vec<Ipv4Addr>,
    #[serde(default)]
    pub load_balancer_ips: Vec<Ipv4Addr>,
    #[serde(default)]
    pub load_balancer_source_ranges: Vec<Ipv4Network>,
    #[serde(default)]
    pub external_traffic_policy: TrafficPolicy,
    #[serde(default)]
    pub session_affinity_timeout_s: Option<u32>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Defaults to `port`
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub node_port: Option<u16>,
}

fn default_protocol() -> String {
    "TCP".into()
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub local: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DesiredFrontend {
    pub owner: String,
    pub backends: Vec<Backend>,
    pub flags: ServiceFlags,
}

#[derive(Debug, Default)]
pub struct SyncStats {
    pub upserted: usize,
    pub unchanged: usize,
    pub deleted: Vec<ServiceKey>,
    pub failed: usize,
    pub last_error: Option<Error>,
}

/// Derives frontends from the desired service set and converges a NAT
/// table onto them.
#[derive(Debug)]
pub struct ServiceSyncer {
    dsr: bool,
    protocols: Vec<Protocol>,
    owners: BTreeMap<ServiceKey, String>,
}

impl Default for ServiceSyncer {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ServiceSyncer {
    pub fn new(dsr: bool) -> Self {
        Self {
            dsr,
            protocols: vec![Protocol::Tcp, Protocol::Udp, Protocol::Sctp],
            owners: BTreeMap::new(),
        }
    }

    /// Limits load balancing to `protocols`; ports using any other protocol
    /// get no frontend.
    pub fn with_protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Expands every service into its frontend keys. When several services
    /// claim one key the lexicographically smallest name owns it.
    pub fn desired(&self, services: &[ServiceSpec]) -> BTreeMap<ServiceKey, DesiredFrontend> {
        let mut out: BTreeMap<ServiceKey, DesiredFrontend> = BTreeMap::new();
        for svc in services {
            for (key, frontend) in self.expand(svc) {
                match out.get(&key) {
                    Some(existing) if existing.owner <= frontend.owner => {
                        debug!(%key, owner = %existing.owner, loser = %frontend.owner, "frontend already claimed");
                    }
                    _ => {
                        out.insert(key, frontend);
                    }
                }
            }
        }
        out
    }

    fn expand(&self, svc: &ServiceSpec) -> Vec<(ServiceKey, DesiredFrontend)> {
        let affinity = match svc.session_affinity_timeout_s {
            Some(t) if t > 0 => Affinity::ClientIp {
                timeout: Duration::from_secs(t as u64),
            },
            _ => Affinity::None,
        };
        let internal = ServiceFlags {
            traffic_policy: TrafficPolicy::Cluster,
            affinity,
            source_ranges: SourceRanges::Any,
            dsr: false,
        };
        let external = ServiceFlags {
            traffic_policy: svc.external_traffic_policy,
            dsr: self.dsr,
            ..internal.clone()
        };
        let load_balancer = ServiceFlags {
            source_ranges: if svc.load_balancer_source_ranges.is_empty() {
                SourceRanges::Any
            } else {
                SourceRanges::Only(svc.load_balancer_source_ranges.clone())
            },
            ..external.clone()
        };

        let mut out = Vec::new();
        for port in &svc.ports {
            let protocol = match Protocol::try_from(port.protocol.as_str()) {
                Ok(p) => p,
                Err(e) => {
                    warn!(service = %svc.name, protocol = %port.protocol, "skipping port: {e}");
                    continue;
                }
            };
            if !self.protocols.contains(&protocol) {
                debug!(service = %svc.name, %protocol, "protocol not load balanced");
                continue;
            }
            let target = port.target_port.unwrap_or(port.port);
            let backends: Vec<Backend> = svc
                .endpoints
                .iter()
                .map(|ep| Backend::new(ep.ip, target, ep.local))
                .collect();
            let frontend = |flags: &ServiceFlags| DesiredFrontend {
                owner: svc.name.clone(),
                backends: backends.clone(),
                flags: flags.clone(),
            };

            if let Some(ip) = svc.cluster_ip {
                out.push((ServiceKey::new(ip, port.port, protocol), frontend(&internal)));
            }
            for ip in &svc.external_ips {
                out.push((ServiceKey::new(*ip, port.port, protocol), frontend(&external)));
            }
            for ip in &svc.load_balancer_ips {
                out.push((
                    ServiceKey::new(*ip, port.port, protocol),
                    frontend(&load_balancer),
                ));
            }
            if let Some(node_port) = port.node_port {
                out.push((
                    ServiceKey::node_port(node_port, protocol),
                    frontend(&external),
                ));
            }
        }
        out
    }

    /// Upserts every desired frontend, then deletes the ones no service
    /// claims any more. A key that changes owner is rewritten in place.
    pub fn apply<F, B, S>(
        &mut self,
        nat: &mut NatTable<F, B, S>,
        services: &[ServiceSpec],
    ) -> SyncStats
    where
        F: BpfMap<Key = FrontendKey, Value = FrontendValue>,
        B: BpfMap<Key = BackendKey, Value = BackendValue>,
        S: BpfMap<Key = SourceRangeKey, Value = u32>,
    {
        let desired = self.desired(services);
        let mut stats = SyncStats::default();

        for (key, frontend) in desired.iter() {
            let before = nat.lookup(key).map(|r| r.id);
            match nat.upsert(*key, &frontend.backends, frontend.flags.clone()) {
                Ok(id) if Some(id) == before => stats.unchanged += 1,
                Ok(_) => {
                    if let Some(prev) = self.owners.get(key)
                        && *prev != frontend.owner
                    {
                        info!(%key, from = %prev, to = %frontend.owner, "frontend changed owner");
                    }
                    stats.upserted += 1;
                }
                Err(e) => {
                    warn!(%e, %key, "failed to program frontend");
                    stats.failed += 1;
                    stats.last_error = Some(e);
                }
            }
        }

        for key in nat.keys() {
            if desired.contains_key(&key) {
                continue;
            }
            match nat.delete(&key) {
                Ok(_) => stats.deleted.push(key),
                Err(e) => {
                    warn!(%e, %key, "failed to delete frontend");
                    stats.failed += 1;
                    stats.last_error = Some(e);
                }
            }
        }

        self.owners = desired
            .into_iter()
            .map(|(k, f)| (k, f.owner))
            .collect();
        stats
    }
}
