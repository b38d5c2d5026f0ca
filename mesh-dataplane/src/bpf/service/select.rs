use std::hash::BuildHasher;
use std::net::Ipv4Addr;

use rand::Rng;

use crate::bpf::service::ServiceKey;

/// The client side of a packet addressed to a service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Flow {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub service: ServiceKey,
}

impl Flow {
    pub fn new(src: Ipv4Addr, src_port: u16, service: ServiceKey) -> Self {
        Self {
            src,
            src_port,
            service,
        }
    }
}

/// Load balancing policy among the `candidates` eligible ordinals of a
/// backend group. Must return a value below `candidates`, which is never 0.
pub trait BackendSelector: Send + Sync {
    fn select(&self, flow: &Flow, candidates: u32) -> u32;
}

/// Always the same ordinal, wrapped into range.
#[derive(Clone, Copy, Debug)]
pub struct FixedOrdinal(pub u32);

impl BackendSelector for FixedOrdinal {
    fn select(&self, _flow: &Flow, candidates: u32) -> u32 {
        self.0 % candidates
    }
}

/// Stable hash of the flow tuple: the same client address and port always
/// land on the same ordinal for a given group size.
#[derive(Clone, Debug)]
pub struct FlowHash {
    state: ahash::RandomState,
}

impl Default for FlowHash {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

impl FlowHash {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: ahash::RandomState::with_seeds(seed, 0x6d65_7368, 0x6470, 0x6c62),
        }
    }
}

impl BackendSelector for FlowHash {
    fn select(&self, flow: &Flow, candidates: u32) -> u32 {
        (self.state.hash_one(flow) % candidates as u64) as u32
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSelector;

impl BackendSelector for RandomSelector {
    fn select(&self, _flow: &Flow, candidates: u32) -> u32 {
        rand::rng().random_range(0..candidates)
    }
}

#[cfg(test)]
mod test {
    use mesh_dataplane_common::Protocol;

    use super::*;

    fn flow(port: u16) -> Flow {
        Flow::new(
            Ipv4Addr::new(10, 65, 1, 2),
            port,
            ServiceKey::new(Ipv4Addr::new(10, 101, 0, 1), 80, Protocol::Tcp),
        )
    }

    #[test]
    fn test_selectors_stay_in_range() {
        let selectors: Vec<Box<dyn BackendSelector>> = vec![
            Box::new(FixedOrdinal(7)),
            Box::new(FlowHash::default()),
            Box::new(RandomSelector),
        ];
        for selector in selectors {
            for port in 1000..1100 {
                assert!(selector.select(&flow(port), 3) < 3);
            }
        }
    }

    #[test]
    fn test_flow_hash_is_stable() {
        let a = FlowHash::with_seed(1);
        let b = FlowHash::with_seed(1);
        for port in 1000..1010 {
            assert_eq!(a.select(&flow(port), 5), b.select(&flow(port), 5));
        }
    }

    #[test]
    fn test_flow_hash_spreads() {
        let hash = FlowHash::default();
        let picked: ahash::HashSet<u32> = (1000..1200).map(|p| hash.select(&flow(p), 4)).collect();
        assert!(picked.len() > 1);
    }
}
