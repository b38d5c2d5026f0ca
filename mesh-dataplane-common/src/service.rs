use crate::{Id, Protocol};

/// Address used as the frontend ip for node port keys so the kernel side can
/// match any local address with a single lookup.
pub const NODEPORT_ANY_IP: u32 = 0xffff_ffff;

/// Only backends at ordinals `0..local_count` may be chosen for traffic
/// arriving from outside the cluster.
pub const FLAG_EXTERNAL_LOCAL: u32 = 1 << 0;
/// The source-range table must be consulted before load balancing.
pub const FLAG_SOURCE_RANGES: u32 = 1 << 1;
pub const FLAG_AFFINITY: u32 = 1 << 2;
/// Replies go straight back to the client from the backend's node.
pub const FLAG_DSR: u32 = 1 << 3;

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct FrontendKey {
    /// Stored in host order
    pub ip: u32,
    /// Stored in host order
    pub port: u16,
    pub protocol: u8,
    pub _pad: u8,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for FrontendKey {}

impl FrontendKey {
    pub fn new(ip: u32, port: u16, protocol: Protocol) -> Self {
        Self {
            ip,
            port,
            protocol: protocol as u8,
            _pad: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct FrontendValue {
    pub id: Id,
    pub count: u32,
    pub local_count: u32,
    pub flags: u32,
    pub affinity_timeout_s: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for FrontendValue {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct BackendKey {
    pub id: Id,
    pub ordinal: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BackendKey {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BackendValue {
    pub ip: u32,
    pub port: u16,
    pub _pad: u16,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BackendValue {}

impl BackendValue {
    pub fn new(ip: u32, port: u16) -> Self {
        Self { ip, port, _pad: 0 }
    }
}

/// Data part of a source-range trie key. The trie prefix length covers the
/// 32 bits of `id` plus the CIDR prefix of `addr`, both in network order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SourceRangeData {
    pub id: u32,
    pub addr: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for SourceRangeData {}
