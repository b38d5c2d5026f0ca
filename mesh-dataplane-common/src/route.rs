pub const ROUTE_LOCAL: u32 = 1 << 0;
pub const ROUTE_WORKLOAD: u32 = 1 << 1;
pub const ROUTE_HOST: u32 = 1 << 2;
pub const ROUTE_IN_POOL: u32 = 1 << 3;
pub const ROUTE_NAT_OUT: u32 = 1 << 4;
pub const ROUTE_TUNNEL: u32 = 1 << 5;

/// Userspace form of a route trie key. The kernel map is keyed by the
/// network order address with `prefix_len` significant bits.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub addr: u32,
    pub prefix_len: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub struct RouteValue {
    pub flags: u32,
    /// Host order, zero when there is no next hop
    pub next_hop: u32,
    /// Zero when the interface is not known
    pub ifindex: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for RouteValue {}
