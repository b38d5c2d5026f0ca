pub const LEG_SYN_SEEN: u8 = 1 << 0;
pub const LEG_ACK_SEEN: u8 = 1 << 1;
pub const LEG_FIN_SEEN: u8 = 1 << 2;
pub const LEG_RST_SEEN: u8 = 1 << 3;
/// Set on the leg whose side sent the first packet of the flow.
pub const LEG_OPENER: u8 = 1 << 4;

pub const CT_KIND_NORMAL: u8 = 0;
/// The flow was translated by a frontend lookup.
pub const CT_KIND_NAT: u8 = 1;

/// Both directions of a flow share one key: the side with the numerically
/// smaller address (then port) is always side A.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ConntrackKey {
    pub protocol: u8,
    pub _pad: [u8; 3],
    /// Stored in host order
    pub addr_a: u32,
    /// Stored in host order
    pub addr_b: u32,
    pub port_a: u16,
    pub port_b: u16,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ConntrackKey {}

impl ConntrackKey {
    pub fn new(protocol: u8, ip1: u32, port1: u16, ip2: u32, port2: u16) -> Self {
        let (addr_a, port_a, addr_b, port_b) = if (ip1, port1) <= (ip2, port2) {
            (ip1, port1, ip2, port2)
        } else {
            (ip2, port2, ip1, port1)
        };
        Self {
            protocol,
            _pad: [0; 3],
            addr_a,
            addr_b,
            port_a,
            port_b,
        }
    }

    /// Whether a packet from `ip:port` travels in the A to B direction.
    pub fn is_a_to_b(&self, ip: u32, port: u16) -> bool {
        self.addr_a == ip && self.port_a == port
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub struct Leg {
    pub last_seen_ns: u64,
    pub ifindex: u32,
    pub flags: u8,
    pub _pad: [u8; 3],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for Leg {}

impl Leg {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub struct ConntrackValue {
    pub created_ns: u64,
    /// Latest of the two legs' timestamps
    pub last_seen_ns: u64,
    pub orig_ip: u32,
    pub xlated_ip: u32,
    pub orig_port: u16,
    pub xlated_port: u16,
    pub kind: u8,
    pub _pad: [u8; 3],
    pub a_to_b: Leg,
    pub b_to_a: Leg,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ConntrackValue {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_key_is_direction_independent() {
        let fwd = ConntrackKey::new(6, 0x7b7b7b7b, 40000, 0x79797979, 80);
        let rev = ConntrackKey::new(6, 0x79797979, 80, 0x7b7b7b7b, 40000);
        assert_eq!(fwd, rev);
        assert_eq!(fwd.addr_a, 0x79797979);
        assert!(fwd.is_a_to_b(0x79797979, 80));
        assert!(!fwd.is_a_to_b(0x7b7b7b7b, 40000));
    }

    #[test]
    fn test_key_same_address_orders_by_port() {
        let key = ConntrackKey::new(17, 1, 9000, 1, 53);
        assert_eq!((key.port_a, key.port_b), (53, 9000));
    }
}
