use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use mesh_dataplane_common::Protocol;
use mesh_dataplane_common::conntrack::{
    CT_KIND_NAT, ConntrackKey, ConntrackValue, LEG_ACK_SEEN, LEG_FIN_SEEN, LEG_OPENER,
    LEG_RST_SEEN, LEG_SYN_SEEN, Leg,
};

/// Idle timeouts per connection state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timeouts {
    pub tcp_pre_established: Duration,
    pub tcp_established: Duration,
    pub tcp_fins_seen: Duration,
    pub tcp_reset_seen: Duration,
    pub udp: Duration,
    pub icmp: Duration,
    pub generic: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tcp_pre_established: Duration::from_secs(20),
            tcp_established: Duration::from_secs(3600),
            tcp_fins_seen: Duration::from_secs(30),
            tcp_reset_seen: Duration::from_secs(40),
            udp: Duration::from_secs(60),
            icmp: Duration::from_secs(5),
            generic: Duration::from_secs(600),
        }
    }
}

impl Timeouts {
    pub fn for_entry(&self, key: &ConntrackKey, value: &ConntrackValue) -> Duration {
        match Protocol::try_from(key.protocol) {
            Ok(Protocol::Tcp) => match ConnState::of(value) {
                ConnState::Reset => self.tcp_reset_seen,
                ConnState::Closed => self.tcp_fins_seen,
                ConnState::Established => self.tcp_established,
                ConnState::Opening => self.tcp_pre_established,
            },
            Ok(Protocol::Udp) => self.udp,
            Ok(Protocol::Icmp) => self.icmp,
            _ => self.generic,
        }
    }

    /// Idle past its bucket's timeout. An entry is never expired before that.
    pub fn is_expired(&self, key: &ConntrackKey, value: &ConntrackValue, now_ns: u64) -> bool {
        now_ns.saturating_sub(value.last_seen_ns) > self.for_entry(key, value).as_nanos() as u64
    }
}

/// Progress of one direction of a flow.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum LegState {
    Unseen,
    SynSeen,
    Established,
    Closing,
}

impl LegState {
    pub fn of(leg: &Leg) -> Self {
        if leg.has(LEG_FIN_SEEN) || leg.has(LEG_RST_SEEN) {
            LegState::Closing
        } else if leg.has(LEG_ACK_SEEN) {
            LegState::Established
        } else if leg.has(LEG_SYN_SEEN) {
            LegState::SynSeen
        } else {
            LegState::Unseen
        }
    }
}

impl Display for LegState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegState::Unseen => write!(f, "unseen"),
            LegState::SynSeen => write!(f, "syn"),
            LegState::Established => write!(f, "est"),
            LegState::Closing => write!(f, "closing"),
        }
    }
}

/// State of the whole connection, derived from both legs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnState {
    Opening,
    Established,
    Closed,
    Reset,
}

impl ConnState {
    pub fn of(value: &ConntrackValue) -> Self {
        let (a, b) = (&value.a_to_b, &value.b_to_a);
        if a.has(LEG_RST_SEEN) || b.has(LEG_RST_SEEN) {
            ConnState::Reset
        } else if a.has(LEG_FIN_SEEN) && b.has(LEG_FIN_SEEN) {
            ConnState::Closed
        } else if a.has(LEG_ACK_SEEN) && b.has(LEG_ACK_SEEN) {
            ConnState::Established
        } else {
            ConnState::Opening
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    pub const SYN: TcpFlags = TcpFlags {
        syn: true,
        ack: false,
        fin: false,
        rst: false,
    };
    pub const SYN_ACK: TcpFlags = TcpFlags {
        syn: true,
        ack: true,
        fin: false,
        rst: false,
    };
    pub const ACK: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: false,
        rst: false,
    };
    pub const FIN_ACK: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: true,
        rst: false,
    };
    pub const RST: TcpFlags = TcpFlags {
        syn: false,
        ack: false,
        fin: false,
        rst: true,
    };

    fn leg_bits(&self) -> u8 {
        let mut bits = 0;
        if self.syn {
            bits |= LEG_SYN_SEEN;
        }
        if self.ack {
            bits |= LEG_ACK_SEEN;
        }
        if self.fin {
            bits |= LEG_FIN_SEEN;
        }
        if self.rst {
            bits |= LEG_RST_SEEN;
        }
        bits
    }
}

/// The parts of a packet conntrack cares about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Packet {
    pub protocol: Protocol,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub ifindex: u32,
    pub tcp: TcpFlags,
}

impl Packet {
    pub fn new(protocol: Protocol, src: SocketAddrV4, dst: SocketAddrV4, ifindex: u32) -> Self {
        Self {
            protocol,
            src,
            dst,
            ifindex,
            tcp: TcpFlags::default(),
        }
    }

    pub fn with_tcp(mut self, tcp: TcpFlags) -> Self {
        self.tcp = tcp;
        self
    }

    pub fn key(&self) -> ConntrackKey {
        ConntrackKey::new(
            self.protocol as u8,
            self.src.ip().to_bits(),
            self.src.port(),
            self.dst.ip().to_bits(),
            self.dst.port(),
        )
    }
}

/// Translation applied to a flow by a frontend lookup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NatTranslation {
    pub orig: SocketAddrV4,
    pub xlated: SocketAddrV4,
}

impl NatTranslation {
    pub fn of(value: &ConntrackValue) -> Option<Self> {
        (value.kind == CT_KIND_NAT).then(|| Self {
            orig: SocketAddrV4::new(Ipv4Addr::from_bits(value.orig_ip), value.orig_port),
            xlated: SocketAddrV4::new(Ipv4Addr::from_bits(value.xlated_ip), value.xlated_port),
        })
    }
}

/// Applies one packet to the record. `created` marks the first packet of
/// the flow, whose leg becomes the opener.
pub(crate) fn apply_packet(value: &mut ConntrackValue, pkt: &Packet, a_to_b: bool, created: bool, now: u64) {
    let leg = if a_to_b {
        &mut value.a_to_b
    } else {
        &mut value.b_to_a
    };
    if created {
        leg.flags |= LEG_OPENER;
    }
    leg.flags |= pkt.tcp.leg_bits();
    leg.last_seen_ns = now;
    if leg.ifindex == 0 {
        leg.ifindex = pkt.ifindex;
    }
    value.last_seen_ns = value.last_seen_ns.max(now);
}

/// A fully established flow opened from side A, as a starting point for
/// synthetic entries.
pub fn established(now: u64, ifindex: u32) -> ConntrackValue {
    let leg = Leg {
        last_seen_ns: now,
        ifindex,
        flags: LEG_SYN_SEEN | LEG_ACK_SEEN,
        _pad: [0; 3],
    };
    ConntrackValue {
        created_ns: now,
        last_seen_ns: now,
        a_to_b: Leg {
            flags: leg.flags | LEG_OPENER,
            ..leg
        },
        b_to_a: leg,
        ..Default::default()
    }
}
