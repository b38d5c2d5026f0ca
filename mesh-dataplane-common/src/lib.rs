#![no_std]

pub mod affinity;
pub mod conntrack;
pub mod route;
pub mod service;

use core::fmt::Display;

/// Backend group identifier. A fresh one is allocated every time a
/// service's backend set is rewritten.
pub type Id = u32;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default, PartialOrd, Ord)]
pub enum Protocol {
    Icmp = 1,
    #[default]
    Tcp = 6,
    Udp = 17,
    Sctp = 132,
}

impl TryFrom<&str> for Protocol {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "ICMP" | "icmp" | "Icmp" => Ok(Protocol::Icmp),
            "TCP" | "tcp" | "Tcp" => Ok(Protocol::Tcp),
            "UDP" | "udp" | "Udp" => Ok(Protocol::Udp),
            "SCTP" | "sctp" | "Sctp" => Ok(Protocol::Sctp),
            _ => Err("protocol must be one of ICMP, TCP, UDP or SCTP"),
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let proto = match value {
            1 => Protocol::Icmp,
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            132 => Protocol::Sctp,
            _ => return Err("unknown protocol number"),
        };
        Ok(proto)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_protocol_conversions() {
        assert_eq!(Protocol::try_from("udp"), Ok(Protocol::Udp));
        assert_eq!(Protocol::try_from(6u8), Ok(Protocol::Tcp));
        assert!(Protocol::try_from(99u8).is_err());
        assert!(Protocol::try_from("quic").is_err());
    }
}
