pub mod packet;
pub mod socket;

pub use packet::*;
pub use socket::*;

/// ICMP errors a router or the destination sent back for one of our requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    DestinationUnreachable,
    TimeExceeded,
}

impl std::fmt::Display for IcmpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IcmpError::DestinationUnreachable => write!(f, "Destination host unreachable"),
            IcmpError::TimeExceeded => write!(f, "TTL expired in transit"),
        }
    }
}

impl std::error::Error for IcmpError {}
