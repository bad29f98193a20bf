//! DHCP wire codec: just enough DHCPv4 (RFC 2131) and DHCPv6 (RFC 8415)
//! to support relay operation.
//!
//! Both parsers are borrowed views over the raw datagram. The relay
//! forwards v4 packets byte-for-byte (except the hop-count increment) and
//! re-wraps v6 packets in a fresh relay-forward envelope, so nothing here
//! decodes into an owned representation.

pub mod message;
pub mod v4;
pub mod v6;

pub use message::{format_id, DhcpMessage};
pub use v4::vendor::VendorData;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("missing option {0}")]
    MissingOption(u16),
    #[error("malformed vendor option")]
    MalformedVendorOption,
}

/// Which DHCP protocol the process is serving. Selected once at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V4,
    V6,
}

impl ProtocolVersion {
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            4 => Some(Self::V4),
            6 => Some(Self::V6),
            _ => None,
        }
    }

    /// Default server port for this protocol (67 for v4, 547 for v6).
    pub fn server_port(&self) -> u16 {
        match self {
            Self::V4 => 67,
            Self::V6 => 547,
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            Self::V4 => 4,
            Self::V6 => 6,
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.number())
    }
}
