//! The routing fingerprint extracted from an inbound packet.

use std::fmt::Write as _;
use std::net::SocketAddr;

use crate::v4::vendor::VendorData;

/// Everything the selection core needs to know about one request. Built
/// once per packet and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct DhcpMessage {
    pub xid: u32,
    pub peer: SocketAddr,
    pub client_id: Vec<u8>,
    pub mac: Vec<u8>,
    pub net_boot: bool,
    pub vendor: VendorData,
}

impl DhcpMessage {
    /// The MAC formatted the way override keys are written.
    pub fn mac_str(&self) -> String {
        format_id(&self.mac)
    }

    pub fn serial(&self) -> &str {
        &self.vendor.serial
    }
}

/// Format an identifier as lowercase colon-separated hex, e.g.
/// `[0x12, 0x34, 0x56]` becomes `"12:34:56"`. Empty input yields "".
pub fn format_id(id: &[u8]) -> String {
    let mut out = String::with_capacity(id.len() * 3);
    for (i, b) in id.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_id_empty() {
        assert_eq!(format_id(&[]), "");
    }

    #[test]
    fn test_format_id() {
        assert_eq!(format_id(&[0xfa]), "fa");
        assert_eq!(format_id(&[0xfa, 0xce]), "fa:ce");
        assert_eq!(format_id(&[0xfa, 0xce, 0x12, 0x34]), "fa:ce:12:34");
        assert_eq!(format_id(&[0x12, 0x34, 0x56, 0x78, 0x9a]), "12:34:56:78:9a");
    }
}
