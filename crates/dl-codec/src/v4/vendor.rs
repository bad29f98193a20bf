//! Vendor identification from DHCPv4 options.
//!
//! Network gear self-identifies through the Vendor Class option (60) or the
//! Vendor-Identifying Vendor Class option (124, RFC 3925), each vendor with
//! its own ad-hoc field layout. Parsing is best-effort: a packet from an
//! unrecognized vendor simply yields empty `VendorData`.

use crate::v4::{Packet4, OPT_VENDOR_CLASS, OPT_VIVC};
use crate::CodecError;

const ENT_ID_CISCO: u32 = 0x9;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorData {
    pub vendor: String,
    pub model: String,
    pub serial: String,
}

/// Extract vendor data from a parsed packet. Malformed vendor options are
/// logged and leave the affected fields empty; they never fail the request.
pub fn vendor_data(packet: &Packet4<'_>) -> VendorData {
    let mut vd = VendorData::default();

    if let Some(raw) = packet.option(OPT_VENDOR_CLASS) {
        if let Ok(vc) = std::str::from_utf8(raw) {
            if let Err(e) = parse_vendor_class(&mut vd, vc, packet.host_name()) {
                tracing::warn!("failed to parse vendor class {:?}: {}", vc, e);
            }
        }
    }

    if let Some(raw) = packet.option(OPT_VIVC) {
        if let Err(e) = parse_vivc(&mut vd, raw) {
            tracing::warn!("failed to parse vendor-identifying vendor class: {}", e);
        }
    }

    vd
}

/// Vendor Class (option 60) grammars:
///
///   Arista;DCS-7050S-64;01.23;JPE12221671
///   ZPESystems:NSC:002251623
///   Juniper-ptx1000-DD576
///   Juniper-qfx10002-36q-DN817   (model itself may contain '-')
///   Juniper-qfx10008             (serial falls back to the Host Name option)
pub fn parse_vendor_class(
    vd: &mut VendorData,
    vc: &str,
    host_name: Option<&str>,
) -> Result<(), CodecError> {
    if vc.starts_with("Arista;") {
        let p: Vec<&str> = vc.split(';').collect();
        if p.len() < 4 {
            return Err(CodecError::MalformedVendorOption);
        }
        vd.vendor = p[0].to_string();
        vd.model = p[1].to_string();
        vd.serial = p[3].to_string();
        return Ok(());
    }

    if vc.starts_with("ZPESystems:") {
        let p: Vec<&str> = vc.split(':').collect();
        if p.len() < 3 {
            return Err(CodecError::MalformedVendorOption);
        }
        vd.vendor = p[0].to_string();
        vd.model = p[1].to_string();
        vd.serial = p[2].to_string();
        return Ok(());
    }

    if let Some(rest) = vc.strip_prefix("Juniper-") {
        vd.vendor = "Juniper".to_string();
        match rest.rfind('-') {
            Some(idx) => {
                vd.model = rest[..idx].to_string();
                vd.serial = rest[idx + 1..].to_string();
            }
            None => {
                // no serial in the vendor class, some models put it in the
                // Host Name option instead
                vd.model = rest.to_string();
                vd.serial = host_name.unwrap_or_default().to_string();
            }
        }
        return Ok(());
    }

    // unrecognized vendor, leave empty
    Ok(())
}

/// Vendor-Identifying Vendor Class (option 124): repeated
/// `{enterprise-id u32, data-len u8, data}` records. Only Cisco's
/// enterprise id is recognized; its data is ';'-separated `KEY:VALUE`.
pub fn parse_vivc(vd: &mut VendorData, raw: &[u8]) -> Result<(), CodecError> {
    let mut pos = 0;
    while pos + 5 <= raw.len() {
        let ent_id = u32::from_be_bytes([raw[pos], raw[pos + 1], raw[pos + 2], raw[pos + 3]]);
        let len = raw[pos + 4] as usize;
        let start = pos + 5;
        if start + len > raw.len() {
            return Err(CodecError::MalformedVendorOption);
        }
        let data = &raw[start..start + len];
        pos = start + len;

        if ent_id != ENT_ID_CISCO {
            continue;
        }
        vd.vendor = "Cisco Systems".to_string();

        // SN:0;PID:R-IOSXRV9000-CC
        let data = std::str::from_utf8(data).map_err(|_| CodecError::MalformedVendorOption)?;
        for field in data.split(';') {
            let (key, value) = field
                .split_once(':')
                .ok_or(CodecError::MalformedVendorOption)?;
            match key {
                "SN" => vd.serial = value.to_string(),
                "PID" => vd.model = value.to_string(),
                _ => {}
            }
        }
    }
    Ok(())
}
