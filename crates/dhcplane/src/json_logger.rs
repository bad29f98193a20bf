//! The default request sink: one JSON object per handled packet, with
//! display fields derived from the raw packet bytes.

use dl_codec::v4::{message_type_name, Packet4};
use dl_codec::v6::Packet6;
use dl_codec::{format_id, ProtocolVersion};
use dl_relay::{LogMessage, RequestLogger};
use serde_json::json;
use tracing::warn;

pub struct JsonLogger;

impl RequestLogger for JsonLogger {
    fn log(&self, msg: &LogMessage) -> anyhow::Result<()> {
        let mut sample = json!({
            "version": msg.version.number(),
            "dhcp_server": msg.server,
            "server_is_rc": msg.server_is_rc,
            "source_ip": msg.peer.ip().to_string(),
            "success": msg.success,
            "latency_us": msg.latency.as_micros() as u64,
        });

        if !msg.error_name.is_empty() {
            sample["error_name"] = json!(msg.error_name);
            sample["error_details"] = json!(msg.error_details);
        }

        if !msg.packet.is_empty() {
            match msg.version {
                ProtocolVersion::V4 => annotate_v4(&mut sample, &msg.packet),
                ProtocolVersion::V6 => annotate_v6(&mut sample, &msg.packet),
            }
        }

        if msg.success {
            tracing::info!(target: "dhcplane::request", "{}", sample);
        } else {
            tracing::error!(target: "dhcplane::request", "{}", sample);
        }
        Ok(())
    }
}

fn annotate_v4(sample: &mut serde_json::Value, packet: &[u8]) {
    let parsed = match Packet4::parse(packet) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("request log: unparseable v4 packet: {}", e);
            return;
        }
    };
    if let Some(t) = parsed.message_type() {
        sample["type"] = json!(message_type_name(t));
    }
    sample["xid"] = json!(format!("{:#010x}", parsed.xid()));
    sample["giaddr"] = json!(parsed.giaddr().to_string());
    sample["client_mac"] = json!(parsed.mac_str());
}

fn annotate_v6(sample: &mut serde_json::Value, packet: &[u8]) {
    let parsed = match Packet6::parse(packet) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("request log: unparseable v6 packet: {}", e);
            return;
        }
    };
    sample["type"] = json!(parsed.msg_type().name());
    if let Ok(xid) = parsed.xid() {
        sample["xid"] = json!(format!("{xid:#08x}"));
    }
    if let Ok(duid) = parsed.duid() {
        sample["duid"] = json!(format_id(duid));
    }
    match parsed.mac() {
        Ok(mac) => sample["client_mac"] = json!(format_id(&mac)),
        Err(e) => warn!("request log: error getting mac: {}", e),
    }
    if parsed.is_relay() {
        if let Ok(link) = parsed.link_addr() {
            sample["link_addr"] = json!(link.to_string());
        }
        if let Ok(peer) = parsed.peer_addr() {
            sample["peer_addr"] = json!(peer.to_string());
        }
    }
}
