//! DHCPv6 packet view and relay envelope (RFC 8415 §19).
//!
//! Client/server messages carry a 4-byte header (type + 24-bit transaction
//! id); relay-forward and relay-reply messages carry a 34-byte header
//! (type, hop count, link-address, peer-address) and nest the relayed
//! message inside a Relay Message option, one layer per relay hop.

use std::net::Ipv6Addr;

use crate::CodecError;

pub const OPT_CLIENT_ID: u16 = 1;
pub const OPT_ORO: u16 = 6;
pub const OPT_RELAY_MESSAGE: u16 = 9;
pub const OPT_BOOTFILE_URL: u16 = 59;

const MESSAGE_HEADER_LEN: usize = 4;
const RELAY_HEADER_LEN: usize = 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
    Reconfigure = 10,
    InformationRequest = 11,
    RelayForw = 12,
    RelayRepl = 13,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Solicit),
            2 => Some(Self::Advertise),
            3 => Some(Self::Request),
            4 => Some(Self::Confirm),
            5 => Some(Self::Renew),
            6 => Some(Self::Rebind),
            7 => Some(Self::Reply),
            8 => Some(Self::Release),
            9 => Some(Self::Decline),
            10 => Some(Self::Reconfigure),
            11 => Some(Self::InformationRequest),
            12 => Some(Self::RelayForw),
            13 => Some(Self::RelayRepl),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Solicit => "SOLICIT",
            Self::Advertise => "ADVERTISE",
            Self::Request => "REQUEST",
            Self::Confirm => "CONFIRM",
            Self::Renew => "RENEW",
            Self::Rebind => "REBIND",
            Self::Reply => "REPLY",
            Self::Release => "RELEASE",
            Self::Decline => "DECLINE",
            Self::Reconfigure => "RECONFIGURE",
            Self::InformationRequest => "INFORMATION-REQUEST",
            Self::RelayForw => "RELAY-FORW",
            Self::RelayRepl => "RELAY-REPL",
        }
    }

    pub fn is_relay(&self) -> bool {
        matches!(self, Self::RelayForw | Self::RelayRepl)
    }
}

/// Borrowed view over a raw DHCPv6 datagram.
#[derive(Clone, Copy)]
pub struct Packet6<'a> {
    data: &'a [u8],
    msg_type: MessageType,
}

impl<'a> Packet6<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, CodecError> {
        let first = *data
            .first()
            .ok_or(CodecError::MalformedPacket("empty v6 packet"))?;
        let msg_type = MessageType::from_byte(first)
            .ok_or(CodecError::MalformedPacket("unknown v6 message type"))?;
        let min = if msg_type.is_relay() {
            RELAY_HEADER_LEN
        } else {
            MESSAGE_HEADER_LEN
        };
        if data.len() < min {
            return Err(CodecError::MalformedPacket("v6 packet shorter than its header"));
        }
        Ok(Self { data, msg_type })
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn is_relay(&self) -> bool {
        self.msg_type.is_relay()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    fn options_region(&self) -> &'a [u8] {
        if self.is_relay() {
            &self.data[RELAY_HEADER_LEN..]
        } else {
            &self.data[MESSAGE_HEADER_LEN..]
        }
    }

    /// First occurrence of an option by code in this layer (no descent).
    pub fn option(&self, code: u16) -> Result<&'a [u8], CodecError> {
        let region = self.options_region();
        let mut pos = 0;
        while pos + 4 <= region.len() {
            let opt = u16::from_be_bytes([region[pos], region[pos + 1]]);
            let len = u16::from_be_bytes([region[pos + 2], region[pos + 3]]) as usize;
            let start = pos + 4;
            if start + len > region.len() {
                return Err(CodecError::MalformedPacket("truncated v6 option"));
            }
            if opt == code {
                return Ok(&region[start..start + len]);
            }
            pos = start + len;
        }
        Err(CodecError::MissingOption(code))
    }

    /// The client/server message, descending through any number of nested
    /// relay layers.
    pub fn inner_message(&self) -> Result<Packet6<'a>, CodecError> {
        if !self.is_relay() {
            return Ok(*self);
        }
        let inner = Packet6::parse(self.option(OPT_RELAY_MESSAGE)?)?;
        inner.inner_message()
    }

    /// 24-bit transaction id of the inner client/server message.
    pub fn xid(&self) -> Result<u32, CodecError> {
        let msg = self.inner_message()?;
        Ok(u32::from_be_bytes([0, msg.data[1], msg.data[2], msg.data[3]]))
    }

    pub fn hops(&self) -> Result<u8, CodecError> {
        if !self.is_relay() {
            return Err(CodecError::MalformedPacket("not a relay message, no hop count"));
        }
        Ok(self.data[1])
    }

    pub fn link_addr(&self) -> Result<Ipv6Addr, CodecError> {
        if !self.is_relay() {
            return Err(CodecError::MalformedPacket("not a relay message, no link-address"));
        }
        Ok(addr_from_slice(&self.data[2..18]))
    }

    pub fn peer_addr(&self) -> Result<Ipv6Addr, CodecError> {
        if !self.is_relay() {
            return Err(CodecError::MalformedPacket("not a relay message, no peer-address"));
        }
        Ok(addr_from_slice(&self.data[18..34]))
    }

    /// Peer-address of the innermost relay layer: the relay closest to the
    /// client, which encodes the client's EUI-64 interface id.
    pub fn innermost_peer_addr(&self) -> Result<Ipv6Addr, CodecError> {
        if !self.is_relay() {
            return Err(CodecError::MalformedPacket("not a relay message, no peer-address"));
        }
        let mut current = *self;
        let mut peer = current.peer_addr()?;
        loop {
            let inner = Packet6::parse(current.option(OPT_RELAY_MESSAGE)?)?;
            if !inner.is_relay() {
                return Ok(peer);
            }
            current = inner;
            peer = current.peer_addr()?;
        }
    }

    /// Client DUID (option 1 of the inner message).
    pub fn duid(&self) -> Result<&'a [u8], CodecError> {
        self.inner_message()?.option(OPT_CLIENT_ID)
    }

    pub fn duid_type_name(&self) -> Result<&'static str, CodecError> {
        Ok(match duid_type(self.duid()?)? {
            1 => "DUID-LLT",
            2 => "DUID-EN",
            3 => "DUID-LL",
            4 => "DUID-UUID",
            _ => "Unknown",
        })
    }

    /// Client MAC address. DUID-LL and DUID-LLT carry it in their final six
    /// bytes; for the other DUID types the innermost relay's peer-address is
    /// decoded as EUI-64.
    pub fn mac(&self) -> Result<Vec<u8>, CodecError> {
        let duid = self.duid()?;
        match duid_type(duid)? {
            1 | 3 => {
                if duid.len() < 6 {
                    return Err(CodecError::MalformedPacket("link-layer DUID shorter than a MAC"));
                }
                Ok(duid[duid.len() - 6..].to_vec())
            }
            _ => {
                let ip = self.innermost_peer_addr()?;
                Ok(eui64_to_mac(&ip)?.to_vec())
            }
        }
    }

    /// Net-boot when the inner message's Option Request option asks for the
    /// Boot File URL option.
    pub fn is_net_boot(&self) -> bool {
        let Ok(msg) = self.inner_message() else {
            return false;
        };
        let Ok(oro) = msg.option(OPT_ORO) else {
            return false;
        };
        oro.chunks_exact(2)
            .any(|c| u16::from_be_bytes([c[0], c[1]]) == OPT_BOOTFILE_URL)
    }
}

fn addr_from_slice(slice: &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(slice);
    Ipv6Addr::from(octets)
}

fn duid_type(duid: &[u8]) -> Result<u16, CodecError> {
    if duid.len() < 2 {
        return Err(CodecError::MalformedPacket("DUID shorter than its type field"));
    }
    Ok(u16::from_be_bytes([duid[0], duid[1]]))
}

/// Recover a MAC address from an EUI-64 interface identifier.
pub fn eui64_to_mac(ip: &Ipv6Addr) -> Result<[u8; 6], CodecError> {
    let o = ip.octets();
    if o[11] != 0xff || o[12] != 0xfe {
        return Err(CodecError::MalformedPacket("interface id is not EUI-64"));
    }
    Ok([o[8] ^ 0x02, o[9], o[10], o[13], o[14], o[15]])
}

/// Wrap a received message in a fresh relay-forward envelope (RFC 8415
/// §19.1.2): hop count one above the inner relay's (zero for a client
/// message), link-address zero, peer-address set to the ingress source.
//
// TODO: confirm the hop semantics against clients behind deep relay chains;
// the counter here follows the classic copy-inner-plus-one behavior.
pub fn encapsulate(packet: &[u8], peer: Ipv6Addr) -> Vec<u8> {
    let mut out = vec![0u8; packet.len() + RELAY_HEADER_LEN + 4];
    out[0] = MessageType::RelayForw as u8;
    out[1] = match Packet6::parse(packet).and_then(|p| p.hops()) {
        Ok(hops) => hops.saturating_add(1),
        Err(_) => 0,
    };
    // link-address stays all-zeros
    out[18..34].copy_from_slice(&peer.octets());
    out[34..36].copy_from_slice(&OPT_RELAY_MESSAGE.to_be_bytes());
    out[36..38].copy_from_slice(&(packet.len() as u16).to_be_bytes());
    out[38..].copy_from_slice(packet);
    out
}

/// Strip one relay layer (RFC 8415 §19.2): returns the relayed message and
/// the peer-address it must be delivered to.
pub fn unwind(packet: &[u8]) -> Result<(&[u8], Ipv6Addr), CodecError> {
    let outer = Packet6::parse(packet)?;
    let peer = outer.peer_addr()?;
    let inner = outer.option(OPT_RELAY_MESSAGE)?;
    Ok((inner, peer))
}
