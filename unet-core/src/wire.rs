//! Wire codec: bincode lobby packets and the relay sub-framing used on the relay channel.
//!
//! Relay request (sender → host):   `[dest peer][channel][packet type][payload..]`
//! Relay delivery (host → receiver): `[sender peer][channel][payload..]`

use crate::protocol::LobbyPacket;
use crate::service::PacketType;

const MAX_PACKET_LEN: usize = 16 * 1024 * 1024; // 16 MiB

const RELAY_REQUEST_HEADER: usize = 3;
const RELAY_DELIVERY_HEADER: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
    #[error("packet too large ({0} bytes)")]
    TooLarge(usize),
    #[error("relay frame too short ({0} bytes)")]
    ShortRelayFrame(usize),
    #[error("unknown packet type byte {0}")]
    UnknownPacketType(u8),
}

/// Encode one lobby packet.
pub fn encode_packet(packet: &LobbyPacket) -> Result<Vec<u8>, WireError> {
    let bytes = bincode::serialize(packet).map_err(WireError::Encode)?;
    if bytes.len() > MAX_PACKET_LEN {
        return Err(WireError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Decode one lobby packet. Trailing bytes are ignored.
pub fn decode_packet(bytes: &[u8]) -> Result<LobbyPacket, WireError> {
    if bytes.len() > MAX_PACKET_LEN {
        return Err(WireError::TooLarge(bytes.len()));
    }
    bincode::deserialize(bytes).map_err(WireError::Decode)
}

/// Parsed relay request as received by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRequest<'a> {
    pub dest: u8,
    pub channel: u8,
    pub packet_type: PacketType,
    pub payload: &'a [u8],
}

pub fn encode_relay_request(dest: u8, channel: u8, packet_type: PacketType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RELAY_REQUEST_HEADER + payload.len());
    out.push(dest);
    out.push(channel);
    out.push(packet_type.to_byte());
    out.extend_from_slice(payload);
    out
}

pub fn decode_relay_request(bytes: &[u8]) -> Result<RelayRequest<'_>, WireError> {
    if bytes.len() < RELAY_REQUEST_HEADER {
        return Err(WireError::ShortRelayFrame(bytes.len()));
    }
    let packet_type =
        PacketType::from_byte(bytes[2]).ok_or(WireError::UnknownPacketType(bytes[2]))?;
    Ok(RelayRequest {
        dest: bytes[0],
        channel: bytes[1],
        packet_type,
        payload: &bytes[RELAY_REQUEST_HEADER..],
    })
}

/// Parsed relay delivery as received by the final recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayDelivery<'a> {
    pub sender: u8,
    pub channel: u8,
    pub payload: &'a [u8],
}

pub fn encode_relay_delivery(sender: u8, channel: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RELAY_DELIVERY_HEADER + payload.len());
    out.push(sender);
    out.push(channel);
    out.extend_from_slice(payload);
    out
}

pub fn decode_relay_delivery(bytes: &[u8]) -> Result<RelayDelivery<'_>, WireError> {
    if bytes.len() < RELAY_DELIVERY_HEADER {
        return Err(WireError::ShortRelayFrame(bytes.len()));
    }
    Ok(RelayDelivery {
        sender: bytes[0],
        channel: bytes[1],
        payload: &bytes[RELAY_DELIVERY_HEADER..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Guid;
    use crate::protocol::MemberRecord;
    use crate::service::{ServiceId, ServiceKind};
    use std::collections::BTreeMap;

    #[test]
    fn roundtrip_snapshot() {
        let guid = Guid::new();
        let mut data = BTreeMap::new();
        data.insert("map".to_string(), "forest".to_string());
        let packet = LobbyPacket::LobbyInfo {
            data: data.clone(),
            members: vec![MemberRecord {
                guid,
                peer: 0,
                primary: Some(ServiceKind::Steam),
                name: "host".into(),
                ids: vec![ServiceId::new(ServiceKind::Steam, 42)],
                data,
                files: Vec::new(),
            }],
        };
        let bytes = encode_packet(&packet).unwrap();
        assert_eq!(decode_packet(&bytes).unwrap(), packet);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            decode_packet(&[0xff, 0xff, 0xff, 0xff]),
            Err(WireError::Decode(_))
        ));
        assert!(decode_packet(&[]).is_err());
    }

    #[test]
    fn relay_request_layout() {
        let frame = encode_relay_request(3, 2, PacketType::Unreliable, b"abc");
        assert_eq!(frame, vec![3, 2, 1, b'a', b'b', b'c']);
        let parsed = decode_relay_request(&frame).unwrap();
        assert_eq!(parsed.dest, 3);
        assert_eq!(parsed.channel, 2);
        assert_eq!(parsed.packet_type, PacketType::Unreliable);
        assert_eq!(parsed.payload, b"abc");
    }

    #[test]
    fn relay_delivery_layout() {
        let frame = encode_relay_delivery(1, 255, b"x");
        assert_eq!(frame, vec![1, 255, b'x']);
        let parsed = decode_relay_delivery(&frame).unwrap();
        assert_eq!((parsed.sender, parsed.channel, parsed.payload), (1, 255, &b"x"[..]));
    }

    #[test]
    fn short_relay_frames_are_rejected() {
        assert!(matches!(decode_relay_request(&[1, 2]), Err(WireError::ShortRelayFrame(2))));
        assert!(matches!(decode_relay_delivery(&[1]), Err(WireError::ShortRelayFrame(1))));
        assert!(matches!(
            decode_relay_request(&[1, 2, 7]),
            Err(WireError::UnknownPacketType(7))
        ));
    }
}
