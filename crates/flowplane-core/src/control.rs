//! Encoding/decoding for the handful of message kinds `Conn` and `Endpoint`
//! must understand structurally (HELLO, ERROR, ECHO, FEATURES_REPLY,
//! ROLE_REQUEST/REPLY). Everything else is opaque bytes handed to the
//! codec collaborator (§6.1) and passed straight through to the application.

use crate::error::{FramingError, PeerExplanation};
use crate::frame::{Frame, Xid};
use crate::version::VersionBitmap;

pub const TYPE_HELLO: u8 = 0;
pub const TYPE_ERROR: u8 = 1;
pub const TYPE_ECHO_REQUEST: u8 = 2;
pub const TYPE_ECHO_REPLY: u8 = 3;
pub const TYPE_FEATURES_REQUEST: u8 = 5;
pub const TYPE_FEATURES_REPLY: u8 = 6;
pub const TYPE_PACKET_OUT: u8 = 13;
pub const TYPE_FLOW_MOD: u8 = 14;
pub const TYPE_GROUP_MOD: u8 = 15;
pub const TYPE_PORT_MOD: u8 = 16;
pub const TYPE_TABLE_MOD: u8 = 17;
pub const TYPE_ROLE_REQUEST: u8 = 24;
pub const TYPE_ROLE_REPLY: u8 = 25;

const HELLO_ELEM_VERSIONBITMAP: u16 = 1;

/// Whether `msg_type` mutates datapath state, and so is off-limits for a
/// SLAVE-role controller (§6.4/§7, OFPET_BAD_REQUEST/OFPBRC_IS_SLAVE).
pub fn is_modifying_request(msg_type: u8) -> bool {
    matches!(msg_type, TYPE_PACKET_OUT | TYPE_FLOW_MOD | TYPE_GROUP_MOD | TYPE_PORT_MOD | TYPE_TABLE_MOD)
}

/// `kind`/`code` pairs named in §6.4.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    HelloFailedIncompatible,
    HelloFailedPermission,
    BadRequestIsSlave,
    RoleRequestFailedStale,
}

impl ErrorKind {
    fn wire(self) -> (u16, u16) {
        match self {
            ErrorKind::HelloFailedIncompatible => (0, 0),
            ErrorKind::HelloFailedPermission => (0, 1),
            ErrorKind::BadRequestIsSlave => (1, 1),
            ErrorKind::RoleRequestFailedStale => (11, 0),
        }
    }
}

/// Builds an `ERROR` frame body: 2-byte kind, 2-byte code, then a free-text
/// or truncated-offending-message payload.
pub fn encode_error(kind: ErrorKind, payload: &[u8]) -> Vec<u8> {
    let (k, c) = kind.wire();
    let mut body = Vec::with_capacity(4 + payload.len());
    body.extend_from_slice(&k.to_be_bytes());
    body.extend_from_slice(&c.to_be_bytes());
    body.extend_from_slice(payload);
    body
}

pub fn encode_error_frame(version: u8, xid: Xid, kind: ErrorKind, payload: &[u8]) -> Frame {
    Frame::new(version, TYPE_ERROR, xid, &encode_error(kind, payload))
}

/// Builds a HELLO frame advertising `bitmap` via a version-bitmap element.
pub fn encode_hello(version: u8, xid: Xid, bitmap: VersionBitmap) -> Frame {
    let mut body = Vec::with_capacity(5);
    body.extend_from_slice(&HELLO_ELEM_VERSIONBITMAP.to_be_bytes());
    body.extend_from_slice(&5u16.to_be_bytes());
    body.push(bitmap.as_bits());
    Frame::new(version, TYPE_HELLO, xid, &body)
}

/// A decoded HELLO: the header version plus an optional version-bitmap
/// element. Per §4.2, a HELLO without a bitmap element means the peer only
/// understands the legacy `version`-field negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hello {
    pub header_version: u8,
    pub bitmap: Option<VersionBitmap>,
}

pub fn decode_hello(frame: &Frame) -> Result<Hello, FramingError> {
    let body = frame.body();
    let bitmap = if body.len() >= 5 && u16::from_be_bytes([body[0], body[1]]) == HELLO_ELEM_VERSIONBITMAP
    {
        Some(VersionBitmap::from_versions(bits_to_versions(body[4])))
    } else {
        None
    };
    Ok(Hello { header_version: frame.version(), bitmap })
}

fn bits_to_versions(bits: u8) -> impl Iterator<Item = u8> {
    (1u8..=8).filter(move |v| bits & (1 << (v - 1)) != 0)
}

pub fn encode_echo(is_reply: bool, version: u8, xid: Xid, data: &[u8]) -> Frame {
    let ty = if is_reply { TYPE_ECHO_REPLY } else { TYPE_ECHO_REQUEST };
    Frame::new(version, ty, xid, data)
}

/// Extracts the 8-byte `dpid` a FEATURES_REPLY body leads with. The rest of
/// the body (capabilities, port descriptions, ...) is opaque to the core.
pub fn decode_features_reply_dpid(frame: &Frame) -> Option<u64> {
    let body = frame.body();
    (body.len() >= 8).then(|| u64::from_be_bytes(body[..8].try_into().unwrap()))
}

/// `role`/`generation_id` pair carried by ROLE_REQUEST and ROLE_REPLY bodies:
/// 4-byte role, 4 bytes padding, 8-byte generation id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleMessage {
    pub role: u32,
    pub generation_id: u64,
}

pub fn decode_role_message(frame: &Frame) -> Option<RoleMessage> {
    let body = frame.body();
    if body.len() < 16 {
        return None;
    }
    let role = u32::from_be_bytes(body[..4].try_into().unwrap());
    let generation_id = u64::from_be_bytes(body[8..16].try_into().unwrap());
    Some(RoleMessage { role, generation_id })
}

pub fn encode_role_reply(version: u8, xid: Xid, msg: RoleMessage) -> Frame {
    let mut body = Vec::with_capacity(16);
    body.extend_from_slice(&msg.role.to_be_bytes());
    body.extend_from_slice(&[0u8; 4]);
    body.extend_from_slice(&msg.generation_id.to_be_bytes());
    Frame::new(version, TYPE_ROLE_REPLY, xid, &body)
}

pub fn peer_explanation_from_payload(payload: &[u8]) -> PeerExplanation {
    PeerExplanation::new(String::from_utf8_lossy(payload).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_bitmap_round_trips() {
        let bitmap = VersionBitmap::from_versions([1, 3, 4]);
        let frame = encode_hello(4, 1, bitmap);
        let hello = decode_hello(&frame).unwrap();
        assert_eq!(hello.header_version, 4);
        assert_eq!(hello.bitmap, Some(bitmap));
    }

    #[test]
    fn hello_without_body_has_no_bitmap() {
        let frame = Frame::new(1, TYPE_HELLO, 1, &[]);
        let hello = decode_hello(&frame).unwrap();
        assert_eq!(hello.bitmap, None);
        assert_eq!(hello.header_version, 1);
    }

    #[test]
    fn features_reply_dpid_round_trips() {
        let mut body = 0xdead_beef_0000_0001u64.to_be_bytes().to_vec();
        body.extend_from_slice(b"rest");
        let frame = Frame::new(4, TYPE_FEATURES_REPLY, 5, &body);
        assert_eq!(decode_features_reply_dpid(&frame), Some(0xdead_beef_0000_0001));
    }

    #[test]
    fn role_message_round_trips() {
        let msg = RoleMessage { role: 2, generation_id: 42 };
        let frame = encode_role_reply(4, 9, msg);
        assert_eq!(decode_role_message(&frame), Some(msg));
    }

    #[test]
    fn error_frame_carries_kind_and_code() {
        let frame = encode_error_frame(4, 1, ErrorKind::HelloFailedIncompatible, b"nope");
        assert_eq!(frame.msg_type(), TYPE_ERROR);
        assert_eq!(&frame.body()[..4], &[0, 0, 0, 0]);
        assert_eq!(&frame.body()[4..], b"nope");
    }

    #[test]
    fn modifying_requests_are_recognized_and_nothing_else_is() {
        for ty in [TYPE_PACKET_OUT, TYPE_FLOW_MOD, TYPE_GROUP_MOD, TYPE_PORT_MOD, TYPE_TABLE_MOD] {
            assert!(is_modifying_request(ty));
        }
        for ty in [TYPE_HELLO, TYPE_ECHO_REQUEST, TYPE_FEATURES_REQUEST, TYPE_ROLE_REQUEST] {
            assert!(!is_modifying_request(ty));
        }
    }
}
