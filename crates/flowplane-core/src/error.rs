use std::fmt;

use crate::frame::ConnId;

/// Why a frame was rejected before it ever became a typed message.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("frame header declares length {0}, shorter than the 8-byte header")]
    TooShort(u16),
    #[error("frame header declares length {0}, exceeds the maximum of {max}", max = crate::frame::MAX_FRAME_LEN)]
    TooLong(u16),
    #[error("codec rejected the message body: {0}")]
    Undecodable(String),
}

/// Transport-level failure: the byte stream itself is gone.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed { addr: std::net::SocketAddr, #[source] source: std::io::Error },
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a `Conn` transitioned to `Closing`/`Disconnected`.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    #[error("malformed input: {0}")]
    Malformed(#[from] FramingError),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("liveness check failed: no echo reply within the timeout")]
    LivenessTimeout,
    #[error("version negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("closed locally by the application")]
    LocalClose,
    #[error("main connection (conn-id 0) was removed, tearing down the endpoint")]
    EndpointTornDown,
}

/// Errors returned synchronously from public operations. Everything that
/// instead surfaces asynchronously (malformed frames, liveness failures,
/// transport loss) does so via `on_closed`/`on_timeout` callbacks carrying a
/// [`CloseReason`], not through this type.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum CoreError {
    #[error("not in ESTABLISHED state")]
    NotEstablished,
    #[error("outbound queue is full")]
    Congested,
    #[error("no connection with id {0:?} on this endpoint")]
    NoSuchConn(ConnId),
    #[error("xid already has an in-flight request registered")]
    XidBusy,
    #[error("no established controller endpoint is attached")]
    NotConnected,
    #[error("duplicate endpoint identity")]
    DuplicateIdentity,
}

/// A peer's reported free-text explanation, e.g. a HELLO_FAILED body. Kept
/// distinct from [`CloseReason`] because it is untrusted wire data, not a
/// locally-determined cause, and is always bounded to wire limits (§6.4: 255
/// bytes for HELLO_FAILED bodies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerExplanation(String);

impl PeerExplanation {
    pub const MAX_LEN: usize = 255;

    pub fn new(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if text.len() > Self::MAX_LEN {
            text.truncate(Self::MAX_LEN);
        }
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerExplanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
