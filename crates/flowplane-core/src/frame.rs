use std::fmt;

use crate::error::FramingError;

/// Minimum legal frame length: the 8-byte header and nothing else.
pub const HEADER_LEN: usize = 8;
/// Maximum legal frame length (§6.2).
pub const MAX_FRAME_LEN: u16 = u16::MAX;

/// Identifies a connection within an [`crate::endpoint::Endpoint`]. `0` is
/// always the main connection; `1..=255` are auxiliary connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u8);

impl ConnId {
    pub const MAIN: ConnId = ConnId(0);

    pub fn is_main(self) -> bool {
        self.0 == 0
    }

    pub fn is_auxiliary(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_main() {
            write!(f, "main")
        } else {
            write!(f, "aux:{}", self.0)
        }
    }
}

/// Identifies one datapath-side [`crate::endpoint::Endpoint`], as reported by
/// the peer during feature exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DpId(pub u64);

/// Identifies one controller-side [`crate::endpoint::Endpoint`], assigned
/// locally and monotonically increasing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CtlId(pub u64);

/// Transaction identifier correlating a request with its reply.
pub type Xid = u32;

/// An immutable, already-validated frame: an 8-byte header plus its body.
///
/// Constructing a `Frame` (via [`Frame::parse`] or [`Frame::new`]) is the
/// only place frame-length validation happens; once built, a `Frame` is
/// known-good and every field access is infallible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Builds a frame from a version, type, xid and body, computing the
    /// length field.
    ///
    /// # Panics
    /// Panics if `8 + body.len()` would overflow `u16` — callers must keep
    /// bodies within [`MAX_FRAME_LEN`] minus the header, which every codec
    /// and control-message encoder in this crate already enforces.
    pub fn new(version: u8, msg_type: u8, xid: Xid, body: &[u8]) -> Self {
        let total_len = HEADER_LEN + body.len();
        assert!(total_len <= MAX_FRAME_LEN as usize, "frame body too large: {total_len}");
        let mut bytes = Vec::with_capacity(total_len);
        bytes.push(version);
        bytes.push(msg_type);
        bytes.extend_from_slice(&(total_len as u16).to_be_bytes());
        bytes.extend_from_slice(&xid.to_be_bytes());
        bytes.extend_from_slice(body);
        Self { bytes }
    }

    /// Validates and wraps a complete, already-length-matched buffer
    /// (exactly `header.length` bytes, as assembled by [`FrameReader`]).
    pub fn parse(bytes: Vec<u8>) -> Result<Self, FramingError> {
        if bytes.len() < HEADER_LEN {
            return Err(FramingError::TooShort(bytes.len() as u16));
        }
        let declared_len = u16::from_be_bytes([bytes[2], bytes[3]]);
        if (declared_len as usize) < HEADER_LEN {
            return Err(FramingError::TooShort(declared_len));
        }
        if declared_len as usize != bytes.len() {
            // FrameReader never hands us a mismatched buffer; defensive only.
            return Err(FramingError::TooShort(declared_len));
        }
        Ok(Self { bytes })
    }

    pub fn version(&self) -> u8 {
        self.bytes[0]
    }

    pub fn msg_type(&self) -> u8 {
        self.bytes[1]
    }

    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    pub fn xid(&self) -> Xid {
        u32::from_be_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]])
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Clone, Copy, Debug)]
enum ReadTarget {
    Header,
    Body { length: usize },
}

/// Reassembles frames out of a byte stream that may be split arbitrarily
/// across reads (§4.1).
///
/// Internal state is exactly `(partial_buffer, bytes_so_far)` as specified:
/// `buf` accumulates bytes toward whatever the current target is (the header
/// until it is complete, then the declared body length), and a frame is
/// emitted the instant `buf.len()` reaches that target.
pub struct FrameReader {
    buf: Vec<u8>,
    target: ReadTarget,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self { buf: Vec::with_capacity(HEADER_LEN), target: ReadTarget::Header }
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds newly-arrived bytes in, appending every complete frame found to
    /// `out` (in arrival order). Returns an error (and stops, leaving any
    /// unconsumed bytes in `bytes` undefined territory for the caller — on
    /// error the connection is closing regardless) the instant a frame is
    /// found to be malformed.
    pub fn push(&mut self, mut bytes: &[u8], out: &mut Vec<Frame>) -> Result<(), FramingError> {
        while !bytes.is_empty() {
            let need = match self.target {
                ReadTarget::Header => HEADER_LEN - self.buf.len(),
                ReadTarget::Body { length } => length - self.buf.len(),
            };
            let take = need.min(bytes.len());
            self.buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            match self.target {
                ReadTarget::Header if self.buf.len() == HEADER_LEN => {
                    let declared_len = u16::from_be_bytes([self.buf[2], self.buf[3]]);
                    if (declared_len as usize) < HEADER_LEN {
                        return Err(FramingError::TooShort(declared_len));
                    }
                    if declared_len > MAX_FRAME_LEN {
                        return Err(FramingError::TooLong(declared_len));
                    }
                    self.target = ReadTarget::Body { length: declared_len as usize };
                }
                ReadTarget::Body { length } if self.buf.len() == length => {
                    let complete = std::mem::replace(&mut self.buf, Vec::with_capacity(HEADER_LEN));
                    out.push(Frame::parse(complete)?);
                    self.target = ReadTarget::Header;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_a_frame_split_across_many_reads() {
        let frame = Frame::new(4, 0, 7, b"abc");
        let bytes = frame.as_bytes().to_vec();

        let mut reader = FrameReader::new();
        let mut out = Vec::new();
        for chunk in bytes.chunks(1) {
            reader.push(chunk, &mut out).unwrap();
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], frame);
    }

    #[test]
    fn emits_multiple_frames_delivered_in_one_read() {
        let f1 = Frame::new(4, 0, 1, b"x");
        let f2 = Frame::new(4, 1, 2, b"yz");
        let mut bytes = f1.as_bytes().to_vec();
        bytes.extend_from_slice(f2.as_bytes());

        let mut reader = FrameReader::new();
        let mut out = Vec::new();
        reader.push(&bytes, &mut out).unwrap();
        assert_eq!(out, vec![f1, f2]);
    }

    #[test]
    fn rejects_declared_length_shorter_than_header() {
        let mut reader = FrameReader::new();
        let mut out = Vec::new();
        // version=4 type=0 length=7 xid=0
        let bytes = [4u8, 0, 0, 7, 0, 0, 0, 0];
        let err = reader.push(&bytes, &mut out).unwrap_err();
        assert!(matches!(err, FramingError::TooShort(7)));
    }

    #[test]
    fn accepts_declared_length_equal_to_max() {
        let mut reader = FrameReader::new();
        let mut out = Vec::new();
        let mut bytes = vec![4u8, 0, 0xFF, 0xFF, 0, 0, 0, 0];
        bytes.extend(std::iter::repeat(0u8).take(MAX_FRAME_LEN as usize - HEADER_LEN));
        reader.push(&bytes, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].length(), MAX_FRAME_LEN);
    }

}
