//! Length-prefixed frame codec over any `Read`/`Write` stream.
//!
//! Each frame is four big-endian `u32` fields followed by the payload:
//!
//! ```text
//! [size][flags][request id][payload tag][payload ...]
//! ```
//!
//! `size` counts everything after itself, so `size == 12 + payload.len()`.

use std::fmt;
use std::io::{self, Read, Write};
use std::ops::BitOr;

use crate::error::{ProtoError, Result};

/// Bytes covered by `size` before the payload starts.
pub const HEADER_LEN: usize = 12;

/// Maximum allowed frame size (64 MiB). Plugin uploads travel in one frame.
pub const MAX_FRAME: u32 = 64 * 1024 * 1024;

/// Frame flag bitset.
///
/// A frame carrying neither [`Flags::REQUEST`] nor [`Flags::RESPONSE`] is a
/// one-way message. A frame without [`Flags::COMPLETE`] announces that more
/// frames follow on the same request id.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
    /// No flags: an incomplete one-way frame.
    pub const NONE: Self = Self(0);
    /// The frame is a request and expects a response.
    pub const REQUEST: Self = Self(0x1);
    /// The frame answers an earlier request with the same id.
    pub const RESPONSE: Self = Self(0x2);
    /// No further frames follow for this request id.
    pub const COMPLETE: Self = Self(0x4);

    /// Wraps raw bits as read from the wire. Unknown bits are preserved.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits as written to the wire.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// `COMPLETE` when `complete` is true, otherwise no flags.
    pub const fn completion(complete: bool) -> Self {
        if complete { Self::COMPLETE } else { Self::NONE }
    }

    /// Whether the frame is a request.
    pub const fn is_request(self) -> bool {
        self.contains(Self::REQUEST)
    }

    /// Whether the frame is a response.
    pub const fn is_response(self) -> bool {
        self.contains(Self::RESPONSE)
    }

    /// Whether the frame closes its request id.
    pub const fn is_complete(self) -> bool {
        self.contains(Self::COMPLETE)
    }

    /// Whether the frame is neither a request nor a response.
    pub const fn is_one_way(self) -> bool {
        !self.is_request() && !self.is_response()
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.is_request() {
            names.push("REQUEST");
        }
        if self.is_response() {
            names.push("RESPONSE");
        }
        if self.is_complete() {
            names.push("COMPLETE");
        }
        write!(f, "Flags({:#x}: {})", self.0, names.join("|"))
    }
}

/// One undecoded unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request/response/completion bits.
    pub flags: Flags,
    /// Correlates frames of one exchange or stream.
    pub request_id: i32,
    /// Selects how `payload` is interpreted.
    pub tag: u32,
    /// Payload bytes, `size - 12` of them.
    pub payload: Vec<u8>,
}

/// Writes `frame` to `w` and flushes.
///
/// The frame is assembled in memory first so it reaches `w` in a single
/// `write_all`.
pub fn encode<W: Write>(w: &mut W, frame: &Frame) -> Result<()> {
    let size = u32::try_from(HEADER_LEN + frame.payload.len()).unwrap_or(u32::MAX);
    if size > MAX_FRAME {
        return Err(ProtoError::FrameTooLarge(size));
    }

    let mut buf = Vec::with_capacity(4 + size as usize);
    buf.extend_from_slice(&size.to_be_bytes());
    buf.extend_from_slice(&frame.flags.bits().to_be_bytes());
    buf.extend_from_slice(&frame.request_id.to_be_bytes());
    buf.extend_from_slice(&frame.tag.to_be_bytes());
    buf.extend_from_slice(&frame.payload);

    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame from `r`, blocking until it is complete.
///
/// End-of-stream before the first byte yields [`ProtoError::Closed`];
/// end-of-stream anywhere later yields [`ProtoError::TruncatedFrame`].
pub fn decode<R: Read>(r: &mut R) -> Result<Frame> {
    let mut size_buf = [0u8; 4];
    match read_full(r, &mut size_buf)? {
        0 => return Err(ProtoError::Closed),
        4 => {}
        actual => {
            return Err(ProtoError::TruncatedFrame {
                expected: 4,
                actual,
            });
        }
    }

    let size = u32::from_be_bytes(size_buf);
    if (size as usize) < HEADER_LEN {
        return Err(ProtoError::InvalidSize(size));
    }
    if size > MAX_FRAME {
        return Err(ProtoError::FrameTooLarge(size));
    }

    let mut body = vec![0u8; size as usize];
    let actual = read_full(r, &mut body)?;
    if actual < body.len() {
        return Err(ProtoError::TruncatedFrame {
            expected: body.len(),
            actual,
        });
    }

    let payload = body.split_off(HEADER_LEN);
    Ok(Frame {
        flags: Flags::from_bits(be_u32(&body[0..4])),
        request_id: i32::from_be_bytes([body[4], body[5], body[6], body[7]]),
        tag: be_u32(&body[8..12]),
        payload,
    })
}

/// Reads until `buf` is full or the stream ends, returning the byte count.
fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
