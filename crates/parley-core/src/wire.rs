//! Parley wire format: the framed packet envelope.
//!
//! Every unit exchanged on the control channel (and the request that opens a
//! bulk connection) is one framed packet:
//!
//! ```text
//! offset 0  u16  magic = 0xFEFF
//! offset 2  u32  length     // len(type) + len(checksum) + len(payload)
//! offset 6  u16  type       // 1 = Identity, 2 = Text, 3 = File
//! offset 8  ..   payload    // length - 4 bytes
//! end-2     u16  checksum   // sum of payload bytes mod 65536
//! ```
//!
//! All integers are big-endian. The header is a `#[repr(C)]` zerocopy type
//! so its layout is checked at compile time. Encoding is the only place the
//! checksum is computed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Header ───────────────────────────────────────────────────────────────────

/// Fixed packet header. The checksum trails the payload and is not part of it.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PacketHeader {
    /// Always [`MAGIC`].
    pub magic: U16<BigEndian>,
    /// Byte count of type + checksum + payload. Excludes magic and itself.
    pub length: U32<BigEndian>,
    /// Payload discriminator, see [`PacketKind`].
    pub kind: U16<BigEndian>,
}

assert_eq_size!(PacketHeader, [u8; 8]);

// ── Constants ─────────────────────────────────────────────────────────────────

/// Fixed 16-bit frame marker.
pub const MAGIC: u16 = 0xFEFF;

/// Size of [`PacketHeader`] on the wire.
pub const HEADER_LEN: usize = 8;

/// Size of the trailing checksum.
pub const CHECKSUM_LEN: usize = 2;

/// Smallest possible frame: header + checksum, empty payload.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + CHECKSUM_LEN;

/// Largest payload a peer may declare. Anything larger is treated as a
/// malformed frame rather than buffered.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Bytes covered by `length` besides the payload (type + checksum).
const LENGTH_OVERHEAD: u32 = 4;

/// Bytes preceding the region covered by `length` (magic + length).
const PREAMBLE_LEN: usize = 6;

// ── Packet kinds ──────────────────────────────────────────────────────────────

/// Discriminator carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketKind {
    Identity = 1,
    Text = 2,
    File = 3,
}

impl TryFrom<u16> for PacketKind {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketKind::Identity),
            2 => Ok(PacketKind::Text),
            3 => Ok(PacketKind::File),
            other => Err(other),
        }
    }
}

impl From<PacketKind> for u16 {
    fn from(k: PacketKind) -> u16 {
        k as u16
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// One decoded frame. `kind` stays raw so unknown types can still be framed
/// and rejected one layer up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: u16,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: impl Into<u16>, payload: impl Into<Bytes>) -> Result<Self, FramingError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(FramingError::TooLarge(payload.len() as u32));
        }
        Ok(Self {
            kind: kind.into(),
            payload,
        })
    }

    /// Serialize to a complete frame.
    pub fn encode(&self) -> Bytes {
        let header = PacketHeader {
            magic: U16::new(MAGIC),
            length: U32::new(self.payload.len() as u32 + LENGTH_OVERHEAD),
            kind: U16::new(self.kind),
        };

        let mut buf = BytesMut::with_capacity(MIN_FRAME_LEN + self.payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        buf.put_u16(checksum(&self.payload));
        buf.freeze()
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// Returns the packet and the number of bytes it occupied. Trailing bytes
    /// past the frame are left alone.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), FramingError> {
        if buf.len() >= 2 {
            let magic = u16::from_be_bytes([buf[0], buf[1]]);
            if magic != MAGIC {
                return Err(FramingError::BadMagic(magic));
            }
        }

        let header = match PacketHeader::read_from_prefix(buf) {
            Some(h) => h,
            None => {
                return Err(FramingError::Incomplete {
                    needed: MIN_FRAME_LEN - buf.len(),
                })
            }
        };

        let length = header.length.get();
        if length < LENGTH_OVERHEAD {
            return Err(FramingError::LengthTooSmall(length));
        }
        let payload_len = (length - LENGTH_OVERHEAD) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(FramingError::TooLarge(length - LENGTH_OVERHEAD));
        }

        let frame_len = PREAMBLE_LEN + length as usize;
        if buf.len() < frame_len {
            return Err(FramingError::Incomplete {
                needed: frame_len - buf.len(),
            });
        }

        let payload = &buf[HEADER_LEN..HEADER_LEN + payload_len];
        let expected = u16::from_be_bytes([buf[frame_len - 2], buf[frame_len - 1]]);
        let actual = checksum(payload);
        if expected != actual {
            return Err(FramingError::Checksum { expected, actual });
        }

        Ok((
            Self {
                kind: header.kind.get(),
                payload: Bytes::copy_from_slice(payload),
            },
            frame_len,
        ))
    }
}

/// Frame `payload` under `kind`.
pub fn encode(kind: impl Into<u16>, payload: &[u8]) -> Result<Bytes, FramingError> {
    Ok(Packet::new(kind, Bytes::copy_from_slice(payload))?.encode())
}

/// Decode a single frame, returning its type and payload.
pub fn decode(buf: &[u8]) -> Result<(u16, Bytes), FramingError> {
    let (packet, _) = Packet::decode(buf)?;
    Ok((packet.kind, packet.payload))
}

/// 16-bit additive checksum over the payload.
pub fn checksum(payload: &[u8]) -> u16 {
    payload
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
}

// ── Streaming ─────────────────────────────────────────────────────────────────

/// Pull the next frame off an accumulating read buffer.
///
/// * `Ok(Some(_))`: a frame was decoded and consumed.
/// * `Ok(None)`: the buffer holds a partial frame; read more and retry.
/// * `Err(_)`: a malformed frame was discarded. For a checksum mismatch
///   exactly that frame is dropped; for a bad magic or bad length the buffer
///   is resynchronised to the next magic marker. The caller may call again.
pub fn next_frame(buf: &mut BytesMut) -> Result<Option<Packet>, FramingError> {
    match Packet::decode(buf) {
        Ok((packet, consumed)) => {
            buf.advance(consumed);
            Ok(Some(packet))
        }
        Err(FramingError::Incomplete { .. }) => Ok(None),
        Err(e @ FramingError::Checksum { .. }) => {
            let frame_len = declared_frame_len(buf).unwrap_or(buf.len());
            buf.advance(frame_len.min(buf.len()));
            Err(e)
        }
        Err(e) => {
            resync(buf);
            Err(e)
        }
    }
}

fn declared_frame_len(buf: &[u8]) -> Option<usize> {
    let header = PacketHeader::read_from_prefix(buf)?;
    Some(PREAMBLE_LEN + header.length.get() as usize)
}

/// Drop the leading byte, then everything up to the next magic marker.
fn resync(buf: &mut BytesMut) {
    let [hi, lo] = MAGIC.to_be_bytes();
    let skip = buf
        .windows(2)
        .skip(1)
        .position(|w| w[0] == hi && w[1] == lo)
        .map(|p| p + 1)
        .unwrap_or_else(|| {
            // Keep a trailing half-marker: its partner may still be in flight.
            if buf.len() > 1 && buf[buf.len() - 1] == hi {
                buf.len() - 1
            } else {
                buf.len()
            }
        });
    buf.advance(skip.max(1).min(buf.len()));
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting framed data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// Shorter than the header or the declared length. Not fatal: buffer
    /// more bytes and retry.
    #[error("incomplete packet: {needed} more bytes needed")]
    Incomplete { needed: usize },

    #[error("bad magic: 0x{0:04x}")]
    BadMagic(u16),

    #[error("declared length {0} is smaller than the type and checksum fields")]
    LengthTooSmall(u32),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    TooLarge(u32),

    #[error("checksum mismatch: frame carries 0x{expected:04x}, payload sums to 0x{actual:04x}")]
    Checksum { expected: u16, actual: u16 },
}

impl FramingError {
    /// True when the caller should wait for more bytes rather than discard.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FramingError::Incomplete { .. })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
