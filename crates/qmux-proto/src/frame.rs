//! QMUX envelope encode/decode and stream reassembly.
//!
//! The decoder is length-prefixed, not delimited: the fixed six-byte
//! transport prefix (marker, length, flags, service, cid) is parsed
//! zero-copy, the declared length tells us how many bytes the frame
//! spans, and only then is the message header and TLV payload walked.
//! All validation happens before any payload bytes are copied.
//!
//! A wrong marker byte means the stream has lost framing. There is no
//! safe way to resync a length-prefixed binary stream, so that error is
//! terminal for the transport that produced it.

use bytes::{Buf, BufMut, BytesMut};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    MessageType, Service,
    errors::{FrameError, Result},
    tlv::{TLV_HEADER_SIZE, Tlv},
};

/// The QMUX frame marker byte.
pub const QMUX_MARKER: u8 = 0x01;

/// Largest possible frame on the wire: marker plus a maximal 16-bit
/// length field.
pub const MAX_FRAME_SIZE: usize = 1 + u16::MAX as usize;

/// Fixed QMUX transport prefix, cast directly from the wire.
///
/// Fields are raw byte arrays so every bit pattern is a valid value;
/// casting untrusted bytes cannot misbehave. Multi-byte integers are
/// little-endian, unlike most network formats.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct QmuxPrefix {
    marker: u8,
    length: [u8; 2],
    flags: u8,
    service: u8,
    cid: u8,
}

impl QmuxPrefix {
    /// Size of the prefix on the wire, marker included.
    const SIZE: usize = 6;

    fn length(&self) -> usize {
        usize::from(u16::from_le_bytes(self.length))
    }
}

/// Outcome of [`decode_one`]: either a complete frame with the number of
/// bytes it consumed, or a signal that the buffer ends mid-frame.
///
/// `NeedMore` is a continuation signal, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame was parsed.
    Frame {
        /// The decoded frame.
        frame: Frame,
        /// Bytes consumed from the front of the buffer.
        consumed: usize,
    },
    /// The buffer ends before the frame does.
    NeedMore,
}

/// A decoded QMUX frame: envelope fields plus TLV payload.
///
/// This is the codec-level value. It has no freeze semantics and no
/// index; [`crate::Message`] wraps it with both. TLVs keep their wire
/// (insertion) order, duplicates included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Service namespace this frame belongs to.
    pub service: Service,
    /// Client id the frame is scoped to.
    pub cid: u8,
    /// Request, response, or indication.
    pub message_type: MessageType,
    /// Transaction id. For the control service only the low 8 bits are
    /// representable on the wire; [`Frame::encode`] enforces that.
    pub transaction_id: u16,
    /// Message id within the service's namespace.
    pub message_id: u16,
    tlvs: Vec<Tlv>,
}

impl Frame {
    /// Build a frame from parts.
    #[must_use]
    pub fn new(
        service: Service,
        cid: u8,
        message_type: MessageType,
        transaction_id: u16,
        message_id: u16,
        tlvs: Vec<Tlv>,
    ) -> Self {
        Self { service, cid, message_type, transaction_id, message_id, tlvs }
    }

    /// TLVs in wire order.
    pub fn tlvs(&self) -> impl Iterator<Item = &Tlv> {
        self.tlvs.iter()
    }

    /// First TLV of the given type, if present.
    #[must_use]
    pub fn tlv(&self, tlv_type: u8) -> Option<&Tlv> {
        self.tlvs.iter().find(|t| t.tlv_type == tlv_type)
    }

    /// Append a TLV.
    pub fn push_tlv(&mut self, tlv: Tlv) {
        self.tlvs.push(tlv);
    }

    /// Number of TLVs in the payload.
    #[must_use]
    pub fn tlv_count(&self) -> usize {
        self.tlvs.len()
    }

    /// Sum of `3 + value.len()` over all TLVs.
    fn tlv_total(&self) -> usize {
        self.tlvs.iter().map(Tlv::wire_size).sum()
    }

    /// Encode the frame into a buffer.
    ///
    /// # Errors
    ///
    /// - `FrameError::CtlTransactionId` if a control-service transaction
    ///   id does not fit in 8 bits;
    /// - `FrameError::FrameTooLarge` if the encoded frame would overflow
    ///   the 16-bit length field.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let tid_size = self.service.transaction_id_size();
        if tid_size == 1 && self.transaction_id > u16::from(u8::MAX) {
            return Err(FrameError::CtlTransactionId { tid: self.transaction_id });
        }

        let tlv_total = self.tlv_total();
        if tlv_total > usize::from(u16::MAX) {
            return Err(FrameError::FrameTooLarge { size: tlv_total, max: usize::from(u16::MAX) });
        }

        // length counts every byte after the marker
        let length = 2 + 3 + 1 + tid_size + 2 + 2 + tlv_total;
        if length > usize::from(u16::MAX) {
            return Err(FrameError::FrameTooLarge { size: length + 1, max: MAX_FRAME_SIZE });
        }

        dst.put_u8(QMUX_MARKER);
        dst.put_u16_le(length as u16);
        dst.put_u8(self.message_type.transport_flags());
        dst.put_u8(self.service.0);
        dst.put_u8(self.cid);

        dst.put_u8(self.message_type.to_flags());
        if tid_size == 1 {
            dst.put_u8(self.transaction_id as u8);
        } else {
            dst.put_u16_le(self.transaction_id);
        }
        dst.put_u16_le(self.message_id);
        dst.put_u16_le(tlv_total as u16);
        for tlv in &self.tlvs {
            tlv.encode(dst);
        }

        Ok(())
    }

    /// Encode into a fresh byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(QmuxPrefix::SIZE + 8 + self.tlv_total());
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

/// Decode at most one frame from the front of `buf`.
///
/// Returns [`Decoded::NeedMore`] when the buffer ends mid-frame. A
/// malformed frame (bad marker, impossible length, tlv-length that does
/// not match the payload) is an error; the caller must treat it as fatal
/// to the stream.
pub fn decode_one(buf: &[u8]) -> Result<Decoded> {
    let Some(&first) = buf.first() else {
        return Ok(Decoded::NeedMore);
    };
    if first != QMUX_MARKER {
        return Err(FrameError::InvalidMarker { found: first });
    }

    let Ok((prefix, _)) = QmuxPrefix::ref_from_prefix(buf) else {
        return Ok(Decoded::NeedMore);
    };

    let length = prefix.length();
    let service = Service(prefix.service);
    let tid_size = service.transaction_id_size();

    // length-field + flags/service/cid + message header
    let minimum = 2 + 3 + 1 + tid_size + 2 + 2;
    if length < minimum {
        return Err(FrameError::FrameTooShort { declared: length, minimum });
    }

    let total = 1 + length;
    if buf.len() < total {
        return Ok(Decoded::NeedMore);
    }

    let mut body = &buf[QmuxPrefix::SIZE..total];
    let message_type = MessageType::from_flags(body.get_u8());
    let transaction_id =
        if tid_size == 1 { u16::from(body.get_u8()) } else { body.get_u16_le() };
    let message_id = body.get_u16_le();
    let tlv_length = usize::from(body.get_u16_le());

    // Trailing bytes beyond tlv-length are a framing error, as is a
    // tlv-length that claims more than the frame holds.
    if tlv_length != body.remaining() {
        return Err(FrameError::TlvLengthMismatch { declared: tlv_length, actual: body.remaining() });
    }

    let mut tlvs = Vec::new();
    while body.has_remaining() {
        if body.remaining() < TLV_HEADER_SIZE {
            return Err(FrameError::TlvLengthMismatch {
                declared: tlv_length,
                actual: body.remaining(),
            });
        }
        let tlv_type = body.get_u8();
        let value_len = usize::from(body.get_u16_le());
        if value_len > body.remaining() {
            return Err(FrameError::TlvOverrun {
                tlv_type,
                declared: value_len,
                remaining: body.remaining(),
            });
        }
        tlvs.push(Tlv { tlv_type, value: body.copy_to_bytes(value_len) });
    }

    Ok(Decoded::Frame {
        frame: Frame { service, cid: prefix.cid, message_type, transaction_id, message_id, tlvs },
        consumed: total,
    })
}

/// Incremental reassembler over an inbound byte stream.
///
/// Feed chunks with [`FrameReader::extend`], drain frames with
/// [`FrameReader::next_frame`]. The internal buffer is capped; a peer
/// that streams garbage faster than frames can be produced trips
/// `BufferOverflow` instead of growing without bound.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    /// Cap on buffered-but-unparsed bytes. Comfortably above the largest
    /// possible frame.
    pub const MAX_BUFFERED: usize = 4 * MAX_FRAME_SIZE;

    /// Create an empty reader.
    #[must_use]
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(8192) }
    }

    /// Append inbound bytes.
    ///
    /// # Errors
    ///
    /// `FrameError::BufferOverflow` if the cap would be exceeded.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() > Self::MAX_BUFFERED {
            return Err(FrameError::BufferOverflow {
                buffered: self.buf.len() + bytes.len(),
                cap: Self::MAX_BUFFERED,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Pop the next complete frame, or `None` if the buffer ends
    /// mid-frame.
    ///
    /// # Errors
    ///
    /// Any [`FrameError`] from [`decode_one`]; the stream is broken and
    /// must not be read further.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match decode_one(&self.buf)? {
            Decoded::NeedMore => Ok(None),
            Decoded::Frame { frame, consumed } => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            },
        }
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
