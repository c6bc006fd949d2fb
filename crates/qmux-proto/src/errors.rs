//! Codec error types.

use thiserror::Error;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, FrameError>;

/// Errors produced while encoding or decoding QMUX frames.
///
/// A distinction matters here: `NeedMore` situations are NOT errors (the
/// decoder reports them through [`crate::Decoded::NeedMore`]); everything
/// in this enum means the byte stream or the caller's input is actually
/// wrong. On a length-prefixed binary stream a malformed frame leaves no
/// safe resync point, so transports treat every variant as fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// First byte of a frame was not the QMUX marker (0x01).
    #[error("invalid frame marker {found:#04x}, expected 0x01")]
    InvalidMarker {
        /// The byte found where the marker should be.
        found: u8,
    },

    /// The frame's declared length is too small to hold the QMUX and
    /// message headers.
    #[error("frame length {declared} too short for headers (need {minimum})")]
    FrameTooShort {
        /// Length declared in the envelope.
        declared: usize,
        /// Minimum length for this service's header layout.
        minimum: usize,
    },

    /// The declared tlv-length disagrees with the bytes actually present.
    ///
    /// Trailing bytes beyond tlv-length are a framing error, as is a TLV
    /// record that runs past the end of the payload.
    #[error("tlv-length mismatch: declared {declared}, payload holds {actual}")]
    TlvLengthMismatch {
        /// tlv-length field from the message header.
        declared: usize,
        /// Bytes actually available for TLVs.
        actual: usize,
    },

    /// A TLV record's declared value length runs past the payload end.
    #[error("tlv {tlv_type:#04x} overruns payload ({declared} bytes declared, {remaining} left)")]
    TlvOverrun {
        /// Type of the offending TLV.
        tlv_type: u8,
        /// Value length the record declared.
        declared: usize,
        /// Bytes remaining in the payload.
        remaining: usize,
    },

    /// Encoded frame would exceed the 16-bit length field.
    #[error("frame too large: {size} bytes exceeds {max}")]
    FrameTooLarge {
        /// Size the frame would need.
        size: usize,
        /// Largest representable frame size.
        max: usize,
    },

    /// A control-service transaction id does not fit in 8 bits.
    #[error("control transaction id {tid:#06x} exceeds 8 bits")]
    CtlTransactionId {
        /// The out-of-range transaction id.
        tid: u16,
    },

    /// A requested TLV was not present in the frame.
    #[error("tlv {tlv_type:#04x} not found")]
    TlvNotFound {
        /// The TLV type requested.
        tlv_type: u8,
    },

    /// A TLV value was shorter than the requested read.
    #[error("tlv {tlv_type:#04x} too short: wanted {expected} bytes, value holds {actual}")]
    TlvTooShort {
        /// The TLV type read.
        tlv_type: u8,
        /// Bytes the read required.
        expected: usize,
        /// Bytes the value holds.
        actual: usize,
    },

    /// A string TLV did not hold valid UTF-8.
    #[error("tlv {tlv_type:#04x} is not valid utf-8")]
    InvalidString {
        /// The TLV type read.
        tlv_type: u8,
    },

    /// Mutation was attempted on a frozen message.
    #[error("message is frozen")]
    Frozen,

    /// A response accessor was used on a frame that is not a response.
    #[error("frame is not a response")]
    NotAResponse,

    /// A response frame is missing its mandatory result TLV.
    #[error("response is missing the result tlv")]
    MissingResult,

    /// The reassembly buffer cap was exceeded without producing a frame.
    #[error("reassembly buffer overflow ({buffered} bytes held, cap {cap})")]
    BufferOverflow {
        /// Bytes currently buffered.
        buffered: usize,
        /// The configured cap.
        cap: usize,
    },
}
