//! The Message object: a frame plus an O(1) TLV index and freeze
//! semantics.
//!
//! A message is mutable only between construction and send. The device
//! layer freezes it when the transaction id is stamped; received frames
//! arrive frozen. Mutation of a frozen message fails with
//! [`FrameError::Frozen`] rather than silently diverging from what went
//! on the wire.

use std::collections::HashMap;
use std::fmt;

use bytes::BufMut;

use crate::{
    MessageType, Service,
    errors::{FrameError, Result},
    frame::Frame,
    tlv::Tlv,
};

/// TLV type of the mandatory result record in responses.
pub(crate) const TLV_RESULT: u8 = 0x02;

/// Outcome carried by a response's result TLV.
pub type QmiResult = std::result::Result<(), QmiProtocolError>;

/// A decoded or in-construction frame with indexed TLV access.
#[derive(Debug, Clone)]
pub struct Message {
    frame: Frame,
    /// First occurrence of each TLV type, for O(1) lookup. Duplicates
    /// remain reachable through iteration.
    index: HashMap<u8, usize>,
    frozen: bool,
}

impl Message {
    /// Start building a request. The transaction id is assigned by the
    /// device on send; until then it reads as zero.
    #[must_use]
    pub fn request(service: Service, cid: u8, message_id: u16) -> Self {
        Self::unfrozen(Frame::new(service, cid, MessageType::Request, 0, message_id, Vec::new()))
    }

    /// Build a response frame. Used by the proxy when answering its
    /// internal handshake, and by tests standing in for a modem.
    #[must_use]
    pub fn response(service: Service, cid: u8, transaction_id: u16, message_id: u16) -> Self {
        Self::unfrozen(Frame::new(
            service,
            cid,
            MessageType::Response,
            transaction_id,
            message_id,
            Vec::new(),
        ))
    }

    /// Build an indication frame.
    #[must_use]
    pub fn indication(service: Service, cid: u8, message_id: u16) -> Self {
        Self::unfrozen(Frame::new(service, cid, MessageType::Indication, 0, message_id, Vec::new()))
    }

    fn unfrozen(frame: Frame) -> Self {
        Self { frame, index: HashMap::new(), frozen: false }
    }

    /// Wrap a decoded frame. Received messages are always frozen.
    #[must_use]
    pub fn from_frame(frame: Frame) -> Self {
        let mut index = HashMap::new();
        for (pos, tlv) in frame.tlvs().enumerate() {
            index.entry(tlv.tlv_type).or_insert(pos);
        }
        Self { frame, index, frozen: true }
    }

    /// Append a TLV.
    ///
    /// # Errors
    ///
    /// `FrameError::Frozen` once the message has been sent or was
    /// received off the wire.
    pub fn push_tlv(&mut self, tlv: Tlv) -> Result<()> {
        if self.frozen {
            return Err(FrameError::Frozen);
        }
        self.index.entry(tlv.tlv_type).or_insert(self.frame.tlv_count());
        self.frame.push_tlv(tlv);
        Ok(())
    }

    /// Stamp the transaction id. Device-side, on send.
    ///
    /// # Errors
    ///
    /// `FrameError::Frozen` if the message was already sent.
    pub fn set_transaction_id(&mut self, transaction_id: u16) -> Result<()> {
        if self.frozen {
            return Err(FrameError::Frozen);
        }
        self.frame.transaction_id = transaction_id;
        Ok(())
    }

    /// Freeze the message. Further mutation fails.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether the message is frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Service namespace.
    #[must_use]
    pub fn service(&self) -> Service {
        self.frame.service
    }

    /// Client id.
    #[must_use]
    pub fn cid(&self) -> u8 {
        self.frame.cid
    }

    /// Transaction id (zero until stamped on a request).
    #[must_use]
    pub fn transaction_id(&self) -> u16 {
        self.frame.transaction_id
    }

    /// Message id within the service namespace.
    #[must_use]
    pub fn message_id(&self) -> u16 {
        self.frame.message_id
    }

    /// Frame role.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.frame.message_type
    }

    /// Whether this is a request.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.frame.message_type == MessageType::Request
    }

    /// Whether this is a response.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.frame.message_type == MessageType::Response
    }

    /// Whether this is an indication.
    #[must_use]
    pub fn is_indication(&self) -> bool {
        self.frame.message_type == MessageType::Indication
    }

    /// First TLV of the given type, via the index.
    #[must_use]
    pub fn tlv(&self, tlv_type: u8) -> Option<&Tlv> {
        self.index.get(&tlv_type).and_then(|&pos| self.frame.tlvs().nth(pos))
    }

    /// First TLV of the given type, or `TlvNotFound`.
    pub fn tlv_required(&self, tlv_type: u8) -> Result<&Tlv> {
        self.tlv(tlv_type).ok_or(FrameError::TlvNotFound { tlv_type })
    }

    /// All TLVs in wire order, duplicates included.
    pub fn tlvs(&self) -> impl Iterator<Item = &Tlv> {
        self.frame.tlvs()
    }

    /// Parse the mandatory result TLV of a response.
    ///
    /// # Errors
    ///
    /// - `FrameError::NotAResponse` on requests and indications;
    /// - `FrameError::MissingResult` if the result TLV is absent;
    /// - TLV read errors if it is shorter than four bytes.
    pub fn result(&self) -> Result<QmiResult> {
        if !self.is_response() {
            return Err(FrameError::NotAResponse);
        }
        let tlv = self.tlv(TLV_RESULT).ok_or(FrameError::MissingResult)?;
        let raw = tlv.bytes();
        if raw.len() < 4 {
            return Err(FrameError::TlvTooShort {
                tlv_type: TLV_RESULT,
                expected: 4,
                actual: raw.len(),
            });
        }
        let status = u16::from_le_bytes([raw[0], raw[1]]);
        let code = u16::from_le_bytes([raw[2], raw[3]]);
        if status == 0 {
            Ok(Ok(()))
        } else {
            Ok(Err(QmiProtocolError::from_code(code)))
        }
    }

    /// Borrow the underlying frame.
    #[must_use]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Consume the message, returning the frame.
    #[must_use]
    pub fn into_frame(self) -> Frame {
        self.frame
    }

    /// Encode into a buffer. See [`Frame::encode`] for the errors.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        self.frame.encode(dst)
    }

    /// Encode into a fresh byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.frame.to_bytes()
    }
}

/// Append a success result TLV (status 0, code 0) to a response under
/// construction.
pub(crate) fn success_result() -> Tlv {
    // INVARIANT: a four-byte value always fits the TLV length field.
    #[allow(clippy::unwrap_used)]
    Tlv::new(TLV_RESULT, vec![0, 0, 0, 0]).unwrap()
}

/// Protocol error enumerants carried in a non-zero result TLV.
///
/// The modem reports these; they are returned to the caller and are
/// never fatal to the device. The table covers the enumerants the
/// deployed firmwares actually emit; anything else is preserved
/// verbatim in `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QmiProtocolError {
    /// Message was malformed.
    MalformedMessage,
    /// The modem is out of memory.
    NoMemory,
    /// Internal firmware error.
    Internal,
    /// Operation aborted.
    Aborted,
    /// No client ids left in the service's namespace.
    ClientIdsExhausted,
    /// Transaction cannot be aborted.
    UnabortableTransaction,
    /// The client id is not allocated.
    InvalidClientId,
    /// No thresholds were provided.
    NoThresholdsProvided,
    /// Handle is not valid.
    InvalidHandle,
    /// Profile index is not valid.
    InvalidProfile,
    /// PIN id is not valid.
    InvalidPinId,
    /// PIN was incorrect.
    IncorrectPin,
    /// No network was found.
    NoNetworkFound,
    /// Call setup failed.
    CallFailed,
    /// Not in a call.
    OutOfCall,
    /// Device is not provisioned.
    NotProvisioned,
    /// A mandatory argument was missing.
    MissingArgument,
    /// An argument exceeded its maximum length.
    ArgumentTooLong,
    /// Transaction id is not valid.
    InvalidTransactionId,
    /// Device is already in use.
    DeviceInUse,
    /// Operation unsupported by the network.
    NetworkUnsupported,
    /// Operation unsupported by the device.
    DeviceUnsupported,
    /// Request had no effect.
    NoEffect,
    /// No free profile slot.
    NoFreeProfile,
    /// PDP type is not valid.
    InvalidPdpType,
    /// Technology preference is not valid.
    InvalidTechnologyPreference,
    /// Authentication failed.
    AuthenticationFailed,
    /// PIN is blocked.
    PinBlocked,
    /// PIN is permanently blocked.
    PinAlwaysBlocked,
    /// UIM is not initialized.
    UimUninitialized,
    /// Encoding failed.
    EncodingFailed,
    /// Information is not available.
    InformationUnavailable,
    /// Session is not active.
    SessionInactive,
    /// Session is not valid.
    SessionInvalid,
    /// Session belongs to another client.
    SessionOwnership,
    /// Insufficient resources on the modem.
    InsufficientResources,
    /// Functionality is disabled.
    Disabled,
    /// Operation is not valid in the current state.
    InvalidOperation,
    /// Command id is not recognized by the service.
    InvalidQmiCommand,
    /// Access denied.
    AccessDenied,
    /// Restricted by hardware.
    HardwareRestricted,
    /// An enumerant this table does not name.
    Unknown(u16),
}

impl QmiProtocolError {
    /// Map a result-TLV code to an enumerant.
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::MalformedMessage,
            2 => Self::NoMemory,
            3 => Self::Internal,
            4 => Self::Aborted,
            5 => Self::ClientIdsExhausted,
            6 => Self::UnabortableTransaction,
            7 => Self::InvalidClientId,
            8 => Self::NoThresholdsProvided,
            9 => Self::InvalidHandle,
            10 => Self::InvalidProfile,
            11 => Self::InvalidPinId,
            12 => Self::IncorrectPin,
            13 => Self::NoNetworkFound,
            14 => Self::CallFailed,
            15 => Self::OutOfCall,
            16 => Self::NotProvisioned,
            17 => Self::MissingArgument,
            19 => Self::ArgumentTooLong,
            22 => Self::InvalidTransactionId,
            23 => Self::DeviceInUse,
            24 => Self::NetworkUnsupported,
            25 => Self::DeviceUnsupported,
            26 => Self::NoEffect,
            27 => Self::NoFreeProfile,
            28 => Self::InvalidPdpType,
            29 => Self::InvalidTechnologyPreference,
            34 => Self::AuthenticationFailed,
            35 => Self::PinBlocked,
            36 => Self::PinAlwaysBlocked,
            37 => Self::UimUninitialized,
            58 => Self::EncodingFailed,
            74 => Self::InformationUnavailable,
            75 => Self::SessionInactive,
            76 => Self::SessionInvalid,
            77 => Self::SessionOwnership,
            78 => Self::InsufficientResources,
            79 => Self::Disabled,
            80 => Self::InvalidOperation,
            81 => Self::InvalidQmiCommand,
            93 => Self::AccessDenied,
            94 => Self::HardwareRestricted,
            other => Self::Unknown(other),
        }
    }

    /// The wire code for this enumerant.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::MalformedMessage => 1,
            Self::NoMemory => 2,
            Self::Internal => 3,
            Self::Aborted => 4,
            Self::ClientIdsExhausted => 5,
            Self::UnabortableTransaction => 6,
            Self::InvalidClientId => 7,
            Self::NoThresholdsProvided => 8,
            Self::InvalidHandle => 9,
            Self::InvalidProfile => 10,
            Self::InvalidPinId => 11,
            Self::IncorrectPin => 12,
            Self::NoNetworkFound => 13,
            Self::CallFailed => 14,
            Self::OutOfCall => 15,
            Self::NotProvisioned => 16,
            Self::MissingArgument => 17,
            Self::ArgumentTooLong => 19,
            Self::InvalidTransactionId => 22,
            Self::DeviceInUse => 23,
            Self::NetworkUnsupported => 24,
            Self::DeviceUnsupported => 25,
            Self::NoEffect => 26,
            Self::NoFreeProfile => 27,
            Self::InvalidPdpType => 28,
            Self::InvalidTechnologyPreference => 29,
            Self::AuthenticationFailed => 34,
            Self::PinBlocked => 35,
            Self::PinAlwaysBlocked => 36,
            Self::UimUninitialized => 37,
            Self::EncodingFailed => 58,
            Self::InformationUnavailable => 74,
            Self::SessionInactive => 75,
            Self::SessionInvalid => 76,
            Self::SessionOwnership => 77,
            Self::InsufficientResources => 78,
            Self::Disabled => 79,
            Self::InvalidOperation => 80,
            Self::InvalidQmiCommand => 81,
            Self::AccessDenied => 93,
            Self::HardwareRestricted => 94,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for QmiProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown protocol error {code}"),
            known => {
                let name = match known {
                    Self::MalformedMessage => "malformed message",
                    Self::NoMemory => "no memory",
                    Self::Internal => "internal",
                    Self::Aborted => "aborted",
                    Self::ClientIdsExhausted => "client ids exhausted",
                    Self::UnabortableTransaction => "unabortable transaction",
                    Self::InvalidClientId => "invalid client id",
                    Self::NoThresholdsProvided => "no thresholds provided",
                    Self::InvalidHandle => "invalid handle",
                    Self::InvalidProfile => "invalid profile",
                    Self::InvalidPinId => "invalid pin id",
                    Self::IncorrectPin => "incorrect pin",
                    Self::NoNetworkFound => "no network found",
                    Self::CallFailed => "call failed",
                    Self::OutOfCall => "out of call",
                    Self::NotProvisioned => "not provisioned",
                    Self::MissingArgument => "missing argument",
                    Self::ArgumentTooLong => "argument too long",
                    Self::InvalidTransactionId => "invalid transaction id",
                    Self::DeviceInUse => "device in use",
                    Self::NetworkUnsupported => "network unsupported",
                    Self::DeviceUnsupported => "device unsupported",
                    Self::NoEffect => "no effect",
                    Self::NoFreeProfile => "no free profile",
                    Self::InvalidPdpType => "invalid pdp type",
                    Self::InvalidTechnologyPreference => "invalid technology preference",
                    Self::AuthenticationFailed => "authentication failed",
                    Self::PinBlocked => "pin blocked",
                    Self::PinAlwaysBlocked => "pin always blocked",
                    Self::UimUninitialized => "uim uninitialized",
                    Self::EncodingFailed => "encoding failed",
                    Self::InformationUnavailable => "information unavailable",
                    Self::SessionInactive => "session inactive",
                    Self::SessionInvalid => "session invalid",
                    Self::SessionOwnership => "session ownership",
                    Self::InsufficientResources => "insufficient resources",
                    Self::Disabled => "disabled",
                    Self::InvalidOperation => "invalid operation",
                    Self::InvalidQmiCommand => "invalid qmi command",
                    Self::AccessDenied => "access denied",
                    Self::HardwareRestricted => "hardware restricted",
                    Self::Unknown(_) => "unknown",
                };
                f.write_str(name)
            },
        }
    }
}

/// Build a result TLV for an error response. Proxy-side: the handshake
/// failure path needs to report a concrete enumerant.
pub(crate) fn error_result(error: QmiProtocolError) -> Tlv {
    let mut value = Vec::with_capacity(4);
    value.put_u16_le(1);
    value.put_u16_le(error.code());
    // INVARIANT: a four-byte value always fits the TLV length field.
    #[allow(clippy::unwrap_used)]
    Tlv::new(TLV_RESULT, value).unwrap()
}

impl Message {
    /// Append a success result TLV (status 0, code 0). Responses built
    /// locally (proxy handshake replies, test modems) use this.
    pub fn push_success_result(&mut self) -> Result<()> {
        self.push_tlv(success_result())
    }

    /// Append an error result TLV with the given enumerant.
    pub fn push_error_result(&mut self, error: QmiProtocolError) -> Result<()> {
        self.push_tlv(error_result(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_one;
    use crate::frame::Decoded;

    #[test]
    fn request_is_mutable_until_frozen() {
        let mut msg = Message::request(Service::DMS, 0x01, 0x0025);
        msg.push_tlv(Tlv::u8(0x01, 0xAA).unwrap()).unwrap();
        msg.set_transaction_id(42).unwrap();
        msg.freeze();

        assert_eq!(msg.push_tlv(Tlv::u8(0x02, 0).unwrap()), Err(FrameError::Frozen));
        assert_eq!(msg.set_transaction_id(43), Err(FrameError::Frozen));
        assert_eq!(msg.transaction_id(), 42);
    }

    #[test]
    fn received_messages_are_frozen() {
        let wire = Message::request(Service::DMS, 0x01, 0x0025).to_bytes().unwrap();
        let Ok(Decoded::Frame { frame, .. }) = decode_one(&wire) else {
            panic!("expected a complete frame");
        };
        let mut msg = Message::from_frame(frame);
        assert!(msg.is_frozen());
        assert_eq!(msg.push_tlv(Tlv::u8(0x01, 0).unwrap()), Err(FrameError::Frozen));
    }

    #[test]
    fn result_parses_success_and_error() {
        let mut ok = Message::response(Service::CTL, 0, 1, 0x0022);
        ok.push_success_result().unwrap();
        assert_eq!(ok.result().unwrap(), Ok(()));

        let mut err = Message::response(Service::CTL, 0, 1, 0x0022);
        err.push_error_result(QmiProtocolError::ClientIdsExhausted).unwrap();
        assert_eq!(err.result().unwrap(), Err(QmiProtocolError::ClientIdsExhausted));
    }

    #[test]
    fn result_requires_a_response() {
        let msg = Message::request(Service::CTL, 0, 0x0022);
        assert_eq!(msg.result(), Err(FrameError::NotAResponse));

        let resp = Message::response(Service::CTL, 0, 1, 0x0022);
        assert_eq!(resp.result(), Err(FrameError::MissingResult));
    }

    #[test]
    fn unknown_enumerants_round_trip() {
        let e = QmiProtocolError::from_code(0x7777);
        assert_eq!(e, QmiProtocolError::Unknown(0x7777));
        assert_eq!(e.code(), 0x7777);
    }

    #[test]
    fn index_points_at_first_duplicate() {
        let mut msg = Message::request(Service::NAS, 1, 0x0042);
        msg.push_tlv(Tlv::u8(0x10, 0xAA).unwrap()).unwrap();
        msg.push_tlv(Tlv::u8(0x10, 0xBB).unwrap()).unwrap();
        assert_eq!(msg.tlv(0x10).unwrap().read_u8().unwrap(), 0xAA);
        assert_eq!(msg.tlvs().count(), 2);
    }
}
