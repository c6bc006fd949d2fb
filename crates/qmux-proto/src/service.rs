//! Service identifiers and message roles.

use std::fmt;

/// A QMI service id: the namespace a message's id and TLV schema live in.
///
/// Stored as the raw wire byte. Known services get named constants; an
/// unknown id is still a valid `Service` (the framing layer does not care
/// what it means).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Service(pub u8);

impl Service {
    /// Control service. Allocates and releases client ids, and carries
    /// an 8-bit transaction id on the wire where everything else is 16.
    pub const CTL: Self = Self(0x00);
    /// Wireless data service.
    pub const WDS: Self = Self(0x01);
    /// Device management service.
    pub const DMS: Self = Self(0x02);
    /// Network access service.
    pub const NAS: Self = Self(0x03);
    /// Quality of service.
    pub const QOS: Self = Self(0x04);
    /// Wireless messaging service.
    pub const WMS: Self = Self(0x05);
    /// Position determination service.
    pub const PDS: Self = Self(0x06);
    /// Authentication service.
    pub const AUTH: Self = Self(0x07);
    /// Voice service.
    pub const VOICE: Self = Self(0x09);
    /// User identity module service.
    pub const UIM: Self = Self(0x0B);
    /// Phonebook manager.
    pub const PBM: Self = Self(0x0C);
    /// Location service.
    pub const LOC: Self = Self(0x10);
    /// Specific absorption rate service.
    pub const SAR: Self = Self(0x11);
    /// Wireless data administrative service.
    pub const WDA: Self = Self(0x1A);
    /// Persistent device configuration service.
    pub const PDC: Self = Self(0x24);
    /// Data port mapper service.
    pub const DPM: Self = Self(0x2F);

    /// Whether this is the control service.
    #[must_use]
    pub fn is_ctl(self) -> bool {
        self == Self::CTL
    }

    /// Width in bytes of this service's transaction id on the wire.
    #[must_use]
    pub fn transaction_id_size(self) -> usize {
        if self.is_ctl() { 1 } else { 2 }
    }

    /// Short lowercase name for known services, used in traces.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::CTL => "ctl",
            Self::WDS => "wds",
            Self::DMS => "dms",
            Self::NAS => "nas",
            Self::QOS => "qos",
            Self::WMS => "wms",
            Self::PDS => "pds",
            Self::AUTH => "auth",
            Self::VOICE => "voice",
            Self::UIM => "uim",
            Self::PBM => "pbm",
            Self::LOC => "loc",
            Self::SAR => "sar",
            Self::WDA => "wda",
            Self::PDC => "pdc",
            Self::DPM => "dpm",
            Self(_) => "unknown",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#04x})", self.name(), self.0)
    }
}

impl From<u8> for Service {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

/// Role of a frame, carried in the message-header flags byte.
///
/// Bit 0 distinguishes request (0) from response (1); bit 1 marks an
/// indication. The transport-level flags byte (0x00 host to modem, 0x80
/// modem to host) is descriptive only and is tolerated on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Host-originated request, part of a transaction.
    Request,
    /// Modem reply matching a request's transaction id.
    Response,
    /// Unsolicited frame, not tied to a transaction.
    Indication,
}

impl MessageType {
    /// Decode from the message-header flags byte.
    #[must_use]
    pub fn from_flags(flags: u8) -> Self {
        if flags & 0x02 != 0 {
            Self::Indication
        } else if flags & 0x01 != 0 {
            Self::Response
        } else {
            Self::Request
        }
    }

    /// Encode into the message-header flags byte.
    #[must_use]
    pub fn to_flags(self) -> u8 {
        match self {
            Self::Request => 0x00,
            Self::Response => 0x01,
            Self::Indication => 0x02,
        }
    }

    /// Transport-level flags byte for this role: 0x00 leaving the host,
    /// 0x80 arriving from the modem.
    #[must_use]
    pub fn transport_flags(self) -> u8 {
        match self {
            Self::Request => 0x00,
            Self::Response | Self::Indication => 0x80,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Indication => "indication",
        };
        f.write_str(s)
    }
}
