//! Control-service vocabulary: message ids, TLV layouts, and builders.
//!
//! The control service (service id 0) is the allocator for every other
//! service's client ids. Its message set is small and fixed, so the
//! builders live here rather than going through generated schema code.

use std::path::Path;

use qmux_proto::{FrameError, Message, Service, StringPrefix, Tlv};

use crate::error::DeviceError;

/// CTL "get version info": per-service version list.
pub const MESSAGE_CTL_GET_VERSION_INFO: u16 = 0x0021;
/// CTL "allocate client id".
pub const MESSAGE_CTL_ALLOCATE_CID: u16 = 0x0022;
/// CTL "release client id".
pub const MESSAGE_CTL_RELEASE_CID: u16 = 0x0023;
/// CTL "sync": flushes stale modem state after an open.
pub const MESSAGE_CTL_SYNC: u16 = 0x0027;
/// Proxy-internal open request. Never reaches a modem: the proxy
/// consumes it during the session handshake.
pub const MESSAGE_CTL_INTERNAL_PROXY_OPEN: u16 = 0xFF00;

/// TLV carrying (service) on allocate requests and (service, cid) on
/// allocate responses and release requests.
pub const TLV_CTL_ALLOCATION_INFO: u8 = 0x01;
/// TLV carrying the version list on a version-info response.
pub const TLV_CTL_VERSION_LIST: u8 = 0x01;
/// TLV carrying the device path in the proxy-internal open request.
pub const TLV_PROXY_OPEN_PATH: u8 = 0x01;

/// One entry of the control service's version list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceVersion {
    /// The service the entry describes.
    pub service: Service,
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

/// Build an ALLOCATE_CID request for `service`.
pub fn allocate_cid_request(service: Service) -> Result<Message, FrameError> {
    let mut msg = Message::request(Service::CTL, 0, MESSAGE_CTL_ALLOCATE_CID);
    msg.push_tlv(Tlv::u8(TLV_CTL_ALLOCATION_INFO, service.0)?)?;
    Ok(msg)
}

/// Build a RELEASE_CID request for an owned (service, cid) pair.
pub fn release_cid_request(service: Service, cid: u8) -> Result<Message, FrameError> {
    let mut msg = Message::request(Service::CTL, 0, MESSAGE_CTL_RELEASE_CID);
    msg.push_tlv(Tlv::new(TLV_CTL_ALLOCATION_INFO, vec![service.0, cid])?)?;
    Ok(msg)
}

/// Build a SYNC request.
pub fn sync_request() -> Message {
    Message::request(Service::CTL, 0, MESSAGE_CTL_SYNC)
}

/// Build a GET_VERSION_INFO request.
pub fn version_info_request() -> Message {
    Message::request(Service::CTL, 0, MESSAGE_CTL_GET_VERSION_INFO)
}

/// Build the proxy-internal open request carrying the device path.
///
/// The path bytes go on the wire exactly as given, no NUL terminator.
pub fn internal_proxy_open_request(path: &Path) -> Result<Message, FrameError> {
    let mut msg = Message::request(Service::CTL, 0, MESSAGE_CTL_INTERNAL_PROXY_OPEN);
    let path = path.to_string_lossy();
    msg.push_tlv(Tlv::string(TLV_PROXY_OPEN_PATH, StringPrefix::None, &path)?)?;
    Ok(msg)
}

/// Parse the (service, cid) pair out of an ALLOCATE_CID response.
pub fn parse_allocation_info(response: &Message) -> Result<(Service, u8), FrameError> {
    let tlv = response.tlv_required(TLV_CTL_ALLOCATION_INFO)?;
    let raw = tlv.bytes();
    if raw.len() < 2 {
        return Err(FrameError::TlvTooShort {
            tlv_type: TLV_CTL_ALLOCATION_INFO,
            expected: 2,
            actual: raw.len(),
        });
    }
    Ok((Service(raw[0]), raw[1]))
}

/// Parse the version list out of a GET_VERSION_INFO response.
///
/// Layout: one count byte, then five bytes per entry (service u8,
/// major LE u16, minor LE u16).
pub fn parse_version_list(response: &Message) -> Result<Vec<ServiceVersion>, FrameError> {
    let tlv = response.tlv_required(TLV_CTL_VERSION_LIST)?;
    let raw = tlv.bytes();
    if raw.is_empty() {
        return Err(FrameError::TlvTooShort {
            tlv_type: TLV_CTL_VERSION_LIST,
            expected: 1,
            actual: 0,
        });
    }
    let count = usize::from(raw[0]);
    let need = 1 + count * 5;
    if raw.len() < need {
        return Err(FrameError::TlvTooShort {
            tlv_type: TLV_CTL_VERSION_LIST,
            expected: need,
            actual: raw.len(),
        });
    }
    let mut versions = Vec::with_capacity(count);
    for entry in raw[1..need].chunks_exact(5) {
        versions.push(ServiceVersion {
            service: Service(entry[0]),
            major: u16::from_le_bytes([entry[1], entry[2]]),
            minor: u16::from_le_bytes([entry[3], entry[4]]),
        });
    }
    Ok(versions)
}

/// Check a response's result TLV, mapping a non-zero status to
/// [`DeviceError::Protocol`].
pub fn check_result(response: &Message) -> Result<(), DeviceError> {
    response.result()?.map_err(DeviceError::Protocol)
}
