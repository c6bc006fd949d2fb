//! Per-(service, cid) client handles.

use std::time::Duration;

use qmux_proto::{Message, Service};
use tokio::sync::mpsc;

use crate::{device::Device, error::DeviceError};

/// A thin handle scoped to one (service, cid) pair on a shared device.
///
/// All it carries is a device reference and its identity; send/receive
/// is scoped to the pair. Service-specific typed APIs are generated
/// from the service schema and delegate here with the right message
/// ids. Dropping the client detaches its indication subscription; the
/// CID itself is released through [`Device::release_client`].
pub struct Client {
    device: Device,
    service: Service,
    cid: u8,
    subscriber_id: u64,
    indications: mpsc::Receiver<Message>,
}

impl Client {
    pub(crate) fn new(
        device: Device,
        service: Service,
        cid: u8,
        subscriber_id: u64,
        indications: mpsc::Receiver<Message>,
    ) -> Self {
        Self { device, service, cid, subscriber_id, indications }
    }

    /// The service this client is scoped to.
    #[must_use]
    pub fn service(&self) -> Service {
        self.service
    }

    /// The client id this client is scoped to.
    #[must_use]
    pub fn cid(&self) -> u8 {
        self.cid
    }

    /// The device this client talks through.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Start a request scoped to this client's (service, cid).
    #[must_use]
    pub fn request(&self, message_id: u16) -> Message {
        Message::request(self.service, self.cid, message_id)
    }

    /// Send a request and await the matching response.
    ///
    /// The message must be scoped to this client's (service, cid) —
    /// build it with [`Client::request`].
    pub async fn command(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, DeviceError> {
        if message.service() != self.service || message.cid() != self.cid {
            return Err(DeviceError::Unsupported("message is scoped to another client"));
        }
        self.device.command(message, timeout).await
    }

    /// Await the next indication this client is entitled to see.
    ///
    /// Returns `None` once the device has failed or closed.
    pub async fn next_indication(&mut self) -> Option<Message> {
        self.indications.recv().await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.device.deregister_subscriber(self.subscriber_id);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("service", &self.service)
            .field("cid", &self.cid)
            .finish_non_exhaustive()
    }
}
