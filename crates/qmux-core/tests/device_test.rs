//! Device integration tests against an in-memory modem.
//!
//! The fake modem sits on the far side of a `tokio::io::duplex` pipe,
//! decodes frames with the real codec, and answers through a
//! test-provided handler. An injection channel lets tests push raw
//! bytes (indications, garbage) without a triggering request.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use qmux_proto::{
    BROADCAST_CID, FrameReader, Message, QmiProtocolError, Service, Tlv,
};
use qmux_core::ctl::{
    MESSAGE_CTL_ALLOCATE_CID, MESSAGE_CTL_RELEASE_CID, TLV_CTL_ALLOCATION_INFO,
};
use qmux_core::{
    CidAllocation, Device, DeviceError, OpenFlags, ReleaseFlags, StreamTransport, Transport,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

type Handler = Box<dyn FnMut(Message) -> Vec<Message> + Send>;

/// Spawn a fake modem; returns the device-side transport and a channel
/// for injecting raw bytes from the modem side.
fn fake_modem(mut handler: Handler) -> (Box<dyn Transport>, mpsc::Sender<Vec<u8>>) {
    let (device_side, modem_side) = tokio::io::duplex(65536);
    let (inject_tx, mut inject_rx) = mpsc::channel::<Vec<u8>>(16);

    tokio::spawn(async move {
        let mut stream = modem_side;
        let mut reader = FrameReader::new();
        let mut buf = BytesMut::new();
        loop {
            tokio::select! {
                injected = inject_rx.recv() => {
                    let Some(bytes) = injected else { break };
                    if stream.write_all(&bytes).await.is_err() {
                        break;
                    }
                },
                read = stream.read_buf(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {},
                    }
                    let chunk = buf.split();
                    if reader.extend(&chunk).is_err() {
                        break;
                    }
                    loop {
                        match reader.next_frame() {
                            Ok(Some(frame)) => {
                                for reply in handler(Message::from_frame(frame)) {
                                    let bytes = reply.to_bytes().unwrap();
                                    if stream.write_all(&bytes).await.is_err() {
                                        return;
                                    }
                                }
                            },
                            Ok(None) => break,
                            Err(_) => return,
                        }
                    }
                },
            }
        }
    });

    (Box::new(StreamTransport::new(device_side)), inject_tx)
}

/// Modem handler that grants ALLOCATE_CID with a fixed cid and accepts
/// RELEASE_CID.
fn ctl_handler(granted_cid: u8) -> Handler {
    Box::new(move |request: Message| {
        let mut response = Message::response(
            request.service(),
            request.cid(),
            request.transaction_id(),
            request.message_id(),
        );
        response.push_success_result().unwrap();
        if request.message_id() == MESSAGE_CTL_ALLOCATE_CID {
            let service = request.tlv(TLV_CTL_ALLOCATION_INFO).unwrap().read_u8().unwrap();
            response
                .push_tlv(Tlv::new(TLV_CTL_ALLOCATION_INFO, vec![service, granted_cid]).unwrap())
                .unwrap();
        }
        vec![response]
    })
}

fn indication(service: Service, cid: u8, message_id: u16) -> Vec<u8> {
    Message::indication(service, cid, message_id).to_bytes().unwrap()
}

#[tokio::test]
async fn allocate_and_release_cid() {
    let (transport, _inject) = fake_modem(ctl_handler(1));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    let client =
        device.allocate_client(Service::DMS, CidAllocation::Automatic, TIMEOUT).await.unwrap();
    assert_eq!(client.service(), Service::DMS);
    assert_eq!(client.cid(), 1);

    device.release_client(client, ReleaseFlags::NONE, TIMEOUT).await.unwrap();
    assert!(device.is_open());
}

#[tokio::test]
async fn no_release_flag_skips_the_wire() {
    let releases = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&releases);
    let (transport, _inject) = fake_modem(Box::new(move |request: Message| {
        if request.message_id() == MESSAGE_CTL_RELEASE_CID {
            *counter.lock().unwrap() += 1;
        }
        ctl_handler(7)(request)
    }));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    let client =
        device.allocate_client(Service::NAS, CidAllocation::Automatic, TIMEOUT).await.unwrap();
    device.release_client(client, ReleaseFlags::NO_RELEASE_CID, TIMEOUT).await.unwrap();

    // Give the pipe a beat: nothing should have been sent.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*releases.lock().unwrap(), 0);
}

#[tokio::test]
async fn reclaim_skips_allocation_entirely() {
    let (transport, _inject) = fake_modem(Box::new(|_| Vec::new()));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    // No wire traffic: the handler never answers, yet reclaim returns.
    let client =
        device.allocate_client(Service::DMS, CidAllocation::Reclaim(3), TIMEOUT).await.unwrap();
    assert_eq!(client.cid(), 3);
}

#[tokio::test]
async fn concurrent_commands_match_out_of_order_responses() {
    const N: usize = 8;

    // Buffer all requests, then answer them in reverse order, each
    // response echoing the request's payload TLV.
    let pending: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let buffered = Arc::clone(&pending);
    let (transport, _inject) = fake_modem(Box::new(move |request: Message| {
        let mut held = buffered.lock().unwrap();
        held.push(request);
        if held.len() < N {
            return Vec::new();
        }
        held.drain(..)
            .rev()
            .map(|req| {
                let mut response = Message::response(
                    req.service(),
                    req.cid(),
                    req.transaction_id(),
                    req.message_id(),
                );
                response.push_success_result().unwrap();
                response.push_tlv(req.tlv(0x10).unwrap().clone()).unwrap();
                response
            })
            .collect()
    }));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    let mut tasks = Vec::new();
    for i in 0..N {
        let device = device.clone();
        tasks.push(tokio::spawn(async move {
            let mut request = Message::request(Service::DMS, 1, 0x0040);
            request.push_tlv(Tlv::u8(0x10, i as u8).unwrap()).unwrap();
            let response = device.command(request, TIMEOUT).await.unwrap();
            (i as u8, response.tlv(0x10).unwrap().read_u8().unwrap())
        }));
    }

    for task in tasks {
        let (sent, echoed) = task.await.unwrap();
        assert_eq!(sent, echoed, "caller received someone else's response");
    }
}

#[tokio::test]
async fn protocol_errors_are_returned_not_fatal() {
    let (transport, _inject) = fake_modem(Box::new(|request: Message| {
        let mut response = Message::response(
            request.service(),
            request.cid(),
            request.transaction_id(),
            request.message_id(),
        );
        response.push_error_result(QmiProtocolError::InvalidClientId).unwrap();
        vec![response]
    }));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    let response = device.command(Message::request(Service::DMS, 9, 0x0025), TIMEOUT).await.unwrap();
    assert_eq!(response.result().unwrap(), Err(QmiProtocolError::InvalidClientId));

    // The device is untouched by a protocol error.
    assert!(device.is_open());
}

#[tokio::test]
async fn timeout_is_per_command() {
    let silent = Arc::new(Mutex::new(true));
    let gate = Arc::clone(&silent);
    let (transport, _inject) = fake_modem(Box::new(move |request: Message| {
        if *gate.lock().unwrap() {
            return Vec::new();
        }
        let mut response = Message::response(
            request.service(),
            request.cid(),
            request.transaction_id(),
            request.message_id(),
        );
        response.push_success_result().unwrap();
        vec![response]
    }));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    let result = device
        .command(Message::request(Service::DMS, 1, 0x0025), Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(DeviceError::Timeout)));

    // A later command on the same device succeeds.
    *silent.lock().unwrap() = false;
    device.command(Message::request(Service::DMS, 1, 0x0025), TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn cancellation_prunes_the_transaction() {
    let (transport, _inject) = fake_modem(Box::new(|_| Vec::new()));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    {
        let command = device.command(Message::request(Service::DMS, 1, 0x0025), TIMEOUT);
        tokio::select! {
            _ = command => panic!("silent modem cannot have answered"),
            () = tokio::time::sleep(Duration::from_millis(50)) => {},
        }
        // command dropped here: transaction withdrawn
    }

    // The tid is free again; a second command gets a fresh slot and the
    // device stays healthy.
    let result = device
        .command(Message::request(Service::DMS, 1, 0x0025), Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(DeviceError::Timeout)));
    assert!(device.is_open());
}

#[tokio::test]
async fn indication_fanout_by_cid_and_broadcast() {
    let (transport, inject) = fake_modem(Box::new(|_| Vec::new()));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    let mut client1 =
        device.allocate_client(Service::DMS, CidAllocation::Reclaim(1), TIMEOUT).await.unwrap();
    let mut client2 =
        device.allocate_client(Service::DMS, CidAllocation::Reclaim(2), TIMEOUT).await.unwrap();

    // Targeted at cid 2: only client2 sees it.
    inject.send(indication(Service::DMS, 2, 0x0100)).await.unwrap();
    let seen = client2.next_indication().await.unwrap();
    assert_eq!(seen.cid(), 2);
    assert_eq!(seen.message_id(), 0x0100);

    // Broadcast: both see exactly one copy.
    inject.send(indication(Service::DMS, BROADCAST_CID, 0x0101)).await.unwrap();
    assert_eq!(client1.next_indication().await.unwrap().message_id(), 0x0101);
    assert_eq!(client2.next_indication().await.unwrap().message_id(), 0x0101);

    // client1 never saw the cid-2 indication.
    tokio::select! {
        extra = client1.next_indication() => {
            panic!("client1 received an indication it does not own: {extra:?}");
        },
        () = tokio::time::sleep(Duration::from_millis(50)) => {},
    }
}

#[tokio::test]
async fn broadcast_subscriber_sees_every_cid() {
    let (transport, inject) = fake_modem(Box::new(|_| Vec::new()));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    let mut watcher = device
        .allocate_client(Service::NAS, CidAllocation::Reclaim(BROADCAST_CID), TIMEOUT)
        .await
        .unwrap();

    inject.send(indication(Service::NAS, 5, 0x0200)).await.unwrap();
    assert_eq!(watcher.next_indication().await.unwrap().cid(), 5);

    // A different service never reaches it.
    inject.send(indication(Service::WDS, 5, 0x0201)).await.unwrap();
    tokio::select! {
        extra = watcher.next_indication() => {
            panic!("cross-service indication delivered: {extra:?}");
        },
        () = tokio::time::sleep(Duration::from_millis(50)) => {},
    }
}

#[tokio::test]
async fn framing_garbage_is_fatal() {
    let (transport, inject) = fake_modem(Box::new(|_| Vec::new()));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    // One command in flight when the stream breaks.
    let device_for_command = device.clone();
    let in_flight = tokio::spawn(async move {
        device_for_command.command(Message::request(Service::DMS, 1, 0x0025), TIMEOUT).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // First byte 0x02: not a QMUX marker, stream declared broken.
    inject.send(vec![0x02, 0x00, 0x00]).await.unwrap();

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(DeviceError::Framing(_))), "got {result:?}");

    // Closed is terminal: every further operation is WrongState.
    assert!(!device.is_open());
    let result = device.command(Message::request(Service::DMS, 1, 0x0025), TIMEOUT).await;
    assert!(matches!(result, Err(DeviceError::WrongState(_))), "got {result:?}");
}

#[tokio::test]
async fn transport_eof_fails_pending_commands() {
    let (transport, inject) = fake_modem(Box::new(|_| Vec::new()));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    let device_for_command = device.clone();
    let in_flight = tokio::spawn(async move {
        device_for_command.command(Message::request(Service::DMS, 1, 0x0025), TIMEOUT).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Dropping the injector closes the modem side of the pipe.
    drop(inject);

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(DeviceError::TransportLost(_))), "got {result:?}");
    assert!(!device.is_open());
}

#[tokio::test]
async fn close_refuses_new_commands_and_is_terminal() {
    let (transport, _inject) = fake_modem(ctl_handler(1));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    device.close(TIMEOUT).await.unwrap();

    let result = device.command(Message::request(Service::DMS, 1, 0x0025), TIMEOUT).await;
    assert!(matches!(result, Err(DeviceError::WrongState(_))));

    let again = device.close(TIMEOUT).await;
    assert!(matches!(again, Err(DeviceError::WrongState(_))));
}

#[tokio::test]
async fn close_fails_survivors_after_the_drain_deadline() {
    let (transport, _inject) = fake_modem(Box::new(|_| Vec::new()));
    let device = Device::from_transport("/dev/cdc-wdm0", transport);

    let device_for_command = device.clone();
    let in_flight = tokio::spawn(async move {
        device_for_command.command(Message::request(Service::DMS, 1, 0x0025), TIMEOUT).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    device.close(Duration::from_millis(100)).await.unwrap();

    let result = in_flight.await.unwrap();
    assert!(matches!(result, Err(DeviceError::Cancelled)), "got {result:?}");
}

/// Transport whose writes never complete: every queued frame stays
/// queued.
struct StallTransport;

#[async_trait::async_trait]
impl Transport for StallTransport {
    async fn send(&mut self, _bytes: &[u8]) -> std::io::Result<()> {
        std::future::pending().await
    }

    async fn recv(&mut self, _buf: &mut BytesMut) -> std::io::Result<usize> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn full_outbound_queue_fails_with_backpressure() {
    let device = Device::from_transport("/dev/stalled", Box::new(StallTransport));

    // Saturate the bounded queue (one frame may be parked inside the
    // stalled writer itself).
    let mut parked = Vec::new();
    for _ in 0..64 {
        let device = device.clone();
        parked.push(tokio::spawn(async move {
            device.command(Message::request(Service::DMS, 1, 0x0025), TIMEOUT).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = device.command(Message::request(Service::DMS, 1, 0x0025), TIMEOUT).await;
    assert!(matches!(result, Err(DeviceError::Backpressure)), "got {result:?}");

    for task in parked {
        task.abort();
    }
}

#[tokio::test]
async fn open_flags_compose() {
    let flags = OpenFlags::PROXY | OpenFlags::SYNC;
    assert!(flags.contains(OpenFlags::PROXY));
    assert!(flags.contains(OpenFlags::SYNC));
    assert!(!flags.contains(OpenFlags::VERSION_INFO));
}
