//! Property-based tests for the QMUX codec.
//!
//! Two families: round-trips (decode(encode(m)) == m for all valid
//! frames) and decode totality (arbitrary bytes either need more data,
//! fail cleanly, or yield a frame whose consumed length is consistent).

use proptest::prelude::*;
use qmux_proto::{Decoded, Frame, MessageType, Service, Tlv, decode_one};

fn arb_service() -> impl Strategy<Value = Service> {
    prop_oneof![
        Just(Service::CTL),
        Just(Service::WDS),
        Just(Service::DMS),
        Just(Service::NAS),
        Just(Service::WMS),
        Just(Service::UIM),
        any::<u8>().prop_map(Service),
    ]
}

fn arb_message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::Request),
        Just(MessageType::Response),
        Just(MessageType::Indication),
    ]
}

fn arb_tlv() -> impl Strategy<Value = Tlv> {
    (any::<u8>(), prop::collection::vec(any::<u8>(), 0..64))
        .prop_map(|(ty, value)| Tlv::new(ty, value).expect("small values always fit"))
}

prop_compose! {
    fn arb_frame()(
        service in arb_service(),
        cid in any::<u8>(),
        message_type in arb_message_type(),
        tid in any::<u16>(),
        message_id in any::<u16>(),
        tlvs in prop::collection::vec(arb_tlv(), 0..8),
    ) -> Frame {
        let tid = if service.is_ctl() { tid & 0xFF } else { tid };
        Frame::new(service, cid, message_type, tid, message_id, tlvs)
    }
}

proptest! {
    #[test]
    fn frame_round_trip(frame in arb_frame()) {
        let wire = frame.to_bytes().expect("should encode");
        let Decoded::Frame { frame: parsed, consumed } =
            decode_one(&wire).expect("should decode")
        else {
            panic!("complete frame reported NeedMore");
        };
        prop_assert_eq!(consumed, wire.len());
        prop_assert_eq!(parsed, frame);
    }

    #[test]
    fn decode_is_total_over_random_buffers(buf in prop::collection::vec(any::<u8>(), 0..512)) {
        match decode_one(&buf) {
            Ok(Decoded::NeedMore) | Err(_) => {},
            Ok(Decoded::Frame { frame, consumed }) => {
                // A decoded frame re-encodes to exactly the bytes it
                // consumed, minus the tolerated transport-flags byte.
                let wire = frame.to_bytes().expect("decoded frame re-encodes");
                prop_assert_eq!(wire.len(), consumed);
            },
        }
    }

    #[test]
    fn decode_never_reads_past_declared_frame(frame in arb_frame(), tail in prop::collection::vec(any::<u8>(), 0..64)) {
        let mut wire = frame.to_bytes().expect("should encode");
        let frame_len = wire.len();
        wire.extend_from_slice(&tail);
        let Decoded::Frame { consumed, .. } = decode_one(&wire).expect("should decode") else {
            panic!("complete frame reported NeedMore");
        };
        prop_assert_eq!(consumed, frame_len);
    }
}
