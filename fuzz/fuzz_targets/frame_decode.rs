//! Fuzz target for QMUX frame decoding
//!
//! # Strategy
//!
//! Arbitrary byte buffers straight through `decode_one`.
//!
//! # Invariants
//!
//! - NEVER panic on malformed input
//! - A decoded frame re-encodes to exactly the bytes it consumed
//! - `NeedMore` is only reported when the buffer ends mid-frame

#![no_main]

use libfuzzer_sys::fuzz_target;
use qmux_proto::{Decoded, decode_one};

fuzz_target!(|data: &[u8]| {
    match decode_one(data) {
        Err(_) | Ok(Decoded::NeedMore) => {},
        Ok(Decoded::Frame { frame, consumed }) => {
            assert!(consumed <= data.len());
            let wire = frame.to_bytes().expect("decoded frame must re-encode");
            assert_eq!(wire.len(), consumed);
        },
    }
});
