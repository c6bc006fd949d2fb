//! Fuzz target for the incremental frame reader
//!
//! # Strategy
//!
//! Arbitrary byte streams delivered in arbitrary chunk sizes through
//! `FrameReader`.
//!
//! # Invariants
//!
//! - NEVER panic regardless of chunking
//! - Chunking does not change the outcome: the reader produces the
//!   same frames as whole-buffer decoding until the first error

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use qmux_proto::{Decoded, Frame, FrameReader, decode_one};

#[derive(Debug, Arbitrary)]
struct Stream {
    data: Vec<u8>,
    chunk: u8,
}

fn reference_frames(mut data: &[u8]) -> (Vec<Frame>, bool) {
    let mut frames = Vec::new();
    loop {
        match decode_one(data) {
            Ok(Decoded::Frame { frame, consumed }) => {
                frames.push(frame);
                data = &data[consumed..];
            },
            Ok(Decoded::NeedMore) => return (frames, false),
            Err(_) => return (frames, true),
        }
    }
}

fuzz_target!(|stream: Stream| {
    let chunk_size = usize::from(stream.chunk.max(1));
    let (expected, expect_error) = reference_frames(&stream.data);

    let mut reader = FrameReader::new();
    let mut seen = Vec::new();
    let mut errored = false;

    'feed: for chunk in stream.data.chunks(chunk_size) {
        if reader.extend(chunk).is_err() {
            // Buffer cap tripped; whole-buffer decoding has no
            // equivalent, so there is nothing to compare.
            return;
        }
        loop {
            match reader.next_frame() {
                Ok(Some(frame)) => seen.push(frame),
                Ok(None) => break,
                Err(_) => {
                    errored = true;
                    break 'feed;
                },
            }
        }
    }

    assert_eq!(seen, expected);
    assert_eq!(errored, expect_error);
});
