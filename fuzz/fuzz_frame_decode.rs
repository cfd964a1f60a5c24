//! Fuzz target for the frame decoder and payload splitting.
//!
//! Run with: cargo +nightly fuzz run fuzz_frame_decode
//!
//! Decodes frames back to back the way the connection reader does and checks
//! that every decoded frame re-encodes to the bytes it came from.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sigpost_core::codec::split_items;
use sigpost_core::{Frame, Signal};

fuzz_target!(|data: &[u8]| {
    let mut rest = data;
    while let Ok(Some((frame, consumed))) = Frame::decode(rest) {
        assert!(consumed > 0 && consumed <= rest.len());
        if let Frame::Data(env) = &frame {
            let _ = Signal::decode(env.code).category();
            let _ = split_items(&env.payload);
            if let Ok(bytes) = frame.encode() {
                assert_eq!(bytes.as_slice(), &rest[..consumed]);
            }
        }
        rest = &rest[consumed..];
    }
});
