//! Fuzz target for checkpoint decoding and comparison.
//!
//! Arbitrary JSON must decode into a checkpoint without panicking, and
//! identity must be reflexive and symmetric.

#![no_main]

use libfuzzer_sys::fuzz_target;
use storage_replication::Checkpoint;

fuzz_target!(|data: (&[u8], &[u8])| {
    let (a, b) = data;
    let Ok(a) = serde_json::from_slice::<Checkpoint>(a) else {
        return;
    };
    assert!(a.is_identical(&a));
    let _ = a.as_sequence();

    if let Ok(b) = serde_json::from_slice::<Checkpoint>(b) {
        assert_eq!(a.is_identical(&b), b.is_identical(&a));
    }
});
