//! Fuzz target for revision token parsing.
//!
//! Parsing must never panic, and anything that parses must parse back to
//! the same revision from its Display form.

#![no_main]

use libfuzzer_sys::fuzz_target;
use storage_replication::Revision;

fuzz_target!(|data: &str| {
    if let Ok(rev) = data.parse::<Revision>() {
        assert!(rev.height() >= 1);
        assert!(!rev.hash().is_empty());
        assert_eq!(rev.to_string().parse::<Revision>(), Ok(rev));
    }
});
