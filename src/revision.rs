//! Revision tokens and write clocks.
//!
//! A revision is `"<height>-<hash>"`. The height strictly increases on every
//! write to a key; the hash is the configured [`HashFunction`] applied to the
//! document's canonical bytes (plus a random salt for pure inserts, so two
//! stores inserting the same content still get distinct tokens).
//!
//! ```text
//! 1-9f86d08188…   insert
//! 2-60303ae22b…   update (previous height + 1)
//! ```

use crate::document::Document;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hash function applied to canonical document bytes.
pub type HashFunction = Arc<dyn Fn(&[u8]) -> String + Send + Sync>;

/// SHA-256, hex encoded.
pub fn default_hash_function() -> HashFunction {
    Arc::new(|bytes: &[u8]| hex::encode(Sha256::digest(bytes)))
}

/// A parsed revision token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    height: u64,
    hash: String,
}

/// Why a revision string failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RevisionParseError {
    #[error("revision has no '-' separator")]
    MissingSeparator,
    #[error("revision height is not a positive integer")]
    InvalidHeight,
    #[error("revision hash is empty")]
    EmptyHash,
}

impl Revision {
    /// Build a revision from parts. Height must be at least 1.
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height: height.max(1),
            hash: hash.into(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

impl FromStr for Revision {
    type Err = RevisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (height, hash) = s
            .split_once('-')
            .ok_or(RevisionParseError::MissingSeparator)?;
        // u64::from_str accepts a leading '+', which would break round-trips
        if height.is_empty() || !height.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RevisionParseError::InvalidHeight);
        }
        let height: u64 = height
            .parse()
            .map_err(|_| RevisionParseError::InvalidHeight)?;
        if height == 0 {
            return Err(RevisionParseError::InvalidHeight);
        }
        if hash.is_empty() {
            return Err(RevisionParseError::EmptyHash);
        }
        Ok(Self {
            height,
            hash: hash.to_string(),
        })
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Height of an optional revision, 0 when absent.
pub fn height_of(rev: Option<&Revision>) -> u64 {
    rev.map(Revision::height).unwrap_or(0)
}

/// Create the revision for writing `document` on top of `previous`.
///
/// Pure inserts (no previous) are salted.
pub fn create_revision(
    hash_function: &HashFunction,
    document: &Document,
    previous: Option<&Document>,
) -> Revision {
    match previous {
        Some(prev) => create_revision_at(
            hash_function,
            document,
            height_of(prev.rev.as_ref()) + 1,
        ),
        None => {
            let mut bytes = document.canonical_bytes();
            bytes.extend_from_slice(format!("{:016x}", rand::random::<u64>()).as_bytes());
            Revision::new(1, hash_function(&bytes))
        }
    }
}

/// Create a revision at an explicit height.
pub fn create_revision_at(hash_function: &HashFunction, document: &Document, height: u64) -> Revision {
    Revision::new(height, hash_function(&document.canonical_bytes()))
}

static LAST_LWT_BITS: AtomicU64 = AtomicU64::new(0);

/// Monotonic last-write-time in milliseconds.
///
/// Wall clock with microsecond resolution; never returns the same value twice
/// within a process even if the clock stalls or steps backwards.
pub fn now_lwt() -> f64 {
    let wall = chrono::Utc::now().timestamp_micros() as f64 / 1000.0;
    let mut current = LAST_LWT_BITS.load(Ordering::Relaxed);
    loop {
        let last = f64::from_bits(current);
        let next = if wall > last { wall } else { last + 0.001 };
        match LAST_LWT_BITS.compare_exchange_weak(
            current,
            next.to_bits(),
            Ordering::SeqCst,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}
