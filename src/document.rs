//! Document records.
//!
//! A [`Document`] is an opaque keyed record: a primary key, an arbitrary
//! JSON payload, a deletion flag, attachment stubs, and the store-managed
//! `rev` / `meta.lwt` fields. The protocol never looks inside the payload;
//! conflict handlers may.

use crate::revision::Revision;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Payload fields of a document.
pub type DocumentData = serde_json::Map<String, Value>;

/// Attachment stub carried on the document. The bytes live in the store,
/// addressed by `digest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub digest: String,
    pub length: u64,
    #[serde(rename = "type")]
    pub content_type: String,
}

impl AttachmentMeta {
    /// Stub for the given bytes (`sha256-<hex>` digest).
    pub fn for_data(content_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            digest: format!("sha256-{}", hex::encode(Sha256::digest(data))),
            length: data.len() as u64,
            content_type: content_type.into(),
        }
    }
}

/// Store-managed metadata.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Last write time (ms), monotonic per process.
    pub lwt: f64,
}

/// A document as stored, pulled, or pushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub data: DocumentData,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, AttachmentMeta>,
    /// `None` only for states that have not been written anywhere yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    #[serde(default)]
    pub meta: DocumentMeta,
}

/// The fields that define a document's content.
#[derive(Serialize)]
struct ContentView<'a> {
    id: &'a str,
    data: &'a DocumentData,
    deleted: bool,
    attachments: &'a BTreeMap<String, AttachmentMeta>,
}

impl Document {
    /// New live document. A non-object payload is stored under `"value"`.
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => DocumentData::new(),
            other => {
                let mut map = DocumentData::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            id: id.into(),
            data,
            deleted: false,
            attachments: BTreeMap::new(),
            rev: None,
            meta: DocumentMeta::default(),
        }
    }

    /// Deleted state of this document, keeping its id and rev.
    pub fn into_tombstone(mut self) -> Self {
        self.deleted = true;
        self.attachments.clear();
        self
    }

    pub fn with_attachment(mut self, attachment_id: impl Into<String>, meta: AttachmentMeta) -> Self {
        self.attachments.insert(attachment_id.into(), meta);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.data.insert(field.into(), value);
    }

    /// Structural equality ignoring `rev` and `meta`.
    pub fn content_eq(&self, other: &Document) -> bool {
        self.id == other.id
            && self.deleted == other.deleted
            && self.data == other.data
            && self.attachments == other.attachments
    }

    /// Deterministic bytes of the content fields, used for revision hashing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let view = ContentView {
            id: &self.id,
            data: &self.data,
            deleted: self.deleted,
            attachments: &self.attachments,
        };
        // Keys are strings and the map is ordered, so this cannot fail
        serde_json::to_vec(&view).unwrap_or_default()
    }

    /// Revision as a string, for comparisons against stored markers.
    pub fn rev_string(&self) -> Option<String> {
        self.rev.as_ref().map(ToString::to_string)
    }

    pub fn height(&self) -> u64 {
        crate::revision::height_of(self.rev.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_eq_ignores_rev_and_meta() {
        let mut a = Document::new("a", json!({"age": 1}));
        let mut b = a.clone();
        a.rev = Some(Revision::new(1, "x"));
        b.rev = Some(Revision::new(5, "y"));
        b.meta.lwt = 1234.5;
        assert!(a.content_eq(&b));

        b.set("age", json!(2));
        assert!(!a.content_eq(&b));
    }

    #[test]
    fn test_content_eq_checks_deleted_and_attachments() {
        let a = Document::new("a", json!({}));
        assert!(!a.content_eq(&a.clone().into_tombstone()));

        let with_att = a.clone().with_attachment("f", AttachmentMeta::for_data("text/plain", b"hi"));
        assert!(!a.content_eq(&with_att));
    }

    #[test]
    fn test_canonical_bytes_independent_of_insertion_order() {
        let mut a = Document::new("a", json!({}));
        a.set("x", json!(1));
        a.set("y", json!(2));
        let mut b = Document::new("a", json!({}));
        b.set("y", json!(2));
        b.set("x", json!(1));
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn test_non_object_payload_wrapped() {
        let doc = Document::new("n", json!(42));
        assert_eq!(doc.get("value"), Some(&json!(42)));
    }

    #[test]
    fn test_attachment_meta_for_data() {
        let meta = AttachmentMeta::for_data("text/plain", b"hello");
        assert_eq!(meta.length, 5);
        assert!(meta.digest.starts_with("sha256-"));
        assert_eq!(meta, AttachmentMeta::for_data("text/plain", b"hello"));
    }

    #[test]
    fn test_serde_shape() {
        let mut doc = Document::new("a", json!({"name": "alice"}));
        doc.rev = Some(Revision::new(2, "abc"));
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["rev"], json!("2-abc"));
        assert_eq!(value["data"]["name"], json!("alice"));
        let back: Document = serde_json::from_value(value).unwrap();
        assert!(back.content_eq(&doc));
        assert_eq!(back.rev, doc.rev);
    }
}
