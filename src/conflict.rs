//! Conflict handling.
//!
//! A conflict is a push whose assumed master state no longer matches the
//! master's real state. The [`ConflictHandler`] decides what the document
//! should become; the upstream engine writes that decision to the fork and
//! pushes it again on the next cycle.
//!
//! Handlers must be pure functions of their inputs (no hidden state) so
//! that several forks resolving the same key converge, and `is_equal` must
//! agree with the master's own notion of equality so identical concurrent
//! inserts never reach `resolve`.

use crate::document::Document;
use crate::error::{ReplicationError, Result};
use crate::revision::{create_revision_at, now_lwt, HashFunction};
use crate::store::BoxFuture;

/// Inputs to a conflict resolution.
#[derive(Debug, Clone)]
pub struct ConflictInput {
    /// What the fork wants the document to be.
    pub new_document_state: Document,
    /// What the fork believed the master held, if anything.
    pub assumed_master_state: Option<Document>,
    /// What the master actually holds.
    pub real_master_state: Document,
}

/// Decides equality and conflict outcomes.
pub trait ConflictHandler: Send + Sync + 'static {
    /// Content equality. Defaults to structural equality ignoring
    /// revision and store metadata.
    fn is_equal(&self, a: &Document, b: &Document, _context: &str) -> bool {
        a.content_eq(b)
    }

    /// Produce the winning document state. An error leaves the document
    /// pending; it is surfaced on the `error` event and retried next cycle.
    fn resolve(&self, input: ConflictInput, context: &str) -> BoxFuture<'_, Document>;
}

/// Master always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConflictHandler;

impl ConflictHandler for DefaultConflictHandler {
    fn resolve(&self, input: ConflictInput, _context: &str) -> BoxFuture<'_, Document> {
        Box::pin(async move { Ok(input.real_master_state) })
    }
}

/// Run the handler for one conflict.
///
/// Returns `None` when the fork state already equals the real master state.
/// Otherwise returns the resolved document stamped for writing on top of
/// `fork_state`, with a height above both the fork and the master.
pub async fn resolve_conflict(
    handler: &dyn ConflictHandler,
    hash_function: &HashFunction,
    input: &ConflictInput,
    fork_state: &Document,
) -> Result<Option<Document>> {
    const CONTEXT: &str = "replication-resolve-conflict";

    if handler.is_equal(&input.new_document_state, &input.real_master_state, CONTEXT) {
        return Ok(None);
    }

    let id = fork_state.id.clone();
    let mut resolved = handler
        .resolve(input.clone(), CONTEXT)
        .await
        .map_err(|e| match e {
            ReplicationError::ConflictHandler { .. } => e,
            other => ReplicationError::conflict_handler(&id, other.to_string()),
        })?;
    if resolved.id != id {
        return Err(ReplicationError::conflict_handler(
            &id,
            format!("resolved document has id {}", resolved.id),
        ));
    }

    let height = fork_state.height().max(input.real_master_state.height()) + 1;
    resolved.rev = Some(create_revision_at(hash_function, &resolved, height));
    resolved.meta.lwt = now_lwt();
    Ok(Some(resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revision::{default_hash_function, Revision};
    use serde_json::json;

    fn at(doc: Document, height: u64) -> Document {
        Document {
            rev: Some(Revision::new(height, "h")),
            ..doc
        }
    }

    struct FailingHandler;

    impl ConflictHandler for FailingHandler {
        fn resolve(&self, _input: ConflictInput, _context: &str) -> BoxFuture<'_, Document> {
            Box::pin(async { Err(ReplicationError::Internal("tie".to_string())) })
        }
    }

    #[tokio::test]
    async fn test_equal_states_need_no_resolution() {
        let fork = at(Document::new("a", json!({"v": 1})), 1);
        let input = ConflictInput {
            new_document_state: fork.clone(),
            assumed_master_state: None,
            real_master_state: at(Document::new("a", json!({"v": 1})), 1),
        };
        let out = resolve_conflict(&DefaultConflictHandler, &default_hash_function(), &input, &fork)
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_default_handler_master_wins_above_both_heights() {
        let fork = at(Document::new("a", json!({"v": 1})), 3);
        let master = at(Document::new("a", json!({"v": 2})), 5);
        let input = ConflictInput {
            new_document_state: fork.clone(),
            assumed_master_state: None,
            real_master_state: master.clone(),
        };
        let resolved = resolve_conflict(&DefaultConflictHandler, &default_hash_function(), &input, &fork)
            .await
            .unwrap()
            .unwrap();
        assert!(resolved.content_eq(&master));
        assert_eq!(resolved.height(), 6);
    }

    #[tokio::test]
    async fn test_handler_error_is_conflict_handler_error() {
        let fork = at(Document::new("a", json!({"v": 1})), 1);
        let input = ConflictInput {
            new_document_state: fork.clone(),
            assumed_master_state: None,
            real_master_state: at(Document::new("a", json!({"v": 2})), 1),
        };
        let err = resolve_conflict(&FailingHandler, &default_hash_function(), &input, &fork)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::ConflictHandler { ref document_id, .. } if document_id == "a"));
        assert!(!err.is_retryable());
    }
}
