//! Process-wide lookup of running replications by identifier.
//!
//! The meta store of a replication must never be driven by two live states
//! with the same identifier, so the registry refuses a second start while
//! the first one has not been canceled.

use super::{EngineState, ReplicationInput, ReplicationState};
use crate::error::{ReplicationError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct ReplicationRegistry {
    states: DashMap<String, Arc<ReplicationState>>,
}

impl ReplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build, register and start a replication.
    ///
    /// Fails with [`ReplicationError::InvalidState`] if a replication with
    /// the same identifier is registered and not canceled.
    pub async fn start(&self, input: ReplicationInput) -> Result<Arc<ReplicationState>> {
        let identifier = input.config.identifier.clone();
        let state = Arc::new(ReplicationState::new(input)?);

        // Entry guard must not live across the await below
        match self.states.entry(identifier.clone()) {
            Entry::Occupied(mut existing) => {
                let current = existing.get().state();
                if current != EngineState::Canceled {
                    return Err(ReplicationError::InvalidState {
                        expected: "no live replication".to_string(),
                        actual: format!("{} is {}", identifier, current),
                    });
                }
                existing.insert(Arc::clone(&state));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&state));
            }
        }

        if let Err(e) = state.start().await {
            self.states.remove_if(&identifier, |_, registered| Arc::ptr_eq(registered, &state));
            return Err(e);
        }
        info!(identifier = %identifier, live = self.states.len(), "Replication registered");
        Ok(state)
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<ReplicationState>> {
        self.states.get(identifier).map(|entry| Arc::clone(entry.value()))
    }

    /// Cancel and unregister. Returns `false` if nothing was registered.
    pub async fn cancel(&self, identifier: &str) -> bool {
        let Some((_, state)) = self.states.remove(identifier) else {
            return false;
        };
        state.cancel().await;
        true
    }

    /// Cancel and unregister everything.
    pub async fn cancel_all(&self) {
        for identifier in self.identifiers() {
            self.cancel(&identifier).await;
        }
    }

    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
