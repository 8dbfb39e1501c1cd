//! Id-keyed table of workflow records.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use stackward_core::{WorkflowState, WorkflowUpdate};
use time::OffsetDateTime;

use crate::error::WorkflowError;

#[derive(Debug, Default)]
pub struct WorkflowTable {
    entries: DashMap<String, WorkflowState>,
}

impl WorkflowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `state` unless a run with the same id is still in progress.
    ///
    /// A terminal record with the same id is replaced and handed back so
    /// the caller can restore it. The check and the insert happen under
    /// one shard lock.
    pub fn try_insert(&self, state: WorkflowState) -> Result<Option<WorkflowState>, WorkflowError> {
        match self.entries.entry(state.id.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().state.is_terminal() {
                    return Err(WorkflowError::AlreadyRunning {
                        id: occupied.key().clone(),
                    });
                }
                Ok(Some(occupied.insert(state)))
            }
            Entry::Vacant(vacant) => {
                vacant.insert(state);
                Ok(None)
            }
        }
    }

    /// Overwrite the record for `state.id`. Only the holder of the id's
    /// reservation calls this.
    pub(crate) fn replace(&self, state: WorkflowState) {
        self.entries.insert(state.id.clone(), state);
    }

    /// Undo a `try_insert`: put back the displaced record, or drop the id.
    pub(crate) fn release(&self, id: &str, previous: Option<WorkflowState>) {
        match previous {
            Some(previous) => {
                self.entries.insert(id.to_string(), previous);
            }
            None => {
                self.entries.remove(id);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<WorkflowState> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn is_in_progress(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| !entry.state.is_terminal())
    }

    /// Merge `update` into the record for `id`.
    ///
    /// Returns `false` when the record is missing or part of the update was
    /// rejected as a backwards transition.
    pub fn merge(&self, id: &str, update: WorkflowUpdate) -> bool {
        match self.entries.get_mut(id) {
            Some(mut entry) => {
                let accepted = entry.value_mut().merge(update);
                if !accepted {
                    tracing::warn!(workflow_id = id, phase = ?entry.phase, "rejected backwards transition");
                }
                accepted
            }
            None => {
                tracing::warn!(workflow_id = id, "update for unknown workflow");
                false
            }
        }
    }

    /// Drop terminal records that ended more than `retention` ago.
    /// Returns how many were removed.
    pub fn prune_completed(&self, retention: Duration) -> usize {
        let now = OffsetDateTime::now_utc();
        let before = self.entries.len();
        self.entries.retain(|_, state| match state.end_time {
            Some(end) if state.state.is_terminal() => now - end < retention,
            _ => true,
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "pruned finished workflows");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
