//! Fulfillment-state store: the broker's per-need record of whether a
//! need is currently satisfied, updated by inbound callbacks.

use crate::atomic::{read_json_or_default, write_json_atomically};
use fort_core::{FulfillmentState, FulfillmentStateEntry};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from reading or writing the fulfillment-state document.
#[derive(Debug, Error)]
pub enum FulfillmentStateError {
    /// The document could not be read or parsed.
    #[error("failed to read fulfillment state: {0}")]
    Read(#[source] std::io::Error),
    /// The document could not be written.
    #[error("failed to write fulfillment state: {0}")]
    Write(#[source] std::io::Error),
}

/// Single-writer, atomically-persisted fulfillment-state store.
pub struct FulfillmentStateStore {
    path: PathBuf,
    inner: Mutex<FulfillmentState>,
}

impl FulfillmentStateStore {
    /// Load the store from `path`, or start empty if the file does
    /// not exist yet.
    pub async fn load(path: PathBuf) -> Result<Self, FulfillmentStateError> {
        let state: FulfillmentState =
            read_json_or_default(&path).map_err(FulfillmentStateError::Read)?;
        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    /// Record a fulfillment callback for `need_id`. `last_sought` is
    /// preserved from the prior entry (or zero for a new one) — the
    /// broker never writes it itself; it is reserved for the
    /// consumer-side poller.
    pub async fn update(
        &self,
        need_id: &str,
        satisfied: bool,
    ) -> Result<(), FulfillmentStateError> {
        let mut state = self.inner.lock().await;
        let last_sought = state.get(need_id).map_or(0, |e| e.last_sought);
        state.insert(
            need_id.to_string(),
            FulfillmentStateEntry {
                satisfied,
                last_sought,
            },
        );
        self.persist(&state)
    }

    /// Current fulfillment entry for a need, if any callback has ever
    /// been recorded for it.
    pub async fn get(&self, need_id: &str) -> Option<FulfillmentStateEntry> {
        let state = self.inner.lock().await;
        state.get(need_id).copied()
    }

    fn persist(&self, state: &FulfillmentState) -> Result<(), FulfillmentStateError> {
        write_json_atomically(&self.path, state).map_err(FulfillmentStateError::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_sets_satisfied_and_preserves_last_sought() {
        let dir = tempfile::tempdir().unwrap();
        let store = FulfillmentStateStore::load(dir.path().join("fulfillment-state.json"))
            .await
            .unwrap();

        store.update("tokens-ci", true).await.unwrap();
        let entry = store.get("tokens-ci").await.unwrap();
        assert!(entry.satisfied);
        assert_eq!(entry.last_sought, 0);

        store.update("tokens-ci", false).await.unwrap();
        let entry = store.get("tokens-ci").await.unwrap();
        assert!(!entry.satisfied);
    }

    #[tokio::test]
    async fn unknown_need_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FulfillmentStateStore::load(dir.path().join("fulfillment-state.json"))
            .await
            .unwrap();
        assert!(store.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fulfillment-state.json");
        {
            let store = FulfillmentStateStore::load(path.clone()).await.unwrap();
            store.update("tokens-ci", true).await.unwrap();
        }
        let reloaded = FulfillmentStateStore::load(path).await.unwrap();
        assert!(reloaded.get("tokens-ci").await.unwrap().satisfied);
    }
}
