//! Keyed, versioned state store.
//!
//! Entries are JSON bodies under string ids, revisioned by an opaque ETag
//! that is in fact a monotonically increasing integer encoded as a string.
//! The store contract is async so that disk- or service-backed
//! implementations can slot in behind the same trait; the in-memory
//! implementation here is the reference and the test double.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Result, StatusError};
use crate::filter::{self, ListFilter};

/// A stored entity: id, JSON body, and revision tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub id: String,
    pub body: Value,
    #[serde(default)]
    pub etag: String,
}

impl StateEntry {
    /// A new entry with no revision; the store assigns one on upsert.
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
            etag: String::new(),
        }
    }
}

/// Options controlling upsert behavior.
#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    /// Shallow-merge the new body's `status` object into the existing body,
    /// preserving every other field. Requires the entry to exist.
    pub update_state_only: bool,
}

/// The state store contract.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetches an entry by id. `NotFound` when absent.
    async fn get(&self, id: &str) -> Result<StateEntry>;

    /// Inserts or replaces an entry, returning the new ETag.
    async fn upsert(&self, entry: StateEntry, options: &UpsertOptions) -> Result<String>;

    /// Deletes an entry by id. `NotFound` when absent.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Lists entries, optionally filtered. An invalid filter expression fails
    /// the whole call with `BadRequest`.
    async fn list(&self, filter: Option<&ListFilter>) -> Result<Vec<StateEntry>>;
}

/// In-memory state store.
///
/// All mutation happens under a single `RwLock`, which is what makes the
/// upsert's read-increment-write of the ETag atomic.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    data: RwLock<BTreeMap<String, StateEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &str) -> Result<StateEntry> {
        let data = self.data.read().await;
        data
            .get(id)
            .cloned()
            .ok_or_else(|| StatusError::not_found(format!("entry '{}' is not found", id)))
    }

    async fn upsert(&self, mut entry: StateEntry, options: &UpsertOptions) -> Result<String> {
        let mut data = self.data.write().await;

        let existing = data.get(&entry.id);
        entry.etag = next_etag(existing.map(|e| e.etag.as_str()));

        if options.update_state_only {
            let existing = existing
                .ok_or_else(|| StatusError::not_found(format!("entry '{}' is not found", entry.id)))?;
            entry.body = merge_status(existing.body.clone(), &entry.body);
        }

        debug!(id = %entry.id, etag = %entry.etag, "upsert state");
        let etag = entry.etag.clone();
        data.insert(entry.id.clone(), entry);
        Ok(etag)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut data = self.data.write().await;
        data
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StatusError::not_found(format!("entry '{}' is not found", id)))
    }

    async fn list(&self, filter: Option<&ListFilter>) -> Result<Vec<StateEntry>> {
        let data = self.data.read().await;
        let mut entries = Vec::new();
        for entry in data.values() {
            match filter {
                Some(f) => {
                    if filter::matches(&entry.body, f)? {
                        entries.push(entry.clone());
                    }
                }
                None => entries.push(entry.clone()),
            }
        }
        Ok(entries)
    }
}

/// The successor of an ETag: `parse(old) + 1`, defaulting to `"1"`.
fn next_etag(old: Option<&str>) -> String {
    old
        .and_then(|tag| tag.parse::<i64>().ok())
        .map(|v| (v + 1).to_string())
        .unwrap_or_else(|| "1".to_string())
}

/// Shallow-merges `incoming`'s `status` object into `existing`'s, leaving
/// every other field of `existing` untouched.
fn merge_status(existing: Value, incoming: &Value) -> Value {
    let Some(incoming_status) = incoming.get("status").and_then(Value::as_object) else {
        return existing;
    };

    let mut obj = match existing {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    let status = obj
        .entry("status".to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    if let Value::Object(status) = status {
        for (k, v) in incoming_status {
            status.insert(k.clone(), v.clone());
        }
    } else {
        *status = Value::Object(incoming_status.clone());
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, body: Value) -> StateEntry {
        StateEntry::new(id, body)
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryStateStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrip() {
        let store = MemoryStateStore::new();
        let etag = store
            .upsert(entry("a", json!({"spec": {"x": 1}})), &UpsertOptions::default())
            .await
            .unwrap();
        assert_eq!(etag, "1");

        let got = store.get("a").await.unwrap();
        assert_eq!(got.id, "a");
        assert_eq!(got.etag, "1");
        assert_eq!(got.body, json!({"spec": {"x": 1}}));
    }

    #[tokio::test]
    async fn etag_increments_monotonically() {
        let store = MemoryStateStore::new();
        let mut last = 0i64;
        for i in 0..5 {
            let etag = store
                .upsert(entry("a", json!({"rev": i})), &UpsertOptions::default())
                .await
                .unwrap();
            let parsed: i64 = etag.parse().unwrap();
            assert!(parsed > last, "etag {} not greater than {}", parsed, last);
            last = parsed;
        }
        assert_eq!(last, 5);
    }

    #[tokio::test]
    async fn etag_ignores_caller_supplied_tag() {
        let store = MemoryStateStore::new();
        store
            .upsert(entry("a", json!({})), &UpsertOptions::default())
            .await
            .unwrap();

        let mut stale = entry("a", json!({}));
        stale.etag = "999".to_string();
        let etag = store.upsert(stale, &UpsertOptions::default()).await.unwrap();
        assert_eq!(etag, "2");
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = MemoryStateStore::new();
        store
            .upsert(entry("a", json!({})), &UpsertOptions::default())
            .await
            .unwrap();
        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStateStore::new();
        assert!(store.delete("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_state_only_merges_status_shallowly() {
        let store = MemoryStateStore::new();
        store
            .upsert(
                entry("a", json!({"spec": {"keep": true}, "status": {"phase": "Pending", "old": 1}})),
                &UpsertOptions::default(),
            )
            .await
            .unwrap();

        store
            .upsert(
                entry("a", json!({"status": {"phase": "Running"}})),
                &UpsertOptions {
                    update_state_only: true,
                },
            )
            .await
            .unwrap();

        let got = store.get("a").await.unwrap();
        assert_eq!(
            got.body,
            json!({"spec": {"keep": true}, "status": {"phase": "Running", "old": 1}})
        );
        assert_eq!(got.etag, "2");
    }

    #[tokio::test]
    async fn update_state_only_requires_existing_entry() {
        let store = MemoryStateStore::new();
        let err = store
            .upsert(
                entry("a", json!({"status": {"x": 1}})),
                &UpsertOptions {
                    update_state_only: true,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_unfiltered_returns_everything() {
        let store = MemoryStateStore::new();
        for id in ["a", "b", "c"] {
            store
                .upsert(entry(id, json!({})), &UpsertOptions::default())
                .await
                .unwrap();
        }
        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn list_with_label_filter() {
        let store = MemoryStateStore::new();
        store
            .upsert(
                entry("a", json!({"metadata": {"labels": {"staged_target": "edge-1"}}})),
                &UpsertOptions::default(),
            )
            .await
            .unwrap();
        store
            .upsert(
                entry("b", json!({"metadata": {"labels": {"staged_target": "edge-2"}}})),
                &UpsertOptions::default(),
            )
            .await
            .unwrap();

        let filter = ListFilter::Label("staged_target=edge-1".into());
        let matched = store.list(Some(&filter)).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "a");
    }

    #[tokio::test]
    async fn list_with_invalid_filter_fails_whole_call() {
        let store = MemoryStateStore::new();
        store
            .upsert(entry("a", json!({})), &UpsertOptions::default())
            .await
            .unwrap();

        let filter = ListFilter::Field("garbage".into());
        let err = store.list(Some(&filter)).await.unwrap_err();
        assert_eq!(err.status, crate::error::Status::BadRequest);
    }

    #[tokio::test]
    async fn list_with_spec_path_filter() {
        let store = MemoryStateStore::new();
        store
            .upsert(
                entry("a", json!({"spec": {"deployment": {"x": 1}}})),
                &UpsertOptions::default(),
            )
            .await
            .unwrap();
        store
            .upsert(entry("b", json!({"spec": {}})), &UpsertOptions::default())
            .await
            .unwrap();

        let filter = ListFilter::Spec("$.deployment".into());
        let matched = store.list(Some(&filter)).await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "a");
    }
}
