//! Durable program -> image index.
//!
//! A JSON sidecar file maps program ids to the image chosen for them plus
//! the last time the mapping was served. The reverse direction (image id ->
//! most recent request across all programs) feeds the eviction sweep.
//!
//! Every mutation rewrites the whole file before returning; request volume
//! is personal-scale and the in-memory map stays authoritative if a write
//! fails.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::IndexEntry;

/// Accepts both the current entry object and the legacy bare-string form
/// (program id -> image id) left behind by older deployments.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Entry(IndexEntry),
    Legacy(String),
}

#[derive(Default)]
struct IndexInner {
    entries: HashMap<String, IndexEntry>,
    /// image id -> most recent lastRequestUnix across every program mapped
    /// to it. Derived data, kept in step with `entries`.
    image_requests: HashMap<String, i64>,
}

impl IndexInner {
    fn recalculate_image_requests(&mut self, image_ids: &[String]) {
        for image_id in image_ids {
            if image_id.is_empty() {
                continue;
            }
            let latest = self
                .entries
                .values()
                .filter(|e| &e.image_id == image_id)
                .map(|e| e.last_request_unix)
                .max()
                .unwrap_or(0);
            if latest == 0 {
                self.image_requests.remove(image_id);
            } else {
                self.image_requests.insert(image_id.clone(), latest);
            }
        }
    }
}

pub struct ProgramImageIndex {
    path: PathBuf,
    inner: RwLock<IndexInner>,
}

impl ProgramImageIndex {
    /// Load the index from its sidecar file. A missing or malformed file is
    /// an empty index, never a startup failure.
    pub fn load(path: PathBuf) -> Self {
        let mut inner = IndexInner::default();

        match std::fs::read(&path) {
            Ok(data) if !data.is_empty() => {
                match serde_json::from_slice::<HashMap<String, StoredEntry>>(&data) {
                    Ok(raw) => {
                        for (program_id, stored) in raw {
                            let entry = match stored {
                                StoredEntry::Entry(entry) => entry,
                                StoredEntry::Legacy(image_id) => IndexEntry {
                                    image_id,
                                    last_request_unix: 0,
                                },
                            };
                            if entry.image_id.is_empty() {
                                continue;
                            }
                            if entry.last_request_unix > 0 {
                                let slot = inner
                                    .image_requests
                                    .entry(entry.image_id.clone())
                                    .or_insert(0);
                                if entry.last_request_unix > *slot {
                                    *slot = entry.last_request_unix;
                                }
                            }
                            inner.entries.insert(program_id, entry);
                        }
                        info!(path = %path.display(), entries = inner.entries.len(), "loaded poster index");
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "poster index unreadable, starting empty");
                    }
                }
            }
            _ => {}
        }

        Self {
            path,
            inner: RwLock::new(inner),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, program_id: &str) -> Option<IndexEntry> {
        self.inner.read().await.entries.get(program_id).cloned()
    }

    /// Upsert a mapping, stamping the current time, and persist. When the
    /// program previously pointed at a different image the old image's
    /// reverse timestamp is recalculated from its remaining references
    /// (several programs may share one image).
    pub async fn set(&self, program_id: &str, image_id: &str) {
        if image_id.is_empty() {
            return;
        }
        let now_unix = Utc::now().timestamp();
        let mut inner = self.inner.write().await;
        let old = inner.entries.insert(
            program_id.to_string(),
            IndexEntry {
                image_id: image_id.to_string(),
                last_request_unix: now_unix,
            },
        );
        inner
            .image_requests
            .insert(image_id.to_string(), now_unix);
        if let Some(old) = old {
            if old.image_id != image_id {
                inner.recalculate_image_requests(&[old.image_id]);
            }
        }
        self.persist(&inner);
    }

    pub async fn delete(&self, program_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.entries.remove(program_id) {
            inner.recalculate_image_requests(&[old.image_id]);
            self.persist(&inner);
        }
    }

    /// Remove every program mapping pointing at any of the given image ids.
    /// Used by the eviction sweep and blocklist purges; persists once.
    pub async fn delete_by_image_ids(&self, image_ids: &HashSet<String>) -> usize {
        if image_ids.is_empty() {
            return 0;
        }
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, entry| !image_ids.contains(&entry.image_id));
        for image_id in image_ids {
            inner.image_requests.remove(image_id);
        }
        let removed = before - inner.entries.len();
        if removed > 0 {
            self.persist(&inner);
        }
        removed
    }

    /// Most recent request instant across all programs mapped to this image,
    /// if any mapping exists.
    pub async fn last_request_for_image(&self, image_id: &str) -> Option<DateTime<Utc>> {
        if image_id.is_empty() {
            return None;
        }
        let inner = self.inner.read().await;
        inner
            .image_requests
            .get(image_id)
            .copied()
            .filter(|ts| *ts > 0)
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn persist(&self, inner: &IndexInner) {
        match serde_json::to_vec_pretty(&inner.entries) {
            Ok(blob) => {
                if let Err(e) = std::fs::write(&self.path, blob) {
                    warn!(path = %self.path.display(), error = %e, "failed to persist poster index");
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize poster index");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn index_in(dir: &TempDir) -> ProgramImageIndex {
        ProgramImageIndex::load(dir.path().join("poster-index.json"))
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);

        index.set("EP000000010001", "img-1").await;
        let entry = index.get("EP000000010001").await.unwrap();
        assert_eq!(entry.image_id, "img-1");
        let age = Utc::now().timestamp() - entry.last_request_unix;
        assert!((0..5).contains(&age));

        index.delete("EP000000010001").await;
        assert!(index.get("EP000000010001").await.is_none());
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let dir = TempDir::new().unwrap();
        {
            let index = index_in(&dir);
            index.set("EP000000010001", "img-1").await;
        }
        let reloaded = index_in(&dir);
        let entry = reloaded.get("EP000000010001").await.unwrap();
        assert_eq!(entry.image_id, "img-1");
        assert!(reloaded.last_request_for_image("img-1").await.is_some());
    }

    #[tokio::test]
    async fn legacy_string_entries_upgrade_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("poster-index.json");
        std::fs::write(
            &path,
            r#"{"EP000000010001":"old-img","EP000000020001":{"imageID":"new-img","lastRequestUnix":1700000000}}"#,
        )
        .unwrap();

        let index = ProgramImageIndex::load(path);
        assert_eq!(index.get("EP000000010001").await.unwrap().image_id, "old-img");
        assert_eq!(index.get("EP000000020001").await.unwrap().image_id, "new-img");
        // Legacy entries have no request history.
        assert!(index.last_request_for_image("old-img").await.is_none());
        assert!(index.last_request_for_image("new-img").await.is_some());
    }

    #[tokio::test]
    async fn malformed_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("poster-index.json");
        std::fs::write(&path, "not json at all").unwrap();
        let index = ProgramImageIndex::load(path);
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn overwrite_recalculates_shared_image_timestamps() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);

        // Two programs share img-a; repointing one must not erase the
        // other's reverse timestamp.
        index.set("EP1", "img-a").await;
        index.set("EP2", "img-a").await;
        index.set("EP1", "img-b").await;

        assert!(index.last_request_for_image("img-a").await.is_some());
        assert!(index.last_request_for_image("img-b").await.is_some());

        index.delete("EP2").await;
        assert!(index.last_request_for_image("img-a").await.is_none());
    }

    #[tokio::test]
    async fn bulk_delete_prunes_everything_for_the_image() {
        let dir = TempDir::new().unwrap();
        let index = index_in(&dir);

        index.set("EP1", "img-a").await;
        index.set("EP2", "img-a").await;
        index.set("EP3", "img-b").await;

        let mut ids = HashSet::new();
        ids.insert("img-a".to_string());
        let removed = index.delete_by_image_ids(&ids).await;
        assert_eq!(removed, 2);
        assert!(index.get("EP1").await.is_none());
        assert!(index.get("EP2").await.is_none());
        assert_eq!(index.get("EP3").await.unwrap().image_id, "img-b");
        assert!(index.last_request_for_image("img-a").await.is_none());
    }
}
