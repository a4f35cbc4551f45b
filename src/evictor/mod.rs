//! Stale cache eviction.
//!
//! Cached posters are deleted once they are twice as old as the cache TTL:
//! the TTL itself governs refresh, so an expired-but-undeleted file can
//! still serve while a re-download is pending. Age comes from the index's
//! reverse lookup (most recent request for the image), falling back to file
//! modification time for files no mapping references.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::index::ProgramImageIndex;
use crate::overrides::OverrideList;

/// Purge multiplier: files are deleted at `2 x max_age_days`.
const PURGE_TTL_FACTOR: i64 = 2;

pub struct StaleFileEvictor {
    cache_dir: PathBuf,
    max_age_days: i64,
    index: Arc<ProgramImageIndex>,
    overrides: Arc<OverrideList>,
}

impl StaleFileEvictor {
    pub fn new(
        cache_dir: PathBuf,
        max_age_days: i64,
        index: Arc<ProgramImageIndex>,
        overrides: Arc<OverrideList>,
    ) -> Self {
        Self {
            cache_dir,
            max_age_days,
            index,
            overrides,
        }
    }

    /// Sweep the cache directory once and return how many files were
    /// removed. Individual file errors are logged and skipped; the index is
    /// persisted once at the end via the bulk prune.
    pub async fn purge(&self) -> usize {
        if self.max_age_days <= 0 {
            return 0;
        }
        let threshold = Duration::days(self.max_age_days * PURGE_TTL_FACTOR);
        let now = Utc::now();

        let entries = match std::fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.cache_dir.display(), error = %e, "cannot read cache directory for eviction");
                return 0;
            }
        };

        let mut removed = 0usize;
        let mut removed_ids: HashSet<String> = HashSet::new();

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "failed to read cache directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jpg") {
                continue;
            }
            let Some(image_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };

            if self.overrides.is_pinned(&image_id) {
                continue;
            }

            let last_used = match self.index.last_request_for_image(&image_id).await {
                Some(instant) => instant,
                None => match file_mtime(&entry) {
                    Some(instant) => instant,
                    None => continue,
                },
            };

            if now - last_used <= threshold {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(image_id, path = %path.display(), "purged stale cached poster");
                    removed += 1;
                    removed_ids.insert(image_id);
                }
                Err(e) => {
                    warn!(image_id, path = %path.display(), error = %e, "failed to purge stale poster");
                }
            }
        }

        if !removed_ids.is_empty() {
            self.index.delete_by_image_ids(&removed_ids).await;
        }
        if removed > 0 {
            info!(removed, dir = %self.cache_dir.display(), "eviction sweep complete");
        }
        removed
    }
}

fn file_mtime(entry: &std::fs::DirEntry) -> Option<DateTime<Utc>> {
    let modified = entry.metadata().ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_index(dir: &TempDir, entries: &[(&str, &str, i64)]) -> Arc<ProgramImageIndex> {
        let path = dir.path().join("poster-index.json");
        let mut map = serde_json::Map::new();
        for (program_id, image_id, age_days) in entries {
            map.insert(
                program_id.to_string(),
                serde_json::json!({
                    "imageID": image_id,
                    "lastRequestUnix": (Utc::now() - Duration::days(*age_days)).timestamp(),
                }),
            );
        }
        std::fs::write(&path, serde_json::to_vec(&map).unwrap()).unwrap();
        Arc::new(ProgramImageIndex::load(path))
    }

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"\xff\xd8\xff").unwrap();
        path
    }

    #[tokio::test]
    async fn purges_only_past_twice_the_ttl() {
        let state = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();

        // TTL 10 days: 15-day-old is inside the 20-day grace window,
        // 25-day-old is out.
        let index = write_index(&state, &[("EP1", "young", 15), ("EP2", "old", 25)]);
        let young = touch(&cache, "young.jpg");
        let old = touch(&cache, "old.jpg");

        let evictor = StaleFileEvictor::new(
            cache.path().to_path_buf(),
            10,
            index.clone(),
            Arc::new(OverrideList::default()),
        );
        let removed = evictor.purge().await;

        assert_eq!(removed, 1);
        assert!(young.exists());
        assert!(!old.exists());
        // Index pruned for the purged image only.
        assert!(index.get("EP1").await.is_some());
        assert!(index.get("EP2").await.is_none());
    }

    #[tokio::test]
    async fn pinned_images_survive() {
        let state = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();

        let index = write_index(&state, &[("EP1", "pinned-img", 90)]);
        let pinned = touch(&cache, "pinned-img.jpg");

        let overrides_path = state.path().join("overrides.txt");
        std::fs::write(&overrides_path, "\"Some Show\",\"pinned-img\"\n").unwrap();
        let overrides = Arc::new(OverrideList::load(&overrides_path));

        let evictor =
            StaleFileEvictor::new(cache.path().to_path_buf(), 10, index, overrides);
        assert_eq!(evictor.purge().await, 0);
        assert!(pinned.exists());
    }

    #[tokio::test]
    async fn unreferenced_files_age_by_mtime() {
        let state = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();

        let index = Arc::new(ProgramImageIndex::load(state.path().join("poster-index.json")));
        let orphan = touch(&cache, "orphan.jpg");
        let ancient = std::time::SystemTime::now() - std::time::Duration::from_secs(60 * 86_400);
        std::fs::File::options()
            .append(true)
            .open(&orphan)
            .unwrap()
            .set_modified(ancient)
            .unwrap();

        let evictor = StaleFileEvictor::new(
            cache.path().to_path_buf(),
            10,
            index,
            Arc::new(OverrideList::default()),
        );
        assert_eq!(evictor.purge().await, 1);
        assert!(!orphan.exists());
    }
}
