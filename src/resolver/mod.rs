//! Poster resolution orchestration.
//!
//! Composes the selector, index, download coordinator, token manager,
//! backoff gate and curation lists into the one operation the proxy
//! endpoint needs: "give me the poster file for this program". Serves from
//! disk whenever possible; otherwise selects, downloads once, validates the
//! payload and persists file + mapping.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::{next_utc_midnight_plus, BackoffGate};
use crate::blocklist::Blocklist;
use crate::download::{DownloadCoordinator, DownloadSlot};
use crate::errors::FetchError;
use crate::index::ProgramImageIndex;
use crate::metadata::MetadataCache;
use crate::overrides::OverrideList;
use crate::selector::{select_poster, SelectionConfig};
use crate::token::TokenManager;
use crate::upstream::{image_fetch_url, image_id_from_uri, is_quota_message, ImageFetcher};

/// Buffer past UTC midnight before retrying after a download-quota body.
const QUOTA_RESET_BUFFER_MINUTES: i64 = 5;

/// A resolved, on-disk poster ready to serve.
#[derive(Debug, Clone)]
pub struct PosterFile {
    pub path: PathBuf,
    pub image_id: String,
}

pub struct PosterResolver {
    cache_dir: PathBuf,
    base_url: Url,
    selection: SelectionConfig,
    max_age: Duration,
    index: Arc<ProgramImageIndex>,
    metadata: Arc<MetadataCache>,
    downloads: Arc<DownloadCoordinator>,
    tokens: Arc<TokenManager>,
    gate: Arc<BackoffGate>,
    fetcher: Arc<dyn ImageFetcher>,
    overrides: Arc<OverrideList>,
    blocklist: Arc<Blocklist>,
}

impl PosterResolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache_dir: PathBuf,
        base_url: Url,
        selection: SelectionConfig,
        max_age_days: i64,
        index: Arc<ProgramImageIndex>,
        metadata: Arc<MetadataCache>,
        downloads: Arc<DownloadCoordinator>,
        tokens: Arc<TokenManager>,
        gate: Arc<BackoffGate>,
        fetcher: Arc<dyn ImageFetcher>,
        overrides: Arc<OverrideList>,
        blocklist: Arc<Blocklist>,
    ) -> Self {
        Self {
            cache_dir,
            base_url,
            selection,
            max_age: Duration::days(max_age_days.max(1)),
            index,
            metadata,
            downloads,
            tokens,
            gate,
            fetcher,
            overrides,
            blocklist,
        }
    }

    pub fn image_path(&self, image_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{image_id}.jpg"))
    }

    /// Resolve the poster for a program. `pinned` skips selection and
    /// serves/downloads that exact image id; otherwise the override list is
    /// consulted, then the index, then the selector.
    pub async fn resolve(
        &self,
        program_id: &str,
        pinned: Option<&str>,
    ) -> Result<PosterFile, FetchError> {
        let pinned_id = match pinned {
            Some(id) if !id.is_empty() => Some(id.to_string()),
            _ => self.override_for_program(program_id).await,
        };
        if let Some(image_id) = pinned_id {
            return self.resolve_pinned(program_id, &image_id).await;
        }
        self.resolve_selected(program_id).await
    }

    /// Override lookup against the titles of already-cached metadata; never
    /// triggers a metadata fetch on its own.
    async fn override_for_program(&self, program_id: &str) -> Option<String> {
        let meta = self.metadata.get(program_id).await?;
        self.overrides
            .image_for_titles(meta.titles.iter().map(String::as_str))
            .map(str::to_string)
    }

    async fn resolve_pinned(
        &self,
        program_id: &str,
        image_id: &str,
    ) -> Result<PosterFile, FetchError> {
        if self.blocklist.contains(image_id) {
            self.purge_blocked(image_id).await;
            return Err(FetchError::NotFound);
        }

        let path = self.image_path(image_id);
        if path.exists() {
            self.index.set(program_id, image_id).await;
            return Ok(PosterFile {
                path,
                image_id: image_id.to_string(),
            });
        }

        // Bare image ids expand against the upstream image endpoint.
        self.download_guarded(program_id, image_id, image_id).await
    }

    async fn resolve_selected(&self, program_id: &str) -> Result<PosterFile, FetchError> {
        if let Some(entry) = self.index.get(program_id).await {
            let path = self.image_path(&entry.image_id);
            if path.exists() {
                if self.blocklist.contains(&entry.image_id) {
                    self.purge_blocked(&entry.image_id).await;
                } else {
                    let expired = entry
                        .last_request()
                        .map_or(true, |at| Utc::now() - at > self.max_age);
                    if !expired {
                        self.index.set(program_id, &entry.image_id).await;
                        return Ok(PosterFile {
                            path,
                            image_id: entry.image_id,
                        });
                    }
                    // Past the TTL: try to refresh, but an expired file is
                    // still better than an error while upstream is unhappy.
                    debug!(program_id, image_id = %entry.image_id, "cached poster expired, refreshing");
                    return match self.resolve_via_selection(program_id).await {
                        Ok(file) => Ok(file),
                        Err(e) => {
                            warn!(program_id, error = %e, "refresh failed, serving expired poster");
                            self.index.set(program_id, &entry.image_id).await;
                            Ok(PosterFile {
                                path,
                                image_id: entry.image_id,
                            })
                        }
                    };
                }
            } else {
                // Mapping points at a missing file: self-heal and re-resolve.
                debug!(program_id, image_id = %entry.image_id, "cached poster missing, dropping mapping");
                self.index.delete(program_id).await;
            }
        }

        self.resolve_via_selection(program_id).await
    }

    async fn resolve_via_selection(&self, program_id: &str) -> Result<PosterFile, FetchError> {
        // While paused, nothing new is fetched; requests without a cached
        // file get the retry hint.
        if let Some(remaining) = self.gate.should_block() {
            return Err(FetchError::throttled("upstream fetches paused", remaining));
        }

        let Some(meta) = self.metadata.get_or_fetch(program_id).await? else {
            return Err(FetchError::NotFound);
        };

        let Some(chosen) = select_poster(&meta.artwork, &self.selection) else {
            debug!(program_id, "no acceptable poster among candidates");
            return Err(FetchError::NotFound);
        };

        info!(
            program_id,
            uri = %chosen.uri,
            category = %chosen.category,
            aspect = %chosen.aspect,
            width = chosen.width,
            height = chosen.height,
            "resolved poster candidate"
        );

        let image_id = image_id_from_uri(&chosen.uri);
        if self.blocklist.contains(&image_id) {
            self.purge_blocked(&image_id).await;
            return Err(FetchError::NotFound);
        }

        // Another program may already have pulled this image down.
        let path = self.image_path(&image_id);
        if path.exists() {
            self.index.set(program_id, &image_id).await;
            return Ok(PosterFile { path, image_id });
        }

        let uri = chosen.uri.clone();
        self.download_guarded(program_id, &image_id, &uri).await
    }

    /// De-duplicated download: one owner fetches, everyone else waits and
    /// re-checks disk afterwards.
    async fn download_guarded(
        &self,
        program_id: &str,
        image_id: &str,
        uri: &str,
    ) -> Result<PosterFile, FetchError> {
        match self.downloads.acquire(image_id) {
            DownloadSlot::Owner => {
                let result = self.download_and_store(program_id, image_id, uri).await;
                self.downloads.release(image_id);
                result
            }
            DownloadSlot::Waiter(handle) => {
                debug!(image_id, "waiting on in-flight download");
                handle.wait().await;
                let path = self.image_path(image_id);
                if path.exists() {
                    self.index.set(program_id, image_id).await;
                    Ok(PosterFile {
                        path,
                        image_id: image_id.to_string(),
                    })
                } else {
                    Err(FetchError::upstream("concurrent download did not produce a file"))
                }
            }
        }
    }

    async fn download_and_store(
        &self,
        program_id: &str,
        image_id: &str,
        uri: &str,
    ) -> Result<PosterFile, FetchError> {
        let path = self.image_path(image_id);
        // The file may have landed while we queued for ownership.
        if path.exists() {
            self.index.set(program_id, image_id).await;
            return Ok(PosterFile {
                path,
                image_id: image_id.to_string(),
            });
        }

        if let Some(remaining) = self.gate.should_block() {
            return Err(FetchError::throttled("upstream fetches paused", remaining));
        }

        let token = self.tokens.token().await?;
        let (_, url) = image_fetch_url(&self.base_url, uri, &token);
        info!(program_id, image_id, "downloading poster from upstream");

        let mut fetched = self.fetcher.fetch_image(&url).await?;
        if fetched.status == 401 {
            // One forced refresh, then one retry; a second rejection is an
            // upstream fetch failure, not a retry loop.
            warn!(program_id, image_id, "upstream rejected token, refreshing once");
            let token = self.tokens.force_refresh_limited().await?;
            let (_, url) = image_fetch_url(&self.base_url, uri, &token);
            fetched = self.fetcher.fetch_image(&url).await?;
            if fetched.status == 401 {
                return Err(FetchError::AuthExpired);
            }
        }

        if fetched.status != 200 {
            return Err(FetchError::upstream(format!(
                "image fetch returned status {}",
                fetched.status
            )));
        }

        // Upstream sometimes answers 200 with a JSON error body; trust the
        // bytes, not the content type.
        if image::guess_format(&fetched.bytes).is_err() {
            if is_quota_message(&fetched.bytes) {
                let until = next_utc_midnight_plus(Utc::now(), QUOTA_RESET_BUFFER_MINUTES);
                self.gate.set_pause_until(until, "image download quota exceeded");
                return Err(FetchError::throttled(
                    "image download quota exceeded",
                    until - Utc::now(),
                ));
            }
            let detail = fetched
                .content_type
                .unwrap_or_else(|| "unrecognized bytes".to_string());
            return Err(FetchError::NonImagePayload { detail });
        }

        tokio::fs::write(&path, &fetched.bytes).await.map_err(|e| {
            warn!(image_id, path = %path.display(), error = %e, "failed to persist poster");
            FetchError::Persistence(e)
        })?;
        self.index.set(program_id, image_id).await;
        info!(program_id, image_id, bytes = fetched.bytes.len(), "poster cached");

        Ok(PosterFile {
            path,
            image_id: image_id.to_string(),
        })
    }

    async fn purge_blocked(&self, image_id: &str) {
        let path = self.image_path(image_id);
        match std::fs::remove_file(&path) {
            Ok(()) => info!(image_id, "removed blocklisted poster from cache"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(image_id, error = %e, "failed to remove blocklisted poster"),
        }
        let mut ids = HashSet::new();
        ids.insert(image_id.to_string());
        self.index.delete_by_image_ids(&ids).await;
    }
}
