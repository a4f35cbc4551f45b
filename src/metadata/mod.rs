//! Program metadata cache.
//!
//! Artwork metadata normally arrives with the guide build; when the proxy
//! is asked about a program it has never seen, the metadata collaborator is
//! consulted once and the result kept in memory for later requests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::FetchError;
use crate::models::ProgramMetadata;

/// Metadata collaborator seam. The production implementation talks to the
/// upstream guide API; tests inject fakes.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn fetch_metadata(&self, program_id: &str) -> Result<ProgramMetadata, FetchError>;
}

pub struct MetadataCache {
    provider: Arc<dyn MetadataProvider>,
    programs: RwLock<HashMap<String, ProgramMetadata>>,
}

impl MetadataCache {
    pub fn new(provider: Arc<dyn MetadataProvider>) -> Self {
        Self {
            provider,
            programs: RwLock::new(HashMap::new()),
        }
    }

    /// Cached metadata for a program, fetching on demand when absent.
    ///
    /// Throttling propagates so the caller can engage backoff handling;
    /// any other fetch failure reads as "no metadata" and the program
    /// resolves to no acceptable image.
    pub async fn get_or_fetch(
        &self,
        program_id: &str,
    ) -> Result<Option<ProgramMetadata>, FetchError> {
        if let Some(meta) = self.programs.read().await.get(program_id) {
            return Ok(Some(meta.clone()));
        }

        info!(program_id, "metadata missing, fetching on demand");
        match self.provider.fetch_metadata(program_id).await {
            Ok(meta) => {
                self.programs
                    .write()
                    .await
                    .insert(program_id.to_string(), meta.clone());
                Ok(Some(meta))
            }
            Err(e @ FetchError::UpstreamThrottled { .. }) => Err(e),
            Err(e) => {
                warn!(program_id, error = %e, "metadata fetch failed");
                Ok(None)
            }
        }
    }

    pub async fn get(&self, program_id: &str) -> Option<ProgramMetadata> {
        self.programs.read().await.get(program_id).cloned()
    }

    /// Pre-populate an entry, e.g. from a guide build or a test fixture.
    pub async fn seed(&self, meta: ProgramMetadata) {
        self.programs
            .write()
            .await
            .insert(meta.program_id.clone(), meta);
    }

    pub async fn remove(&self, program_id: &str) {
        self.programs.write().await.remove(program_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataProvider for FlakyProvider {
        async fn fetch_metadata(&self, program_id: &str) -> Result<ProgramMetadata, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProgramMetadata {
                program_id: program_id.to_string(),
                titles: vec!["Some Show".to_string()],
                artwork: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn fetches_once_and_caches() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
        });
        let cache = MetadataCache::new(provider.clone());

        assert!(cache.get("EP1").await.is_none());
        let first = cache.get_or_fetch("EP1").await.unwrap().unwrap();
        assert_eq!(first.program_id, "EP1");
        let second = cache.get_or_fetch("EP1").await.unwrap().unwrap();
        assert_eq!(second.titles, first.titles);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    struct FailingProvider;

    #[async_trait]
    impl MetadataProvider for FailingProvider {
        async fn fetch_metadata(&self, _program_id: &str) -> Result<ProgramMetadata, FetchError> {
            Err(FetchError::upstream("boom"))
        }
    }

    #[tokio::test]
    async fn fetch_failure_reads_as_no_metadata() {
        let cache = MetadataCache::new(Arc::new(FailingProvider));
        assert!(cache.get_or_fetch("EP1").await.unwrap().is_none());
    }
}
