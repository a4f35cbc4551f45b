//! Cached upstream bearer token.
//!
//! One token serves the whole process. Reads are lock-cheap; the refresh
//! path is serialized so a stampede of expired callers performs exactly one
//! login. The token is persisted next to the other sidecar files so a
//! restart does not burn a login, and "too many logins" responses engage
//! the global backoff gate instead of retrying.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backoff::{next_utc_midnight_plus, BackoffGate};
use crate::errors::FetchError;
use crate::models::LoginSession;

/// Tokens are never used this close to their expiry.
const EXPIRY_SAFETY_MARGIN_MINUTES: i64 = 10;
/// Minimum spacing between forced re-logins under `force_refresh_limited`.
const FORCE_REFRESH_COOLDOWN_MINUTES: i64 = 5;
/// Buffer past UTC midnight before retrying after a lockout.
const QUOTA_RESET_BUFFER_MINUTES: i64 = 5;

/// Upstream login exchange, implemented by the Schedules Direct client and
/// by fakes in tests.
#[async_trait]
pub trait LoginProvider: Send + Sync {
    async fn login(&self) -> Result<LoginSession, FetchError>;
}

pub struct TokenManager {
    path: PathBuf,
    provider: Arc<dyn LoginProvider>,
    gate: Arc<BackoffGate>,
    session: RwLock<Option<LoginSession>>,
    refresh_lock: Mutex<()>,
    last_forced: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl TokenManager {
    /// Create a manager, trusting a persisted token only if its expiry is
    /// still comfortably in the future.
    pub fn load(path: PathBuf, provider: Arc<dyn LoginProvider>, gate: Arc<BackoffGate>) -> Self {
        let session = std::fs::read(&path)
            .ok()
            .and_then(|data| serde_json::from_slice::<LoginSession>(&data).ok())
            .filter(|s| s.is_fresh(Utc::now(), Duration::minutes(EXPIRY_SAFETY_MARGIN_MINUTES)));

        if session.is_some() {
            info!(path = %path.display(), "reusing persisted upstream token");
        }

        Self {
            path,
            provider,
            gate,
            session: RwLock::new(session),
            refresh_lock: Mutex::new(()),
            last_forced: std::sync::Mutex::new(None),
        }
    }

    fn margin() -> Duration {
        Duration::minutes(EXPIRY_SAFETY_MARGIN_MINUTES)
    }

    /// Current token, refreshing first if it is missing or near expiry.
    pub async fn token(&self) -> Result<String, FetchError> {
        if let Some(session) = self.session.read().await.as_ref() {
            if session.is_fresh(Utc::now(), Self::margin()) {
                return Ok(session.token.clone());
            }
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we queued for the lock.
        if let Some(session) = self.session.read().await.as_ref() {
            if session.is_fresh(Utc::now(), Self::margin()) {
                return Ok(session.token.clone());
            }
        }
        self.login_and_publish().await
    }

    /// Drop the cached token (memory and disk) and log in again. Used after
    /// an authentication-rejected response from upstream.
    pub async fn force_refresh(&self) -> Result<String, FetchError> {
        let _guard = self.refresh_lock.lock().await;
        self.session.write().await.take();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove persisted token");
            }
        }
        self.login_and_publish().await
    }

    /// Like `force_refresh`, but rate-limited: within the cooldown window
    /// callers get the most recent token instead of triggering yet another
    /// login, which keeps N simultaneously-failing requests from logging in
    /// N times.
    pub async fn force_refresh_limited(&self) -> Result<String, FetchError> {
        let within_cooldown = {
            let mut last = self.last_forced.lock().unwrap();
            let now = Utc::now();
            match *last {
                Some(at) if now - at < Duration::minutes(FORCE_REFRESH_COOLDOWN_MINUTES) => true,
                _ => {
                    *last = Some(now);
                    false
                }
            }
        };

        if within_cooldown {
            debug!("forced token refresh suppressed by cooldown");
            if let Some(session) = self.session.read().await.as_ref() {
                return Ok(session.token.clone());
            }
            return self.token().await;
        }

        self.force_refresh().await
    }

    async fn login_and_publish(&self) -> Result<String, FetchError> {
        if let Some(remaining) = self.gate.should_block() {
            return Err(FetchError::throttled("upstream fetches paused", remaining));
        }

        match self.provider.login().await {
            Ok(session) => {
                self.persist(&session);
                let token = session.token.clone();
                info!(expires_at = %session.expires_at, "obtained upstream token");
                *self.session.write().await = Some(session);
                Ok(token)
            }
            Err(FetchError::LoginLockout {
                message,
                server_time,
            }) => {
                let reference = server_time.unwrap_or_else(Utc::now);
                let until = next_utc_midnight_plus(reference, QUOTA_RESET_BUFFER_MINUTES);
                self.gate.set_pause_until(until, &message);
                Err(FetchError::throttled(message, until - Utc::now()))
            }
            Err(e) => Err(e),
        }
    }

    fn persist(&self, session: &LoginSession) {
        match serde_json::to_vec_pretty(session) {
            Ok(blob) => {
                if let Err(e) = std::fs::write(&self.path, blob) {
                    warn!(path = %self.path.display(), error = %e, "failed to persist token");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize token"),
        }
    }
}
