//! Schedules Direct API client.
//!
//! Three upstream concerns live here: the login exchange (token endpoint),
//! on-demand artwork metadata, and raw image fetches. Each sits behind a
//! trait seam so the resolver can be exercised with fakes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tracing::{debug, warn};
use url::Url;

use crate::config::UpstreamConfig;
use crate::errors::{AppError, FetchError};
use crate::metadata::MetadataProvider;
use crate::models::{
    ArtworkData, ArtworkResponseEntry, LoginResponse, LoginSession, ProgramMetadata,
};
use crate::token::{LoginProvider, TokenManager};

pub const USER_AGENT: &str = concat!("sd-poster-proxy/", env!("CARGO_PKG_VERSION"));

/// Upstream login code for lockout ("too many logins").
const CODE_TOO_MANY_LOGINS: i64 = 4009;

/// Fetched image response, undecoded. The resolver validates the bytes.
pub struct FetchedImage {
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Raw image fetch seam.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch_image(&self, image_url: &str) -> Result<FetchedImage, FetchError>;
}

pub struct SchedulesDirectClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

impl SchedulesDirectClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, AppError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| AppError::configuration(format!("invalid upstream base url: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url
            .join(path)
            .map_err(|e| FetchError::upstream(format!("invalid endpoint {path}: {e}")))
    }
}

#[async_trait]
impl LoginProvider for SchedulesDirectClient {
    async fn login(&self) -> Result<LoginSession, FetchError> {
        let url = self.endpoint("token")?;
        debug!(%url, "logging in to upstream");
        let response = self
            .http
            .post(url)
            .json(&json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await?;

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| FetchError::upstream(format!("malformed login response: {e}")))?;
        classify_login(body)
    }
}

/// Map a login response body onto a session or the error taxonomy.
fn classify_login(body: LoginResponse) -> Result<LoginSession, FetchError> {
    if body.code == CODE_TOO_MANY_LOGINS || is_lockout_message(&body.message) {
        return Err(FetchError::LoginLockout {
            message: body.message,
            server_time: body.server_time,
        });
    }
    if body.code != 0 || body.token.is_empty() {
        return Err(FetchError::upstream(format!(
            "login failed (code {}): {}",
            body.code, body.message
        )));
    }
    let expires_at = Utc
        .timestamp_opt(body.token_expires, 0)
        .single()
        .filter(|_| body.token_expires > 0)
        .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(24));
    Ok(LoginSession {
        token: body.token,
        expires_at,
    })
}

fn is_lockout_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("too many logins") || message.contains("max logins")
}

/// Phrases upstream puts in HTTP-200 error bodies when the image download
/// quota is exhausted.
pub fn is_quota_message(body: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    let text = text.to_ascii_lowercase();
    text.contains("exceeded") || text.contains("quota") || text.contains("maximum image downloads")
}

#[async_trait]
impl ImageFetcher for SchedulesDirectClient {
    async fn fetch_image(&self, image_url: &str) -> Result<FetchedImage, FetchError> {
        let response = self.http.get(image_url).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedImage {
            status,
            content_type,
            bytes,
        })
    }
}

/// Metadata provider over the raw client: authenticated
/// `POST metadata/programs/` with a single-element id array.
pub struct SdMetadataService {
    client: Arc<SchedulesDirectClient>,
    tokens: Arc<TokenManager>,
}

impl SdMetadataService {
    pub fn new(client: Arc<SchedulesDirectClient>, tokens: Arc<TokenManager>) -> Self {
        Self { client, tokens }
    }
}

#[async_trait]
impl MetadataProvider for SdMetadataService {
    async fn fetch_metadata(&self, program_id: &str) -> Result<ProgramMetadata, FetchError> {
        let token = self.tokens.token().await?;
        let url = self.client.endpoint("metadata/programs/")?;
        let response = self
            .client
            .http
            .post(url)
            .header("token", token)
            .json(&json!([program_id]))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::upstream(format!(
                "metadata request returned {}",
                response.status()
            )));
        }

        let entries: Vec<ArtworkResponseEntry> = response
            .json()
            .await
            .map_err(|e| FetchError::upstream(format!("malformed metadata response: {e}")))?;

        for entry in entries {
            if entry.program_id != program_id {
                continue;
            }
            match entry.data {
                ArtworkData::Images(artwork) => {
                    return Ok(ProgramMetadata {
                        program_id: program_id.to_string(),
                        titles: Vec::new(),
                        artwork,
                    });
                }
                ArtworkData::Error(e) => {
                    warn!(program_id, code = e.code, message = %e.message, "upstream has no artwork for program");
                    return Ok(ProgramMetadata {
                        program_id: program_id.to_string(),
                        ..Default::default()
                    });
                }
            }
        }

        Err(FetchError::upstream(format!(
            "metadata response had no entry for {program_id}"
        )))
    }
}

/// Normalized image id for a candidate locator: the last path segment with
/// any `.jpg` suffix stripped. Bare ids pass through.
pub fn image_id_from_uri(uri: &str) -> String {
    let uri = uri.trim();
    if uri.starts_with("http://") || uri.starts_with("https://") {
        if let Ok(parsed) = Url::parse(uri) {
            if let Some(last) = parsed
                .path_segments()
                .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            {
                return last.trim_end_matches(".jpg").to_string();
            }
        }
    }
    uri.trim_end_matches(".jpg").to_string()
}

/// Build the final fetch URL for a candidate locator, attaching the current
/// token. Full URLs keep their path but get the fresh token (replacing any
/// stale one embedded upstream); bare ids expand against the image
/// endpoint. Returns `(image_id, image_url)`.
pub fn image_fetch_url(base: &Url, uri: &str, token: &str) -> (String, String) {
    let image_id = image_id_from_uri(uri);

    if uri.starts_with("http://") || uri.starts_with("https://") {
        if let Ok(mut parsed) = Url::parse(uri) {
            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(k, _)| k != "token")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            {
                let mut query = parsed.query_pairs_mut();
                query.clear();
                for (k, v) in &pairs {
                    query.append_pair(k, v);
                }
                query.append_pair("token", token);
            }
            return (image_id, parsed.to_string());
        }
    }

    let url = base
        .join(&format!("image/{image_id}.jpg"))
        .map(|mut u| {
            u.query_pairs_mut().append_pair("token", token);
            u.to_string()
        })
        .unwrap_or_else(|_| format!("{base}image/{image_id}.jpg?token={token}"));
    (image_id, url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://json.schedulesdirect.org/20141201/").unwrap()
    }

    #[test]
    fn image_id_strips_path_and_extension() {
        assert_eq!(image_id_from_uri("abcd1234.jpg"), "abcd1234");
        assert_eq!(image_id_from_uri("abcd1234"), "abcd1234");
        assert_eq!(
            image_id_from_uri(
                "https://json.schedulesdirect.org/20141201/image/abcd1234.jpg?token=stale"
            ),
            "abcd1234"
        );
    }

    #[test]
    fn fetch_url_expands_bare_ids() {
        let (id, url) = image_fetch_url(&base(), "abcd1234", "tok");
        assert_eq!(id, "abcd1234");
        assert_eq!(
            url,
            "https://json.schedulesdirect.org/20141201/image/abcd1234.jpg?token=tok"
        );
    }

    #[test]
    fn fetch_url_replaces_stale_tokens() {
        let (id, url) = image_fetch_url(
            &base(),
            "https://json.schedulesdirect.org/20141201/image/abcd1234.jpg?token=stale",
            "fresh",
        );
        assert_eq!(id, "abcd1234");
        assert!(url.contains("token=fresh"));
        assert!(!url.contains("stale"));
    }

    #[test]
    fn login_classification_covers_the_taxonomy() {
        let ok = classify_login(LoginResponse {
            code: 0,
            message: "OK".to_string(),
            token: "tok".to_string(),
            token_expires: Utc::now().timestamp() + 86_400,
            server_time: None,
        })
        .unwrap();
        assert_eq!(ok.token, "tok");

        let lockout = classify_login(LoginResponse {
            code: CODE_TOO_MANY_LOGINS,
            message: "Too many logins".to_string(),
            token: String::new(),
            token_expires: 0,
            server_time: None,
        });
        assert!(matches!(lockout, Err(FetchError::LoginLockout { .. })));

        let failure = classify_login(LoginResponse {
            code: 4003,
            message: "invalid credentials".to_string(),
            token: String::new(),
            token_expires: 0,
            server_time: None,
        });
        assert!(matches!(failure, Err(FetchError::Upstream(_))));
    }

    #[test]
    fn quota_messages_are_recognized() {
        assert!(is_quota_message(
            b"{\"message\":\"You have exceeded the maximum image downloads for today\"}"
        ));
        assert!(is_quota_message(b"image quota reached"));
        assert!(!is_quota_message(b"\xff\xd8\xff\xe0 jpeg bytes"));
        assert!(!is_quota_message(b"{\"message\":\"not found\"}"));
    }
}
