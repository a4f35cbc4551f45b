use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One artwork option offered by the upstream metadata for a program.
///
/// Upstream dimensions are occasionally missing or zero; zero means
/// "unknown" and loses every width tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCandidate {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub aspect: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Artwork specificity: "Series", "Season" or "Episode".
    #[serde(default)]
    pub tier: String,
}

/// Artwork metadata for a single program, as supplied by the metadata
/// collaborator. Titles are carried for override matching only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramMetadata {
    pub program_id: String,
    #[serde(default)]
    pub titles: Vec<String>,
    #[serde(default)]
    pub artwork: Vec<ImageCandidate>,
}

/// Durable program -> image mapping, one entry per program id.
///
/// `lastRequestUnix` is refreshed on every serve and drives both the cache
/// TTL and the eviction sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "imageID")]
    pub image_id: String,
    #[serde(rename = "lastRequestUnix", default, skip_serializing_if = "is_zero")]
    pub last_request_unix: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl IndexEntry {
    pub fn last_request(&self) -> Option<DateTime<Utc>> {
        if self.last_request_unix <= 0 {
            return None;
        }
        Utc.timestamp_opt(self.last_request_unix, 0).single()
    }
}

/// Bearer credential obtained from the upstream login exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginSession {
    pub token: String,
    #[serde(rename = "token_expiry_utc")]
    pub expires_at: DateTime<Utc>,
}

impl LoginSession {
    /// Whether the token is still usable at `now`, keeping a safety margin
    /// so it never expires mid-request.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        now < self.expires_at - margin
    }
}

/// Upstream login response body.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub token: String,
    #[serde(rename = "tokenExpires", default)]
    pub token_expires: i64,
    /// Server wall-clock time, used to anchor quota-reset deadlines.
    #[serde(rename = "datetime", default)]
    pub server_time: Option<DateTime<Utc>>,
}

/// One entry of the upstream `metadata/programs` response. The `data` field
/// is either the artwork list or an error object for that program id.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtworkResponseEntry {
    #[serde(rename = "programID", default)]
    pub program_id: String,
    #[serde(default)]
    pub data: ArtworkData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArtworkData {
    Images(Vec<ImageCandidate>),
    Error(ArtworkError),
}

impl Default for ArtworkData {
    fn default() -> Self {
        ArtworkData::Images(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtworkError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}
