use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub upstream: UpstreamConfig,
    pub images: ImageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Cached poster files, one `<imageID>.jpg` per image.
    pub cache_dir: PathBuf,
    /// Sidecar state: index, token, overrides, blocklist.
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub username: String,
    /// SHA1-hashed per upstream API requirements.
    pub password: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Required poster aspect label, e.g. "2x3"; "all" disables the filter.
    pub poster_aspect: String,
    /// Cache TTL in days; files are evicted at twice this age.
    pub max_age_days: i64,
    /// Hours between background eviction sweeps; 0 disables them (the
    /// startup sweep always runs).
    pub sweep_interval_hours: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                cache_dir: PathBuf::from("./data/posters"),
                state_dir: PathBuf::from("./data"),
            },
            upstream: UpstreamConfig {
                base_url: "https://json.schedulesdirect.org/20141201/".to_string(),
                username: String::new(),
                password: String::new(),
                timeout_seconds: 20,
            },
            images: ImageConfig {
                poster_aspect: "2x3".to_string(),
                max_age_days: 30,
                sweep_interval_hours: 24,
            },
        }
    }
}

impl Config {
    /// Load the TOML config, writing a default file on first run.
    pub fn load(config_file: &str) -> Result<Self> {
        if std::path::Path::new(config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            Ok(default_config)
        }
    }

    pub fn index_path(&self) -> PathBuf {
        self.storage.state_dir.join("poster-index.json")
    }

    pub fn token_path(&self) -> PathBuf {
        self.storage.state_dir.join("sd-token.json")
    }

    pub fn overrides_path(&self) -> PathBuf {
        self.storage.state_dir.join("overrides.txt")
    }

    pub fn blocklist_path(&self) -> PathBuf {
        self.storage.state_dir.join("blocklist.txt")
    }
}
