//! Engine configuration.
//!
//! Everything the engine needs from its surroundings (API location,
//! credentials, the acting user) is passed in through [`EngineConfig`]; the
//! engine never reads ambient storage on its own. A config can be built from
//! JSON, from `SETTLEMENT_*` environment variables, or from a dashboard
//! connection string (raw or base64 JSON with `url`, `key`, `user`).

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

const DEFAULT_API_PREFIX: &str = "/api/settlement";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const ENV_API_URL: &str = "SETTLEMENT_API_URL";
const ENV_API_KEY: &str = "SETTLEMENT_API_KEY";
const ENV_CREATED_BY: &str = "SETTLEMENT_CREATED_BY";
const ENV_TIMEOUT_SECS: &str = "SETTLEMENT_TIMEOUT_SECS";
const ENV_LOG_DIR: &str = "SETTLEMENT_LOG_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub filter: String,
    /// Directory for daily rolling log files. Console only when `None`.
    pub dir: Option<PathBuf>,
    /// Number of rolled files to keep.
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,settlement_engine=debug".to_string(),
            dir: None,
            max_files: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub api_base_url: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Recorded as `createdBy` on every batch this engine creates.
    pub created_by: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_api_prefix() -> String {
    DEFAULT_API_PREFIX.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl EngineConfig {
    pub fn new(api_base_url: &str, created_by: &str) -> Self {
        Self {
            api_base_url: normalize_base_url(api_base_url),
            api_prefix: default_api_prefix(),
            api_key: None,
            created_by: created_by.trim().to_string(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            log: LogConfig::default(),
        }
    }

    pub fn from_json_str(raw: &str) -> EngineResult<Self> {
        let mut cfg: Self =
            serde_json::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))?;
        cfg.api_base_url = normalize_base_url(&cfg.api_base_url);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> EngineResult<Self> {
        let url = std::env::var(ENV_API_URL)
            .map_err(|_| EngineError::Config(format!("{ENV_API_URL} is not set")))?;
        let created_by = std::env::var(ENV_CREATED_BY)
            .map_err(|_| EngineError::Config(format!("{ENV_CREATED_BY} is not set")))?;

        let mut cfg = Self::new(&url, &created_by);
        cfg.api_key = std::env::var(ENV_API_KEY)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        if let Ok(raw) = std::env::var(ENV_TIMEOUT_SECS) {
            cfg.request_timeout_secs = raw.trim().parse().map_err(|_| {
                EngineError::Config(format!("{ENV_TIMEOUT_SECS} must be a number of seconds"))
            })?;
        }
        cfg.log.dir = std::env::var(ENV_LOG_DIR).ok().map(PathBuf::from);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build a config from a dashboard connection string. `created_by` wins
    /// over the string's `user` field when given.
    pub fn from_connection_string(raw: &str, created_by: Option<&str>) -> EngineResult<Self> {
        let payload = decode_connection_string(raw)
            .ok_or_else(|| EngineError::Config("unreadable connection string".into()))?;
        let url = payload
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Config("connection string has no url".into()))?;
        let user = created_by
            .map(str::to_string)
            .or_else(|| {
                payload
                    .get("user")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let mut cfg = Self::new(url, &user);
        cfg.api_key = payload
            .get("key")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(EngineError::Config("missing settlement API URL".into()));
        }
        if self.created_by.trim().is_empty() {
            return Err(EngineError::Config("missing createdBy user".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(EngineError::Config("request timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Absolute URL for a route below the API prefix, e.g. `batches/42`.
    pub fn endpoint(&self, route: &str) -> String {
        let prefix = self.api_prefix.trim_matches('/');
        let route = route.trim_start_matches('/');
        if prefix.is_empty() {
            format!("{}/{route}", self.api_base_url)
        } else {
            format!("{}/{prefix}/{route}", self.api_base_url)
        }
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Give a bare host a scheme (http for loopback, https otherwise) and drop
/// trailing slashes. Path segments are kept; `api_prefix` is joined on top.
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.contains("://") {
        return trimmed.to_string();
    }
    let loopback = ["localhost", "127.0.0.1", "[::1]"]
        .iter()
        .any(|host| trimmed.starts_with(host));
    format!("{}://{trimmed}", if loopback { "http" } else { "https" })
}

/// Raw JSON, or JSON in any base64 alphabet with or without padding.
fn decode_connection_string(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str(&compact).ok();
    }
    let decoded = [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(&compact).ok())?;
    serde_json::from_slice(&decoded).ok()
}
