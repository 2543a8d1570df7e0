// src/config/acquire.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::backoff::BackoffCfg;
use crate::ingest::types::Filter;

pub const ENV_CONFIG_PATH: &str = "TAP_CONFIG_PATH";

fn default_pacing_secs() -> f64 {
    2.0
}
fn default_rate_limit_cooldown_secs() -> f64 {
    60.0
}
fn default_error_cooldown_secs() -> f64 {
    30.0
}
fn default_empty_page_pause_secs() -> f64 {
    10.0
}
fn default_page_size() -> u32 {
    100
}

/// Tuning for one acquisition loop. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireConfig {
    /// Mandatory sleep before every search call.
    #[serde(default = "default_pacing_secs")]
    pub pacing_secs: f64,
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: f64,
    #[serde(default = "default_error_cooldown_secs")]
    pub error_cooldown_secs: f64,
    #[serde(default = "default_empty_page_pause_secs")]
    pub empty_page_pause_secs: f64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Ignore stored watermarks on the first walk.
    #[serde(default)]
    pub clean_start: bool,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            pacing_secs: default_pacing_secs(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            error_cooldown_secs: default_error_cooldown_secs(),
            empty_page_pause_secs: default_empty_page_pause_secs(),
            page_size: default_page_size(),
            clean_start: false,
        }
    }
}

impl AcquireConfig {
    /// Replace negative / non-finite durations with defaults, clamp the page size.
    pub fn sanitized(mut self) -> Self {
        fn fix(v: &mut f64, default: f64) {
            if !v.is_finite() || *v < 0.0 {
                *v = default;
            }
        }
        fix(&mut self.pacing_secs, default_pacing_secs());
        fix(
            &mut self.rate_limit_cooldown_secs,
            default_rate_limit_cooldown_secs(),
        );
        fix(&mut self.error_cooldown_secs, default_error_cooldown_secs());
        fix(
            &mut self.empty_page_pause_secs,
            default_empty_page_pause_secs(),
        );
        self.page_size = self.page_size.clamp(1, 100);
        self
    }

    pub fn backoff(&self) -> BackoffCfg {
        BackoffCfg {
            pacing: secs(self.pacing_secs),
            rate_limit_cooldown: secs(self.rate_limit_cooldown_secs),
            error_cooldown: secs(self.error_cooldown_secs),
        }
    }

    pub fn empty_page_pause(&self) -> Duration {
        secs(self.empty_page_pause_secs)
    }
}

fn secs(v: f64) -> Duration {
    Duration::try_from_secs_f64(v).unwrap_or_default()
}

/// File form: an `[acquire]` table plus a `[[filters]]` array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TapConfig {
    #[serde(default)]
    pub acquire: AcquireConfig,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl TapConfig {
    /// Sanitize tuning, reject filters that select nothing, collapse duplicates.
    pub fn validated(self) -> Result<Self> {
        let mut filters: Vec<Filter> = Vec::with_capacity(self.filters.len());
        for f in self.filters {
            if !f.is_meaningful() {
                return Err(anyhow!("filter needs a query or a geocode: {f}"));
            }
            if !filters.contains(&f) {
                filters.push(f);
            }
        }
        Ok(Self {
            acquire: self.acquire.sanitized(),
            filters,
        })
    }
}

/// Load from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<TapConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_config(&content, ext.as_str())?.validated()
}

/// Load using env var + fallbacks:
/// 1) $TAP_CONFIG_PATH
/// 2) config/tap.toml
/// 3) config/tap.json
pub fn load_config_default() -> Result<TapConfig> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_config_from(&pb);
        } else {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/tap.toml");
    if toml_p.exists() {
        return load_config_from(&toml_p);
    }
    let json_p = PathBuf::from("config/tap.json");
    if json_p.exists() {
        return load_config_from(&json_p);
    }
    Ok(TapConfig::default())
}

fn parse_config(s: &str, hint_ext: &str) -> Result<TapConfig> {
    let looks_json = s.trim_start().starts_with('{');
    if hint_ext == "json" || (hint_ext != "toml" && looks_json) {
        return serde_json::from_str(s).context("parsing JSON config");
    }
    toml::from_str(s).context("parsing TOML config")
}

/// API credentials. Either a ready access token, or a consumer key + secret pair that
/// can be traded for one.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    pub access_token: Option<String>,
}

impl Credentials {
    pub fn validate(self) -> Result<Self> {
        let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let c = Self {
            consumer_key: clean(self.consumer_key),
            consumer_secret: clean(self.consumer_secret),
            access_token: clean(self.access_token),
        };
        if c.access_token.is_none() && c.consumer_secret.is_none() {
            return Err(anyhow!("consumer secret or access token is required"));
        }
        if c.access_token.is_none() && c.consumer_key.is_none() {
            return Err(anyhow!("consumer key is required to obtain an access token"));
        }
        Ok(c)
    }
}
