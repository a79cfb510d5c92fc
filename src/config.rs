use std::{
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};

pub const DEFAULT_PORT: u16 = 7171;
pub const DEFAULT_EVENT_SHARDS: u32 = 8;
pub const DEFAULT_COUNTER_SHARDS: u32 = 4;
pub const DEFAULT_SCORE_CAP: f64 = 100.0;
pub const DEFAULT_PAYLOAD_BUDGET_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 350 * 1024;
pub const DEFAULT_EVENT_TTL_DAYS: i64 = 90;
pub const DEFAULT_AGGREGATE_TTL_DAYS: i64 = 180;
pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const DEFAULT_MAX_PAGE_LIMIT: usize = 500;
pub const DEFAULT_MAX_DAY_SPAN: i64 = 93;
pub const DEFAULT_RULEPACK_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Number of primary event partitions per day.
    pub event_shards: u32,
    /// Number of counter shards spreading one aggregate dimension value.
    pub counter_shards: u32,
    pub score_cap: f64,
    pub payload_budget_bytes: usize,
    pub max_request_bytes: usize,
    pub event_ttl_days: i64,
    pub aggregate_ttl_days: i64,
    pub page_limit: usize,
    pub max_page_limit: usize,
    pub max_day_span: i64,
    pub rulepack_ttl_secs: i64,
    pub default_locale: String,
    pub fallback_locale: String,
    /// When set, ingest requests must carry a valid signature header.
    pub ingest_signing_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            event_shards: DEFAULT_EVENT_SHARDS,
            counter_shards: DEFAULT_COUNTER_SHARDS,
            score_cap: DEFAULT_SCORE_CAP,
            payload_budget_bytes: DEFAULT_PAYLOAD_BUDGET_BYTES,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            event_ttl_days: DEFAULT_EVENT_TTL_DAYS,
            aggregate_ttl_days: DEFAULT_AGGREGATE_TTL_DAYS,
            page_limit: DEFAULT_PAGE_LIMIT,
            max_page_limit: DEFAULT_MAX_PAGE_LIMIT,
            max_day_span: DEFAULT_MAX_DAY_SPAN,
            rulepack_ttl_secs: DEFAULT_RULEPACK_TTL_SECS,
            default_locale: "en".to_string(),
            fallback_locale: "en-US".to_string(),
            ingest_signing_key: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub event_shards: Option<u32>,
    pub counter_shards: Option<u32>,
    pub score_cap: Option<f64>,
    pub payload_budget_bytes: Option<usize>,
    pub max_request_bytes: Option<usize>,
    pub event_ttl_days: Option<i64>,
    pub aggregate_ttl_days: Option<i64>,
    pub page_limit: Option<usize>,
    pub max_page_limit: Option<usize>,
    pub rulepack_ttl_secs: Option<i64>,
    pub default_locale: Option<String>,
    pub fallback_locale: Option<String>,
    pub ingest_signing_key: Option<String>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = env::current_dir().map_err(|err| TelemetryError::Config(err.to_string()))?;
    path.push(".threatdbx");
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        cfg.validate()?;
        cfg.ensure_data_dirs()?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        cfg.ensure_data_dirs()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_shards == 0 || self.counter_shards == 0 {
            return Err(TelemetryError::Config(
                "shard counts must be at least 1".to_string(),
            ));
        }
        if self.score_cap < 0.0 {
            return Err(TelemetryError::Config(
                "score_cap cannot be negative".to_string(),
            ));
        }
        if self.page_limit == 0 || self.max_page_limit < self.page_limit {
            return Err(TelemetryError::Config(
                "page limits must satisfy 0 < page_limit <= max_page_limit".to_string(),
            ));
        }
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(port) = update.port {
            self.port = port;
        }
        if let Some(dir) = update.data_dir {
            self.data_dir = dir;
        }
        if let Some(shards) = update.event_shards {
            self.event_shards = shards;
        }
        if let Some(shards) = update.counter_shards {
            self.counter_shards = shards;
        }
        if let Some(cap) = update.score_cap {
            self.score_cap = cap;
        }
        if let Some(bytes) = update.payload_budget_bytes {
            self.payload_budget_bytes = bytes;
        }
        if let Some(bytes) = update.max_request_bytes {
            self.max_request_bytes = bytes;
        }
        if let Some(days) = update.event_ttl_days {
            self.event_ttl_days = days;
        }
        if let Some(days) = update.aggregate_ttl_days {
            self.aggregate_ttl_days = days;
        }
        if let Some(limit) = update.page_limit {
            self.page_limit = limit;
        }
        if let Some(limit) = update.max_page_limit {
            self.max_page_limit = limit;
        }
        if let Some(secs) = update.rulepack_ttl_secs {
            self.rulepack_ttl_secs = secs;
        }
        if let Some(locale) = update.default_locale {
            self.default_locale = locale;
        }
        if let Some(locale) = update.fallback_locale {
            self.fallback_locale = locale;
        }
        if let Some(key) = update.ingest_signing_key {
            self.ingest_signing_key = if key.trim().is_empty() { None } else { Some(key) };
        }
        self.updated_at = Utc::now();
    }

    pub fn ensure_data_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(self.rulepack_dir())?;
        Ok(())
    }

    pub fn event_store_path(&self) -> PathBuf {
        self.data_dir.join("event_store")
    }

    pub fn rulepack_dir(&self) -> PathBuf {
        self.data_dir.join("rulepacks")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir.join("threatdbx.pid")
    }
}

fn default_data_dir() -> PathBuf {
    let Ok(current_dir) = env::current_dir() else {
        return PathBuf::from(".threatdbx");
    };
    current_dir.join(".threatdbx")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.port, cfg.port);
        assert_eq!(parsed.event_shards, cfg.event_shards);
        assert_eq!(parsed.default_locale, "en");
    }

    #[test]
    fn rejects_zero_shards() {
        let mut cfg = Config::default();
        cfg.event_shards = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn blank_signing_key_disables_signing() {
        let mut cfg = Config::default();
        cfg.apply_update(ConfigUpdate {
            ingest_signing_key: Some("  ".to_string()),
            ..ConfigUpdate::default()
        });
        assert!(cfg.ingest_signing_key.is_none());
    }
}
