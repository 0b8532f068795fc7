use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "COACH_LEDGER_CONFIG";

const MIN_SYNC_DELAY_MS: u64 = 0;
const MAX_SYNC_DELAY_MS: u64 = 60_000;
const MIN_SYNC_INTERVAL_SECS: u64 = 60;
const MAX_SYNC_INTERVAL_SECS: u64 = 7 * 24 * 3600;
const MIN_REPORT_MONTHS: u32 = 1;
const MAX_REPORT_MONTHS: u32 = 12;
const MIN_BATCH_SECS: u64 = 10;
const MAX_BATCH_SECS: u64 = 3_600;
const MAX_REFRESH_BUFFER_SECS: i64 = 3_600;
const MAX_STALE_AFTER_HOURS: i64 = 24 * 90;
const MIN_HTTP_TIMEOUT_MS: u64 = 1_000;
const MAX_HTTP_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct ServiceConfig {
    pub app_env: String,
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub cron_secret: Option<String>,
    pub token_encryption_key: Option<String>,
    pub xero: XeroConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct XeroConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub identity_url: String,
    pub api_url: String,
    pub http_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct SyncConfig {
    /// Pause between connections in a batch run.
    pub delay_between_connections_ms: u64,
    /// Tokens expiring sooner than this are refreshed before use.
    pub refresh_buffer_secs: i64,
    /// Months covered by each P&L fetch, current month included.
    pub report_months: u32,
    /// In-process trigger for the batch run; `None` leaves it to an external cron.
    pub interval_secs: Option<u64>,
    /// Connections not synced within this window count as stale in the health report.
    pub stale_after_hours: i64,
    /// Wall-clock budget for one batch; connections left when it runs out are skipped.
    pub max_batch_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            app_env: "development".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
            database_path: PathBuf::from("coach-ledger.sqlite"),
            log_dir: None,
            cron_secret: None,
            token_encryption_key: None,
            xero: XeroConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for XeroConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: "http://localhost:8080/api/xero/callback".to_string(),
            identity_url: "https://identity.xero.com".to_string(),
            api_url: "https://api.xero.com".to_string(),
            http_timeout_ms: 30_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            delay_between_connections_ms: 500,
            refresh_buffer_secs: 300,
            report_months: 12,
            interval_secs: None,
            stale_after_hours: 26,
            max_batch_secs: 300,
        }
    }
}

impl ServiceConfig {
    /// Defaults, then the YAML file named by `COACH_LEDGER_CONFIG`, then env overrides.
    pub fn load() -> AppResult<Self> {
        let mut config = match env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Config(format!("{}: {}", path.display(), error)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(value) = get("APP_ENV") {
            self.app_env = value;
        }
        if let Some(value) = get("BIND_ADDR") {
            self.bind_addr = value;
        }
        if let Some(value) = get("DATABASE_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = get("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = get("CRON_SECRET") {
            self.cron_secret = Some(value);
        }
        if let Some(value) = get("TOKEN_ENCRYPTION_KEY") {
            self.token_encryption_key = Some(value);
        }
        if let Some(value) = get("XERO_CLIENT_ID") {
            self.xero.client_id = value;
        }
        if let Some(value) = get("XERO_CLIENT_SECRET") {
            self.xero.client_secret = value;
        }
        if let Some(value) = get("XERO_REDIRECT_URI") {
            self.xero.redirect_uri = value;
        }
        if let Some(value) = get("XERO_IDENTITY_URL") {
            self.xero.identity_url = value;
        }
        if let Some(value) = get("XERO_API_URL") {
            self.xero.api_url = value;
        }
        if let Some(value) = get("SYNC_DELAY_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.sync.delay_between_connections_ms = value;
        }
        if let Some(value) = get("SYNC_MAX_BATCH_SECS").and_then(|v| v.parse::<u64>().ok()) {
            self.sync.max_batch_secs = value;
        }
        if let Some(value) = get("SYNC_INTERVAL_SECS").and_then(|v| v.parse::<u64>().ok()) {
            self.sync.interval_secs = if value == 0 { None } else { Some(value) };
        }
    }

    fn normalize(&mut self) {
        self.sync.delay_between_connections_ms = self
            .sync
            .delay_between_connections_ms
            .clamp(MIN_SYNC_DELAY_MS, MAX_SYNC_DELAY_MS);
        self.sync.report_months = self.sync.report_months.clamp(MIN_REPORT_MONTHS, MAX_REPORT_MONTHS);
        self.sync.interval_secs = self
            .sync
            .interval_secs
            .map(|secs| secs.clamp(MIN_SYNC_INTERVAL_SECS, MAX_SYNC_INTERVAL_SECS));
        self.sync.refresh_buffer_secs = self.sync.refresh_buffer_secs.clamp(0, MAX_REFRESH_BUFFER_SECS);
        self.sync.stale_after_hours = self.sync.stale_after_hours.clamp(1, MAX_STALE_AFTER_HOURS);
        self.sync.max_batch_secs = self.sync.max_batch_secs.clamp(MIN_BATCH_SECS, MAX_BATCH_SECS);
        self.xero.http_timeout_ms = self.xero.http_timeout_ms.clamp(MIN_HTTP_TIMEOUT_MS, MAX_HTTP_TIMEOUT_MS);
        self.xero.identity_url = self.xero.identity_url.trim_end_matches('/').to_string();
        self.xero.api_url = self.xero.api_url.trim_end_matches('/').to_string();
    }

    fn validate(&self) -> AppResult<()> {
        if self.is_production() && self.cron_secret.is_none() {
            return Err(AppError::Config("CRON_SECRET is required in production".to_string()));
        }
        if self.token_encryption_key.is_none() {
            return Err(AppError::Config("TOKEN_ENCRYPTION_KEY is not set".to_string()));
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }
}

#[cfg(test)]
mod tests {
    use super::ServiceConfig;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn yaml_overrides_defaults_and_keeps_the_rest() {
        let config = ServiceConfig::from_yaml(
            "bind_addr: 0.0.0.0:9000\nsync:\n  delay_between_connections_ms: 250\n",
        )
        .expect("parse yaml");
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.sync.delay_between_connections_ms, 250);
        assert_eq!(config.sync.refresh_buffer_secs, 300);
        assert_eq!(config.xero.identity_url, "https://identity.xero.com");
    }

    #[test]
    fn env_overrides_win_and_blank_values_are_ignored() {
        let mut config = ServiceConfig::default();
        config.apply_env(lookup(&[
            ("CRON_SECRET", "s3cret"),
            ("XERO_CLIENT_ID", "  "),
            ("SYNC_INTERVAL_SECS", "0"),
            ("SYNC_DELAY_MS", "10"),
        ]));
        assert_eq!(config.cron_secret.as_deref(), Some("s3cret"));
        assert!(config.xero.client_id.is_empty());
        assert_eq!(config.sync.interval_secs, None);
        assert_eq!(config.sync.delay_between_connections_ms, 10);
    }

    #[test]
    fn numeric_knobs_are_clamped() {
        let mut config = ServiceConfig::default();
        config.sync.report_months = 40;
        config.sync.interval_secs = Some(5);
        config.sync.max_batch_secs = 1;
        config.sync.refresh_buffer_secs = i64::MAX;
        config.sync.stale_after_hours = i64::MAX;
        config.xero.api_url = "https://api.xero.com/".to_string();
        config.normalize();
        assert_eq!(config.sync.report_months, 12);
        assert_eq!(config.sync.interval_secs, Some(60));
        assert_eq!(config.sync.max_batch_secs, 10);
        assert_eq!(config.sync.refresh_buffer_secs, 3_600);
        assert_eq!(config.sync.stale_after_hours, 24 * 90);
        assert_eq!(config.xero.api_url, "https://api.xero.com");
    }

    #[test]
    fn production_requires_cron_secret() {
        let mut config = ServiceConfig::default();
        config.app_env = "production".to_string();
        config.token_encryption_key = Some("key".to_string());
        let err = config.validate().expect_err("missing secret should fail");
        assert!(err.to_string().contains("CRON_SECRET"));

        config.cron_secret = Some("secret".to_string());
        config.validate().expect("valid production config");
    }
}
