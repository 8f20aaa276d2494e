use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Level, info};

use crate::platform::{NativePlatform, Platform};

pub const CONFIG_FILE: &str = "signdeck.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Filled in by `load`; a value in the file is ignored.
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub db_path: Option<PathBuf>,

    #[serde(default)]
    pub signer_workdir: Option<PathBuf>,

    #[serde(default)]
    pub session_dir: Option<PathBuf>,

    #[serde(default)]
    pub logs_dir: Option<PathBuf>,

    /// IANA zone the cron triggers fire in.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_signer_bin")]
    pub signer_bin: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,
}

/// API credentials handed to the signer as `TG_API_ID` / `TG_API_HASH`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_tg_api_id")]
    pub api_id: String,

    #[serde(default = "default_tg_api_hash")]
    pub api_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    #[serde(default = "default_live_buffer_lines")]
    pub live_buffer_lines: usize,

    #[serde(default = "default_live_grace_secs")]
    pub live_grace_secs: u64,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    #[serde(default = "default_maintenance_cron")]
    pub maintenance_cron: String,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_signer_bin() -> String {
    "tg-signer".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_tg_api_id() -> String {
    "611335".to_string()
}
fn default_tg_api_hash() -> String {
    "d524b414d21f4d37f08684c1df41ac9c".to_string()
}
fn default_run_timeout_secs() -> u64 {
    300
}
fn default_live_buffer_lines() -> usize {
    500
}
fn default_live_grace_secs() -> u64 {
    60
}
fn default_history_limit() -> usize {
    100
}
fn default_retention_days() -> i64 {
    3
}
fn default_maintenance_cron() -> String {
    "0 3 * * *".to_string()
}
fn default_sweep_interval_secs() -> u64 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: default_run_timeout_secs(),
            live_buffer_lines: default_live_buffer_lines(),
            live_grace_secs: default_live_grace_secs(),
            history_limit: default_history_limit(),
            retention_days: default_retention_days(),
            maintenance_cron: default_maintenance_cron(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_id: default_tg_api_id(),
            api_hash: default_tg_api_hash(),
        }
    }
}

impl EngineConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn live_grace(&self) -> Duration {
        Duration::from_secs(self.live_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Settings {
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: data_dir.as_ref().to_path_buf(),
            db_path: None,
            signer_workdir: None,
            session_dir: None,
            logs_dir: None,
            timezone: default_timezone(),
            signer_bin: default_signer_bin(),
            log_level: default_log_level(),
            engine: EngineConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }

    /// Load settings for the platform data directory.
    pub async fn load_default() -> Result<Self> {
        Self::load(NativePlatform::data_dir()).await
    }

    /// Read `signdeck.toml` from `data_dir` (defaults when absent), then apply
    /// `SIGNDECK_*` environment overrides.
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let config_path = data_dir.join(CONFIG_FILE);
        let mut settings = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("reading {}", config_path.display()))?;
            let mut parsed: Settings = toml::from_str(&content)
                .with_context(|| format!("parsing {}", config_path.display()))?;
            parsed.data_dir = data_dir;
            info!("Loaded settings from {}", config_path.display());
            parsed
        } else {
            Self::with_data_dir(data_dir)
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub(crate) fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SIGNDECK_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("SIGNDECK_PORT").and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Some(tz) = lookup("SIGNDECK_TIMEZONE") {
            self.timezone = tz;
        }
        if let Some(bin) = lookup("SIGNDECK_SIGNER_BIN") {
            self.signer_bin = bin;
        }
        if let Some(level) = lookup("SIGNDECK_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(api_id) = lookup("SIGNDECK_TG_API_ID").filter(|v| !v.trim().is_empty()) {
            self.telegram.api_id = api_id;
        }
        if let Some(api_hash) = lookup("SIGNDECK_TG_API_HASH").filter(|v| !v.trim().is_empty()) {
            self.telegram.api_hash = api_hash;
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("db.sqlite"))
    }

    pub fn signer_workdir(&self) -> PathBuf {
        self.signer_workdir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(".signer"))
    }

    pub fn session_dir(&self) -> PathBuf {
        self.session_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sessions"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.logs_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn signs_dir(&self) -> PathBuf {
        self.signer_workdir().join("signs")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.signer_workdir().join("history")
    }

    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("invalid timezone '{}': {}", self.timezone, e))
    }

    pub fn level(&self) -> Level {
        self.log_level.parse().unwrap_or(Level::INFO)
    }

    pub fn is_loopback(&self) -> bool {
        is_loopback_host(&self.host)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let db_parent = self.db_path().parent().map(Path::to_path_buf);
        let dirs = [
            Some(self.data_dir.clone()),
            Some(self.signer_workdir()),
            Some(self.signs_dir()),
            Some(self.history_dir()),
            Some(self.session_dir()),
            Some(self.logs_dir()),
            db_parent,
        ];
        for dir in dirs.into_iter().flatten() {
            if dir.as_os_str().is_empty() {
                continue;
            }
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        NativePlatform::restrict_dir_permissions(&self.data_dir);
        NativePlatform::restrict_dir_permissions(&self.session_dir());
        Ok(())
    }
}

pub fn is_loopback_host(host: &str) -> bool {
    host == "127.0.0.1" || host == "::1" || host == "localhost"
}
