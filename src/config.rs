use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

/// Env var naming an optional YAML config file.
pub const CONFIG_ENV: &str = "DATAQUERY_CONFIG";

/// Runtime settings: defaults, then an optional YAML file, then env vars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the persisted `rows/` and `logs/` tables.
    pub data_dir: PathBuf,
    /// Keep everything in memory; nothing is written to `data_dir`.
    pub in_memory: bool,
    pub port: u16,
    pub log_level: String,
    pub username: String,
    pub password: String,
    /// Pre-shared bearer tokens accepted alongside Basic credentials.
    pub api_tokens: Vec<String>,
    /// Seconds between background vacuums; 0 disables them.
    pub vacuum_interval_secs: u64,
    pub max_upload_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            in_memory: false,
            port: 8080,
            log_level: "info".to_string(),
            username: "admin".to_string(),
            password: "password".to_string(),
            api_tokens: Vec::new(),
            vacuum_interval_secs: 30,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load from `$DATAQUERY_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self> {
        let mut config = match env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing config file {:?}", path))
    }

    /// Override fields from environment-style lookups.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("DATAQUERY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("DATAQUERY_IN_MEMORY") {
            self.in_memory = matches!(flag.trim(), "1" | "true" | "yes");
        }
        if let Some(port) = lookup("PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("PORT={:?} is not a valid port", port))?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(user) = lookup("DATAQUERY_USERNAME") {
            self.username = user;
        }
        if let Some(pass) = lookup("DATAQUERY_PASSWORD") {
            self.password = pass;
        }
        if let Some(tokens) = lookup("DATAQUERY_TOKENS") {
            self.api_tokens = tokens
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(secs) = lookup("DATAQUERY_VACUUM_SECS") {
            self.vacuum_interval_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("DATAQUERY_VACUUM_SECS={:?} is not a number", secs))?;
        }
        Ok(())
    }

    pub fn vacuum_interval(&self) -> Option<Duration> {
        (self.vacuum_interval_secs > 0).then(|| Duration::from_secs(self.vacuum_interval_secs))
    }

    /// True while the built-in demo credentials are still in use.
    pub fn uses_default_credentials(&self) -> bool {
        let default = Self::default();
        self.username == default.username && self.password == default.password
    }
}
