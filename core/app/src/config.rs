//! Application configuration file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use snapmatch_common::{Error, Result};
use snapmatch_jobs::{MatcherCommand, DEFAULT_TIMEOUT, MAX_TIMEOUT};
use snapmatch_storage::StorageConfig;

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "SNAPMATCH_CONFIG";

const APP_DIR: &str = "snapmatch";
const CONFIG_FILE: &str = "config.json";
const LEDGER_FILE: &str = "ledger.json";

fn default_storage() -> StorageConfig {
    StorageConfig::local_only()
}

fn default_mirror_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_url_ttl_secs() -> u64 {
    3600
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,
    /// Root of the local mirror.
    #[serde(default = "default_mirror_root")]
    pub mirror_root: PathBuf,
    /// Defaults to `{mirror_root}/ledger.json`.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub matcher: MatcherConfig,
    /// Lifetime of generated links.
    #[serde(default = "default_url_ttl_secs")]
    pub url_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            mirror_root: default_mirror_root(),
            ledger_path: None,
            matcher: MatcherConfig::default(),
            url_ttl_secs: default_url_ttl_secs(),
        }
    }
}

impl AppConfig {
    /// `$SNAPMATCH_CONFIG`, else `{config_dir}/snapmatch/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load and validate a configuration file.
    ///
    /// # Errors
    /// - `Configuration` if the file is missing, malformed, or invalid
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::Configuration(format!(
                    "Configuration file not found: {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| Error::Configuration(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        fs::write(path, json).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.provider.trim().is_empty() {
            return Err(Error::Configuration(
                "storage.provider must not be empty".to_string(),
            ));
        }
        if self.mirror_root.as_os_str().is_empty() {
            return Err(Error::Configuration("mirror_root must not be empty".to_string()));
        }
        if self.url_ttl_secs == 0 {
            return Err(Error::Configuration("url_ttl_secs must be positive".to_string()));
        }
        self.matcher.validate()
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.mirror_root.join(LEDGER_FILE))
    }

    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_secs)
    }
}

fn default_program() -> String {
    "python3".to_string()
}

fn default_args() -> Vec<String> {
    vec!["fast_face_match.py".to_string()]
}

fn default_threshold() -> Option<f64> {
    Some(0.6)
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

/// How to run the external matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Match distance threshold passed after the event root. Lower is stricter.
    #[serde(default = "default_threshold")]
    pub threshold: Option<f64>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            threshold: default_threshold(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl MatcherConfig {
    fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(Error::Configuration("matcher.program must not be empty".to_string()));
        }
        if self.timeout_secs == 0 || self.timeout_secs > MAX_TIMEOUT.as_secs() {
            return Err(Error::Configuration(format!(
                "matcher.timeout_secs must be between 1 and {}, got {}",
                MAX_TIMEOUT.as_secs(),
                self.timeout_secs
            )));
        }
        if let Some(threshold) = self.threshold {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(Error::Configuration(format!(
                    "matcher.threshold must be a non-negative number, got {}",
                    threshold
                )));
            }
        }
        Ok(())
    }

    pub fn command(&self) -> MatcherCommand {
        let command = MatcherCommand::new(&self.program)
            .args(self.args.iter().cloned())
            .with_timeout(Duration::from_secs(self.timeout_secs));
        match self.threshold {
            Some(threshold) => command.with_threshold(threshold),
            None => command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_json(r#"{"mirror_root": "/srv/snapmatch"}"#).unwrap();

        assert_eq!(config.storage.provider, "local");
        assert_eq!(config.ledger_path(), PathBuf::from("/srv/snapmatch/ledger.json"));
        assert_eq!(config.url_ttl(), Duration::from_secs(3600));

        let command = config.matcher.command();
        assert_eq!(command.program, "python3");
        assert_eq!(command.args, vec!["fast_face_match.py"]);
        assert_eq!(command.threshold, Some(0.6));
        assert_eq!(command.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "storage": {
                "provider": "s3",
                "required": false,
                "settings": { "bucket": "photos", "region": "eu-west-1" }
            },
            "mirror_root": "/data",
            "ledger_path": "/state/ledger.json",
            "matcher": { "program": "/usr/bin/match", "args": [], "threshold": null, "timeout_secs": 60 },
            "url_ttl_secs": 600
        }"#;
        let config = AppConfig::from_json(json).unwrap();

        assert_eq!(config.storage.provider, "s3");
        assert!(!config.storage.required);
        assert_eq!(config.storage.settings["bucket"], "photos");
        assert_eq!(config.ledger_path(), PathBuf::from("/state/ledger.json"));
        assert_eq!(config.matcher.command().threshold, None);
        assert_eq!(config.matcher.command().timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for json in [
            r#"{"storage": {"provider": ""}}"#,
            r#"{"url_ttl_secs": 0}"#,
            r#"{"matcher": {"timeout_secs": 0}}"#,
            r#"{"matcher": {"timeout_secs": 18446744073709551615}}"#,
            r#"{"matcher": {"timeout_secs": 604801}}"#,
            r#"{"matcher": {"threshold": -1.0}}"#,
            r#"{"mirror_root": 5}"#,
        ] {
            assert!(
                matches!(AppConfig::from_json(json), Err(Error::Configuration(_))),
                "{}",
                json
            );
        }
    }

    #[test]
    fn test_longest_timeout_is_accepted() {
        let config = AppConfig::from_json(r#"{"matcher": {"timeout_secs": 604800}}"#).unwrap();
        assert_eq!(config.matcher.command().timeout, MAX_TIMEOUT);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/config.json");
        let config = AppConfig {
            mirror_root: temp.path().join("mirror"),
            ..AppConfig::default()
        };

        config.save(&path).await.unwrap();
        let loaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(loaded.mirror_root, config.mirror_root);
    }

    #[tokio::test]
    async fn test_missing_file_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        let result = AppConfig::load(temp.path().join("absent.json")).await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
