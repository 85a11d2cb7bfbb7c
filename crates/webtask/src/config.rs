//! Client configuration
//!
//! Loaded from YAML or JSON (format picked by file extension) and then
//! overridden from `WEBTASK_*` environment variables.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    /// Detect file format from extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> ClientResult<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => Ok(FileFormat::Yaml),
            Some("json") => Ok(FileFormat::Json),
            Some(ext) => Err(ClientError::Config(format!("Unsupported config format: {}", ext))),
            None => Err(ClientError::Config("Config file has no extension".to_string())),
        }
    }
}

/// Parse `content` as `format`
pub fn parse_content<T: DeserializeOwned>(content: &str, format: FileFormat) -> ClientResult<T> {
    match format {
        FileFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| ClientError::Config(format!("Invalid YAML: {}", e))),
        FileFormat::Json => serde_json::from_str(content)
            .map_err(|e| ClientError::Config(format!("Invalid JSON: {}", e))),
    }
}

/// Read and parse a configuration file
pub fn load_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> ClientResult<T> {
    let path = path.as_ref();
    let format = FileFormat::from_path(path)?;
    let content = fs::read_to_string(path)?;
    tracing::debug!(path = %path.display(), ?format, "Loading configuration");
    parse_content(&content, format)
}

/// Parse an environment variable, ignoring (with a warning) values that do not parse
pub fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment override");
                None
            }
        },
        Err(_) => None,
    }
}

/// Settings shared by every task a client creates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: Option<String>,
    /// Cap on basic/default authentication retries per task; 0 disables the cap
    pub max_auth_retry: u32,
    pub download_dir: PathBuf,
    pub relocation_timeout_ms: u64,
    pub default_headers: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            max_auth_retry: 0,
            download_dir: env::temp_dir().join("webtask-downloads"),
            relocation_timeout_ms: 30_000,
            default_headers: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ClientResult<Self> {
        load_file(path)
    }

    /// Defaults overridden from the environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `WEBTASK_BASE_URL`, `WEBTASK_MAX_AUTH_RETRY`,
    /// `WEBTASK_DOWNLOAD_DIR` and `WEBTASK_RELOCATION_TIMEOUT_MS`
    pub fn apply_env(&mut self) {
        if let Ok(base_url) = env::var("WEBTASK_BASE_URL") {
            self.base_url = Some(base_url);
        }
        if let Some(max) = env_parse("WEBTASK_MAX_AUTH_RETRY") {
            self.max_auth_retry = max;
        }
        if let Ok(dir) = env::var("WEBTASK_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(dir);
        }
        if let Some(ms) = env_parse("WEBTASK_RELOCATION_TIMEOUT_MS") {
            self.relocation_timeout_ms = ms;
        }
    }

    pub fn relocation_timeout(&self) -> Duration {
        Duration::from_millis(self.relocation_timeout_ms)
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.relocation_timeout_ms == 0 {
            return Err(ClientError::Config(
                "relocation_timeout_ms must be greater than zero".to_string(),
            ));
        }
        for name in self.default_headers.keys() {
            http::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ClientError::InvalidHeader(name.clone()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_format_detection() {
        assert_eq!(FileFormat::from_path("client.yaml").unwrap(), FileFormat::Yaml);
        assert_eq!(FileFormat::from_path("client.yml").unwrap(), FileFormat::Yaml);
        assert_eq!(FileFormat::from_path("client.json").unwrap(), FileFormat::Json);
        assert!(FileFormat::from_path("client.toml").is_err());
        assert!(FileFormat::from_path("client").is_err());
    }

    #[test]
    fn test_load_yaml_config() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "base_url: https://api.example.com/v1\nmax_auth_retry: 3\ndefault_headers:\n  Accept: application/json"
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.base_url.as_deref(), Some("https://api.example.com/v1"));
        assert_eq!(config.max_auth_retry, 3);
        assert_eq!(config.default_headers["Accept"], "application/json");
        // Unspecified fields keep their defaults
        assert_eq!(config.relocation_timeout_ms, 30_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_json_config() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"download_dir": "/var/tmp/dl", "relocation_timeout_ms": 500}}"#).unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.download_dir, PathBuf::from("/var/tmp/dl"));
        assert_eq!(config.relocation_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_auth_retry, 0);
    }

    #[test]
    fn test_invalid_content_is_config_error() {
        let err = parse_content::<ClientConfig>("max_auth_retry: [", FileFormat::Yaml).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ClientConfig { relocation_timeout_ms: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.default_headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(config.validate(), Err(ClientError::InvalidHeader(_))));
    }

    #[test]
    fn test_env_overrides() {
        env::set_var("WEBTASK_MAX_AUTH_RETRY", "5");
        env::set_var("WEBTASK_RELOCATION_TIMEOUT_MS", "not-a-number");

        let mut config = ClientConfig::default();
        config.apply_env();
        assert_eq!(config.max_auth_retry, 5);
        assert_eq!(config.relocation_timeout_ms, 30_000);

        env::remove_var("WEBTASK_MAX_AUTH_RETRY");
        env::remove_var("WEBTASK_RELOCATION_TIMEOUT_MS");
    }
}
