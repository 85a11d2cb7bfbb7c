//! HTTP transport configuration

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use webtask::config::{env_parse, load_file};

use crate::error::{HttpResult, HttpTransportError};

/// Upper bound for any single timeout before a warning is logged
const MAX_REASONABLE_TIMEOUT_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_ms: u64,
    /// Per-request timeout; 0 falls back to `total_timeout_ms`
    pub read_timeout_ms: u64,
    /// Bound on a whole transfer, including challenge rounds and body streaming
    pub total_timeout_ms: u64,
    pub proxy_url: Option<String>,
    pub verify_peer: bool,
    pub user_agent: String,
    /// Where downloads are staged before relocation; a fresh temp dir if unset
    pub transient_dir: Option<PathBuf>,
    /// Authentication rounds per transfer before a 401 is delivered as is
    pub max_challenge_rounds: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            total_timeout_ms: 60_000,
            proxy_url: None,
            verify_peer: true,
            user_agent: format!("webtask/{}", env!("CARGO_PKG_VERSION")),
            transient_dir: None,
            max_challenge_rounds: 8,
        }
    }
}

impl HttpConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> HttpResult<Self> {
        Ok(load_file(path)?)
    }

    /// Apply `WEBTASK_HTTP_*` overrides
    pub fn apply_env(&mut self) {
        if let Some(ms) = env_parse("WEBTASK_HTTP_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("WEBTASK_HTTP_READ_TIMEOUT_MS") {
            self.read_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("WEBTASK_HTTP_TOTAL_TIMEOUT_MS") {
            self.total_timeout_ms = ms;
        }
        if let Ok(proxy) = env::var("WEBTASK_HTTP_PROXY") {
            self.proxy_url = Some(proxy).filter(|p| !p.is_empty());
        }
        if let Some(verify) = env_parse("WEBTASK_HTTP_VERIFY_PEER") {
            self.verify_peer = verify;
        }
        if let Ok(dir) = env::var("WEBTASK_HTTP_TRANSIENT_DIR") {
            self.transient_dir = Some(PathBuf::from(dir));
        }
    }

    /// Timeout applied to each individual request
    pub fn request_timeout(&self) -> Duration {
        if self.read_timeout_ms > 0 && self.read_timeout_ms <= self.total_timeout_ms {
            Duration::from_millis(self.read_timeout_ms)
        } else {
            Duration::from_millis(self.total_timeout_ms)
        }
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    pub fn validate(&self) -> HttpResult<()> {
        if self.connect_timeout_ms == 0 {
            return Err(HttpTransportError::InvalidConfig(
                "Connect timeout must be greater than 0".to_string(),
            ));
        }
        if self.total_timeout_ms == 0 {
            return Err(HttpTransportError::InvalidConfig(
                "Total timeout must be greater than 0".to_string(),
            ));
        }
        if self.connect_timeout_ms > self.total_timeout_ms {
            return Err(HttpTransportError::InvalidConfig(
                "Connect timeout cannot be greater than total timeout".to_string(),
            ));
        }
        if self.read_timeout_ms > self.total_timeout_ms {
            return Err(HttpTransportError::InvalidConfig(
                "Read timeout cannot be greater than total timeout".to_string(),
            ));
        }
        if self.total_timeout_ms > MAX_REASONABLE_TIMEOUT_MS {
            tracing::warn!(
                total_timeout_ms = self.total_timeout_ms,
                "Total timeout is very long; consider reducing it"
            );
        }
        Ok(())
    }

    /// Build the shared reqwest client. Request-level timeouts are applied
    /// per request, not here.
    pub fn build_client(&self) -> HttpResult<Client> {
        self.validate()?;

        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .user_agent(self.user_agent.clone());

        if let Some(proxy_url) = &self.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|_| {
                HttpTransportError::InvalidConfig(format!("Invalid proxy URL: {}", proxy_url))
            })?;
            builder = builder.proxy(proxy);
        }

        builder = builder.danger_accept_invalid_certs(!self.verify_peer);

        Ok(builder.build()?)
    }
}
