//! Command implementations

pub mod download;
pub mod fetch;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use http::Method;
use serde::{Deserialize, Serialize};
use url::Url;
use webtask::{CachePolicy, Client, ClientConfig, Credential, Outcome, StaticCredentials, Task, TaskBuilder, WaitStatus};
use webtask_http::{HttpConfig, HttpTransport};

use crate::cli::RequestArgs;
use crate::utils::{format_duration, parse_header, parse_query, parse_user};

/// Contents of the `--config` file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub client: ClientConfig,
    pub http: HttpConfig,
}

impl Settings {
    /// Load from `path` if given, then apply `WEBTASK_*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings: Settings = match path {
            Some(path) => webtask::config::load_file(path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))?,
            None => Settings::default(),
        };
        settings.client.apply_env();
        settings.http.apply_env();
        Ok(settings)
    }
}

/// Build a client for `args` and return it with the request target.
///
/// An absolute URL becomes the base URL itself; anything else is resolved
/// against the configured base URL.
pub(crate) fn connect(mut client_config: ClientConfig, http_config: HttpConfig, args: &RequestArgs) -> Result<(Client, String)> {
    let target = match Url::parse(&args.url) {
        Ok(url) if url.has_host() => {
            client_config.base_url = Some(args.url.clone());
            String::new()
        }
        _ => {
            if client_config.base_url.is_none() {
                bail!("'{}' is not an absolute URL and no base_url is configured", args.url);
            }
            args.url.clone()
        }
    };
    if let Some(max) = args.max_auth_retry {
        client_config.max_auth_retry = max;
    }

    let transport = HttpTransport::new(http_config).context("Failed to create HTTP transport")?;
    let mut builder = Client::from_config(client_config).transport(transport);
    if let Some(credential) = credential(args)? {
        builder = builder.authentication_handler(StaticCredentials::new(credential));
    }
    let client = builder.build().context("Failed to create client")?;
    Ok((client, target))
}

fn credential(args: &RequestArgs) -> Result<Option<Credential>> {
    if let Some(user) = &args.user {
        return parse_user(user).map(Some);
    }
    Ok(args.bearer.as_ref().map(Credential::bearer))
}

/// Apply headers and query parameters from `args`
pub(crate) fn apply_request_args(mut builder: TaskBuilder, args: &RequestArgs) -> Result<TaskBuilder> {
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        builder = builder.header(name, value);
    }
    for raw in &args.query {
        let (name, value) = parse_query(raw)?;
        builder = builder.query(name, value);
    }
    if args.no_cache {
        builder = builder.cache_policy(CachePolicy::ReloadIgnoringLocalAndRemote);
    }
    Ok(builder)
}

pub(crate) fn parse_method(raw: &str) -> Result<Method> {
    Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method '{}'", raw))
}

/// Resume `task`, wait for it and turn a failed outcome into an error
pub(crate) fn run_task(task: &Task, timeout_secs: u64) -> Result<()> {
    let started = Instant::now();
    let status = task.resume_and_wait(Duration::from_secs(timeout_secs));
    let outcome = match status {
        WaitStatus::TimedOut => bail!("Request timed out after {}s", timeout_secs),
        WaitStatus::Completed(outcome) => outcome,
    };
    let request = task.request();
    match outcome {
        Outcome::Success => {
            tracing::info!(
                url = %request.url,
                status = task.response().status().map(|s| s.as_u16()).unwrap_or_default(),
                elapsed = %format_duration(started.elapsed()),
                "Request finished"
            );
            Ok(())
        }
        Outcome::Failure(err) => bail!("{} {} failed: {}", request.method, request.url, err),
        Outcome::Unset => bail!("{} {} finished without an outcome", request.method, request.url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn request_args(url: &str) -> RequestArgs {
        RequestArgs {
            url: url.to_string(),
            headers: vec![],
            query: vec![],
            user: None,
            bearer: None,
            max_auth_retry: None,
            timeout: 30,
            no_cache: false,
        }
    }

    #[test]
    fn test_settings_load_sections() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "client:\n  base_url: https://api.example.com\n  max_auth_retry: 2\nhttp:\n  verify_peer: false"
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.client.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(settings.client.max_auth_retry, 2);
        assert!(!settings.http.verify_peer);
    }

    #[test]
    fn test_connect_absolute_url_becomes_base() {
        let (client, target) =
            connect(ClientConfig::default(), HttpConfig::default(), &request_args("https://example.com/a/b")).unwrap();
        assert_eq!(client.base_url().as_str(), "https://example.com/a/b");
        assert!(target.is_empty());
    }

    #[test]
    fn test_connect_relative_needs_base() {
        assert!(connect(ClientConfig::default(), HttpConfig::default(), &request_args("users/1")).is_err());

        let config = ClientConfig { base_url: Some("https://api.example.com/v1".to_string()), ..Default::default() };
        let (client, target) = connect(config, HttpConfig::default(), &request_args("users/1")).unwrap();
        assert_eq!(client.base_url().as_str(), "https://api.example.com/v1");
        assert_eq!(target, "users/1");
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("post").unwrap(), Method::POST);
        assert!(parse_method("BAD METHOD").is_err());
    }

    #[test]
    fn test_no_cache_flag_sets_cache_policy() {
        let (client, target) =
            connect(ClientConfig::default(), HttpConfig::default(), &request_args("https://example.com/feed")).unwrap();
        let args = RequestArgs { no_cache: true, ..request_args("https://example.com/feed") };
        let task = apply_request_args(client.get(&target), &args).unwrap().build().unwrap();
        assert_eq!(task.request().cache_policy, CachePolicy::ReloadIgnoringLocalAndRemote);

        let task = apply_request_args(client.get(&target), &request_args("https://example.com/feed"))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(task.request().cache_policy, CachePolicy::UseProtocol);
    }
}
