//! Argument parsing helpers and console formatting

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use colored::{ColoredString, Colorize};
use webtask::Credential;

/// Utility for colored console output
pub struct ColoredOutput;

impl ColoredOutput {
    pub fn success(msg: &str) -> ColoredString {
        msg.green().bold()
    }

    pub fn error(msg: &str) -> ColoredString {
        msg.red().bold()
    }

    pub fn dim(msg: &str) -> ColoredString {
        msg.dimmed()
    }

    pub fn highlight(msg: &str) -> ColoredString {
        msg.cyan().bold()
    }
}

/// Format duration in a human-readable way
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{:.1}m", ms as f64 / 60_000.0)
    }
}

/// Parse `Name: value`
pub fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid header '{}': expected 'Name: value'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("Invalid header '{}': empty name", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Parse `name=value`; a bare `name` means an empty value
pub fn parse_query(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw.split_once('=').unwrap_or((raw, ""));
    if name.is_empty() {
        bail!("Invalid query parameter '{}': empty name", raw);
    }
    Ok((name.to_string(), value.to_string()))
}

/// Parse `user:password` for Basic authentication
pub fn parse_user(raw: &str) -> Result<Credential> {
    let (username, password) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid credentials: expected 'user:password'"))?;
    Ok(Credential::basic(username, password))
}
