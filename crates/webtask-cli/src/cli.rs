//! CLI argument definitions using clap

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "webtask", about = "webtask - run HTTP tasks from the command line", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file with `client` and `http` sections (YAML or JSON)
    #[arg(long, global = true, env = "WEBTASK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `webtask=debug`
    #[arg(long, global = true, env = "RUST_LOG", default_value = "warn")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "WEBTASK_JSON_LOGS")]
    pub json_logs: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Perform a request and print the response body
    Fetch(FetchArgs),

    /// Download a resource into a directory
    Download(DownloadArgs),
}

/// Options shared by every request-issuing command
#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Absolute URL, or a path relative to the configured base URL
    pub url: String,

    /// Request header as `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Query parameter as `name=value` (repeatable)
    #[arg(short, long = "query")]
    pub query: Vec<String>,

    /// Basic credentials as `user:password`, answered on challenge
    #[arg(short, long, conflicts_with = "bearer")]
    pub user: Option<String>,

    /// Bearer token, answered on challenge
    #[arg(long)]
    pub bearer: Option<String>,

    /// Maximum Basic/Default challenge answers per request (0 = unlimited)
    #[arg(long)]
    pub max_auth_retry: Option<u32>,

    /// Seconds to wait for the request; 0 waits forever
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Bypass local and intermediate caches
    #[arg(long)]
    pub no_cache: bool,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    #[command(flatten)]
    pub request: RequestArgs,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    pub method: String,

    /// Request body
    #[arg(short, long, conflicts_with = "data_file")]
    pub data: Option<String>,

    /// Read the request body from a file
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    /// Send the body as `application/json`
    #[arg(long)]
    pub json: bool,

    /// Print status line and headers before the body
    #[arg(short, long)]
    pub include: bool,

    /// Pretty-print JSON responses
    #[arg(long)]
    pub pretty: bool,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    #[command(flatten)]
    pub request: RequestArgs,

    /// Directory the downloaded file is moved into
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,
}
