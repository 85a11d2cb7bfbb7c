//! reqwest-backed [`webtask::Transport`].
//!
//! ```no_run
//! use std::time::Duration;
//! use webtask::Client;
//! use webtask_http::{HttpConfig, HttpTransport};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = HttpTransport::new(HttpConfig::default())?;
//! let client = Client::builder("https://api.example.com").transport(transport).build()?;
//! let task = client.get("status").build()?;
//! let status = task.resume_and_wait(Duration::from_secs(10));
//! println!("{:?}", status.outcome());
//! println!("{:?}", task.response().status());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod transport;

pub use config::HttpConfig;
pub use error::{HttpResult, HttpTransportError};
pub use transport::HttpTransport;
