pub mod cli;
pub mod commands;
pub mod logging;
pub mod utils;

pub use cli::{Cli, Commands};
pub use commands::Settings;
