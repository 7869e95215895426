pub mod analyzer;
pub mod bigquery;
pub mod cli;
pub mod load_config;
pub mod webhook;

pub use cli::{run, Cli, Commands};
