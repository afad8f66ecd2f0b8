//! # Quiver CLI
//!
//! Runs valuation cycles on the Quiver engine from a TOML configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod demo;
pub mod runner;

pub use config::{ConfigError, RunnerConfig, TargetConfig};
