//! # saxsctrl
//!
//! Application layer of the SAXS instrument communication stack: loads the
//! station configuration, sets up logging and builds the configured
//! instruments from the driver crates.
//!
//! ## Crate Structure
//!
//! - **`config`**: [`config::SaxsConfig`], loaded with Figment from TOML and
//!   `SAXSCTRL_` environment variables, validated against the driver registry.
//! - **`logging`**: `tracing-subscriber` setup with pretty, compact and JSON
//!   output.
//! - **`station`**: the driver registry, the set of built instruments and the
//!   notification logger.

pub mod config;
pub mod logging;
pub mod station;

pub use config::SaxsConfig;
pub use station::{registry, Station};
