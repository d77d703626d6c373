// src/config/mod.rs

//! Configuration loading and validation for shardrun.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate ranges and resolve raw sections into engine types (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{ConfigFile, DefaultsConfig, LocalConfig, RawConfigFile, TaskConfig};
