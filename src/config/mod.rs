//! Configuration module
//!
//! Handles loading server settings from a TOML file.

mod settings;

pub use settings::*;
