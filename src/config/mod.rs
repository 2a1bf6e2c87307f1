//! Configuration module
//!
//! Handles loading the bridge configuration file.

mod settings;

pub use settings::*;
