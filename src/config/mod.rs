// src/config/mod.rs
//! Configuration module for the relay server and client agent.
//!
//! This module manages settings, constants, and default configurations.

pub mod constants;
pub mod defaults;
pub mod settings;

pub use settings::{ClientConfig, ConfigError, ServerArgs, ServerConfig};
