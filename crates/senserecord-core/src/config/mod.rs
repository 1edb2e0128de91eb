//! Application configuration
//!
//! This module defines configuration types and default values:
//! - `app_config`: YAML configuration structure, discovery and validation
//! - `defaults`: Default configuration values

pub mod app_config;
pub mod defaults;

// Re-export configuration types
pub use app_config::{AppConfig, BoardConfig, RequestDefaults, ServerConfig, TaskConfig};
