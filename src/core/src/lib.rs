//! Nodeboot Core - Foundational Types
//!
//! Error taxonomy, configuration and data-directory layout shared by the
//! nodeboot runtime and CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{DataLayout, StageConfig};
pub use error::{MultiError, Result, StageError};

/// Nodeboot version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
