//! Dockling Core - Foundational Types
//!
//! Error taxonomy, engine configuration and lifecycle events shared by the
//! runtime and the CLI.

pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{EngineConfig, IsolationMode, RetryConfig};
pub use error::{DocklingError, Result};
pub use event::{EngineEvent, EventEmitter};

/// Dockling version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
