//! FediTest Common Library
//!
//! Shared types, capabilities, configuration and errors for the FediTest
//! engine and its embedded listener.

pub mod capability;
pub mod config;
pub mod error;
pub mod logging;
pub mod types;
pub mod uri;

// Re-export commonly used types
pub use capability::{supports, Capability, CapabilitySet};
pub use config::{
    BindingConfig, ConstellationConfig, EngineConfig, ListenerConfig, SessionConfig,
};
pub use error::{
    AssertionFailure, Error, ErrorKind, InteropLevel, Result, RoleProblem, SpecLevel,
    UnsatisfiedRole,
};
pub use types::*;

/// FediTest version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
