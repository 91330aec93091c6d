//! Error types for FediTest

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using FediTest Error
pub type Result<T> = std::result::Result<T, Error>;

/// How badly a violated expectation breaks the standard being tested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecLevel {
    Must,
    Should,
    Implied,
    #[default]
    Unspecified,
}

/// How badly a violated expectation breaks interoperability in practice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteropLevel {
    Problem,
    Degraded,
    Unaffected,
    #[default]
    Unknown,
}

/// An expectation explicitly violated by test logic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionFailure {
    pub message: String,
    #[serde(default)]
    pub spec_level: SpecLevel,
    #[serde(default)]
    pub interop_level: InteropLevel,
}

impl AssertionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            spec_level: SpecLevel::default(),
            interop_level: InteropLevel::default(),
        }
    }

    pub fn with_levels(mut self, spec_level: SpecLevel, interop_level: InteropLevel) -> Self {
        self.spec_level = spec_level;
        self.interop_level = interop_level;
        self
    }
}

impl std::fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Why a role could not be bound to a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RoleProblem {
    /// Nothing assigned to the role and no fallback driver available
    NoBinding,
    /// The binding names a driver that is not registered
    UnknownDriver { driver: String },
    /// The bound driver lacks some required capabilities
    MissingCapabilities { driver: String, missing: Vec<String> },
    /// The binding's `capabilities` param cannot be parsed
    InvalidCapabilities { message: String },
}

/// One role that the resolver could not satisfy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsatisfiedRole {
    pub role: String,
    #[serde(flatten)]
    pub problem: RoleProblem,
}

impl std::fmt::Display for UnsatisfiedRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.problem {
            RoleProblem::NoBinding => write!(f, "{}: no binding and no fallback driver", self.role),
            RoleProblem::UnknownDriver { driver } => {
                write!(f, "{}: unknown driver '{}'", self.role, driver)
            }
            RoleProblem::InvalidCapabilities { message } => {
                write!(f, "{}: invalid capabilities ({})", self.role, message)
            }
            RoleProblem::MissingCapabilities { driver, missing } => write!(
                f,
                "{}: driver '{}' lacks {}",
                self.role,
                driver,
                missing.join(", ")
            ),
        }
    }
}

fn join_roles(roles: &[UnsatisfiedRole]) -> String {
    roles
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// FediTest error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Provisioning failed for driver {driver}: {message}")]
    Provision { driver: String, message: String },

    #[error("Unsatisfiable roles: {}", join_roles(.roles))]
    UnsatisfiableRole { roles: Vec<UnsatisfiedRole> },

    #[error("Action {operation} failed: {message}")]
    Action { operation: String, message: String },

    #[error("Timed out after {millis} ms waiting for {operation}")]
    Timeout { operation: String, millis: u64 },

    #[error("Assertion failed: {0}")]
    Assertion(AssertionFailure),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation {operation} not supported by {driver}")]
    Unsupported { driver: String, operation: String },

    #[error("Test skipped: {0}")]
    Skip(String),

    #[error("Invalid operator input after {attempts} attempts: {last}")]
    InvalidInput { attempts: u32, last: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Serializable classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Provision,
    UnsatisfiableRole,
    Action,
    Timeout,
    Assertion,
    Protocol,
    Unsupported,
    Skip,
    InvalidInput,
    Config,
    Internal,
}

impl Error {
    pub fn provision(driver: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provision {
            driver: driver.into(),
            message: message.into(),
        }
    }

    pub fn action(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Action {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            millis: after.as_millis() as u64,
        }
    }

    pub fn unsupported(driver: impl Into<String>, operation: impl Into<String>) -> Self {
        Error::Unsupported {
            driver: driver.into(),
            operation: operation.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Provision { .. } => ErrorKind::Provision,
            Error::UnsatisfiableRole { .. } => ErrorKind::UnsatisfiableRole,
            Error::Action { .. } | Error::Http(_) => ErrorKind::Action,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Assertion(_) => ErrorKind::Assertion,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::Skip(_) => ErrorKind::Skip,
            Error::InvalidInput { .. } => ErrorKind::InvalidInput,
            Error::InvalidConfig(_) | Error::Yaml(_) | Error::Toml(_) => ErrorKind::Config,
            Error::InvalidStateTransition { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// The operation that raised this error, when known
    pub fn operation(&self) -> Option<&str> {
        match self {
            Error::Action { operation, .. }
            | Error::Timeout { operation, .. }
            | Error::Unsupported { operation, .. } => Some(operation),
            _ => None,
        }
    }

    pub fn assertion(&self) -> Option<&AssertionFailure> {
        match self {
            Error::Assertion(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<AssertionFailure> for Error {
    fn from(failure: AssertionFailure) -> Self {
        Error::Assertion(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsatisfiable_lists_every_role() {
        let err = Error::UnsatisfiableRole {
            roles: vec![
                UnsatisfiedRole {
                    role: "leader".to_string(),
                    problem: RoleProblem::NoBinding,
                },
                UnsatisfiedRole {
                    role: "follower".to_string(),
                    problem: RoleProblem::MissingCapabilities {
                        driver: "mastodon".to_string(),
                        missing: vec!["can-observe-block".to_string()],
                    },
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("leader"));
        assert!(msg.contains("follower"));
        assert!(msg.contains("can-observe-block"));
        assert_eq!(err.kind(), ErrorKind::UnsatisfiableRole);
    }

    #[test]
    fn test_operation_is_reported() {
        let err = Error::action("create-post", "HTTP 500");
        assert_eq!(err.operation(), Some("create-post"));
        assert_eq!(err.kind(), ErrorKind::Action);

        let err = Error::timeout("await-inbound", std::time::Duration::from_millis(1500));
        assert_eq!(err.to_string(), "Timed out after 1500 ms waiting for await-inbound");
    }

    #[test]
    fn test_role_problem_serializes_flat() {
        let role = UnsatisfiedRole {
            role: "r".to_string(),
            problem: RoleProblem::UnknownDriver {
                driver: "nope".to_string(),
            },
        };
        let json = serde_json::to_value(&role).unwrap();
        assert_eq!(json["role"], "r");
        assert_eq!(json["reason"], "unknown_driver");
        assert_eq!(json["driver"], "nope");
    }
}
