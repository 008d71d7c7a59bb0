//! Error types for the reactive executive

use thiserror::Error;

/// Main error type for the executive
///
/// Variants fall into two groups. Plan-structural errors are reported to
/// whoever loaded the plan and leave the executive untouched. Internal
/// invariant violations are fatal: the driver stops rather than keep
/// actuating with unknown state. Condition failures and command failures
/// are never errors; they are node outcomes and command handle values.
#[derive(Error, Debug)]
pub enum ExecError {
    // Plan-structural errors
    #[error("Plan error in node '{node}': {message}")]
    Plan { node: String, message: String },

    #[error("Unknown library node: {0}")]
    UnknownLibrary(String),

    #[error("Variable '{name}' not found in scope of node '{node}'")]
    UnresolvedVariable { node: String, name: String },

    #[error("Node reference '{name}' from node '{node}' does not resolve")]
    UnresolvedNode { node: String, name: String },

    #[error("Node reference '{name}' from node '{node}' is ambiguous")]
    AmbiguousNode { node: String, name: String },

    #[error(
        "Nodes '{first}' and '{second}' assign to '{variable}' with equal priority {priority}"
    )]
    DuplicatePriority {
        first: String,
        second: String,
        variable: String,
        priority: i32,
    },

    // Internal invariant violations
    #[error("Expression '{0}' deactivated more often than activated")]
    ActivationUnderflow(String),

    #[error("Stale {kind} reference (slot {slot}, generation {generation})")]
    StaleReference {
        kind: &'static str,
        slot: u32,
        generation: u32,
    },

    #[error("Time regressed from {previous} to {current}")]
    TimeRegressed { previous: f64, current: f64 },

    #[error("Quiescence loop exceeded {0} steps")]
    QuiescenceOverflow(usize),

    #[error("Internal error: {0}")]
    Internal(String),

    // Boundary errors
    #[error("Input queue is closed")]
    QueueClosed,

    #[error("Executive thread is not running")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("YAML parse error: {0}")]
    YamlParse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Shorthand for a structural error attributed to a node
    pub fn plan(node: impl Into<String>, message: impl Into<String>) -> Self {
        ExecError::Plan {
            node: node.into(),
            message: message.into(),
        }
    }

    /// True for internal invariant violations, after which the executive
    /// must not keep running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecError::ActivationUnderflow(_)
                | ExecError::StaleReference { .. }
                | ExecError::TimeRegressed { .. }
                | ExecError::QuiescenceOverflow(_)
                | ExecError::Internal(_)
        )
    }

    /// True for errors detected while instantiating a plan.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ExecError::Plan { .. }
                | ExecError::UnknownLibrary(_)
                | ExecError::UnresolvedVariable { .. }
                | ExecError::UnresolvedNode { .. }
                | ExecError::AmbiguousNode { .. }
                | ExecError::DuplicatePriority { .. }
        )
    }
}

/// Result type alias for the executive
pub type ExecResult<T> = Result<T, ExecError>;

// Conversion implementations
impl From<serde_json::Error> for ExecError {
    fn from(err: serde_json::Error) -> Self {
        ExecError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ExecError {
    fn from(err: serde_yaml::Error) -> Self {
        ExecError::YamlParse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ExecError::ActivationUnderflow("x".into()).is_fatal());
        assert!(ExecError::QuiescenceOverflow(10).is_fatal());
        assert!(!ExecError::UnknownLibrary("lib".into()).is_fatal());
        assert!(!ExecError::QueueClosed.is_fatal());
    }

    #[test]
    fn test_structural_classification() {
        assert!(ExecError::plan("root", "bad").is_structural());
        assert!(ExecError::DuplicatePriority {
            first: "a".into(),
            second: "b".into(),
            variable: "x".into(),
            priority: 1,
        }
        .is_structural());
        assert!(!ExecError::Internal("oops".into()).is_structural());
    }

    #[test]
    fn test_yaml_conversion() {
        let err: ExecError = serde_yaml::from_str::<i32>("not: [valid").unwrap_err().into();
        assert!(matches!(err, ExecError::YamlParse(_)));
    }
}
