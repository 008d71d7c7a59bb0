//! Values carried by expressions, states and queue entries
//!
//! [`Value`] is the tagged union every expression produces. Besides the
//! plain data types it carries the internal enumerations a plan may compare
//! against: node states, outcomes, failure types and command handles.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Lifecycle state of a plan node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Inactive,
    Waiting,
    Executing,
    IterationEnded,
    Finished,
    Failing,
    Finishing,
}

impl NodeState {
    /// All states, in declaration order
    pub const ALL: [NodeState; 7] = [
        NodeState::Inactive,
        NodeState::Waiting,
        NodeState::Executing,
        NodeState::IterationEnded,
        NodeState::Finished,
        NodeState::Failing,
        NodeState::Finishing,
    ];

    /// Canonical upper-case name
    pub fn name(&self) -> &'static str {
        match self {
            NodeState::Inactive => "INACTIVE",
            NodeState::Waiting => "WAITING",
            NodeState::Executing => "EXECUTING",
            NodeState::IterationEnded => "ITERATION_ENDED",
            NodeState::Finished => "FINISHED",
            NodeState::Failing => "FAILING",
            NodeState::Finishing => "FINISHING",
        }
    }

    /// Dense index, used for per-state tables
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of one node iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeOutcome {
    Success,
    Failure,
    Skipped,
    Interrupted,
}

impl NodeOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            NodeOutcome::Success => "SUCCESS",
            NodeOutcome::Failure => "FAILURE",
            NodeOutcome::Skipped => "SKIPPED",
            NodeOutcome::Interrupted => "INTERRUPTED",
        }
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reason attached to a `FAILURE` or `INTERRUPTED` outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    PreConditionFailed,
    PostConditionFailed,
    InvariantConditionFailed,
    ParentFailed,
    Exited,
    ParentExited,
}

impl FailureType {
    pub fn name(&self) -> &'static str {
        match self {
            FailureType::PreConditionFailed => "PRE_CONDITION_FAILED",
            FailureType::PostConditionFailed => "POST_CONDITION_FAILED",
            FailureType::InvariantConditionFailed => "INVARIANT_CONDITION_FAILED",
            FailureType::ParentFailed => "PARENT_FAILED",
            FailureType::Exited => "EXITED",
            FailureType::ParentExited => "PARENT_EXITED",
        }
    }

    /// Outcome a node reports when it unwinds for this reason
    pub fn outcome(&self) -> NodeOutcome {
        match self {
            FailureType::Exited | FailureType::ParentExited => NodeOutcome::Interrupted,
            _ => NodeOutcome::Failure,
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Acknowledgement code reported by a command handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandHandle {
    #[serde(rename = "COMMAND_SENT_TO_SYSTEM")]
    SentToSystem,
    #[serde(rename = "COMMAND_ACCEPTED")]
    Accepted,
    #[serde(rename = "COMMAND_RCVD_BY_SYSTEM")]
    RcvdBySystem,
    #[serde(rename = "COMMAND_FAILED")]
    Failed,
    #[serde(rename = "COMMAND_DENIED")]
    Denied,
    #[serde(rename = "COMMAND_SUCCESS")]
    Success,
}

impl CommandHandle {
    pub fn name(&self) -> &'static str {
        match self {
            CommandHandle::SentToSystem => "COMMAND_SENT_TO_SYSTEM",
            CommandHandle::Accepted => "COMMAND_ACCEPTED",
            CommandHandle::RcvdBySystem => "COMMAND_RCVD_BY_SYSTEM",
            CommandHandle::Failed => "COMMAND_FAILED",
            CommandHandle::Denied => "COMMAND_DENIED",
            CommandHandle::Success => "COMMAND_SUCCESS",
        }
    }

    /// Handles after which the command can no longer make progress
    pub fn is_interrupting(&self) -> bool {
        matches!(self, CommandHandle::Failed | CommandHandle::Denied)
    }
}

impl fmt::Display for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value held by an expression
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// No value known
    #[default]
    Unknown,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    String(String),
    Array(Vec<Value>),
    /// Seconds since the epoch
    Date(f64),
    /// Seconds
    Duration(f64),
    NodeState(NodeState),
    Outcome(NodeOutcome),
    Failure(FailureType),
    CommandHandle(CommandHandle),
}

impl Value {
    pub fn is_known(&self) -> bool {
        !matches!(self, Value::Unknown)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Value::Boolean(true))
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Value::Boolean(false))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers are widened
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(r) | Value::Date(r) | Value::Duration(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.as_real().is_some()
    }

    /// Name of the value's type, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unknown => "Unknown",
            Value::Boolean(_) => "Boolean",
            Value::Integer(_) => "Integer",
            Value::Real(_) => "Real",
            Value::String(_) => "String",
            Value::Array(_) => "Array",
            Value::Date(_) => "Date",
            Value::Duration(_) => "Duration",
            Value::NodeState(_) => "NodeState",
            Value::Outcome(_) => "NodeOutcome",
            Value::Failure(_) => "FailureType",
            Value::CommandHandle(_) => "CommandHandle",
        }
    }

    /// Plan-level equality: unknown if either side is unknown, numeric
    /// values compare across integer/real.
    pub fn equals(&self, other: &Value) -> Option<bool> {
        if !self.is_known() || !other.is_known() {
            return None;
        }
        match (self.as_real(), other.as_real()) {
            (Some(a), Some(b)) => Some(a == b),
            _ => Some(self == other),
        }
    }

    /// Plan-level ordering for numbers and strings
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => {
                let (a, b) = (self.as_real()?, other.as_real()?);
                a.partial_cmp(&b)
            }
        }
    }

    /// Magnitude of the change from `self` to `other`, used against
    /// change-lookup tolerances. Unknown to unknown is no change; unknown to
    /// known (or either way) is an infinite change.
    pub fn difference(&self, other: &Value) -> f64 {
        match (self.is_known(), other.is_known()) {
            (false, false) => 0.0,
            (false, true) | (true, false) => f64::INFINITY,
            (true, true) => match (self.as_real(), other.as_real()) {
                (Some(a), Some(b)) => (a - b).abs(),
                _ => {
                    if self == other {
                        0.0
                    } else {
                        f64::INFINITY
                    }
                }
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unknown => f.write_str("UNKNOWN"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) | Value::Date(r) | Value::Duration(r) => write!(f, "{}", r),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::NodeState(s) => write!(f, "{}", s),
            Value::Outcome(o) => write!(f, "{}", o),
            Value::Failure(t) => write!(f, "{}", t),
            Value::CommandHandle(h) => write!(f, "{}", h),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::Real(r)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<NodeState> for Value {
    fn from(s: NodeState) -> Self {
        Value::NodeState(s)
    }
}

impl From<NodeOutcome> for Value {
    fn from(o: NodeOutcome) -> Self {
        Value::Outcome(o)
    }
}

impl From<FailureType> for Value {
    fn from(t: FailureType) -> Self {
        Value::Failure(t)
    }
}

impl From<CommandHandle> for Value {
    fn from(h: CommandHandle) -> Self {
        Value::CommandHandle(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equals_is_unknown_when_either_side_unknown() {
        assert_eq!(Value::Unknown.equals(&Value::Integer(1)), None);
        assert_eq!(Value::Integer(1).equals(&Value::Unknown), None);
    }

    #[test]
    fn test_equals_crosses_numeric_types() {
        assert_eq!(Value::Integer(2).equals(&Value::Real(2.0)), Some(true));
        assert_eq!(Value::Integer(2).equals(&Value::Real(2.5)), Some(false));
        assert_eq!(
            Value::from(CommandHandle::Success).equals(&CommandHandle::Success.into()),
            Some(true)
        );
    }

    #[test]
    fn test_difference() {
        assert_eq!(Value::Unknown.difference(&Value::Unknown), 0.0);
        assert!(Value::Unknown.difference(&Value::Real(1.0)).is_infinite());
        assert_eq!(Value::Real(1.0).difference(&Value::Integer(3)), 2.0);
        assert_eq!(Value::from("a").difference(&Value::from("a")), 0.0);
        assert!(Value::from("a").difference(&Value::from("b")).is_infinite());
    }

    #[test]
    fn test_compare() {
        assert_eq!(
            Value::Integer(1).compare(&Value::Real(1.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::from("b").compare(&Value::from("a")), Some(Ordering::Greater));
        assert_eq!(Value::Boolean(true).compare(&Value::Integer(1)), None);
    }

    #[test]
    fn test_failure_outcome_mapping() {
        assert_eq!(FailureType::Exited.outcome(), NodeOutcome::Interrupted);
        assert_eq!(
            FailureType::InvariantConditionFailed.outcome(),
            NodeOutcome::Failure
        );
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&CommandHandle::Success).unwrap();
        assert_eq!(json, "\"COMMAND_SUCCESS\"");
        let state: NodeState = serde_json::from_str("\"ITERATION_ENDED\"").unwrap();
        assert_eq!(state, NodeState::IterationEnded);
    }
}
