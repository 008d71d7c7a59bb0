//! Contracts with the outside world
//!
//! The executive never talks to sensors, actuators or planners directly.
//! It calls these handlers from its own thread, and the answers come back
//! through the input queue. Handlers must not block.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::engine::value::Value;

/// An external observable: a name plus argument values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl State {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// State with no arguments
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }
}

// Values hold floats, so equality is structural on the bit pattern here.
// NaN arguments never name a useful state anyway.
impl Eq for State {}

impl Hash for State {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.args.len().hash(state);
        for arg in &self.args {
            hash_value(arg, state);
        }
    }
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    std::mem::discriminant(value).hash(state);
    match value {
        Value::Unknown => {}
        Value::Boolean(b) => b.hash(state),
        Value::Integer(i) => i.hash(state),
        Value::Real(r) | Value::Date(r) | Value::Duration(r) => r.to_bits().hash(state),
        Value::String(s) => s.hash(state),
        Value::Array(items) => {
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
        Value::NodeState(s) => s.hash(state),
        Value::Outcome(o) => o.hash(state),
        Value::Failure(f) => f.hash(state),
        Value::CommandHandle(h) => h.hash(state),
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

/// Identifies one issued command across the queue boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd-{}", self.0)
    }
}

/// A command as handed to the [`CommandHandler`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub name: String,
    pub args: Vec<Value>,
    /// Name of the issuing node
    pub node: String,
}

/// Identifies one planner update across the queue boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateId(pub u64);

/// Name/value pairs sent to the planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub id: UpdateId,
    pub node: String,
    pub pairs: Vec<(String, Value)>,
}

/// Source of state values
pub trait LookupHandler: Send + Sync {
    /// Current value of `state`, or [`Value::Unknown`]
    fn lookup_now(&self, state: &State) -> Value;

    /// Start pushing changes of `state` through the input queue
    fn subscribe(&self, _state: &State) {}

    fn unsubscribe(&self, _state: &State) {}

    /// Only changes outside `(lo, hi)` are of interest
    fn set_thresholds(&self, _state: &State, _hi: f64, _lo: f64) {}
}

/// Sink for commands. Handles and return values arrive as queue entries.
pub trait CommandHandler: Send + Sync {
    fn execute_command(&self, command: &Command);

    /// Request an abort; the acknowledgement arrives as a queue entry
    fn abort_command(&self, command: &Command);
}

/// Sink for planner updates. Acknowledgements arrive as queue entries.
pub trait PlannerUpdateHandler: Send + Sync {
    fn send_planner_update(&self, update: &Update);
}

/// The three handlers the executive calls out to
#[derive(Clone)]
pub struct Interfaces {
    pub lookup: Arc<dyn LookupHandler>,
    pub command: Arc<dyn CommandHandler>,
    pub update: Arc<dyn PlannerUpdateHandler>,
}

impl Interfaces {
    pub fn new(
        lookup: Arc<dyn LookupHandler>,
        command: Arc<dyn CommandHandler>,
        update: Arc<dyn PlannerUpdateHandler>,
    ) -> Self {
        Self {
            lookup,
            command,
            update,
        }
    }

    /// Use one adapter for all three roles
    pub fn shared<T>(adapter: Arc<T>) -> Self
    where
        T: LookupHandler + CommandHandler + PlannerUpdateHandler + 'static,
    {
        Self {
            lookup: adapter.clone(),
            command: adapter.clone(),
            update: adapter,
        }
    }
}

impl fmt::Debug for Interfaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interfaces").finish_non_exhaustive()
    }
}
