//! Transition and assignment observers
//!
//! The executive reports every node state transition and every variable
//! assignment to its registered [`ExecListener`]s. Listeners observe only:
//! they return nothing and cannot influence the transition.
//!
//! - [`TracingListener`] turns notifications into structured `tracing`
//!   events.
//! - [`RecordingListener`] buffers them for inspection, mostly in tests.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::engine::value::{FailureType, NodeOutcome, NodeState, Value};

// =============================================================================
// Records
// =============================================================================

/// One node state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTransition {
    pub plan: Uuid,
    pub node: String,
    pub from: NodeState,
    pub to: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<NodeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureType>,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
}

/// One variable assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub plan: Uuid,
    pub node: String,
    pub variable: String,
    pub value: Value,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Listener trait
// =============================================================================

/// Observer of executive activity
pub trait ExecListener: Send + Sync {
    fn on_transition(&self, transition: &NodeTransition);

    fn on_assignment(&self, _assignment: &AssignmentRecord) {}

    fn on_add_plan(&self, _plan: Uuid, _root: &str) {}

    fn on_add_library(&self, _name: &str) {}
}

/// Logs through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl ExecListener for TracingListener {
    fn on_transition(&self, t: &NodeTransition) {
        info!(
            plan = %t.plan,
            node = %t.node,
            from = %t.from,
            to = %t.to,
            outcome = ?t.outcome,
            failure = ?t.failure,
            cycle = t.cycle,
            "node transition"
        );
    }

    fn on_assignment(&self, a: &AssignmentRecord) {
        info!(
            plan = %a.plan,
            node = %a.node,
            variable = %a.variable,
            value = %a.value,
            cycle = a.cycle,
            "assignment"
        );
    }

    fn on_add_plan(&self, plan: Uuid, root: &str) {
        info!(plan = %plan, root, "plan added");
    }

    fn on_add_library(&self, name: &str) {
        info!(library = name, "library added");
    }
}

/// Buffers everything it hears
#[derive(Debug, Default)]
pub struct RecordingListener {
    transitions: RwLock<Vec<NodeTransition>>,
    assignments: RwLock<Vec<AssignmentRecord>>,
    plans: RwLock<Vec<(Uuid, String)>>,
    libraries: RwLock<Vec<String>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transitions(&self) -> Vec<NodeTransition> {
        self.transitions.read().clone()
    }

    pub fn assignments(&self) -> Vec<AssignmentRecord> {
        self.assignments.read().clone()
    }

    pub fn plans(&self) -> Vec<(Uuid, String)> {
        self.plans.read().clone()
    }

    pub fn libraries(&self) -> Vec<String> {
        self.libraries.read().clone()
    }

    /// States `node` passed through, starting with its first destination
    pub fn states_of(&self, node: &str) -> Vec<NodeState> {
        self.transitions
            .read()
            .iter()
            .filter(|t| t.node == node)
            .map(|t| t.to)
            .collect()
    }

    /// The last transition recorded for `node`
    pub fn last_transition(&self, node: &str) -> Option<NodeTransition> {
        self.transitions
            .read()
            .iter()
            .rev()
            .find(|t| t.node == node)
            .cloned()
    }

    pub fn clear(&self) {
        self.transitions.write().clear();
        self.assignments.write().clear();
    }
}

impl ExecListener for RecordingListener {
    fn on_transition(&self, transition: &NodeTransition) {
        self.transitions.write().push(transition.clone());
    }

    fn on_assignment(&self, assignment: &AssignmentRecord) {
        self.assignments.write().push(assignment.clone());
    }

    fn on_add_plan(&self, plan: Uuid, root: &str) {
        self.plans.write().push((plan, root.to_string()));
    }

    fn on_add_library(&self, name: &str) {
        self.libraries.write().push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(node: &str, from: NodeState, to: NodeState) -> NodeTransition {
        NodeTransition {
            plan: Uuid::nil(),
            node: node.to_string(),
            from,
            to,
            outcome: None,
            failure: None,
            cycle: 1,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_recording_listener_filters_by_node() {
        let listener = RecordingListener::new();
        listener.on_transition(&transition("a", NodeState::Inactive, NodeState::Waiting));
        listener.on_transition(&transition("b", NodeState::Inactive, NodeState::Waiting));
        listener.on_transition(&transition("a", NodeState::Waiting, NodeState::Executing));

        assert_eq!(
            listener.states_of("a"),
            vec![NodeState::Waiting, NodeState::Executing]
        );
        assert_eq!(
            listener.last_transition("b").map(|t| t.to),
            Some(NodeState::Waiting)
        );
    }

    #[test]
    fn test_transition_serializes_state_names() {
        let json = serde_json::to_string(&transition(
            "a",
            NodeState::Waiting,
            NodeState::IterationEnded,
        ))
        .unwrap();
        assert!(json.contains("\"ITERATION_ENDED\""));
        assert!(!json.contains("outcome"));
    }
}
