//! Plan nodes and the node state machine
//!
//! A [`Node`] is pure data living in the executive's arena. Whether and
//! where a node moves next is decided by [`dest_state`], a pure function of
//! the node's current state, its type, and a [`ConditionSnapshot`] taken from
//! the current condition values. The executive builds the snapshot, calls
//! `dest_state`, and then performs the transition with its side effects.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::arena::Index;
use crate::engine::expr::ExprId;
use crate::engine::interface::{CommandId, UpdateId};
use crate::engine::value::{CommandHandle, FailureType, NodeOutcome, NodeState};

/// Handle to a node in the executive's arena
pub type NodeId = Index<Node>;

/// Fixed kind of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Empty,
    List,
    Command,
    Assignment,
    Update,
    LibraryCall,
}

impl NodeType {
    /// List-like nodes pass through FINISHING and wait for their children
    pub fn has_children(&self) -> bool {
        matches!(self, NodeType::List | NodeType::LibraryCall)
    }
}

/// User-visible conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Skip,
    Start,
    End,
    Exit,
    Invariant,
    Pre,
    Post,
    Repeat,
}

impl Condition {
    pub const ALL: [Condition; 8] = [
        Condition::Skip,
        Condition::Start,
        Condition::End,
        Condition::Exit,
        Condition::Invariant,
        Condition::Pre,
        Condition::Post,
        Condition::Repeat,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Condition::Skip => "SkipCondition",
            Condition::Start => "StartCondition",
            Condition::End => "EndCondition",
            Condition::Exit => "ExitCondition",
            Condition::Invariant => "InvariantCondition",
            Condition::Pre => "PreCondition",
            Condition::Post => "PostCondition",
            Condition::Repeat => "RepeatCondition",
        }
    }

    /// Value of an absent condition
    pub fn default_value(&self) -> bool {
        matches!(
            self,
            Condition::Start
                | Condition::End
                | Condition::Invariant
                | Condition::Pre
                | Condition::Post
        )
    }

    /// Conditions the node listens to while in `state`
    pub fn active_in(state: NodeState) -> &'static [Condition] {
        match state {
            NodeState::Waiting => &[Condition::Skip, Condition::Start, Condition::Pre],
            NodeState::Executing => &[
                Condition::End,
                Condition::Exit,
                Condition::Invariant,
                Condition::Post,
            ],
            NodeState::Finishing => &[Condition::Exit, Condition::Invariant, Condition::Post],
            NodeState::IterationEnded => &[Condition::Repeat],
            NodeState::Inactive | NodeState::Failing | NodeState::Finished => &[],
        }
    }
}

/// Command node payload
#[derive(Debug, Clone)]
pub struct CommandBody {
    pub name: String,
    pub args: Vec<ExprId>,
    /// Variable receiving the return value
    pub returns: Option<ExprId>,
    pub handle: Option<CommandHandle>,
    /// Command in flight, if any
    pub active: Option<CommandId>,
    pub abort_requested: bool,
    pub abort_complete: bool,
}

/// Assignment node payload
#[derive(Debug, Clone)]
pub struct AssignmentBody {
    pub variable: ExprId,
    pub variable_name: String,
    pub value: ExprId,
    pub applied: bool,
}

/// Update node payload
#[derive(Debug, Clone)]
pub struct UpdateBody {
    pub pairs: Vec<(String, ExprId)>,
    pub active: Option<UpdateId>,
    pub acknowledged: bool,
}

/// Type-specific node payload
#[derive(Debug, Clone)]
pub enum NodeBody {
    Empty,
    List,
    Command(CommandBody),
    Assignment(AssignmentBody),
    Update(UpdateBody),
    LibraryCall { library: String },
}

impl NodeBody {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeBody::Empty => NodeType::Empty,
            NodeBody::List => NodeType::List,
            NodeBody::Command(_) => NodeType::Command,
            NodeBody::Assignment(_) => NodeType::Assignment,
            NodeBody::Update(_) => NodeType::Update,
            NodeBody::LibraryCall { .. } => NodeType::LibraryCall,
        }
    }

    /// Expressions that must be live while the body runs
    pub fn expressions(&self) -> Vec<ExprId> {
        match self {
            NodeBody::Command(cmd) => cmd.args.clone(),
            NodeBody::Assignment(assign) => vec![assign.value],
            NodeBody::Update(update) => update.pairs.iter().map(|(_, id)| *id).collect(),
            NodeBody::Empty | NodeBody::List | NodeBody::LibraryCall { .. } => Vec::new(),
        }
    }
}

/// Node variables other nodes can reference
#[derive(Debug, Clone, Copy)]
pub struct NodeVariables {
    pub state: ExprId,
    pub outcome: ExprId,
    pub failure: ExprId,
    /// Command nodes only
    pub command_handle: Option<ExprId>,
}

/// A plan node
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub plan: Uuid,
    pub priority: Option<i32>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub conditions: [Option<ExprId>; 8],
    pub body: NodeBody,
    pub state: NodeState,
    pub outcome: Option<NodeOutcome>,
    pub failure: Option<FailureType>,
    pub vars: NodeVariables,
    /// Variables declared on this node, owned by it
    pub declared: Vec<(String, ExprId)>,
    /// Library interface bindings: shared with the caller
    pub aliases: Vec<(String, ExprId)>,
    /// Expression roots torn down with the node
    pub owned: Vec<ExprId>,
    /// Time the current state was entered
    pub state_start_time: Option<f64>,
    pub state_start_cycle: u64,
    pub iteration: u32,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        self.body.node_type()
    }

    pub fn condition(&self, which: Condition) -> Option<ExprId> {
        self.conditions[which.index()]
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Look a variable up among this node's own declarations and aliases
    pub fn local_variable(&self, name: &str) -> Option<ExprId> {
        self.declared
            .iter()
            .chain(self.aliases.iter())
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }
}

/// Condition values and structural facts a transition depends on.
///
/// `None` means unknown. Absent user conditions are filled with their
/// defaults by the caller, and `end` is already combined with the
/// type-specific completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionSnapshot {
    pub skip: Option<bool>,
    pub start: Option<bool>,
    pub end: Option<bool>,
    pub exit: Option<bool>,
    pub invariant: Option<bool>,
    pub pre: Option<bool>,
    pub post: Option<bool>,
    pub repeat: Option<bool>,
    /// Some ancestor's exit condition is true
    pub ancestor_exit: bool,
    /// Some ancestor's invariant condition is false
    pub ancestor_invariant_failed: bool,
    /// Some ancestor's end condition is true
    pub ancestor_end: bool,
    /// `None` for a root
    pub parent_state: Option<NodeState>,
    /// Every child is WAITING, INACTIVE or FINISHED
    pub children_settled: bool,
    /// Type-specific cleanup after failure is done
    pub cleanup_complete: bool,
}

impl Default for ConditionSnapshot {
    fn default() -> Self {
        Self {
            skip: Some(false),
            start: Some(true),
            end: Some(true),
            exit: Some(false),
            invariant: Some(true),
            pre: Some(true),
            post: Some(true),
            repeat: Some(false),
            ancestor_exit: false,
            ancestor_invariant_failed: false,
            ancestor_end: false,
            parent_state: None,
            children_settled: true,
            cleanup_complete: true,
        }
    }
}

/// Where a node goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub state: NodeState,
    /// `None` keeps the current outcome
    pub outcome: Option<NodeOutcome>,
    pub failure: Option<FailureType>,
}

impl Destination {
    fn to(state: NodeState) -> Self {
        Self {
            state,
            outcome: None,
            failure: None,
        }
    }

    fn with_outcome(state: NodeState, outcome: NodeOutcome) -> Self {
        Self {
            state,
            outcome: Some(outcome),
            failure: None,
        }
    }

    fn failing(failure: FailureType) -> Self {
        Self {
            state: NodeState::Failing,
            outcome: Some(failure.outcome()),
            failure: Some(failure),
        }
    }

    fn post(c: &ConditionSnapshot) -> Self {
        if c.post == Some(true) {
            Self::with_outcome(NodeState::IterationEnded, NodeOutcome::Success)
        } else {
            Self {
                state: NodeState::IterationEnded,
                outcome: Some(NodeOutcome::Failure),
                failure: Some(FailureType::PostConditionFailed),
            }
        }
    }
}

/// Interrupting conditions checked in EXECUTING and FINISHING, in priority
/// order.
fn interruption(c: &ConditionSnapshot) -> Option<Destination> {
    if c.invariant == Some(false) {
        Some(Destination::failing(FailureType::InvariantConditionFailed))
    } else if c.exit == Some(true) {
        Some(Destination::failing(FailureType::Exited))
    } else if c.ancestor_invariant_failed {
        Some(Destination::failing(FailureType::ParentFailed))
    } else if c.ancestor_exit {
        Some(Destination::failing(FailureType::ParentExited))
    } else {
        None
    }
}

/// Next state of a node, if any.
///
/// Reservation arbitration for WAITING → EXECUTING is not part of this
/// function; the executive applies it to the candidates it returns.
pub fn dest_state(state: NodeState, node_type: NodeType, c: &ConditionSnapshot) -> Option<Destination> {
    match state {
        NodeState::Inactive => match c.parent_state {
            None | Some(NodeState::Executing) => Some(Destination::to(NodeState::Waiting)),
            Some(NodeState::Finished) => Some(Destination::with_outcome(
                NodeState::Finished,
                NodeOutcome::Skipped,
            )),
            Some(_) => None,
        },
        NodeState::Waiting => {
            if c.ancestor_exit || c.ancestor_invariant_failed || c.ancestor_end || c.skip == Some(true) {
                return Some(Destination::with_outcome(
                    NodeState::Finished,
                    NodeOutcome::Skipped,
                ));
            }
            if c.start != Some(true) {
                return None;
            }
            match c.pre {
                Some(true) => Some(Destination::to(NodeState::Executing)),
                Some(false) => Some(Destination::with_outcome(
                    NodeState::IterationEnded,
                    NodeOutcome::Skipped,
                )),
                None => None,
            }
        }
        NodeState::Executing => {
            if let Some(dest) = interruption(c) {
                return Some(dest);
            }
            if c.end != Some(true) {
                return None;
            }
            if node_type.has_children() {
                Some(Destination::to(NodeState::Finishing))
            } else {
                Some(Destination::post(c))
            }
        }
        NodeState::Finishing => {
            if let Some(dest) = interruption(c) {
                return Some(dest);
            }
            if c.children_settled {
                Some(Destination::post(c))
            } else {
                None
            }
        }
        NodeState::Failing => {
            if c.cleanup_complete && c.children_settled {
                Some(Destination::to(NodeState::Finished))
            } else {
                None
            }
        }
        NodeState::IterationEnded => {
            if c.ancestor_exit || c.ancestor_invariant_failed || c.ancestor_end {
                return Some(Destination::to(NodeState::Finished));
            }
            match c.repeat {
                Some(true) => Some(Destination::to(NodeState::Waiting)),
                Some(false) => Some(Destination::to(NodeState::Finished)),
                None => None,
            }
        }
        NodeState::Finished => match c.parent_state {
            Some(NodeState::Waiting) => Some(Destination::to(NodeState::Inactive)),
            _ => None,
        },
    }
}
