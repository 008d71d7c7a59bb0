//! Reactive Exec - condition-driven plan execution engine
//!
//! Plans are trees of nodes. Each node moves through a fixed lifecycle
//! (`INACTIVE`, `WAITING`, `EXECUTING`, `FINISHING`, `ITERATION_ENDED`,
//! `FAILING`, `FINISHED`) whenever the boolean conditions guarding it change.
//! Conditions are expressions over plan variables, other nodes' state and
//! values looked up from the outside world.
//!
//! # Features
//!
//! - Quiescence cycles: every node sees one consistent snapshot per step
//! - Expression listener graph with reference-counted activation
//! - State cache with change-lookup tolerances and threshold pushdown
//! - Thread-safe input queue with marks for synchronous callers
//! - Variable reservations arbitrated by node priority
//! - Library nodes, command aborts, planner updates and message pairing
//! - Plans as YAML or JSON documents
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reactive_exec::prelude::*;
//!
//! let adapter = Arc::new(ScriptedInterface::new());
//! let mut exec = Exec::new(ExecConfig::default(), Interfaces::shared(adapter.clone()))?;
//! adapter.attach(exec.queue());
//! adapter.auto_ack_commands(CommandHandle::Success);
//!
//! let plan = PlanNode::from_yaml(r#"
//! id: Drive
//! type: list
//! children:
//!   - id: Go
//!     type: command
//!     name: move
//!     args: [{int: 3}]
//! "#)?;
//! exec.add_plan(plan)?;
//! exec.run_until_quiescent(100)?;
//! assert!(exec.all_plans_finished());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod engine;
mod error;

// Re-exports
pub use engine::config::ExecConfig;
pub use engine::exec::{CycleReport, Exec, PlanInstance, PlanReport, ShutdownReport};
pub use engine::interface::{
    Command, CommandHandler, CommandId, Interfaces, LookupHandler, PlannerUpdateHandler, State,
    Update, UpdateId,
};
pub use engine::listener::{ExecListener, NodeTransition, RecordingListener, TracingListener};
pub use engine::plan::{ExprSpec, PlanBody, PlanNode};
pub use engine::queue::{InputQueue, QueueEntry};
pub use engine::runner::{ExecHandle, ExecRunner, RunSummary};
pub use engine::scripted::ScriptedInterface;
pub use engine::value::{CommandHandle, FailureType, NodeOutcome, NodeState, Value};
pub use error::{ExecError, ExecResult};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Command, CommandHandle, CommandHandler, CommandId, CycleReport, Exec, ExecConfig,
        ExecError, ExecHandle, ExecListener, ExecResult, ExecRunner, ExprSpec, FailureType,
        InputQueue, Interfaces, LookupHandler, NodeOutcome, NodeState, NodeTransition,
        PlanNode, PlannerUpdateHandler, QueueEntry, RecordingListener, ScriptedInterface,
        State, TracingListener, Value,
    };
}
