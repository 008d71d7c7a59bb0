//! Plan description model
//!
//! A [`PlanNode`] tree is what a plan loader hands the executive. It is plain
//! serde data: YAML and JSON both work, and tests build trees with the
//! `with_*` builder methods. The executive turns a tree into arena nodes and
//! expressions when the add-plan entry is dequeued.
//!
//! ```yaml
//! id: Root
//! type: list
//! variables:
//!   - name: x
//!     initial: { Integer: 0 }
//! children:
//!   - id: Drive
//!     type: command
//!     name: drive
//!     args: [ { real: 1.5 } ]
//!   - id: Record
//!     type: assignment
//!     variable: x
//!     value: { int: 1 }
//!     start:
//!       op:
//!         op: eq
//!         args:
//!           - { node_command_handle: Drive }
//!           - { value: { CommandHandle: COMMAND_SUCCESS } }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::engine::expr::Operator;
use crate::engine::value::{CommandHandle, Value};
use crate::error::ExecResult;

/// Expression as written in a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprSpec {
    Value(Value),
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    /// Variable in scope, by name
    Var(String),
    LookupNow {
        name: String,
        #[serde(default)]
        args: Vec<ExprSpec>,
    },
    LookupOnChange {
        name: String,
        #[serde(default)]
        args: Vec<ExprSpec>,
        #[serde(default)]
        tolerance: f64,
    },
    Op {
        op: Operator,
        #[serde(default)]
        args: Vec<ExprSpec>,
    },
    /// State of a node, by reference
    NodeState(String),
    NodeOutcome(String),
    NodeFailure(String),
    NodeCommandHandle(String),
}

impl ExprSpec {
    pub fn var(name: impl Into<String>) -> Self {
        ExprSpec::Var(name.into())
    }

    pub fn int(value: i64) -> Self {
        ExprSpec::Int(value)
    }

    pub fn real(value: f64) -> Self {
        ExprSpec::Real(value)
    }

    pub fn boolean(value: bool) -> Self {
        ExprSpec::Bool(value)
    }

    pub fn string(value: impl Into<String>) -> Self {
        ExprSpec::Str(value.into())
    }

    pub fn handle(handle: CommandHandle) -> Self {
        ExprSpec::Value(Value::CommandHandle(handle))
    }

    pub fn op(op: Operator, args: Vec<ExprSpec>) -> Self {
        ExprSpec::Op { op, args }
    }

    pub fn eq(a: ExprSpec, b: ExprSpec) -> Self {
        Self::op(Operator::Eq, vec![a, b])
    }

    pub fn not(a: ExprSpec) -> Self {
        Self::op(Operator::Not, vec![a])
    }

    pub fn lookup_now(name: impl Into<String>) -> Self {
        ExprSpec::LookupNow {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn lookup_on_change(name: impl Into<String>, tolerance: f64) -> Self {
        ExprSpec::LookupOnChange {
            name: name.into(),
            args: Vec::new(),
            tolerance,
        }
    }

    /// Literal value, if this is a constant
    pub fn literal(&self) -> Option<Value> {
        match self {
            ExprSpec::Value(v) => Some(v.clone()),
            ExprSpec::Bool(b) => Some(Value::Boolean(*b)),
            ExprSpec::Int(i) => Some(Value::Integer(*i)),
            ExprSpec::Real(r) => Some(Value::Real(*r)),
            ExprSpec::Str(s) => Some(Value::String(s.clone())),
            _ => None,
        }
    }
}

/// Declared variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(default)]
    pub initial: Value,
}

/// The eight user conditions; all optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conditions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<ExprSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<ExprSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<ExprSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre: Option<ExprSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post: Option<ExprSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invariant: Option<ExprSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExprSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<ExprSpec>,
}

/// Name/value pair of a planner update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePair {
    pub name: String,
    pub value: ExprSpec,
}

/// Binding of a library interface variable at the call site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    /// Interface variable name inside the library
    pub name: String,
    pub value: ExprSpec,
}

/// Type-specific part of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanBody {
    Empty,
    List {
        #[serde(default)]
        children: Vec<PlanNode>,
    },
    Command {
        name: String,
        #[serde(default)]
        args: Vec<ExprSpec>,
        /// Variable receiving the command's return value
        #[serde(default)]
        returns: Option<String>,
    },
    Assignment {
        variable: String,
        value: ExprSpec,
    },
    Update {
        #[serde(default)]
        pairs: Vec<UpdatePair>,
    },
    LibraryCall {
        library: String,
        #[serde(default)]
        aliases: Vec<Alias>,
    },
}

impl PlanBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            PlanBody::Empty => "Empty",
            PlanBody::List { .. } => "NodeList",
            PlanBody::Command { .. } => "Command",
            PlanBody::Assignment { .. } => "Assignment",
            PlanBody::Update { .. } => "Update",
            PlanBody::LibraryCall { .. } => "LibraryNodeCall",
        }
    }
}

/// A node of a plan description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    /// Lower wins variable contention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableDecl>,
    /// Names bound by the caller when this node is used as a library
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interface: Vec<String>,
    #[serde(flatten)]
    pub conditions: Conditions,
    #[serde(flatten)]
    pub body: PlanBody,
}

impl PlanNode {
    fn new(id: impl Into<String>, body: PlanBody) -> Self {
        Self {
            id: id.into(),
            priority: None,
            variables: Vec::new(),
            interface: Vec::new(),
            conditions: Conditions::default(),
            body,
        }
    }

    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, PlanBody::Empty)
    }

    pub fn list(id: impl Into<String>, children: Vec<PlanNode>) -> Self {
        Self::new(id, PlanBody::List { children })
    }

    pub fn command(id: impl Into<String>, name: impl Into<String>, args: Vec<ExprSpec>) -> Self {
        Self::new(
            id,
            PlanBody::Command {
                name: name.into(),
                args,
                returns: None,
            },
        )
    }

    pub fn assignment(id: impl Into<String>, variable: impl Into<String>, value: ExprSpec) -> Self {
        Self::new(
            id,
            PlanBody::Assignment {
                variable: variable.into(),
                value,
            },
        )
    }

    pub fn update(id: impl Into<String>, pairs: Vec<(&str, ExprSpec)>) -> Self {
        let pairs = pairs
            .into_iter()
            .map(|(name, value)| UpdatePair {
                name: name.to_string(),
                value,
            })
            .collect();
        Self::new(id, PlanBody::Update { pairs })
    }

    pub fn library_call(id: impl Into<String>, library: impl Into<String>) -> Self {
        Self::new(
            id,
            PlanBody::LibraryCall {
                library: library.into(),
                aliases: Vec::new(),
            },
        )
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, initial: Value) -> Self {
        self.variables.push(VariableDecl {
            name: name.into(),
            initial,
        });
        self
    }

    pub fn with_interface(mut self, name: impl Into<String>) -> Self {
        self.interface.push(name.into());
        self
    }

    pub fn with_start(mut self, expr: ExprSpec) -> Self {
        self.conditions.start = Some(expr);
        self
    }

    pub fn with_end(mut self, expr: ExprSpec) -> Self {
        self.conditions.end = Some(expr);
        self
    }

    pub fn with_repeat(mut self, expr: ExprSpec) -> Self {
        self.conditions.repeat = Some(expr);
        self
    }

    pub fn with_pre(mut self, expr: ExprSpec) -> Self {
        self.conditions.pre = Some(expr);
        self
    }

    pub fn with_post(mut self, expr: ExprSpec) -> Self {
        self.conditions.post = Some(expr);
        self
    }

    pub fn with_invariant(mut self, expr: ExprSpec) -> Self {
        self.conditions.invariant = Some(expr);
        self
    }

    pub fn with_exit(mut self, expr: ExprSpec) -> Self {
        self.conditions.exit = Some(expr);
        self
    }

    pub fn with_skip(mut self, expr: ExprSpec) -> Self {
        self.conditions.skip = Some(expr);
        self
    }

    /// Set the variable receiving a command's return value
    pub fn with_returns(mut self, variable: impl Into<String>) -> Self {
        if let PlanBody::Command { returns, .. } = &mut self.body {
            *returns = Some(variable.into());
        }
        self
    }

    /// Bind a library interface variable
    pub fn with_alias(mut self, name: impl Into<String>, value: ExprSpec) -> Self {
        if let PlanBody::LibraryCall { aliases, .. } = &mut self.body {
            aliases.push(Alias {
                name: name.into(),
                value,
            });
        }
        self
    }

    pub fn children(&self) -> &[PlanNode] {
        match &self.body {
            PlanBody::List { children } => children,
            _ => &[],
        }
    }

    /// Number of nodes in this subtree
    pub fn size(&self) -> usize {
        1 + self.children().iter().map(PlanNode::size).sum::<usize>()
    }

    pub fn from_yaml(yaml: &str) -> ExecResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json(json: &str) -> ExecResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a `.json` file, or YAML for any other extension
    pub fn from_file(path: impl AsRef<Path>) -> ExecResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }

    pub fn to_yaml(&self) -> ExecResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
