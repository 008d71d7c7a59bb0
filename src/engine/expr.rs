//! Expression listener graph
//!
//! Every value a plan can test lives in an [`Expression`] stored in the
//! [`ExprGraph`] arena. Leaves (constants, variables, lookups, node
//! variables) are passive; functions are calculable and listen to their
//! subexpressions. Edges run both ways by index: a function holds its
//! subexpressions, and each subexpression holds the function in its
//! listener list.
//!
//! Activation is reference counted. An expression only recomputes and
//! forwards change notifications while active, and a function forwards
//! only when its own value actually changed.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::trace;

use crate::engine::arena::{Arena, Index};
use crate::engine::node::NodeId;
use crate::engine::value::Value;
use crate::error::{ExecError, ExecResult};

/// Handle to an expression in the graph
pub type ExprId = Index<Expression>;

/// Who gets told when an expression changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    Expr(ExprId),
    Node(NodeId),
}

/// Edge from a calculable expression to one of its operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubExpr {
    pub id: ExprId,
    /// Owned operands are torn down with their owner; shared ones (named
    /// variables, library aliases, node variables) only lose the edge.
    pub owned: bool,
}

impl SubExpr {
    pub fn owned(id: ExprId) -> Self {
        Self { id, owned: true }
    }

    pub fn shared(id: ExprId) -> Self {
        Self { id, owned: false }
    }
}

/// Operators available to calculable expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Not,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Abs,
    Min,
    Max,
    Sqrt,
    IsKnown,
    Concat,
    ArraySize,
    ArrayElement,
}

impl Operator {
    /// Accepted operand counts as (min, max)
    pub fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Operator::Not
            | Operator::Abs
            | Operator::Sqrt
            | Operator::IsKnown
            | Operator::ArraySize => (1, Some(1)),
            Operator::Xor
            | Operator::Eq
            | Operator::Ne
            | Operator::Lt
            | Operator::Le
            | Operator::Gt
            | Operator::Ge
            | Operator::Div
            | Operator::Mod
            | Operator::ArrayElement => (2, Some(2)),
            Operator::Sub => (1, Some(2)),
            Operator::And | Operator::Or | Operator::Concat => (0, None),
            Operator::Add | Operator::Mul | Operator::Min | Operator::Max => (1, None),
        }
    }

    /// Evaluate the operator over operand values. Unknown operands make
    /// the result unknown except where three-valued logic decides anyway.
    /// An operand count outside [`Operator::arity`] yields unknown.
    pub fn apply(&self, args: &[Value]) -> Value {
        let (min, max) = self.arity();
        if args.len() < min || max.map_or(false, |max| args.len() > max) {
            return Value::Unknown;
        }
        match self {
            Operator::Not => match args[0].as_bool() {
                Some(b) => Value::Boolean(!b),
                None => Value::Unknown,
            },
            Operator::And => {
                let mut unknown = false;
                for arg in args {
                    match arg.as_bool() {
                        Some(false) => return Value::Boolean(false),
                        Some(true) => {}
                        None => unknown = true,
                    }
                }
                if unknown {
                    Value::Unknown
                } else {
                    Value::Boolean(true)
                }
            }
            Operator::Or => {
                let mut unknown = false;
                for arg in args {
                    match arg.as_bool() {
                        Some(true) => return Value::Boolean(true),
                        Some(false) => {}
                        None => unknown = true,
                    }
                }
                if unknown {
                    Value::Unknown
                } else {
                    Value::Boolean(false)
                }
            }
            Operator::Xor => match (args[0].as_bool(), args[1].as_bool()) {
                (Some(a), Some(b)) => Value::Boolean(a != b),
                _ => Value::Unknown,
            },
            Operator::Eq => args[0]
                .equals(&args[1])
                .map(Value::Boolean)
                .unwrap_or_default(),
            Operator::Ne => args[0]
                .equals(&args[1])
                .map(|eq| Value::Boolean(!eq))
                .unwrap_or_default(),
            Operator::Lt => compare_with(args, |o| o == Ordering::Less),
            Operator::Le => compare_with(args, |o| o != Ordering::Greater),
            Operator::Gt => compare_with(args, |o| o == Ordering::Greater),
            Operator::Ge => compare_with(args, |o| o != Ordering::Less),
            Operator::Add => arithmetic(args, i64::checked_add, |a, b| a + b),
            Operator::Mul => arithmetic(args, i64::checked_mul, |a, b| a * b),
            Operator::Sub => {
                if args.len() == 1 {
                    match &args[0] {
                        Value::Integer(i) => i.checked_neg().map(Value::Integer).unwrap_or_default(),
                        other => other.as_real().map(|r| Value::Real(-r)).unwrap_or_default(),
                    }
                } else {
                    arithmetic(args, i64::checked_sub, |a, b| a - b)
                }
            }
            Operator::Div => match (&args[0], &args[1]) {
                (Value::Integer(_), Value::Integer(0)) => Value::Unknown,
                (Value::Integer(a), Value::Integer(b)) => {
                    a.checked_div(*b).map(Value::Integer).unwrap_or_default()
                }
                (a, b) => match (a.as_real(), b.as_real()) {
                    (Some(_), Some(d)) if d == 0.0 => Value::Unknown,
                    (Some(n), Some(d)) => Value::Real(n / d),
                    _ => Value::Unknown,
                },
            },
            Operator::Mod => match (&args[0], &args[1]) {
                (Value::Integer(a), Value::Integer(b)) if *b != 0 => {
                    a.checked_rem(*b).map(Value::Integer).unwrap_or_default()
                }
                _ => Value::Unknown,
            },
            Operator::Abs => match &args[0] {
                Value::Integer(i) => i.checked_abs().map(Value::Integer).unwrap_or_default(),
                other => other.as_real().map(|r| Value::Real(r.abs())).unwrap_or_default(),
            },
            Operator::Min => extremum(args, Ordering::Less),
            Operator::Max => extremum(args, Ordering::Greater),
            Operator::Sqrt => match args[0].as_real() {
                Some(r) if r >= 0.0 => Value::Real(r.sqrt()),
                _ => Value::Unknown,
            },
            Operator::IsKnown => Value::Boolean(args[0].is_known()),
            Operator::Concat => {
                let mut out = String::new();
                for arg in args {
                    match arg.as_str() {
                        Some(s) => out.push_str(s),
                        None => return Value::Unknown,
                    }
                }
                Value::String(out)
            }
            Operator::ArraySize => match &args[0] {
                Value::Array(items) => Value::Integer(items.len() as i64),
                _ => Value::Unknown,
            },
            Operator::ArrayElement => match (&args[0], args[1].as_integer()) {
                (Value::Array(items), Some(i)) if i >= 0 => {
                    items.get(i as usize).cloned().unwrap_or_default()
                }
                _ => Value::Unknown,
            },
        }
    }
}

fn compare_with(args: &[Value], test: impl Fn(Ordering) -> bool) -> Value {
    if !args[0].is_known() || !args[1].is_known() {
        return Value::Unknown;
    }
    match args[0].compare(&args[1]) {
        Some(ordering) => Value::Boolean(test(ordering)),
        None => Value::Unknown,
    }
}

fn arithmetic(
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    real_op: fn(f64, f64) -> f64,
) -> Value {
    if args.iter().all(|a| matches!(a, Value::Integer(_))) {
        let mut acc: Option<i64> = None;
        for arg in args {
            let i = arg.as_integer().unwrap_or_default();
            acc = match acc {
                None => Some(i),
                Some(total) => match int_op(total, i) {
                    Some(v) => Some(v),
                    None => return Value::Unknown,
                },
            };
        }
        return acc.map(Value::Integer).unwrap_or_default();
    }
    let mut acc: Option<f64> = None;
    for arg in args {
        let r = match arg.as_real() {
            Some(r) => r,
            None => return Value::Unknown,
        };
        acc = Some(match acc {
            None => r,
            Some(total) => real_op(total, r),
        });
    }
    acc.map(Value::Real).unwrap_or_default()
}

fn extremum(args: &[Value], keep: Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for arg in args {
        if !arg.is_numeric() {
            return Value::Unknown;
        }
        best = match best {
            Some(current) if current.compare(arg) != Some(keep.reverse()) => Some(current),
            _ => Some(arg),
        };
    }
    best.cloned().unwrap_or_default()
}

/// Which per-node variable a [`ExprKind::NodeVariable`] mirrors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeVariableKind {
    State,
    Outcome,
    FailureType,
    CommandHandle,
}

/// Lookup registration parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LookupData {
    pub state_name: String,
    pub args: Vec<SubExpr>,
    /// `None` for a one-shot LookupNow; a tolerance for LookupOnChange
    pub tolerance: Option<f64>,
}

impl LookupData {
    pub fn is_change_lookup(&self) -> bool {
        self.tolerance.is_some()
    }
}

/// Assignable cell state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableData {
    pub initial: Value,
    /// Value before the last assignment, for rollback
    pub saved: Option<Value>,
    /// Node currently permitted to write
    pub reserved_by: Option<NodeId>,
}

/// Closed set of expression kinds
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Constant,
    Variable(VariableData),
    NodeVariable(NodeVariableKind),
    Lookup(LookupData),
    Function { op: Operator, args: Vec<SubExpr> },
}

impl ExprKind {
    pub fn is_calculable(&self) -> bool {
        matches!(self, ExprKind::Function { .. } | ExprKind::Lookup(_))
    }
}

/// A value cell in the graph
#[derive(Debug)]
pub struct Expression {
    name: Option<String>,
    kind: ExprKind,
    value: Value,
    activation_count: u32,
    listeners: Vec<Listener>,
    durable: bool,
}

impl Expression {
    fn new(name: Option<String>, kind: ExprKind, value: Value) -> Self {
        Self {
            name,
            kind,
            value,
            activation_count: 0,
            listeners: Vec::new(),
            durable: false,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_active(&self) -> bool {
        self.activation_count > 0
    }

    pub fn activation_count(&self) -> u32 {
        self.activation_count
    }

    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }
}

/// Lookup activity the state cache must act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupEvent {
    Activated(ExprId),
    Deactivated(ExprId),
    /// An argument of an active lookup changed; the state it reads is now
    /// a different one
    ArgumentsChanged(ExprId),
}

/// Arena of expressions plus the pending side effects of graph updates
pub struct ExprGraph {
    exprs: Arena<Expression>,
    true_value: ExprId,
    false_value: ExprId,
    unknown_value: ExprId,
    lookup_events: Vec<LookupEvent>,
    changed_nodes: Vec<NodeId>,
}

impl ExprGraph {
    pub fn new() -> Self {
        let mut exprs = Arena::new("expression");
        let mut durable = |exprs: &mut Arena<Expression>, value: Value| {
            let mut expr = Expression::new(None, ExprKind::Constant, value);
            expr.durable = true;
            exprs.insert(expr)
        };
        let true_value = durable(&mut exprs, Value::Boolean(true));
        let false_value = durable(&mut exprs, Value::Boolean(false));
        let unknown_value = durable(&mut exprs, Value::Unknown);
        Self {
            exprs,
            true_value,
            false_value,
            unknown_value,
            lookup_events: Vec::new(),
            changed_nodes: Vec::new(),
        }
    }

    /// Shared `true` constant
    pub fn true_value(&self) -> ExprId {
        self.true_value
    }

    /// Shared `false` constant
    pub fn false_value(&self) -> ExprId {
        self.false_value
    }

    /// Shared unknown constant
    pub fn unknown_value(&self) -> ExprId {
        self.unknown_value
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    pub fn contains(&self, id: ExprId) -> bool {
        self.exprs.contains(id)
    }

    pub fn get(&self, id: ExprId) -> ExecResult<&Expression> {
        self.exprs.get(id)
    }

    // =========================================================================
    // Construction
    // =========================================================================

    pub fn constant(&mut self, value: Value) -> ExprId {
        self.exprs
            .insert(Expression::new(None, ExprKind::Constant, value))
    }

    pub fn variable(&mut self, name: impl Into<String>, initial: Value) -> ExprId {
        let data = VariableData {
            initial: initial.clone(),
            ..Default::default()
        };
        self.exprs.insert(Expression::new(
            Some(name.into()),
            ExprKind::Variable(data),
            initial,
        ))
    }

    pub fn node_variable(
        &mut self,
        name: impl Into<String>,
        kind: NodeVariableKind,
        initial: Value,
    ) -> ExprId {
        self.exprs.insert(Expression::new(
            Some(name.into()),
            ExprKind::NodeVariable(kind),
            initial,
        ))
    }

    pub fn lookup(&mut self, data: LookupData) -> ExprId {
        let args: Vec<ExprId> = data.args.iter().map(|a| a.id).collect();
        let name = data.state_name.clone();
        let id = self
            .exprs
            .insert(Expression::new(Some(name), ExprKind::Lookup(data), Value::Unknown));
        for arg in args {
            self.add_listener(arg, Listener::Expr(id));
        }
        id
    }

    pub fn function(&mut self, op: Operator, args: Vec<SubExpr>) -> ExecResult<ExprId> {
        let (min, max) = op.arity();
        if args.len() < min || max.map_or(false, |max| args.len() > max) {
            return Err(ExecError::Internal(format!(
                "operator {:?} given {} operands",
                op,
                args.len()
            )));
        }
        let operands: Vec<ExprId> = args.iter().map(|a| a.id).collect();
        for operand in &operands {
            self.exprs.get(*operand)?;
        }
        let id = self.exprs.insert(Expression::new(
            None,
            ExprKind::Function { op, args },
            Value::Unknown,
        ));
        for operand in operands {
            self.add_listener(operand, Listener::Expr(id));
        }
        Ok(id)
    }

    fn add_listener(&mut self, id: ExprId, listener: Listener) {
        if let Some(expr) = self.exprs.try_get_mut(id) {
            if !expr.listeners.contains(&listener) {
                expr.listeners.push(listener);
            }
        }
    }

    pub fn add_node_listener(&mut self, id: ExprId, node: NodeId) -> ExecResult<()> {
        self.exprs.get(id)?;
        self.add_listener(id, Listener::Node(node));
        Ok(())
    }

    pub fn remove_listener(&mut self, id: ExprId, listener: Listener) {
        if let Some(expr) = self.exprs.try_get_mut(id) {
            expr.listeners.retain(|l| *l != listener);
        }
    }

    // =========================================================================
    // Values
    // =========================================================================

    pub fn value(&self, id: ExprId) -> ExecResult<&Value> {
        Ok(&self.exprs.get(id)?.value)
    }

    /// Boolean reading of a condition; `None` when unknown or non-Boolean
    pub fn bool_value(&self, id: ExprId) -> ExecResult<Option<bool>> {
        Ok(self.exprs.get(id)?.value.as_bool())
    }

    pub fn is_active(&self, id: ExprId) -> ExecResult<bool> {
        Ok(self.exprs.get(id)?.is_active())
    }

    /// Human-readable label for logs and errors
    pub fn describe(&self, id: ExprId) -> String {
        match self.exprs.try_get(id) {
            Some(expr) => match (&expr.name, &expr.kind) {
                (Some(name), _) => name.clone(),
                (None, ExprKind::Function { op, .. }) => format!("{:?}{:?}", op, id),
                (None, _) => format!("{}", expr.value),
            },
            None => format!("<stale {:?}>", id),
        }
    }

    /// Set the value of a passive expression and propagate the change.
    ///
    /// Returns whether the value changed. Setting an equal value is a no-op:
    /// nobody hears about it.
    pub fn set_value(&mut self, id: ExprId, value: Value) -> ExecResult<bool> {
        let expr = self.exprs.get_mut(id)?;
        if let ExprKind::Function { .. } = expr.kind {
            return Err(ExecError::Internal(format!(
                "attempted to set value of calculable expression {:?}",
                id
            )));
        }
        if expr.value == value {
            return Ok(false);
        }
        trace!(expr = ?id, old = %expr.value, new = %value, "expression value changed");
        expr.value = value;
        if expr.is_active() {
            self.propagate(id)?;
        }
        Ok(true)
    }

    /// Notify everything downstream of `origin`. Calculable listeners
    /// recompute and continue only if their own value changed; node
    /// listeners are collected for the exec to re-check.
    fn propagate(&mut self, origin: ExprId) -> ExecResult<()> {
        let mut stack = vec![origin];
        while let Some(id) = stack.pop() {
            let listeners = self.exprs.get(id)?.listeners.clone();
            // reversed so the first listener is visited first
            for listener in listeners.into_iter().rev() {
                match listener {
                    Listener::Expr(dest) => {
                        let (active, lookup) = self.exprs.try_get(dest).map_or((false, false), |e| {
                            (e.is_active(), matches!(e.kind, ExprKind::Lookup(_)))
                        });
                        if !active {
                            continue;
                        }
                        if lookup {
                            let event = LookupEvent::ArgumentsChanged(dest);
                            if !self.lookup_events.contains(&event) {
                                self.lookup_events.push(event);
                            }
                        } else if self.recompute(dest)? {
                            stack.push(dest);
                        }
                    }
                    Listener::Node(node) => {
                        if !self.changed_nodes.contains(&node) {
                            self.changed_nodes.push(node);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Recompute a function from its operands. Returns whether its value
    /// changed. Lookups are fed by the state cache and never recompute here;
    /// a change to their arguments is reported as a lookup event instead.
    fn recompute(&mut self, id: ExprId) -> ExecResult<bool> {
        let (op, operands) = match &self.exprs.get(id)?.kind {
            ExprKind::Function { op, args } => (*op, args.clone()),
            _ => return Ok(false),
        };
        let mut values = Vec::with_capacity(operands.len());
        for operand in &operands {
            values.push(self.exprs.get(operand.id)?.value.clone());
        }
        let new_value = op.apply(&values);
        let expr = self.exprs.get_mut(id)?;
        if expr.value == new_value {
            return Ok(false);
        }
        expr.value = new_value;
        Ok(true)
    }

    // =========================================================================
    // Activation
    // =========================================================================

    /// Increment the activation count; the first activation activates
    /// operands and brings the value up to date without notifying.
    pub fn activate(&mut self, id: ExprId) -> ExecResult<()> {
        let expr = self.exprs.get_mut(id)?;
        expr.activation_count = expr.activation_count.checked_add(1).ok_or_else(|| {
            ExecError::Internal(format!("activation count overflow on {:?}", id))
        })?;
        if expr.activation_count > 1 {
            return Ok(());
        }
        match &expr.kind {
            ExprKind::Function { args, .. } => {
                let operands: Vec<ExprId> = args.iter().map(|a| a.id).collect();
                for operand in operands {
                    self.activate(operand)?;
                }
                self.recompute(id)?;
            }
            ExprKind::Lookup(data) => {
                let operands: Vec<ExprId> = data.args.iter().map(|a| a.id).collect();
                for operand in operands {
                    self.activate(operand)?;
                }
                self.lookup_events.push(LookupEvent::Activated(id));
            }
            _ => {}
        }
        Ok(())
    }

    /// Decrement the activation count. Deactivating an inactive expression
    /// is an internal error.
    pub fn deactivate(&mut self, id: ExprId) -> ExecResult<()> {
        let label = self.describe(id);
        let expr = self.exprs.get_mut(id)?;
        if expr.activation_count == 0 {
            return Err(ExecError::ActivationUnderflow(label));
        }
        expr.activation_count -= 1;
        if expr.activation_count > 0 {
            return Ok(());
        }
        match &expr.kind {
            ExprKind::Function { args, .. } => {
                let operands: Vec<ExprId> = args.iter().map(|a| a.id).collect();
                for operand in operands {
                    self.deactivate(operand)?;
                }
            }
            ExprKind::Lookup(data) => {
                let operands: Vec<ExprId> = data.args.iter().map(|a| a.id).collect();
                expr.value = Value::Unknown;
                for operand in operands {
                    self.deactivate(operand)?;
                }
                self.lookup_events.push(LookupEvent::Deactivated(id));
            }
            _ => {}
        }
        Ok(())
    }

    /// Lookup activity since the last drain
    pub fn drain_lookup_events(&mut self) -> Vec<LookupEvent> {
        std::mem::take(&mut self.lookup_events)
    }

    /// Nodes whose conditions changed since the last drain
    pub fn drain_changed_nodes(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.changed_nodes)
    }

    pub fn has_changed_nodes(&self) -> bool {
        !self.changed_nodes.is_empty()
    }

    // =========================================================================
    // Variables
    // =========================================================================

    fn variable_data_mut(&mut self, id: ExprId) -> ExecResult<&mut VariableData> {
        match &mut self.exprs.get_mut(id)?.kind {
            ExprKind::Variable(data) => Ok(data),
            other => Err(ExecError::Internal(format!(
                "{:?} is not assignable ({:?})",
                id, other
            ))),
        }
    }

    /// Remember the current value for a later [`restore`](Self::restore)
    pub fn save(&mut self, id: ExprId) -> ExecResult<()> {
        let current = self.exprs.get(id)?.value.clone();
        self.variable_data_mut(id)?.saved = Some(current);
        Ok(())
    }

    /// Roll back to the saved value, if any
    pub fn restore(&mut self, id: ExprId) -> ExecResult<bool> {
        match self.variable_data_mut(id)?.saved.take() {
            Some(previous) => {
                self.set_value(id, previous)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop the saved value after a successful assignment
    pub fn commit(&mut self, id: ExprId) -> ExecResult<()> {
        self.variable_data_mut(id)?.saved = None;
        Ok(())
    }

    /// Put a variable back to its declared initial value
    pub fn reset_variable(&mut self, id: ExprId) -> ExecResult<()> {
        let data = self.variable_data_mut(id)?;
        data.saved = None;
        let initial = data.initial.clone();
        self.set_value(id, initial)?;
        Ok(())
    }

    pub fn reserved_by(&self, id: ExprId) -> ExecResult<Option<NodeId>> {
        match &self.exprs.get(id)?.kind {
            ExprKind::Variable(data) => Ok(data.reserved_by),
            _ => Ok(None),
        }
    }

    /// Claim the write reservation. Fails if another node holds it.
    pub fn reserve(&mut self, id: ExprId, node: NodeId) -> ExecResult<bool> {
        let data = self.variable_data_mut(id)?;
        match data.reserved_by {
            Some(holder) if holder != node => Ok(false),
            _ => {
                data.reserved_by = Some(node);
                Ok(true)
            }
        }
    }

    /// Release the reservation if `node` holds it
    pub fn release(&mut self, id: ExprId, node: NodeId) -> ExecResult<bool> {
        let data = self.variable_data_mut(id)?;
        if data.reserved_by == Some(node) {
            data.reserved_by = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Remove an expression and every operand it owns. Shared operands
    /// only lose the listener edge. Durable constants are never removed.
    pub fn remove_tree(&mut self, id: ExprId) -> ExecResult<()> {
        let expr = match self.exprs.try_get(id) {
            Some(expr) => expr,
            None => return Ok(()),
        };
        if expr.durable {
            return Ok(());
        }
        let operands: Vec<SubExpr> = match &expr.kind {
            ExprKind::Function { args, .. } => args.clone(),
            ExprKind::Lookup(data) => data.args.clone(),
            _ => Vec::new(),
        };
        if expr.is_active() && matches!(expr.kind, ExprKind::Lookup(_)) {
            self.lookup_events.push(LookupEvent::Deactivated(id));
        }
        for operand in operands {
            self.remove_listener(operand.id, Listener::Expr(id));
            if operand.owned {
                self.remove_tree(operand.id)?;
            }
        }
        self.exprs.remove(id);
        Ok(())
    }
}

impl Default for ExprGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(graph: &mut ExprGraph, v: i64) -> ExprId {
        graph.constant(Value::Integer(v))
    }

    #[test]
    fn test_function_recomputes_on_activation() {
        let mut graph = ExprGraph::new();
        let x = graph.variable("x", Value::Integer(2));
        let three = int(&mut graph, 3);
        let sum = graph
            .function(Operator::Add, vec![SubExpr::shared(x), SubExpr::owned(three)])
            .unwrap();

        assert_eq!(*graph.value(sum).unwrap(), Value::Unknown);
        graph.activate(sum).unwrap();
        assert_eq!(*graph.value(sum).unwrap(), Value::Integer(5));
        assert!(graph.is_active(x).unwrap());
    }

    #[test]
    fn test_inactive_function_ignores_changes() {
        let mut graph = ExprGraph::new();
        let x = graph.variable("x", Value::Integer(1));
        let neg = graph.function(Operator::Sub, vec![SubExpr::shared(x)]).unwrap();

        graph.activate(x).unwrap();
        graph.set_value(x, Value::Integer(4)).unwrap();
        assert_eq!(*graph.value(neg).unwrap(), Value::Unknown);
    }

    #[test]
    fn test_change_propagates_to_nodes_only_when_value_changes() {
        let mut graph = ExprGraph::new();
        let x = graph.variable("x", Value::Integer(1));
        let ten = int(&mut graph, 10);
        let below = graph
            .function(Operator::Lt, vec![SubExpr::shared(x), SubExpr::owned(ten)])
            .unwrap();
        let node = NodeId::from_raw_parts(0, 0);
        graph.add_node_listener(below, node).unwrap();
        graph.activate(below).unwrap();

        // 1 -> 2 keeps x < 10 true: the function suppresses the change
        graph.set_value(x, Value::Integer(2)).unwrap();
        assert!(graph.drain_changed_nodes().is_empty());

        graph.set_value(x, Value::Integer(20)).unwrap();
        assert_eq!(graph.drain_changed_nodes(), vec![node]);
        assert_eq!(graph.bool_value(below).unwrap(), Some(false));
    }

    #[test]
    fn test_deactivate_underflow_is_error() {
        let mut graph = ExprGraph::new();
        let x = graph.variable("x", Value::Unknown);
        graph.activate(x).unwrap();
        graph.deactivate(x).unwrap();
        assert!(matches!(
            graph.deactivate(x),
            Err(ExecError::ActivationUnderflow(name)) if name == "x"
        ));
    }

    #[test]
    fn test_nested_activation_is_counted() {
        let mut graph = ExprGraph::new();
        let x = graph.variable("x", Value::Boolean(true));
        let not = graph.function(Operator::Not, vec![SubExpr::shared(x)]).unwrap();
        graph.activate(not).unwrap();
        graph.activate(not).unwrap();
        graph.deactivate(not).unwrap();
        assert!(graph.is_active(not).unwrap());
        assert!(graph.is_active(x).unwrap());
        graph.deactivate(not).unwrap();
        assert!(!graph.is_active(not).unwrap());
        assert!(!graph.is_active(x).unwrap());
    }

    #[test]
    fn test_three_valued_logic() {
        let t = Value::Boolean(true);
        let f = Value::Boolean(false);
        let u = Value::Unknown;
        assert_eq!(Operator::And.apply(&[t.clone(), u.clone()]), Value::Unknown);
        assert_eq!(Operator::And.apply(&[f.clone(), u.clone()]), f);
        assert_eq!(Operator::Or.apply(&[t.clone(), u.clone()]), t);
        assert_eq!(Operator::Or.apply(&[]), Value::Boolean(false));
        assert_eq!(Operator::And.apply(&[]), Value::Boolean(true));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(
            Operator::Add.apply(&[Value::Integer(2), Value::Integer(3)]),
            Value::Integer(5)
        );
        assert_eq!(
            Operator::Add.apply(&[Value::Integer(2), Value::Real(0.5)]),
            Value::Real(2.5)
        );
        assert_eq!(
            Operator::Div.apply(&[Value::Integer(1), Value::Integer(0)]),
            Value::Unknown
        );
        assert_eq!(
            Operator::Max.apply(&[Value::Integer(2), Value::Real(7.5), Value::Integer(3)]),
            Value::Real(7.5)
        );
        assert_eq!(
            Operator::Min.apply(&[Value::Integer(2), Value::Real(7.5)]),
            Value::Integer(2)
        );
    }

    #[test]
    fn test_wrong_operand_count_is_unknown() {
        assert_eq!(Operator::Not.apply(&[]), Value::Unknown);
        assert_eq!(Operator::Lt.apply(&[Value::Integer(1)]), Value::Unknown);
        assert_eq!(
            Operator::Sub.apply(&[Value::Integer(1), Value::Integer(2), Value::Integer(3)]),
            Value::Unknown
        );
    }

    #[test]
    fn test_save_restore() {
        let mut graph = ExprGraph::new();
        let x = graph.variable("x", Value::Integer(1));
        graph.save(x).unwrap();
        graph.set_value(x, Value::Integer(5)).unwrap();
        assert!(graph.restore(x).unwrap());
        assert_eq!(*graph.value(x).unwrap(), Value::Integer(1));
        assert!(!graph.restore(x).unwrap());
    }

    #[test]
    fn test_reservation_single_holder() {
        let mut graph = ExprGraph::new();
        let x = graph.variable("x", Value::Unknown);
        let a = NodeId::from_raw_parts(1, 0);
        let b = NodeId::from_raw_parts(2, 0);
        assert!(graph.reserve(x, a).unwrap());
        assert!(!graph.reserve(x, b).unwrap());
        assert!(!graph.release(x, b).unwrap());
        assert!(graph.release(x, a).unwrap());
        assert!(graph.reserve(x, b).unwrap());
    }

    #[test]
    fn test_remove_tree_keeps_shared_operands() {
        let mut graph = ExprGraph::new();
        let x = graph.variable("x", Value::Integer(1));
        let one = int(&mut graph, 1);
        let sum = graph
            .function(Operator::Add, vec![SubExpr::shared(x), SubExpr::owned(one)])
            .unwrap();
        graph.remove_tree(sum).unwrap();
        assert!(graph.contains(x));
        assert!(!graph.contains(one));
        assert!(!graph.contains(sum));
        assert!(graph.get(x).unwrap().listeners().is_empty());
    }

    #[test]
    fn test_lookup_activation_emits_events() {
        let mut graph = ExprGraph::new();
        let lookup = graph.lookup(LookupData {
            state_name: "altitude".into(),
            args: vec![],
            tolerance: Some(0.5),
        });
        graph.activate(lookup).unwrap();
        graph.deactivate(lookup).unwrap();
        assert_eq!(
            graph.drain_lookup_events(),
            vec![LookupEvent::Activated(lookup), LookupEvent::Deactivated(lookup)]
        );
    }

    #[test]
    fn test_lookup_argument_change_emits_event() {
        let mut graph = ExprGraph::new();
        let sensor = graph.variable("sensor", Value::String("a".into()));
        let lookup = graph.lookup(LookupData {
            state_name: "temp".into(),
            args: vec![SubExpr::shared(sensor)],
            tolerance: Some(0.0),
        });
        // inactive lookups do not care
        graph.set_value(sensor, Value::String("b".into())).unwrap();
        assert!(graph.drain_lookup_events().is_empty());

        graph.activate(lookup).unwrap();
        graph.drain_lookup_events();
        graph.set_value(sensor, Value::String("c".into())).unwrap();
        graph.set_value(sensor, Value::String("d".into())).unwrap();
        assert_eq!(
            graph.drain_lookup_events(),
            vec![LookupEvent::ArgumentsChanged(lookup)]
        );
        assert!(!graph.has_changed_nodes());
    }
}
