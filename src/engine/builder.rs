//! Plan instantiation
//!
//! Turns a [`PlanNode`] description into arena nodes and expressions in two
//! passes. The first pass creates every node, its declared variables and its
//! node variables, expanding library calls in place. The second pass, in
//! pre-order, builds conditions and bodies; by then every name a plan can
//! refer to exists, and a library call's aliases are bound before the
//! library's own nodes look them up.
//!
//! Any structural error tears down whatever was already created, so a
//! rejected plan leaves no trace in the arenas.

use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::engine::arena::Arena;
use crate::engine::expr::{
    ExprGraph, ExprId, ExprKind, Listener, LookupData, NodeVariableKind, SubExpr,
};
use crate::engine::node::{
    AssignmentBody, CommandBody, Condition, Node, NodeBody, NodeId, NodeVariables, UpdateBody,
};
use crate::engine::plan::{ExprSpec, PlanBody, PlanNode};
use crate::engine::value::{NodeState, Value};
use crate::error::{ExecError, ExecResult};

/// Borrowed view of the executive state needed to build a plan
pub struct PlanBuilder<'a> {
    graph: &'a mut ExprGraph,
    nodes: &'a mut Arena<Node>,
    libraries: &'a HashMap<String, PlanNode>,
    plan: Uuid,
    created: Vec<(NodeId, PlanNode)>,
    /// Every expression created, so a failed build can clean up operands
    /// that never made it onto a node
    built: Vec<ExprId>,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(
        graph: &'a mut ExprGraph,
        nodes: &'a mut Arena<Node>,
        libraries: &'a HashMap<String, PlanNode>,
        plan: Uuid,
    ) -> Self {
        Self {
            graph,
            nodes,
            libraries,
            plan,
            created: Vec::new(),
            built: Vec::new(),
        }
    }

    /// Instantiate `root` and return its node id
    pub fn build(mut self, root: &PlanNode) -> ExecResult<NodeId> {
        match self.build_all(root) {
            Ok(id) => Ok(id),
            Err(err) => {
                let created: Vec<NodeId> = self.created.iter().map(|(id, _)| *id).collect();
                for id in created.into_iter().rev() {
                    teardown_node(self.graph, self.nodes, id)?;
                }
                for expr in std::mem::take(&mut self.built) {
                    self.graph.remove_tree(expr)?;
                }
                // lookups are never active during construction
                self.graph.drain_lookup_events();
                Err(err)
            }
        }
    }

    fn build_all(&mut self, root: &PlanNode) -> ExecResult<NodeId> {
        let root_id = self.create(root, None, &mut Vec::new())?;
        let created = std::mem::take(&mut self.created);
        let result = created
            .iter()
            .try_for_each(|(id, spec)| self.populate(*id, spec));
        self.created = created;
        result?;
        self.check_priorities()?;
        Ok(root_id)
    }

    // =========================================================================
    // Pass 1: nodes
    // =========================================================================

    fn create(
        &mut self,
        spec: &PlanNode,
        parent: Option<NodeId>,
        expanding: &mut Vec<String>,
    ) -> ExecResult<NodeId> {
        if spec.id.is_empty() {
            return Err(ExecError::plan("<unnamed>", "node has no id"));
        }
        for (i, decl) in spec.variables.iter().enumerate() {
            if spec.variables[..i].iter().any(|d| d.name == decl.name) {
                return Err(ExecError::plan(
                    &spec.id,
                    format!("variable '{}' declared twice", decl.name),
                ));
            }
        }
        let vars = NodeVariables {
            state: self.graph.node_variable(
                format!("{}.state", spec.id),
                NodeVariableKind::State,
                Value::NodeState(NodeState::Inactive),
            ),
            outcome: self.graph.node_variable(
                format!("{}.outcome", spec.id),
                NodeVariableKind::Outcome,
                Value::Unknown,
            ),
            failure: self.graph.node_variable(
                format!("{}.failure", spec.id),
                NodeVariableKind::FailureType,
                Value::Unknown,
            ),
            command_handle: match spec.body {
                PlanBody::Command { .. } => Some(self.graph.node_variable(
                    format!("{}.command_handle", spec.id),
                    NodeVariableKind::CommandHandle,
                    Value::Unknown,
                )),
                _ => None,
            },
        };
        let mut owned = vec![vars.state, vars.outcome, vars.failure];
        owned.extend(vars.command_handle);

        let mut declared = Vec::new();
        for decl in &spec.variables {
            let id = self.graph.variable(decl.name.clone(), decl.initial.clone());
            owned.push(id);
            declared.push((decl.name.clone(), id));
        }

        let id = self.nodes.insert(Node {
            name: spec.id.clone(),
            plan: self.plan,
            priority: spec.priority,
            parent,
            children: Vec::new(),
            conditions: [None; 8],
            body: NodeBody::Empty,
            state: NodeState::Inactive,
            outcome: None,
            failure: None,
            vars,
            declared,
            aliases: Vec::new(),
            owned,
            state_start_time: None,
            state_start_cycle: 0,
            iteration: 0,
        });
        self.created.push((id, spec.clone()));

        let children: Vec<NodeId> = match &spec.body {
            PlanBody::List { children } => {
                let mut ids = Vec::with_capacity(children.len());
                for child in children {
                    ids.push(self.create(child, Some(id), expanding)?);
                }
                ids
            }
            PlanBody::LibraryCall { library, .. } => {
                let definition = self
                    .libraries
                    .get(library)
                    .ok_or_else(|| ExecError::UnknownLibrary(library.clone()))?;
                if expanding.contains(library) {
                    return Err(ExecError::plan(
                        &spec.id,
                        format!("library '{}' calls itself", library),
                    ));
                }
                expanding.push(library.clone());
                let inner = self.create(definition, Some(id), expanding);
                expanding.pop();
                vec![inner?]
            }
            _ => Vec::new(),
        };
        self.nodes.get_mut(id)?.children = children;
        Ok(id)
    }

    // =========================================================================
    // Pass 2: conditions and bodies
    // =========================================================================

    fn populate(&mut self, id: NodeId, spec: &PlanNode) -> ExecResult<()> {
        // aliases first: the library's nodes resolve through them
        if let PlanBody::LibraryCall { library, aliases } = &spec.body {
            let inner_interface = self
                .libraries
                .get(library)
                .map(|lib| lib.interface.clone())
                .unwrap_or_default();
            let mut bound = Vec::new();
            for alias in aliases {
                if !inner_interface.contains(&alias.name) {
                    return Err(ExecError::plan(
                        &spec.id,
                        format!("library '{}' has no interface variable '{}'", library, alias.name),
                    ));
                }
                let sub = self.build_expr(&alias.value, id, &spec.id)?;
                if sub.owned {
                    self.nodes.get_mut(id)?.owned.push(sub.id);
                }
                bound.push((alias.name.clone(), sub.id));
            }
            for name in &inner_interface {
                if !bound.iter().any(|(n, _)| n == name) {
                    return Err(ExecError::plan(
                        &spec.id,
                        format!("interface variable '{}' of '{}' is not bound", name, library),
                    ));
                }
            }
            self.nodes.get_mut(id)?.aliases = bound;
        }

        let mut conditions = [None; 8];
        for which in Condition::ALL {
            let condition = match which {
                Condition::Skip => &spec.conditions.skip,
                Condition::Start => &spec.conditions.start,
                Condition::End => &spec.conditions.end,
                Condition::Exit => &spec.conditions.exit,
                Condition::Invariant => &spec.conditions.invariant,
                Condition::Pre => &spec.conditions.pre,
                Condition::Post => &spec.conditions.post,
                Condition::Repeat => &spec.conditions.repeat,
            };
            if let Some(expr) = condition {
                let sub = self.build_expr(expr, id, &spec.id)?;
                self.graph.add_node_listener(sub.id, id)?;
                if sub.owned {
                    self.nodes.get_mut(id)?.owned.push(sub.id);
                }
                conditions[which.index()] = Some(sub.id);
            }
        }

        let body = match &spec.body {
            PlanBody::Empty => NodeBody::Empty,
            PlanBody::List { .. } => NodeBody::List,
            PlanBody::LibraryCall { library, .. } => NodeBody::LibraryCall {
                library: library.clone(),
            },
            PlanBody::Command {
                name,
                args,
                returns,
            } => {
                let args = self.build_owned_list(args, id, &spec.id)?;
                let returns = match returns {
                    Some(var) => Some(self.resolve_assignable(id, &spec.id, var)?),
                    None => None,
                };
                NodeBody::Command(CommandBody {
                    name: name.clone(),
                    args,
                    returns,
                    handle: None,
                    active: None,
                    abort_requested: false,
                    abort_complete: false,
                })
            }
            PlanBody::Assignment { variable, value } => {
                let target = self.resolve_assignable(id, &spec.id, variable)?;
                let value = self.build_owned(value, id, &spec.id)?;
                NodeBody::Assignment(AssignmentBody {
                    variable: target,
                    variable_name: variable.clone(),
                    value,
                    applied: false,
                })
            }
            PlanBody::Update { pairs } => {
                let mut built = Vec::with_capacity(pairs.len());
                for pair in pairs {
                    built.push((pair.name.clone(), self.build_owned(&pair.value, id, &spec.id)?));
                }
                NodeBody::Update(UpdateBody {
                    pairs: built,
                    active: None,
                    acknowledged: false,
                })
            }
        };

        let node = self.nodes.get_mut(id)?;
        node.conditions = conditions;
        node.body = body;
        debug!(node = %spec.id, node_type = spec.body.type_name(), "node built");
        Ok(())
    }

    /// Build an expression the node keeps for its body; shared results are
    /// fine, only owned ones go on the teardown list.
    fn build_owned(&mut self, spec: &ExprSpec, scope: NodeId, node: &str) -> ExecResult<ExprId> {
        let sub = self.build_expr(spec, scope, node)?;
        if sub.owned {
            self.nodes.get_mut(scope)?.owned.push(sub.id);
        }
        Ok(sub.id)
    }

    fn build_owned_list(
        &mut self,
        specs: &[ExprSpec],
        scope: NodeId,
        node: &str,
    ) -> ExecResult<Vec<ExprId>> {
        specs
            .iter()
            .map(|spec| self.build_owned(spec, scope, node))
            .collect()
    }

    fn build_expr(&mut self, spec: &ExprSpec, scope: NodeId, node: &str) -> ExecResult<SubExpr> {
        if let Some(value) = spec.literal() {
            return Ok(match value {
                Value::Boolean(true) => SubExpr::shared(self.graph.true_value()),
                Value::Boolean(false) => SubExpr::shared(self.graph.false_value()),
                Value::Unknown => SubExpr::shared(self.graph.unknown_value()),
                other => {
                    let id = self.graph.constant(other);
                    SubExpr::owned(self.track(id))
                }
            });
        }
        match spec {
            ExprSpec::Var(name) => Ok(SubExpr::shared(self.resolve_variable(scope, node, name)?)),
            ExprSpec::LookupNow { name, args } => {
                let args = self.build_args(args, scope, node)?;
                let id = self.graph.lookup(LookupData {
                    state_name: name.clone(),
                    args,
                    tolerance: None,
                });
                Ok(SubExpr::owned(self.track(id)))
            }
            ExprSpec::LookupOnChange {
                name,
                args,
                tolerance,
            } => {
                if *tolerance < 0.0 || tolerance.is_nan() {
                    return Err(ExecError::plan(
                        node,
                        format!("lookup of '{}' has invalid tolerance {}", name, tolerance),
                    ));
                }
                let args = self.build_args(args, scope, node)?;
                let id = self.graph.lookup(LookupData {
                    state_name: name.clone(),
                    args,
                    tolerance: Some(*tolerance),
                });
                Ok(SubExpr::owned(self.track(id)))
            }
            ExprSpec::Op { op, args } => {
                let (min, max) = op.arity();
                if args.len() < min || max.map_or(false, |max| args.len() > max) {
                    return Err(ExecError::plan(
                        node,
                        format!("operator {:?} given {} operands", op, args.len()),
                    ));
                }
                let args = self.build_args(args, scope, node)?;
                let id = self.graph.function(*op, args)?;
                Ok(SubExpr::owned(self.track(id)))
            }
            ExprSpec::NodeState(target) => {
                let found = self.resolve_node(scope, node, target)?;
                Ok(SubExpr::shared(self.nodes.get(found)?.vars.state))
            }
            ExprSpec::NodeOutcome(target) => {
                let found = self.resolve_node(scope, node, target)?;
                Ok(SubExpr::shared(self.nodes.get(found)?.vars.outcome))
            }
            ExprSpec::NodeFailure(target) => {
                let found = self.resolve_node(scope, node, target)?;
                Ok(SubExpr::shared(self.nodes.get(found)?.vars.failure))
            }
            ExprSpec::NodeCommandHandle(target) => {
                let found = self.resolve_node(scope, node, target)?;
                self.nodes
                    .get(found)?
                    .vars
                    .command_handle
                    .map(SubExpr::shared)
                    .ok_or_else(|| {
                        ExecError::plan(node, format!("'{}' is not a command node", target))
                    })
            }
            // literals handled above
            _ => Err(ExecError::Internal(format!("unhandled expression {:?}", spec))),
        }
    }

    fn track(&mut self, id: ExprId) -> ExprId {
        self.built.push(id);
        id
    }

    fn build_args(&mut self, specs: &[ExprSpec], scope: NodeId, node: &str) -> ExecResult<Vec<SubExpr>> {
        specs
            .iter()
            .map(|spec| self.build_expr(spec, scope, node))
            .collect()
    }

    // =========================================================================
    // Name resolution
    // =========================================================================

    /// Walk up from `scope`. A library call is a wall: from inside the
    /// library only its aliases are visible.
    fn resolve_variable(&self, scope: NodeId, node: &str, name: &str) -> ExecResult<ExprId> {
        let mut current = Some(scope);
        let mut from_child = false;
        while let Some(id) = current {
            let n = self.nodes.get(id)?;
            if let Some(found) = n.local_variable(name) {
                return Ok(found);
            }
            if from_child && matches!(n.body, NodeBody::LibraryCall { .. }) {
                break;
            }
            current = n.parent;
            from_child = true;
        }
        Err(ExecError::UnresolvedVariable {
            node: node.to_string(),
            name: name.to_string(),
        })
    }

    fn resolve_assignable(&self, scope: NodeId, node: &str, name: &str) -> ExecResult<ExprId> {
        let id = self.resolve_variable(scope, node, name)?;
        match self.graph.get(id)?.kind() {
            ExprKind::Variable(_) => Ok(id),
            _ => Err(ExecError::plan(
                node,
                format!("'{}' is not an assignable variable", name),
            )),
        }
    }

    /// Search the node itself, then its children, then each ancestor level
    /// with that level's children. Two matches at one level are ambiguous.
    fn resolve_node(&self, scope: NodeId, node: &str, name: &str) -> ExecResult<NodeId> {
        let here = self.nodes.get(scope)?;
        if here.name == name {
            return Ok(scope);
        }
        if let Some(found) = self.unique_child(scope, node, name)? {
            return Ok(found);
        }
        let mut current = scope;
        loop {
            let n = self.nodes.get(current)?;
            let parent = match n.parent {
                Some(parent) => parent,
                None => break,
            };
            let p = self.nodes.get(parent)?;
            // never look out of a library
            if matches!(p.body, NodeBody::LibraryCall { .. }) {
                break;
            }
            if p.name == name {
                return Ok(parent);
            }
            if let Some(found) = self.unique_child(parent, node, name)? {
                return Ok(found);
            }
            current = parent;
        }
        Err(ExecError::UnresolvedNode {
            node: node.to_string(),
            name: name.to_string(),
        })
    }

    fn unique_child(&self, parent: NodeId, node: &str, name: &str) -> ExecResult<Option<NodeId>> {
        let mut found = None;
        for child in &self.nodes.get(parent)?.children {
            if self.nodes.get(*child)?.name == name {
                if found.is_some() {
                    return Err(ExecError::AmbiguousNode {
                        node: node.to_string(),
                        name: name.to_string(),
                    });
                }
                found = Some(*child);
            }
        }
        Ok(found)
    }

    /// No two assignment nodes in the plan may write the same variable with
    /// the same explicit priority, wherever they sit in the tree.
    fn check_priorities(&self) -> ExecResult<()> {
        let mut seen: HashMap<(ExprId, i32), &str> = HashMap::new();
        for (id, _) in &self.created {
            let node = self.nodes.get(*id)?;
            let (variable, priority) = match (&node.body, node.priority) {
                (NodeBody::Assignment(a), Some(p)) => (a.variable, p),
                _ => continue,
            };
            if let Some(first) = seen.insert((variable, priority), &node.name) {
                return Err(ExecError::DuplicatePriority {
                    first: first.to_string(),
                    second: node.name.clone(),
                    variable: self.graph.describe(variable),
                    priority,
                });
            }
        }
        Ok(())
    }
}

/// Remove one node and everything it owns. Children are not touched.
///
/// The node must already be deactivated; only listener edges to shared
/// conditions are cleaned up here.
pub fn teardown_node(graph: &mut ExprGraph, nodes: &mut Arena<Node>, id: NodeId) -> ExecResult<()> {
    let node = match nodes.remove(id) {
        Some(node) => node,
        None => return Ok(()),
    };
    for condition in node.conditions.iter().flatten() {
        graph.remove_listener(*condition, Listener::Node(id));
    }
    for expr in node.owned {
        graph.remove_tree(expr)?;
    }
    Ok(())
}
