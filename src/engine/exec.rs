//! Execution cycle driver
//!
//! [`Exec`] owns everything the exec thread touches: the expression graph,
//! the node arena, the state cache and the message pairing queues. Other
//! threads reach it only through the shared [`InputQueue`].
//!
//! One call to [`Exec::run_cycle`] is one quiescence cycle:
//!
//! 1. refresh the clock and drain the input queue into the cache, graph and
//!    nodes;
//! 2. step node transitions to a fixed point, performing assignments between
//!    fixed points since they can enable further transitions;
//! 3. only then hand commands, planner updates and aborts to the adapters.
//!
//! Within one step every candidate node is evaluated against the same
//! condition values before any of them transitions.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::engine::arena::Arena;
use crate::engine::builder::{teardown_node, PlanBuilder};
use crate::engine::config::ExecConfig;
use crate::engine::expr::{ExprGraph, ExprId, ExprKind, LookupEvent};
use crate::engine::interface::{Command, CommandId, Interfaces, State, Update, UpdateId};
use crate::engine::listener::{AssignmentRecord, ExecListener, NodeTransition};
use crate::engine::messages::{MessageQueueMap, Pairing};
use crate::engine::node::{
    dest_state, Condition, ConditionSnapshot, Destination, Node, NodeBody, NodeId,
};
use crate::engine::plan::PlanNode;
use crate::engine::queue::{InputQueue, QueueEntry};
use crate::engine::state_cache::StateCache;
use crate::engine::value::{CommandHandle, FailureType, NodeOutcome, NodeState, Value};
use crate::error::{ExecError, ExecResult};

/// Command name the executive handles itself by waiting for a message
pub const RECEIVE_MESSAGE_COMMAND: &str = "ReceiveMessage";

/// A loaded plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlanInstance {
    pub id: Uuid,
    pub root: NodeId,
    pub name: String,
}

/// Final result of a plan removed by [`Exec::collect_finished_plans`]
#[derive(Debug, Clone, PartialEq)]
pub struct PlanReport {
    pub id: Uuid,
    pub name: String,
    pub outcome: Option<NodeOutcome>,
    pub failure: Option<FailureType>,
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub entries: usize,
    pub steps: usize,
    pub transitions: usize,
    pub assignments: usize,
    pub commands: usize,
    pub updates: usize,
}

/// What shutdown did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub aborts_requested: usize,
    pub aborts_unacknowledged: usize,
    pub entries_dropped: usize,
    pub nodes_removed: usize,
}

/// The reactive executive
pub struct Exec {
    config: ExecConfig,
    queue: Arc<InputQueue>,
    interfaces: Interfaces,
    listeners: Vec<Arc<dyn ExecListener>>,
    graph: ExprGraph,
    nodes: Arena<Node>,
    cache: StateCache,
    messages: MessageQueueMap,
    libraries: HashMap<String, PlanNode>,
    plans: Vec<PlanInstance>,
    pending: Vec<NodeId>,
    pending_set: HashSet<NodeId>,
    commands: HashMap<CommandId, (NodeId, Command)>,
    updates: HashMap<UpdateId, NodeId>,
    next_command: u64,
    next_update: u64,
    assignments_pending: Vec<NodeId>,
    commands_pending: Vec<NodeId>,
    updates_pending: Vec<NodeId>,
    aborts_pending: Vec<CommandId>,
    reservation_waiters: HashMap<ExprId, Vec<NodeId>>,
    mark_seen: Option<u64>,
    cycle: u64,
    terminating: bool,
}

impl Exec {
    pub fn new(config: ExecConfig, interfaces: Interfaces) -> ExecResult<Self> {
        config.validate()?;
        let queue = Arc::new(InputQueue::with_capacity(config.queue_capacity));
        let cache = StateCache::new(State::named(config.time_state.clone()));
        let messages = MessageQueueMap::new(config.allow_duplicate_messages);
        Ok(Self {
            config,
            queue,
            interfaces,
            listeners: Vec::new(),
            graph: ExprGraph::new(),
            nodes: Arena::new("node"),
            cache,
            messages,
            libraries: HashMap::new(),
            plans: Vec::new(),
            pending: Vec::new(),
            pending_set: HashSet::new(),
            commands: HashMap::new(),
            updates: HashMap::new(),
            next_command: 1,
            next_update: 1,
            assignments_pending: Vec::new(),
            commands_pending: Vec::new(),
            updates_pending: Vec::new(),
            aborts_pending: Vec::new(),
            reservation_waiters: HashMap::new(),
            mark_seen: None,
            cycle: 0,
            terminating: false,
        })
    }

    /// Register an observer (builder style)
    pub fn with_listener(mut self, listener: Arc<dyn ExecListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ExecListener>) {
        self.listeners.push(listener);
    }

    /// The shared input queue, for adapters
    pub fn queue(&self) -> Arc<InputQueue> {
        Arc::clone(&self.queue)
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn graph(&self) -> &ExprGraph {
        &self.graph
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    pub fn plans(&self) -> &[PlanInstance] {
        &self.plans
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn current_time(&self) -> Option<f64> {
        self.cache.current_time()
    }

    /// Clock value at which a change lookup on time next wants a cycle
    pub fn next_wakeup_time(&self) -> Option<f64> {
        self.cache.next_time_threshold()
    }

    /// More stepping is due without any new input
    pub fn needs_step(&self) -> bool {
        !self.pending.is_empty() || self.graph.has_changed_nodes()
    }

    // =========================================================================
    // Plans and libraries
    // =========================================================================

    /// Instantiate a plan directly. Structural errors come back to the
    /// caller and leave the executive unchanged.
    pub fn add_plan(&mut self, plan: PlanNode) -> ExecResult<Uuid> {
        if self.terminating {
            return Err(ExecError::NotRunning);
        }
        let id = Uuid::new_v4();
        let root = PlanBuilder::new(&mut self.graph, &mut self.nodes, &self.libraries, id)
            .build(&plan)?;
        self.plans.push(PlanInstance {
            id,
            root,
            name: plan.id.clone(),
        });
        self.mark(root);
        info!(plan = %id, root = %plan.id, nodes = plan.size(), "plan added");
        for listener in &self.listeners {
            listener.on_add_plan(id, &plan.id);
        }
        Ok(id)
    }

    /// Register a library node under its id
    pub fn add_library(&mut self, library: PlanNode) -> ExecResult<()> {
        if self.terminating {
            return Err(ExecError::NotRunning);
        }
        let name = library.id.clone();
        if self.libraries.insert(name.clone(), library).is_some() {
            warn!(library = %name, "library replaced");
        } else {
            info!(library = %name, "library added");
        }
        for listener in &self.listeners {
            listener.on_add_library(&name);
        }
        Ok(())
    }

    pub fn has_library(&self, name: &str) -> bool {
        self.libraries.contains_key(name)
    }

    /// True when every loaded plan's root has finished
    pub fn all_plans_finished(&self) -> bool {
        self.plans.iter().all(|plan| {
            self.nodes
                .try_get(plan.root)
                .map_or(true, |root| root.state == NodeState::Finished)
        })
    }

    /// Tear down every finished plan and report how each ended
    pub fn collect_finished_plans(&mut self) -> ExecResult<Vec<PlanReport>> {
        let mut reports = Vec::new();
        let mut kept = Vec::new();
        for plan in std::mem::take(&mut self.plans) {
            let finished = self
                .nodes
                .try_get(plan.root)
                .map(|root| (root.state == NodeState::Finished, root.outcome, root.failure));
            match finished {
                Some((true, outcome, failure)) => {
                    self.remove_subtree(plan.root)?;
                    debug!(plan = %plan.id, root = %plan.name, "plan removed");
                    reports.push(PlanReport {
                        id: plan.id,
                        name: plan.name,
                        outcome,
                        failure,
                    });
                }
                Some(_) => kept.push(plan),
                None => {}
            }
        }
        self.plans = kept;
        self.sync_lookups()?;
        Ok(reports)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn node(&self, id: NodeId) -> ExecResult<&Node> {
        self.nodes.get(id)
    }

    /// First node with this name, in arena order
    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(_, node)| node.name == name)
            .map(|(id, _)| id)
    }

    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        self.find_node(name)
            .and_then(|id| self.nodes.try_get(id))
            .map(|n| n.state)
    }

    pub fn node_outcome(&self, name: &str) -> Option<NodeOutcome> {
        self.find_node(name)
            .and_then(|id| self.nodes.try_get(id))
            .and_then(|n| n.outcome)
    }

    pub fn node_failure(&self, name: &str) -> Option<FailureType> {
        self.find_node(name)
            .and_then(|id| self.nodes.try_get(id))
            .and_then(|n| n.failure)
    }

    /// Value of `variable` as seen from node `node`
    pub fn variable_value(&self, node: &str, variable: &str) -> Option<Value> {
        let mut current = self.find_node(node);
        while let Some(id) = current {
            let n = self.nodes.try_get(id)?;
            if let Some(expr) = n.local_variable(variable) {
                return self.graph.value(expr).ok().cloned();
            }
            current = n.parent;
        }
        None
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    /// Run one quiescence cycle
    pub fn run_cycle(&mut self) -> ExecResult<CycleReport> {
        let started = Instant::now();
        self.cycle = self.cache.begin_cycle();
        let mut report = CycleReport {
            cycle: self.cycle,
            ..Default::default()
        };
        self.cache
            .refresh_time(&mut self.graph, self.interfaces.lookup.as_ref())?;
        report.entries = self.process_queue()?;

        loop {
            report.transitions += self.quiesce(&mut report.steps)?;
            if self.assignments_pending.is_empty() {
                break;
            }
            report.assignments += self.perform_assignments()?;
        }

        report.commands = self.dispatch_commands()?;
        report.updates = self.dispatch_updates()?;
        self.dispatch_aborts()?;

        if let Some(sequence) = self.mark_seen.take() {
            self.queue.mark_processed(sequence);
        }
        debug!(
            cycle = report.cycle,
            entries = report.entries,
            steps = report.steps,
            transitions = report.transitions,
            elapsed_us = started.elapsed().as_micros() as u64,
            "cycle complete"
        );
        Ok(report)
    }

    /// Run cycles until nothing is left to do or `max_cycles` ran
    pub fn run_until_quiescent(&mut self, max_cycles: usize) -> ExecResult<usize> {
        let mut ran = 0;
        while ran < max_cycles {
            self.run_cycle()?;
            ran += 1;
            if self.terminating || (!self.needs_step() && self.queue.is_empty()) {
                break;
            }
        }
        Ok(ran)
    }

    fn mark(&mut self, id: NodeId) {
        if self.pending_set.insert(id) {
            self.pending.push(id);
        }
    }

    // =========================================================================
    // Input
    // =========================================================================

    fn process_queue(&mut self) -> ExecResult<usize> {
        let mut count = 0;
        while let Some(entry) = self.queue.dequeue() {
            count += 1;
            if entry == QueueEntry::Terminate {
                info!("termination requested");
                self.terminating = true;
                break;
            }
            self.handle_entry(entry)?;
        }
        Ok(count)
    }

    fn handle_entry(&mut self, entry: QueueEntry) -> ExecResult<()> {
        trace!(kind = entry.kind(), "dequeue");
        match entry {
            QueueEntry::LookupReturn { state, value } => self.cache.update_state(
                &mut self.graph,
                self.interfaces.lookup.as_ref(),
                &state,
                value,
            )?,
            QueueEntry::CommandAck { command, handle } => self.receive_handle(command, handle)?,
            QueueEntry::CommandReturn { command, value } => self.receive_return(command, value)?,
            QueueEntry::CommandAbortAck { command, ack } => self.receive_abort_ack(command, ack)?,
            QueueEntry::PlannerUpdateAck { update, ack } => {
                let node = match self.updates.get(&update) {
                    Some(node) => *node,
                    None => {
                        debug!(update = update.0, "ack for unknown update");
                        return Ok(());
                    }
                };
                if !ack {
                    warn!(update = update.0, "planner update rejected");
                }
                if let Some(Node {
                    body: NodeBody::Update(body),
                    ..
                }) = self.nodes.try_get_mut(node)
                {
                    if body.active == Some(update) {
                        body.acknowledged = true;
                    }
                }
                self.mark(node);
            }
            QueueEntry::AddPlan(plan) => match self.add_plan(*plan) {
                Ok(_) => {}
                Err(err) if err.is_structural() || matches!(err, ExecError::NotRunning) => {
                    warn!(error = %err, "plan rejected")
                }
                Err(err) => return Err(err),
            },
            QueueEntry::AddLibrary(library) => {
                if let Err(err) = self.add_library(*library) {
                    warn!(error = %err, "library rejected");
                }
            }
            QueueEntry::ReceiveMessage { message, param } => {
                let pairings = self.messages.add_message(&message, param);
                self.apply_pairings(pairings)?;
            }
            QueueEntry::AcceptMessage { message, command } => {
                let pairings = self.messages.add_recipient(&message, command);
                self.apply_pairings(pairings)?;
            }
            QueueEntry::ReleaseMessageHandle { command } => {
                self.messages.remove_recipient(command);
            }
            QueueEntry::MessageQueueEmpty { message } => {
                let dropped = self.messages.clear_messages(&message);
                debug!(message = %message, dropped, "message queue emptied");
            }
            QueueEntry::Mark { sequence } => self.mark_seen = Some(sequence),
            QueueEntry::Terminate => self.terminating = true,
        }
        Ok(())
    }

    fn receive_handle(&mut self, command: CommandId, handle: CommandHandle) -> ExecResult<()> {
        let node = match self.commands.get(&command) {
            Some((node, _)) => *node,
            None => {
                debug!(command = %command, "handle for unknown command");
                return Ok(());
            }
        };
        let handle_var = {
            let n = self.nodes.get_mut(node)?;
            match &mut n.body {
                NodeBody::Command(body) if body.active == Some(command) => {
                    body.handle = Some(handle);
                }
                _ => return Ok(()),
            }
            n.vars.command_handle
        };
        trace!(command = %command, handle = %handle, "command handle");
        if let Some(var) = handle_var {
            self.graph.set_value(var, Value::CommandHandle(handle))?;
        }
        self.mark(node);
        Ok(())
    }

    fn receive_return(&mut self, command: CommandId, value: Value) -> ExecResult<()> {
        let node = match self.commands.get(&command) {
            Some((node, _)) => *node,
            None => return Ok(()),
        };
        let (returns, plan, name) = {
            let n = self.nodes.get(node)?;
            match &n.body {
                NodeBody::Command(body) if body.active == Some(command) => {
                    (body.returns, n.plan, n.name.clone())
                }
                _ => return Ok(()),
            }
        };
        if let Some(var) = returns {
            self.graph.set_value(var, value.clone())?;
            let record = AssignmentRecord {
                plan,
                node: name,
                variable: self.graph.describe(var),
                value,
                cycle: self.cycle,
                timestamp: Utc::now(),
            };
            for listener in &self.listeners {
                listener.on_assignment(&record);
            }
        }
        self.mark(node);
        Ok(())
    }

    fn receive_abort_ack(&mut self, command: CommandId, ack: bool) -> ExecResult<()> {
        let node = match self.commands.get(&command) {
            Some((node, _)) => *node,
            None => return Ok(()),
        };
        if !ack {
            warn!(command = %command, "abort not acknowledged positively");
        }
        if let Some(Node {
            body: NodeBody::Command(body),
            ..
        }) = self.nodes.try_get_mut(node)
        {
            if body.active == Some(command) {
                body.abort_complete = true;
            }
        }
        self.mark(node);
        Ok(())
    }

    fn apply_pairings(&mut self, pairings: Vec<Pairing>) -> ExecResult<()> {
        for pairing in pairings {
            debug!(message = %pairing.message, command = %pairing.command, "message paired");
            self.receive_return(pairing.command, pairing.param)?;
            self.receive_handle(pairing.command, CommandHandle::Success)?;
        }
        Ok(())
    }

    /// Hand lookup activity to the state cache
    fn sync_lookups(&mut self) -> ExecResult<()> {
        for event in self.graph.drain_lookup_events() {
            match event {
                LookupEvent::Activated(id) | LookupEvent::ArgumentsChanged(id) => {
                    if !self.graph.contains(id) || !self.graph.is_active(id)? {
                        continue;
                    }
                    self.register_lookup(id)?;
                }
                LookupEvent::Deactivated(id) => {
                    self.cache
                        .unregister_lookup(self.interfaces.lookup.as_ref(), id)?
                }
            }
        }
        Ok(())
    }

    /// Bring the registration of an active lookup in line with its current
    /// arguments. Nothing is registered while an argument is unknown.
    fn register_lookup(&mut self, id: ExprId) -> ExecResult<()> {
        let lookup = self.interfaces.lookup.as_ref();
        let data = match self.graph.get(id)?.kind() {
            ExprKind::Lookup(data) => data.clone(),
            _ => return Ok(()),
        };
        let mut args = Vec::with_capacity(data.args.len());
        for arg in &data.args {
            args.push(self.graph.value(arg.id)?.clone());
        }
        let state = if args.iter().all(Value::is_known) {
            Some(State::new(data.state_name, args))
        } else {
            None
        };
        if state.is_some() && self.cache.registered_state(id) == state.as_ref() {
            return Ok(());
        }

        self.cache.unregister_lookup(lookup, id)?;
        match state {
            Some(state) => {
                trace!(lookup = ?id, state = %state, "registering lookup");
                self.cache
                    .register_lookup(&mut self.graph, lookup, id, state, data.tolerance)
            }
            None => {
                trace!(lookup = ?id, "lookup arguments unknown");
                self.graph.set_value(id, Value::Unknown)?;
                Ok(())
            }
        }
    }

    // =========================================================================
    // Stepping
    // =========================================================================

    fn quiesce(&mut self, steps: &mut usize) -> ExecResult<usize> {
        let mut transitions = 0;
        loop {
            self.sync_lookups()?;
            let candidates = self.collect_candidates()?;
            if candidates.is_empty() {
                return Ok(transitions);
            }
            *steps += 1;
            if *steps > self.config.max_steps_per_cycle {
                return Err(ExecError::QuiescenceOverflow(self.config.max_steps_per_cycle));
            }

            let mut planned = Vec::new();
            for id in candidates {
                let (state, node_type) = match self.nodes.try_get(id) {
                    Some(node) => (node.state, node.node_type()),
                    None => continue,
                };
                let snapshot = self.snapshot(id)?;
                if let Some(dest) = dest_state(state, node_type, &snapshot) {
                    planned.push((id, dest));
                }
            }
            let planned = self.arbitrate(planned)?;
            for (id, dest) in planned {
                self.transition(id, dest)?;
                transitions += 1;
            }
        }
    }

    /// Nodes to evaluate this step: those explicitly marked, plus those
    /// whose conditions changed and everything below them, since ancestor
    /// conditions feed descendants' transitions.
    fn collect_candidates(&mut self) -> ExecResult<Vec<NodeId>> {
        let mut out = std::mem::take(&mut self.pending);
        let mut seen = std::mem::take(&mut self.pending_set);
        let mut stack = self.graph.drain_changed_nodes();
        while let Some(id) = stack.pop() {
            let node = match self.nodes.try_get(id) {
                Some(node) => node,
                None => continue,
            };
            if seen.insert(id) {
                out.push(id);
            }
            for child in &node.children {
                let live = self
                    .nodes
                    .try_get(*child)
                    .map_or(false, |c| !matches!(c.state, NodeState::Inactive | NodeState::Finished));
                if live {
                    stack.push(*child);
                }
            }
        }
        out.retain(|id| self.nodes.contains(*id));
        Ok(out)
    }

    fn condition_value(&self, node: &Node, which: Condition) -> ExecResult<Option<bool>> {
        match node.condition(which) {
            Some(expr) => self.graph.bool_value(expr),
            None => Ok(Some(which.default_value())),
        }
    }

    /// Take the condition values a transition of `id` depends on
    pub fn snapshot(&self, id: NodeId) -> ExecResult<ConditionSnapshot> {
        let node = self.nodes.get(id)?;
        let user_end = self.condition_value(node, Condition::End)?;
        let mut post = self.condition_value(node, Condition::Post)?;

        let children_finished = node
            .children
            .iter()
            .all(|c| self.nodes.try_get(*c).map_or(true, |c| c.state == NodeState::Finished));
        let children_settled = node.children.iter().all(|c| {
            self.nodes.try_get(*c).map_or(true, |c| {
                matches!(
                    c.state,
                    NodeState::Waiting | NodeState::Inactive | NodeState::Finished
                )
            })
        });

        let (end, cleanup_complete) = match &node.body {
            NodeBody::Empty => (user_end, true),
            NodeBody::List | NodeBody::LibraryCall { .. } => {
                if node.condition(Condition::End).is_some() {
                    (user_end, true)
                } else {
                    (Some(children_finished), true)
                }
            }
            NodeBody::Command(body) => {
                let end = match body.handle {
                    Some(handle) if handle.is_interrupting() => {
                        post = Some(false);
                        Some(true)
                    }
                    Some(_) => user_end,
                    None => Some(false),
                };
                (end, body.abort_complete)
            }
            NodeBody::Assignment(body) => {
                (if body.applied { user_end } else { Some(false) }, true)
            }
            NodeBody::Update(body) => {
                (if body.acknowledged { user_end } else { Some(false) }, true)
            }
        };

        let mut snapshot = ConditionSnapshot {
            skip: self.condition_value(node, Condition::Skip)?,
            start: self.condition_value(node, Condition::Start)?,
            end,
            exit: self.condition_value(node, Condition::Exit)?,
            invariant: self.condition_value(node, Condition::Invariant)?,
            pre: self.condition_value(node, Condition::Pre)?,
            post,
            repeat: self.condition_value(node, Condition::Repeat)?,
            ancestor_exit: false,
            ancestor_invariant_failed: false,
            ancestor_end: false,
            parent_state: None,
            children_settled,
            cleanup_complete,
        };

        let mut ancestor = node.parent;
        let mut direct = true;
        while let Some(pid) = ancestor {
            let parent = self.nodes.get(pid)?;
            if direct {
                snapshot.parent_state = Some(parent.state);
            }
            match parent.state {
                NodeState::Executing | NodeState::Finishing => {
                    if self.condition_value(parent, Condition::Exit)? == Some(true) {
                        snapshot.ancestor_exit = true;
                    }
                    if self.condition_value(parent, Condition::Invariant)? == Some(false) {
                        snapshot.ancestor_invariant_failed = true;
                    }
                    if parent.state == NodeState::Finishing
                        || (parent.condition(Condition::End).is_some()
                            && self.condition_value(parent, Condition::End)? == Some(true))
                    {
                        snapshot.ancestor_end = true;
                    }
                }
                NodeState::Failing => match parent.failure {
                    Some(FailureType::Exited) | Some(FailureType::ParentExited) => {
                        snapshot.ancestor_exit = true
                    }
                    _ => snapshot.ancestor_invariant_failed = true,
                },
                NodeState::IterationEnded | NodeState::Finished if direct => {
                    snapshot.ancestor_end = true;
                }
                _ => {}
            }
            ancestor = parent.parent;
            direct = false;
        }
        Ok(snapshot)
    }

    /// Resolve contention among assignment nodes about to execute. The
    /// lowest priority value wins; losers wait for the reservation.
    fn arbitrate(&mut self, planned: Vec<(NodeId, Destination)>) -> ExecResult<Vec<(NodeId, Destination)>> {
        let mut contenders: HashMap<ExprId, Vec<usize>> = HashMap::new();
        let mut order: Vec<ExprId> = Vec::new();
        for (i, (id, dest)) in planned.iter().enumerate() {
            if dest.state != NodeState::Executing {
                continue;
            }
            if let NodeBody::Assignment(body) = &self.nodes.get(*id)?.body {
                if !contenders.contains_key(&body.variable) {
                    order.push(body.variable);
                }
                contenders.entry(body.variable).or_default().push(i);
            }
        }

        let mut rejected = HashSet::new();
        for variable in order {
            let mut group = contenders.remove(&variable).unwrap_or_default();
            let winner = if self.graph.reserved_by(variable)?.is_some() {
                None
            } else {
                let mut ranked = Vec::with_capacity(group.len());
                for i in &group {
                    let id = planned[*i].0;
                    ranked.push((self.nodes.get(id)?.priority, self.declaration_rank(id)?, *i));
                }
                ranked.sort_by_key(|(priority, rank, _)| (priority.unwrap_or(i32::MAX), *rank));
                ranked.first().map(|(_, _, i)| *i)
            };

            if let Some(w) = winner {
                let id = planned[w].0;
                self.graph.reserve(variable, id)?;
                trace!(variable = %self.graph.describe(variable), node = ?id, "reservation granted");
                group.retain(|i| *i != w);
            }
            for loser in group {
                let id = planned[loser].0;
                debug!(
                    node = %self.nodes.get(id)?.name,
                    variable = %self.graph.describe(variable),
                    "waiting for reservation"
                );
                let waiters = self.reservation_waiters.entry(variable).or_default();
                if !waiters.contains(&id) {
                    waiters.push(id);
                }
                rejected.insert(loser);
            }
        }

        Ok(planned
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !rejected.contains(i))
            .map(|(_, p)| p)
            .collect())
    }

    fn declaration_rank(&self, id: NodeId) -> ExecResult<usize> {
        let node = self.nodes.get(id)?;
        match node.parent {
            Some(parent) => Ok(self
                .nodes
                .get(parent)?
                .children
                .iter()
                .position(|c| *c == id)
                .unwrap_or(usize::MAX)),
            None => Ok(0),
        }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    fn transition(&mut self, id: NodeId, dest: Destination) -> ExecResult<()> {
        let now = self.cache.current_time();
        let cycle = self.cycle;
        let (from, vars, parent, children, plan, name) = {
            let node = self.nodes.get_mut(id)?;
            let from = node.state;
            node.state = dest.state;
            match dest.state {
                NodeState::Waiting | NodeState::Inactive => {
                    node.outcome = None;
                    node.failure = None;
                }
                _ => {
                    if dest.outcome.is_some() {
                        node.outcome = dest.outcome;
                    }
                    if dest.failure.is_some() {
                        node.failure = dest.failure;
                    }
                }
            }
            if from == NodeState::IterationEnded && dest.state == NodeState::Waiting {
                node.iteration += 1;
            }
            node.state_start_time = now;
            node.state_start_cycle = cycle;
            (
                from,
                node.vars,
                node.parent,
                node.children.clone(),
                node.plan,
                node.name.clone(),
            )
        };

        self.switch_conditions(id, from, dest.state)?;
        self.switch_body(id, from, dest.state)?;

        let (outcome, failure) = {
            let node = self.nodes.get(id)?;
            (node.outcome, node.failure)
        };
        self.graph
            .set_value(vars.state, Value::NodeState(dest.state))?;
        self.graph
            .set_value(vars.outcome, outcome.map(Value::Outcome).unwrap_or_default())?;
        self.graph
            .set_value(vars.failure, failure.map(Value::Failure).unwrap_or_default())?;

        let record = NodeTransition {
            plan,
            node: name,
            from,
            to: dest.state,
            outcome,
            failure,
            cycle,
            timestamp: Utc::now(),
        };
        for listener in &self.listeners {
            listener.on_transition(&record);
        }

        self.mark(id);
        if let Some(parent) = parent {
            self.mark(parent);
        }
        for child in children {
            self.mark(child);
        }
        Ok(())
    }

    fn switch_conditions(&mut self, id: NodeId, from: NodeState, to: NodeState) -> ExecResult<()> {
        let old = Condition::active_in(from);
        let new = Condition::active_in(to);
        let conditions = self.nodes.get(id)?.conditions;
        for which in old.iter().filter(|c| !new.contains(*c)) {
            if let Some(expr) = conditions[which.index()] {
                self.graph.deactivate(expr)?;
            }
        }
        for which in new.iter().filter(|c| !old.contains(*c)) {
            if let Some(expr) = conditions[which.index()] {
                self.graph.activate(expr)?;
            }
        }
        Ok(())
    }

    /// Body side effects of leaving `from` and entering `to`
    fn switch_body(&mut self, id: NodeId, from: NodeState, to: NodeState) -> ExecResult<()> {
        if from == NodeState::Executing {
            for expr in self.nodes.get(id)?.body.expressions() {
                self.graph.deactivate(expr)?;
            }
        }

        match to {
            NodeState::Executing => {
                for expr in self.nodes.get(id)?.body.expressions() {
                    self.graph.activate(expr)?;
                }
                match &self.nodes.get(id)?.body {
                    NodeBody::Command(_) => self.commands_pending.push(id),
                    NodeBody::Assignment(_) => self.assignments_pending.push(id),
                    NodeBody::Update(_) => self.updates_pending.push(id),
                    NodeBody::Empty | NodeBody::List | NodeBody::LibraryCall { .. } => {}
                }
            }
            NodeState::Failing => self.begin_cleanup(id)?,
            NodeState::IterationEnded => {
                if let NodeBody::Assignment(body) = &self.nodes.get(id)?.body {
                    if body.applied {
                        let variable = body.variable;
                        self.graph.commit(variable)?;
                    }
                }
                self.release_message_wait(id)?;
                self.release_reservation(id)?;
            }
            NodeState::Finished => {
                self.release_message_wait(id)?;
                self.release_reservation(id)?;
            }
            NodeState::Waiting => self.reset_body(id)?,
            NodeState::Inactive => {
                self.reset_body(id)?;
                let declared: Vec<ExprId> =
                    self.nodes.get(id)?.declared.iter().map(|(_, e)| *e).collect();
                for var in declared {
                    self.graph.reset_variable(var)?;
                }
            }
            NodeState::Finishing => {}
        }
        Ok(())
    }

    fn begin_cleanup(&mut self, id: NodeId) -> ExecResult<()> {
        let node = self.nodes.get_mut(id)?;
        let name = node.name.clone();
        match &mut node.body {
            NodeBody::Command(body) => {
                let outstanding = body.active.is_some()
                    && !matches!(
                        body.handle,
                        Some(CommandHandle::Success)
                            | Some(CommandHandle::Failed)
                            | Some(CommandHandle::Denied)
                    );
                if outstanding {
                    if let Some(command) = body.active {
                        body.abort_requested = true;
                        body.abort_complete = false;
                        self.aborts_pending.push(command);
                        debug!(node = %name, command = %command, "abort requested");
                    }
                } else {
                    body.abort_complete = true;
                }
            }
            NodeBody::Assignment(body) => {
                if body.applied {
                    let variable = body.variable;
                    body.applied = false;
                    self.graph.restore(variable)?;
                    debug!(node = %name, "assignment rolled back");
                }
            }
            NodeBody::Empty | NodeBody::List | NodeBody::Update(_) | NodeBody::LibraryCall { .. } => {}
        }
        self.release_reservation(id)
    }

    fn release_reservation(&mut self, id: NodeId) -> ExecResult<()> {
        let variable = match &self.nodes.get(id)?.body {
            NodeBody::Assignment(body) => body.variable,
            _ => return Ok(()),
        };
        if self.graph.reserved_by(variable)? == Some(id) {
            self.graph.release(variable, id)?;
            trace!(variable = %self.graph.describe(variable), "reservation released");
            if let Some(waiters) = self.reservation_waiters.remove(&variable) {
                for waiter in waiters {
                    self.mark(waiter);
                }
            }
        }
        Ok(())
    }

    fn release_message_wait(&mut self, id: NodeId) -> ExecResult<()> {
        if let NodeBody::Command(body) = &self.nodes.get(id)?.body {
            if let Some(command) = body.active {
                self.messages.remove_recipient(command);
            }
        }
        Ok(())
    }

    /// Fresh body state for a new iteration
    fn reset_body(&mut self, id: NodeId) -> ExecResult<()> {
        let node = self.nodes.get_mut(id)?;
        let handle_var = node.vars.command_handle;
        match &mut node.body {
            NodeBody::Command(body) => {
                if let Some(command) = body.active.take() {
                    self.commands.remove(&command);
                    self.messages.remove_recipient(command);
                }
                body.handle = None;
                body.abort_requested = false;
                body.abort_complete = false;
            }
            NodeBody::Assignment(body) => body.applied = false,
            NodeBody::Update(body) => {
                if let Some(update) = body.active.take() {
                    self.updates.remove(&update);
                }
                body.acknowledged = false;
            }
            NodeBody::Empty | NodeBody::List | NodeBody::LibraryCall { .. } => {}
        }
        if let Some(var) = handle_var {
            self.graph.set_value(var, Value::Unknown)?;
        }
        Ok(())
    }

    // =========================================================================
    // Side effects
    // =========================================================================

    fn perform_assignments(&mut self) -> ExecResult<usize> {
        let mut performed = 0;
        for id in std::mem::take(&mut self.assignments_pending) {
            let (variable, value_expr, name, plan, variable_name) = match self.nodes.try_get(id) {
                Some(Node {
                    state: NodeState::Executing,
                    body: NodeBody::Assignment(body),
                    name,
                    plan,
                    ..
                }) => (
                    body.variable,
                    body.value,
                    name.clone(),
                    *plan,
                    body.variable_name.clone(),
                ),
                _ => continue,
            };
            let value = self.graph.value(value_expr)?.clone();
            self.graph.save(variable)?;
            self.graph.set_value(variable, value.clone())?;
            if let NodeBody::Assignment(body) = &mut self.nodes.get_mut(id)?.body {
                body.applied = true;
            }
            let record = AssignmentRecord {
                plan,
                node: name,
                variable: variable_name,
                value,
                cycle: self.cycle,
                timestamp: Utc::now(),
            };
            for listener in &self.listeners {
                listener.on_assignment(&record);
            }
            self.mark(id);
            performed += 1;
        }
        Ok(performed)
    }

    fn dispatch_commands(&mut self) -> ExecResult<usize> {
        let mut sent = 0;
        for id in std::mem::take(&mut self.commands_pending) {
            let (name, arg_exprs, node_name) = match self.nodes.try_get(id) {
                Some(Node {
                    state: NodeState::Executing,
                    body: NodeBody::Command(body),
                    name,
                    ..
                }) => (body.name.clone(), body.args.clone(), name.clone()),
                _ => continue,
            };
            let mut args = Vec::with_capacity(arg_exprs.len());
            for expr in arg_exprs {
                args.push(self.graph.value(expr)?.clone());
            }
            let command_id = CommandId(self.next_command);
            self.next_command += 1;
            let command = Command {
                id: command_id,
                name,
                args,
                node: node_name,
            };
            if let NodeBody::Command(body) = &mut self.nodes.get_mut(id)?.body {
                body.active = Some(command_id);
            }
            self.commands.insert(command_id, (id, command.clone()));
            debug!(command = %command_id, name = %command.name, node = %command.node, "dispatching command");

            if command.name == RECEIVE_MESSAGE_COMMAND {
                match command.args.first().and_then(Value::as_str) {
                    Some(message) => {
                        let pairings = self.messages.add_recipient(message, command_id);
                        self.apply_pairings(pairings)?;
                    }
                    None => {
                        warn!(node = %command.node, "ReceiveMessage without a message name");
                        self.receive_handle(command_id, CommandHandle::Denied)?;
                    }
                }
            } else {
                self.interfaces.command.execute_command(&command);
            }
            sent += 1;
        }
        Ok(sent)
    }

    fn dispatch_updates(&mut self) -> ExecResult<usize> {
        let mut sent = 0;
        for id in std::mem::take(&mut self.updates_pending) {
            let (pair_exprs, node_name) = match self.nodes.try_get(id) {
                Some(Node {
                    state: NodeState::Executing,
                    body: NodeBody::Update(body),
                    name,
                    ..
                }) => (body.pairs.clone(), name.clone()),
                _ => continue,
            };
            let mut pairs = Vec::with_capacity(pair_exprs.len());
            for (name, expr) in pair_exprs {
                pairs.push((name, self.graph.value(expr)?.clone()));
            }
            let update_id = UpdateId(self.next_update);
            self.next_update += 1;
            if let NodeBody::Update(body) = &mut self.nodes.get_mut(id)?.body {
                body.active = Some(update_id);
            }
            self.updates.insert(update_id, id);
            let update = Update {
                id: update_id,
                node: node_name,
                pairs,
            };
            debug!(update = update_id.0, node = %update.node, "sending planner update");
            self.interfaces.update.send_planner_update(&update);
            sent += 1;
        }
        Ok(sent)
    }

    fn dispatch_aborts(&mut self) -> ExecResult<()> {
        for command_id in std::mem::take(&mut self.aborts_pending) {
            let (node, command) = match self.commands.get(&command_id) {
                Some((node, command)) => (*node, command.clone()),
                None => continue,
            };
            if command.name == RECEIVE_MESSAGE_COMMAND {
                // nothing external to abort
                self.messages.remove_recipient(command_id);
                self.receive_abort_ack(command_id, true)?;
                continue;
            }
            debug!(command = %command_id, node = ?node, "aborting command");
            self.interfaces.command.abort_command(&command);
        }
        Ok(())
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Deactivate and remove `root` and all its descendants
    fn remove_subtree(&mut self, root: NodeId) -> ExecResult<usize> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.try_get(id) {
                order.push(id);
                stack.extend(node.children.iter().copied());
            }
        }
        for id in order.iter().rev() {
            self.deactivate_node(*id)?;
            if let Some(Node {
                body: NodeBody::Command(body),
                ..
            }) = self.nodes.try_get(*id)
            {
                if let Some(command) = body.active {
                    self.commands.remove(&command);
                    self.messages.remove_recipient(command);
                }
            }
            if let Some(Node {
                body: NodeBody::Update(body),
                ..
            }) = self.nodes.try_get(*id)
            {
                if let Some(update) = body.active {
                    self.updates.remove(&update);
                }
            }
            for waiters in self.reservation_waiters.values_mut() {
                waiters.retain(|w| w != id);
            }
            self.pending.retain(|p| p != id);
            self.pending_set.remove(id);
            teardown_node(&mut self.graph, &mut self.nodes, *id)?;
        }
        Ok(order.len())
    }

    fn deactivate_node(&mut self, id: NodeId) -> ExecResult<()> {
        let state = self.nodes.get(id)?.state;
        self.switch_conditions(id, state, NodeState::Inactive)?;
        if state == NodeState::Executing {
            for expr in self.nodes.get(id)?.body.expressions() {
                self.graph.deactivate(expr)?;
            }
        }
        self.release_reservation(id)
    }

    /// Cooperative shutdown: abort outstanding commands, wait a bounded time
    /// for their acknowledgements, then tear everything down and close the
    /// queue.
    pub fn shutdown(&mut self) -> ExecResult<ShutdownReport> {
        self.terminating = true;
        let mut report = ShutdownReport::default();

        let mut outstanding = HashSet::new();
        let active: Vec<(CommandId, NodeId, Command)> = self
            .commands
            .iter()
            .map(|(id, (node, command))| (*id, *node, command.clone()))
            .collect();
        for (command_id, node, command) in active {
            let needs_abort = match self.nodes.try_get_mut(node) {
                Some(Node {
                    body: NodeBody::Command(body),
                    ..
                }) if body.active == Some(command_id) => {
                    let finished = matches!(
                        body.handle,
                        Some(CommandHandle::Success)
                            | Some(CommandHandle::Failed)
                            | Some(CommandHandle::Denied)
                    );
                    if finished || body.abort_complete {
                        false
                    } else {
                        body.abort_requested = true;
                        true
                    }
                }
                _ => false,
            };
            if !needs_abort {
                continue;
            }
            if command.name == RECEIVE_MESSAGE_COMMAND {
                self.messages.remove_recipient(command_id);
                continue;
            }
            self.interfaces.command.abort_command(&command);
            outstanding.insert(command_id);
        }
        report.aborts_requested = outstanding.len();
        if !outstanding.is_empty() {
            info!(count = outstanding.len(), "waiting for abort acknowledgements");
        }

        let deadline = Instant::now() + self.config.abort_timeout();
        while !outstanding.is_empty() && Instant::now() < deadline {
            self.queue.wait(Some(deadline));
            while let Some(entry) = self.queue.dequeue() {
                match entry {
                    QueueEntry::CommandAbortAck { command, .. } => {
                        outstanding.remove(&command);
                    }
                    QueueEntry::Mark { sequence } => self.queue.mark_processed(sequence),
                    other => trace!(kind = other.kind(), "dropped during shutdown"),
                }
            }
        }
        report.aborts_unacknowledged = outstanding.len();
        if !outstanding.is_empty() {
            warn!(count = outstanding.len(), "abort acknowledgements timed out");
        }

        for plan in std::mem::take(&mut self.plans) {
            report.nodes_removed += self.remove_subtree(plan.root)?;
        }
        self.sync_lookups()?;
        self.cache
            .clear_registrations(self.interfaces.lookup.as_ref());
        self.assignments_pending.clear();
        self.commands_pending.clear();
        self.updates_pending.clear();
        self.aborts_pending.clear();

        self.queue.close();
        report.entries_dropped = self.queue.flush();
        info!(
            nodes = report.nodes_removed,
            dropped = report.entries_dropped,
            "executive shut down"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Exec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exec")
            .field("cycle", &self.cycle)
            .field("plans", &self.plans.len())
            .field("nodes", &self.nodes.len())
            .field("expressions", &self.graph.len())
            .field("terminating", &self.terminating)
            .finish()
    }
}
