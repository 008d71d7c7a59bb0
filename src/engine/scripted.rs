//! In-memory interface adapter
//!
//! [`ScriptedInterface`] plays the external world for tests, benchmarks and
//! simulations. States are read from a table the caller fills in; commands,
//! aborts and planner updates are recorded, and can be answered
//! automatically through an attached [`InputQueue`].

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::engine::interface::{
    Command, CommandHandler, LookupHandler, PlannerUpdateHandler, State, Update,
};
use crate::engine::queue::InputQueue;
use crate::engine::value::{CommandHandle, Value};

#[derive(Default)]
struct Script {
    /// Handle sent back for every command, if any
    command_handle: Option<CommandHandle>,
    /// Return values by command name
    command_returns: HashMap<String, Value>,
    ack_aborts: bool,
    ack_updates: bool,
}

/// Recording adapter implementing all three handler roles
#[derive(Default)]
pub struct ScriptedInterface {
    states: Mutex<HashMap<State, Value>>,
    lookups: Mutex<Vec<State>>,
    subscriptions: Mutex<HashSet<State>>,
    thresholds: Mutex<HashMap<State, (f64, f64)>>,
    commands: Mutex<Vec<Command>>,
    aborts: Mutex<Vec<Command>>,
    updates: Mutex<Vec<Update>>,
    script: Mutex<Script>,
    queue: Mutex<Option<Arc<InputQueue>>>,
}

impl ScriptedInterface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue used for automatic replies
    pub fn attach(&self, queue: Arc<InputQueue>) {
        *self.queue.lock() = Some(queue);
    }

    /// Answer every command with `handle`
    pub fn auto_ack_commands(&self, handle: CommandHandle) {
        self.script.lock().command_handle = Some(handle);
    }

    /// Return `value` from every command named `name`, before its handle
    pub fn return_value(&self, name: impl Into<String>, value: Value) {
        self.script.lock().command_returns.insert(name.into(), value);
    }

    pub fn auto_ack_aborts(&self, ack: bool) {
        self.script.lock().ack_aborts = ack;
    }

    pub fn auto_ack_updates(&self, ack: bool) {
        self.script.lock().ack_updates = ack;
    }

    /// Set the value `lookup_now` reports. Does not notify the executive.
    pub fn set_state(&self, state: State, value: Value) {
        self.states.lock().insert(state, value);
    }

    /// Set a state and push it through the attached queue
    pub fn publish_state(&self, state: State, value: Value) {
        self.set_state(state.clone(), value.clone());
        if let Some(queue) = self.queue.lock().as_ref() {
            if let Err(err) = queue.enqueue_lookup_return(state, value) {
                warn!(error = %err, "state not published");
            }
        }
    }

    pub fn set_time(&self, time: f64) {
        self.set_state(State::named("time"), Value::Real(time));
    }

    /// How many times `lookup_now` was asked about a state with this name
    pub fn lookup_count(&self, name: &str) -> usize {
        self.lookups.lock().iter().filter(|s| s.name == name).count()
    }

    pub fn is_subscribed(&self, state: &State) -> bool {
        self.subscriptions.lock().contains(state)
    }

    pub fn thresholds(&self, state: &State) -> Option<(f64, f64)> {
        self.thresholds.lock().get(state).copied()
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    /// Most recent command with this name
    pub fn last_command(&self, name: &str) -> Option<Command> {
        self.commands.lock().iter().rev().find(|c| c.name == name).cloned()
    }

    pub fn aborts(&self) -> Vec<Command> {
        self.aborts.lock().clone()
    }

    pub fn updates(&self) -> Vec<Update> {
        self.updates.lock().clone()
    }

    fn reply<F>(&self, send: F)
    where
        F: FnOnce(&InputQueue) -> crate::error::ExecResult<()>,
    {
        if let Some(queue) = self.queue.lock().as_ref() {
            if let Err(err) = send(queue) {
                warn!(error = %err, "scripted reply dropped");
            }
        }
    }
}

impl LookupHandler for ScriptedInterface {
    fn lookup_now(&self, state: &State) -> Value {
        self.lookups.lock().push(state.clone());
        self.states.lock().get(state).cloned().unwrap_or_default()
    }

    fn subscribe(&self, state: &State) {
        self.subscriptions.lock().insert(state.clone());
    }

    fn unsubscribe(&self, state: &State) {
        self.subscriptions.lock().remove(state);
        self.thresholds.lock().remove(state);
    }

    fn set_thresholds(&self, state: &State, hi: f64, lo: f64) {
        self.thresholds.lock().insert(state.clone(), (hi, lo));
    }
}

impl CommandHandler for ScriptedInterface {
    fn execute_command(&self, command: &Command) {
        debug!(command = %command.id, name = %command.name, "scripted command");
        self.commands.lock().push(command.clone());
        let (handle, returns) = {
            let script = self.script.lock();
            (script.command_handle, script.command_returns.get(&command.name).cloned())
        };
        if let Some(value) = returns {
            self.reply(|q| q.enqueue_command_return(command.id, value));
        }
        if let Some(handle) = handle {
            self.reply(|q| q.enqueue_command_ack(command.id, handle));
        }
    }

    fn abort_command(&self, command: &Command) {
        self.aborts.lock().push(command.clone());
        if self.script.lock().ack_aborts {
            self.reply(|q| q.enqueue_command_abort_ack(command.id, true));
        }
    }
}

impl PlannerUpdateHandler for ScriptedInterface {
    fn send_planner_update(&self, update: &Update) {
        self.updates.lock().push(update.clone());
        if self.script.lock().ack_updates {
            self.reply(|q| q.enqueue_planner_update_ack(update.id, true));
        }
    }
}
