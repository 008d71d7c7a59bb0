//! Message pairing
//!
//! Incoming messages are buffered per name until a command waiting for that
//! name accepts one. Recipients are served in the order they arrived, and so
//! are messages. Unless duplicates are allowed, a new message replaces any
//! older ones still buffered under the same name.

use std::collections::{HashMap, VecDeque};
use tracing::debug;

use crate::engine::interface::CommandId;
use crate::engine::value::Value;

/// A message handed to a waiting command
#[derive(Debug, Clone, PartialEq)]
pub struct Pairing {
    pub command: CommandId,
    pub message: String,
    pub param: Value,
}

#[derive(Debug, Default)]
struct PairingQueue {
    messages: VecDeque<Value>,
    recipients: VecDeque<CommandId>,
}

/// Per-name pairing queues
#[derive(Debug, Default)]
pub struct MessageQueueMap {
    queues: HashMap<String, PairingQueue>,
    allow_duplicates: bool,
}

impl MessageQueueMap {
    pub fn new(allow_duplicates: bool) -> Self {
        Self {
            queues: HashMap::new(),
            allow_duplicates,
        }
    }

    pub fn allow_duplicates(&self) -> bool {
        self.allow_duplicates
    }

    /// Buffer an incoming message and pair what can be paired
    pub fn add_message(&mut self, message: &str, param: Value) -> Vec<Pairing> {
        let allow_duplicates = self.allow_duplicates;
        let queue = self.queues.entry(message.to_string()).or_default();
        if !allow_duplicates {
            queue.messages.clear();
        }
        queue.messages.push_back(param);
        debug!(message, "message buffered");
        Self::pair(message, queue)
    }

    /// Register `command` as waiting for the next `message`
    pub fn add_recipient(&mut self, message: &str, command: CommandId) -> Vec<Pairing> {
        let queue = self.queues.entry(message.to_string()).or_default();
        queue.recipients.push_back(command);
        Self::pair(message, queue)
    }

    /// Withdraw a waiting command. Returns whether it was waiting.
    pub fn remove_recipient(&mut self, command: CommandId) -> bool {
        let mut removed = false;
        for queue in self.queues.values_mut() {
            let before = queue.recipients.len();
            queue.recipients.retain(|c| *c != command);
            removed |= queue.recipients.len() != before;
        }
        removed
    }

    /// Drop every message buffered under `message`. Waiting recipients stay.
    pub fn clear_messages(&mut self, message: &str) -> usize {
        self.queues
            .get_mut(message)
            .map(|queue| {
                let dropped = queue.messages.len();
                queue.messages.clear();
                dropped
            })
            .unwrap_or(0)
    }

    pub fn buffered(&self, message: &str) -> usize {
        self.queues.get(message).map_or(0, |q| q.messages.len())
    }

    pub fn waiting(&self, message: &str) -> usize {
        self.queues.get(message).map_or(0, |q| q.recipients.len())
    }

    fn pair(message: &str, queue: &mut PairingQueue) -> Vec<Pairing> {
        let mut pairings = Vec::new();
        while !queue.messages.is_empty() && !queue.recipients.is_empty() {
            if let (Some(command), Some(param)) =
                (queue.recipients.pop_front(), queue.messages.pop_front())
            {
                pairings.push(Pairing {
                    command,
                    message: message.to_string(),
                    param,
                });
            }
        }
        pairings
    }
}
