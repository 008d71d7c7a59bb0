//! Input queue
//!
//! The one thread-safe door into the executive. Adapter threads enqueue
//! typed [`QueueEntry`] values; the exec thread dequeues them in FIFO order.
//!
//! Entries live in a slab of slots linked through `next`. Retired slots go
//! on a LIFO free list and are reused before the slab grows, so a steady
//! stream of entries does not allocate slots. A slot's payload is taken out
//! when the entry is dequeued, so a free slot never holds a stale value.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::engine::interface::{CommandId, State, UpdateId};
use crate::engine::plan::PlanNode;
use crate::engine::value::{CommandHandle, Value};
use crate::error::{ExecError, ExecResult};

/// Something that happened outside the exec thread
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEntry {
    /// New value for a looked-up state
    LookupReturn { state: State, value: Value },
    CommandAck {
        command: CommandId,
        handle: CommandHandle,
    },
    CommandReturn { command: CommandId, value: Value },
    CommandAbortAck { command: CommandId, ack: bool },
    PlannerUpdateAck { update: UpdateId, ack: bool },
    AddPlan(Box<PlanNode>),
    AddLibrary(Box<PlanNode>),
    /// An incoming message with its parameter
    ReceiveMessage { message: String, param: Value },
    /// `command` is waiting for the next `message`
    AcceptMessage { message: String, command: CommandId },
    /// `command` no longer wants a message
    ReleaseMessageHandle { command: CommandId },
    /// Drop everything buffered under `message`
    MessageQueueEmpty { message: String },
    /// Barrier; see [`InputQueue::mark`]
    Mark { sequence: u64 },
    /// Cooperative shutdown request
    Terminate,
}

impl QueueEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueEntry::LookupReturn { .. } => "lookup_return",
            QueueEntry::CommandAck { .. } => "command_ack",
            QueueEntry::CommandReturn { .. } => "command_return",
            QueueEntry::CommandAbortAck { .. } => "command_abort_ack",
            QueueEntry::PlannerUpdateAck { .. } => "planner_update_ack",
            QueueEntry::AddPlan(_) => "add_plan",
            QueueEntry::AddLibrary(_) => "add_library",
            QueueEntry::ReceiveMessage { .. } => "receive_message",
            QueueEntry::AcceptMessage { .. } => "accept_message",
            QueueEntry::ReleaseMessageHandle { .. } => "release_message_handle",
            QueueEntry::MessageQueueEmpty { .. } => "message_queue_empty",
            QueueEntry::Mark { .. } => "mark",
            QueueEntry::Terminate => "terminate",
        }
    }
}

struct Slot {
    entry: Option<QueueEntry>,
    next: Option<usize>,
}

struct Inner {
    slots: Vec<Slot>,
    head: Option<usize>,
    tail: Option<usize>,
    free: Vec<usize>,
    len: usize,
    next_mark: u64,
    processed_mark: u64,
    closed: bool,
    /// Set by [`InputQueue::notify`] to wake the consumer with no entry
    woken: bool,
}

impl Inner {
    fn allocate(&mut self, entry: QueueEntry) -> usize {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.entry = Some(entry);
                slot.next = None;
                index
            }
            None => {
                self.slots.push(Slot {
                    entry: Some(entry),
                    next: None,
                });
                self.slots.len() - 1
            }
        }
    }

    fn link(&mut self, entry: QueueEntry) {
        let index = self.allocate(entry);
        match self.tail {
            Some(tail) => self.slots[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    fn behead(&mut self) -> Option<QueueEntry> {
        let index = self.head?;
        let slot = &mut self.slots[index];
        let entry = slot.entry.take();
        self.head = slot.next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.free.push(index);
        self.len -= 1;
        entry
    }
}

/// Mutex-guarded FIFO shared between adapter threads and the exec thread
pub struct InputQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
    marks: Condvar,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Pre-allocate `capacity` free slots
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                entry: None,
                next: None,
            });
            free.push(capacity - 1 - i);
        }
        Self {
            inner: Mutex::new(Inner {
                slots,
                head: None,
                tail: None,
                free,
                len: 0,
                next_mark: 0,
                processed_mark: 0,
                closed: false,
                woken: false,
            }),
            ready: Condvar::new(),
            marks: Condvar::new(),
        }
    }

    /// Append an entry and wake the consumer
    pub fn enqueue(&self, entry: QueueEntry) -> ExecResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ExecError::QueueClosed);
        }
        trace!(kind = entry.kind(), "enqueue");
        inner.link(entry);
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    pub fn enqueue_lookup_return(&self, state: State, value: Value) -> ExecResult<()> {
        self.enqueue(QueueEntry::LookupReturn { state, value })
    }

    pub fn enqueue_command_ack(&self, command: CommandId, handle: CommandHandle) -> ExecResult<()> {
        self.enqueue(QueueEntry::CommandAck { command, handle })
    }

    pub fn enqueue_command_return(&self, command: CommandId, value: Value) -> ExecResult<()> {
        self.enqueue(QueueEntry::CommandReturn { command, value })
    }

    pub fn enqueue_command_abort_ack(&self, command: CommandId, ack: bool) -> ExecResult<()> {
        self.enqueue(QueueEntry::CommandAbortAck { command, ack })
    }

    pub fn enqueue_planner_update_ack(&self, update: UpdateId, ack: bool) -> ExecResult<()> {
        self.enqueue(QueueEntry::PlannerUpdateAck { update, ack })
    }

    pub fn enqueue_plan(&self, plan: PlanNode) -> ExecResult<()> {
        self.enqueue(QueueEntry::AddPlan(Box::new(plan)))
    }

    pub fn enqueue_library(&self, library: PlanNode) -> ExecResult<()> {
        self.enqueue(QueueEntry::AddLibrary(Box::new(library)))
    }

    pub fn enqueue_receive_message(&self, message: impl Into<String>, param: Value) -> ExecResult<()> {
        self.enqueue(QueueEntry::ReceiveMessage {
            message: message.into(),
            param,
        })
    }

    pub fn enqueue_accept_message(&self, message: impl Into<String>, command: CommandId) -> ExecResult<()> {
        self.enqueue(QueueEntry::AcceptMessage {
            message: message.into(),
            command,
        })
    }

    pub fn enqueue_release_message_handle(&self, command: CommandId) -> ExecResult<()> {
        self.enqueue(QueueEntry::ReleaseMessageHandle { command })
    }

    pub fn enqueue_message_queue_empty(&self, message: impl Into<String>) -> ExecResult<()> {
        self.enqueue(QueueEntry::MessageQueueEmpty {
            message: message.into(),
        })
    }

    /// Ask the consumer to shut down after its current cycle
    pub fn enqueue_terminate(&self) -> ExecResult<()> {
        self.enqueue(QueueEntry::Terminate)
    }

    /// Append a barrier and return its sequence number. Once the consumer
    /// reports a mark at or past it, everything enqueued before it has been
    /// processed.
    pub fn mark(&self) -> ExecResult<u64> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ExecError::QueueClosed);
        }
        inner.next_mark += 1;
        let sequence = inner.next_mark;
        inner.link(QueueEntry::Mark { sequence });
        drop(inner);
        self.ready.notify_one();
        Ok(sequence)
    }

    /// Pop the head entry, if any
    pub fn dequeue(&self) -> Option<QueueEntry> {
        self.inner.lock().behead()
    }

    /// Block until there is an entry, [`notify`](Self::notify) is called,
    /// the queue closes, or `deadline` passes. Returns whether entries are
    /// waiting.
    pub fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut inner = self.inner.lock();
        while inner.len == 0 && !inner.woken && !inner.closed {
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut inner, deadline).timed_out() {
                        break;
                    }
                }
                None => self.ready.wait(&mut inner),
            }
        }
        inner.woken = false;
        inner.len > 0
    }

    /// Wake the consumer without enqueuing anything
    pub fn notify(&self) {
        self.inner.lock().woken = true;
        self.ready.notify_one();
    }

    /// Record that the consumer has passed mark `sequence`
    pub fn mark_processed(&self, sequence: u64) {
        let mut inner = self.inner.lock();
        if sequence > inner.processed_mark {
            inner.processed_mark = sequence;
        }
        drop(inner);
        self.marks.notify_all();
    }

    pub fn processed_mark(&self) -> u64 {
        self.inner.lock().processed_mark
    }

    /// Block until mark `sequence` has been processed or `timeout` passes
    pub fn wait_for_mark(&self, sequence: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.processed_mark < sequence {
            if inner.closed && inner.len == 0 {
                break;
            }
            if self.marks.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.processed_mark >= sequence
    }

    /// Discard all pending entries. Returns how many were dropped.
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut dropped = 0;
        while inner.behead().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Refuse further entries and wake anyone waiting
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.ready.notify_all();
        self.marks.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retired slots ready for reuse
    pub fn free_slots(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Total slots ever allocated
    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}
