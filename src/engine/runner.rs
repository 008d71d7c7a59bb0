//! Threaded runner
//!
//! [`ExecRunner::spawn`] moves an [`Exec`] onto its own thread. The thread
//! runs a cycle, then sleeps on the input queue until an entry arrives, a
//! scheduled wakeup comes due, or the idle wait elapses. Everything else
//! talks to it through a cloneable [`ExecHandle`].

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::engine::exec::{Exec, ShutdownReport};
use crate::engine::interface::{CommandId, State, UpdateId};
use crate::engine::plan::PlanNode;
use crate::engine::queue::{InputQueue, QueueEntry};
use crate::engine::value::{CommandHandle, Value};
use crate::error::{ExecError, ExecResult};

/// Pending timed wakeups, ordered by due time
#[derive(Debug, Default)]
struct Wakeups {
    due: BTreeMap<(Instant, u64), ()>,
    next_id: u64,
}

impl Wakeups {
    fn schedule(&mut self, at: Instant) -> u64 {
        self.next_id += 1;
        self.due.insert((at, self.next_id), ());
        self.next_id
    }

    fn cancel(&mut self, id: u64) -> bool {
        let key = self.due.keys().find(|(_, i)| *i == id).copied();
        key.map_or(false, |k| self.due.remove(&k).is_some())
    }

    /// Drop every wakeup due by `now`; report how many fired and when the
    /// next one is due
    fn fire(&mut self, now: Instant) -> (usize, Option<Instant>) {
        let later = self.due.split_off(&(now, u64::MAX));
        let fired = self.due.len();
        self.due = later;
        (fired, self.due.keys().next().map(|(at, _)| *at))
    }
}

/// How a runner thread ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub shutdown: ShutdownReport,
}

/// Cloneable access to a running executive
#[derive(Clone)]
pub struct ExecHandle {
    queue: Arc<InputQueue>,
    wakeups: Arc<Mutex<Wakeups>>,
    running: Arc<AtomicBool>,
}

impl ExecHandle {
    pub fn queue(&self) -> &Arc<InputQueue> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn enqueue(&self, entry: QueueEntry) -> ExecResult<()> {
        self.queue.enqueue(entry)
    }

    pub fn add_plan(&self, plan: PlanNode) -> ExecResult<()> {
        self.queue.enqueue_plan(plan)
    }

    pub fn add_library(&self, library: PlanNode) -> ExecResult<()> {
        self.queue.enqueue_library(library)
    }

    pub fn lookup_return(&self, state: State, value: Value) -> ExecResult<()> {
        self.queue.enqueue_lookup_return(state, value)
    }

    pub fn command_ack(&self, command: CommandId, handle: CommandHandle) -> ExecResult<()> {
        self.queue.enqueue_command_ack(command, handle)
    }

    pub fn command_return(&self, command: CommandId, value: Value) -> ExecResult<()> {
        self.queue.enqueue_command_return(command, value)
    }

    pub fn command_abort_ack(&self, command: CommandId, ack: bool) -> ExecResult<()> {
        self.queue.enqueue_command_abort_ack(command, ack)
    }

    pub fn planner_update_ack(&self, update: UpdateId, ack: bool) -> ExecResult<()> {
        self.queue.enqueue_planner_update_ack(update, ack)
    }

    pub fn receive_message(&self, message: impl Into<String>, param: Value) -> ExecResult<()> {
        self.queue.enqueue_receive_message(message, param)
    }

    pub fn mark(&self) -> ExecResult<u64> {
        self.queue.mark()
    }

    pub fn wait_for_mark(&self, sequence: u64, timeout: Duration) -> bool {
        self.queue.wait_for_mark(sequence, timeout)
    }

    /// Enqueue a mark and block until the executive has processed
    /// everything before it
    pub fn mark_and_wait(&self, timeout: Duration) -> ExecResult<bool> {
        let sequence = self.queue.mark()?;
        Ok(self.queue.wait_for_mark(sequence, timeout))
    }

    /// Run a cycle no later than `at`
    pub fn schedule_wakeup(&self, at: Instant) -> u64 {
        let id = self.wakeups.lock().schedule(at);
        self.queue.notify();
        id
    }

    pub fn cancel_wakeup(&self, id: u64) -> bool {
        self.wakeups.lock().cancel(id)
    }

    /// Ask the executive to stop. Entries already queued are processed.
    pub fn shutdown(&self) -> ExecResult<()> {
        self.queue.enqueue_terminate()
    }
}

impl std::fmt::Debug for ExecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecHandle")
            .field("running", &self.is_running())
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// An executive running on its own thread
pub struct ExecRunner {
    handle: ExecHandle,
    thread: Option<JoinHandle<ExecResult<RunSummary>>>,
}

impl ExecRunner {
    pub fn spawn(exec: Exec) -> ExecResult<Self> {
        let handle = ExecHandle {
            queue: exec.queue(),
            wakeups: Arc::new(Mutex::new(Wakeups::default())),
            running: Arc::new(AtomicBool::new(true)),
        };
        let thread_handle = handle.clone();
        let thread = std::thread::Builder::new()
            .name("exec".to_string())
            .spawn(move || run_loop(exec, thread_handle))?;
        info!("executive thread started");
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ExecHandle {
        self.handle.clone()
    }

    /// Wait for the thread to finish
    pub fn join(mut self) -> ExecResult<RunSummary> {
        self.join_thread()
    }

    /// Request shutdown and wait for the thread
    pub fn stop(mut self) -> ExecResult<RunSummary> {
        // an already closed queue means the thread is on its way out
        let _ = self.handle.shutdown();
        self.join_thread()
    }

    fn join_thread(&mut self) -> ExecResult<RunSummary> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| ExecError::Internal("executive thread panicked".to_string()))?,
            None => Err(ExecError::NotRunning),
        }
    }
}

impl Drop for ExecRunner {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.handle.shutdown();
            let _ = self.join_thread();
        }
    }
}

fn run_loop(mut exec: Exec, handle: ExecHandle) -> ExecResult<RunSummary> {
    let idle_wait = exec.config().idle_wait();
    let mut cycles = 0u64;

    let outcome = loop {
        if let Err(err) = exec.run_cycle() {
            error!(error = %err, cycle = exec.cycle(), "cycle failed");
            break Err(err);
        }
        cycles += 1;
        if exec.is_terminating() {
            break Ok(());
        }
        if exec.needs_step() || !handle.queue.is_empty() {
            continue;
        }

        let now = Instant::now();
        let (fired, next) = handle.wakeups.lock().fire(now);
        if fired > 0 {
            debug!(fired, "wakeup due");
            continue;
        }
        let deadline = next.map_or(now + idle_wait, |at| at.min(now + idle_wait));
        handle.queue.wait(Some(deadline));
        if handle.queue.is_closed() && handle.queue.is_empty() {
            break Ok(());
        }
    };

    handle.running.store(false, Ordering::Release);
    let shutdown = exec.shutdown();
    info!(cycles, "executive thread stopped");
    outcome?;
    Ok(RunSummary {
        cycles,
        shutdown: shutdown?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakeups_fire_in_order() {
        let mut wakeups = Wakeups::default();
        let now = Instant::now();
        wakeups.schedule(now + Duration::from_secs(10));
        let early = wakeups.schedule(now);
        assert!(early > 0);

        let (fired, next) = wakeups.fire(now);
        assert_eq!(fired, 1);
        assert_eq!(next, Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_cancel_wakeup() {
        let mut wakeups = Wakeups::default();
        let id = wakeups.schedule(Instant::now());
        assert!(wakeups.cancel(id));
        assert!(!wakeups.cancel(id));
        assert_eq!(wakeups.fire(Instant::now()).0, 0);
    }
}
