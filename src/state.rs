//! Monotonic lifecycle state shared by every long-lived worker.
//!
//! Servers, sessions, the DAQ read loop and the spool worker all move through
//! the same five stages, always forward: not started, starting, running,
//! stopping, stopped. A worker owns one [`RunState`]; its controller calls
//! [`RunState::transit`] to request a stage and [`RunState::wait`] to observe
//! it, so `start()` can block until the task is actually serving and `stop()`
//! can block until the task has released its sockets.
//!
//! The primitive is an integer stage behind a watch channel. Every successful
//! forward transition wakes every current waiter; backward transitions are
//! silent no-ops, which lets racing controllers call `transit` without
//! coordination - the highest requested stage wins.

use std::time::Duration;

use tokio::sync::watch;

/// Lifecycle stage of a worker. Stages are totally ordered and a worker's
/// visible stage never decreases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RunStage {
    /// The worker task has not been spawned yet.
    #[default]
    NotStarted = 0,
    /// The task is spawned but not serving yet.
    Starting = 1,
    /// The task is serving.
    Running = 2,
    /// Shutdown was requested; the task will observe it at its next poll.
    Stopping = 3,
    /// The task has exited and released its resources.
    Stopped = 4,
}

/// Forward-only stage holder with wake-ups on transition.
#[derive(Clone, Debug)]
pub struct RunState {
    tx: watch::Sender<RunStage>,
}

impl Default for RunState {
    fn default() -> Self {
        RunState::new()
    }
}

impl RunState {
    /// Creates a state at [`RunStage::NotStarted`].
    pub fn new() -> Self {
        RunState { tx: watch::channel(RunStage::NotStarted).0 }
    }

    /// Returns the present stage.
    pub fn current(&self) -> RunStage {
        *self.tx.borrow()
    }

    /// Requests a forward transition.
    ///
    /// If `next` is beyond the present stage the stage is set, every waiter
    /// is woken and `true` is returned. Otherwise nothing happens and `false`
    /// is returned. Concurrent transitions race harmlessly: the highest
    /// requested stage wins and the lower-valued calls report `false`.
    pub fn transit(&self, next: RunStage) -> bool {
        self.tx.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Waits until the stage reaches `target` or beyond.
    ///
    /// Returns whether the condition was met. A `None` timeout waits
    /// indefinitely; a zero timeout checks once without sleeping. Reaching a
    /// stage beyond `target` also satisfies the wait.
    pub async fn wait(&self, target: RunStage, timeout: Option<Duration>) -> bool {
        let mut rx = self.tx.subscribe();
        let reached = rx.wait_for(|stage| *stage >= target);
        match timeout {
            None => reached.await.is_ok(),
            Some(limit) => matches!(tokio::time::timeout(limit, reached).await, Ok(Ok(_))),
        }
    }
}
