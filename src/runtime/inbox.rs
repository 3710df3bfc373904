//! Cross-thread inbox for an execution environment
//!
//! The Boa context is `!Send`, so other threads never touch it. They push
//! [`HostTask`]s into the environment's inbox instead; the owning thread
//! drains the inbox whenever it drives the job queue.

use boa_engine::{Context, JsResult};
use parking_lot::{Condvar, Mutex};
use std::{collections::VecDeque, sync::Arc, time::Duration};

use super::promise::BridgeId;

/// Work marshalled onto the environment's owning thread.
pub enum HostTask {
    /// Settle a detached promise bridge.
    Settle {
        bridge: BridgeId,
        outcome: Result<serde_json::Value, String>,
    },
    /// Run an arbitrary closure against the context.
    Call(Box<dyn FnOnce(&mut Context) -> JsResult<()> + Send>),
}

#[derive(Default)]
struct InboxState {
    tasks: VecDeque<HostTask>,
    closed: bool,
}

/// Shared queue between host threads and the environment thread.
#[derive(Default)]
pub struct HostInbox {
    state: Mutex<InboxState>,
    signal: Condvar,
}

impl HostInbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a task. Returns false once the inbox is closed.
    pub fn push(&self, task: HostTask) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.tasks.push_back(task);
        self.signal.notify_one();
        true
    }

    pub fn drain(&self) -> Vec<HostTask> {
        let mut state = self.state.lock();
        state.tasks.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().tasks.is_empty()
    }

    /// Block until a task arrives, the inbox closes, or `timeout` passes.
    pub fn wait(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if state.tasks.is_empty() && !state.closed {
            let _ = self.signal.wait_for(&mut state, timeout);
        }
    }

    /// Refuse further tasks and discard queued ones.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.tasks.clear();
        self.signal.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// `Send + Clone` handle used by host threads to reach an environment.
#[derive(Clone)]
pub struct EnvironmentHandle {
    inbox: Arc<HostInbox>,
}

impl EnvironmentHandle {
    pub(crate) fn new(inbox: Arc<HostInbox>) -> Self {
        Self { inbox }
    }

    /// Run `task` on the environment thread the next time it drives its
    /// job queue. Returns false if the environment is destroyed.
    pub fn run_on_environment<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut Context) -> JsResult<()> + Send + 'static,
    {
        self.inbox.push(HostTask::Call(Box::new(task)))
    }

    pub fn is_alive(&self) -> bool {
        !self.inbox.is_closed()
    }
}
