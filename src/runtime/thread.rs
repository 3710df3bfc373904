//! Service workers on dedicated threads
//!
//! A Boa context never leaves the thread that created it, so a
//! [`WorkerThread`] builds its [`ServiceWorker`] on its own OS thread and
//! serves commands sent through a [`WorkerThreadHandle`]. Between commands
//! the thread keeps pumping the environment so timers fire and host tasks
//! (promise settlements, marshalled closures) are drained.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde_json::Value;
use std::{
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
};
use tokio::sync::oneshot;
use tracing::{debug, info_span, warn};
use url::Url;

use super::events::{Event, WorkerEvent};
use super::extendable::ExtendableEvent;
use super::fetch::{FetchEvent, FetchRequest, ResponseSnapshot};
use super::promise::{PromiseBridge, PromiseSettler};
use super::worker::{
    ContentSource, ImportScripts, InstallState, ServiceWorker, ServiceWorkerRegistration,
};
use super::{RuntimeConfig, RuntimeResult, ServiceWorkerError};

// ============================================================================
// Host-side types
// ============================================================================

/// An event the host asks a worker thread to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Install,
    Activate,
    /// Extendable `message` event whose `data` is the payload.
    Message(Value),
    Fetch(FetchRequest),
    /// Plain event with optional `data`.
    Custom {
        event_type: String,
        data: Option<Value>,
    },
}

/// What the host gets back once an event and its extensions settled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventOutcome {
    /// Set for fetch events the worker answered with `respondWith`.
    pub response: Option<ResponseSnapshot>,
}

/// Everything needed to build a worker on its thread.
#[derive(Clone)]
pub struct WorkerOptions {
    pub id: String,
    pub url: Url,
    pub install_state: InstallState,
    pub content: ContentSource,
    pub import_scripts: Option<ImportScripts>,
    pub registration: Weak<dyn ServiceWorkerRegistration>,
    pub config: RuntimeConfig,
}

impl WorkerOptions {
    pub fn new(id: impl Into<String>, url: Url, content: ContentSource) -> Self {
        Self {
            id: id.into(),
            url,
            install_state: InstallState::Installing,
            content,
            import_scripts: None,
            registration: super::worker::no_registration(),
            config: RuntimeConfig::default(),
        }
    }
}

type Reply<T> = oneshot::Sender<RuntimeResult<T>>;

enum Command {
    Dispatch {
        event: HostEvent,
        response: Reply<EventOutcome>,
    },
    Evaluate {
        script: String,
        response: Reply<Value>,
    },
    InstallState {
        response: Reply<InstallState>,
    },
    SetInstallState {
        state: InstallState,
        response: Reply<()>,
    },
    SkipWaitingStatus {
        response: Reply<bool>,
    },
    CreateBridge {
        global: String,
        response: Reply<PromiseSettler>,
    },
    TakeException {
        response: Reply<Option<ServiceWorkerError>>,
    },
    Destroy {
        response: Reply<()>,
    },
    Shutdown,
}

// ============================================================================
// Worker thread
// ============================================================================

/// Owns the thread; dropping it shuts the worker down and joins.
pub struct WorkerThread {
    handle: WorkerThreadHandle,
    join: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn spawn(options: WorkerOptions) -> RuntimeResult<Self> {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let name = format!("sw-{}", options.id);
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || run_worker(options, command_rx))
            .map_err(|e| ServiceWorkerError::EngineError(e.to_string()))?;

        Ok(Self {
            handle: WorkerThreadHandle { command_tx },
            join: Some(join),
        })
    }

    pub fn handle(&self) -> WorkerThreadHandle {
        self.handle.clone()
    }

    /// Stop the thread and wait for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.handle.command_tx.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("Service worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::ops::Deref for WorkerThread {
    type Target = WorkerThreadHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

fn build_worker(options: WorkerOptions) -> ServiceWorker {
    let worker = ServiceWorker::with_config(
        options.id,
        options.url,
        options.registration,
        options.install_state,
        options.content,
        options.config,
    );
    if let Some(hook) = options.import_scripts {
        worker.set_import_scripts(hook);
    }
    worker
}

fn run_worker(options: WorkerOptions, command_rx: Receiver<Command>) {
    let idle_tick = options.config.idle_tick;
    let mut worker = build_worker(options);

    let _span = info_span!("service_worker", id = %worker.id()).entered();
    debug!(url = %worker.url(), "Worker thread starting");

    // Load now so timers set by the top-level script start running.
    if let Err(e) = worker.execution_environment() {
        warn!(error = %e, "Failed to create worker environment");
    }

    loop {
        if let Err(e) = worker.pump() {
            if !worker.is_destroyed() {
                warn!(error = %e, "Pumping worker environment failed");
            }
        }

        match command_rx.recv_timeout(idle_tick) {
            Ok(Command::Shutdown) => {
                debug!("Worker shutdown requested");
                break;
            }
            Ok(command) => execute_command(&mut worker, command),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Command channel disconnected");
                break;
            }
        }
    }

    worker.destroy();
    debug!("Worker thread stopped");
}

fn execute_command(worker: &mut ServiceWorker, command: Command) {
    match command {
        Command::Dispatch { event, response } => {
            let _ = response.send(dispatch_host_event(worker, event));
        }
        Command::Evaluate { script, response } => {
            let _ = response.send(evaluate_to_json(worker, &script));
        }
        Command::InstallState { response } => {
            let _ = response.send(Ok(worker.install_state()));
        }
        Command::SetInstallState { state, response } => {
            worker.set_install_state(state);
            let _ = response.send(Ok(()));
        }
        Command::SkipWaitingStatus { response } => {
            let _ = response.send(Ok(worker.skip_waiting_status()));
        }
        Command::CreateBridge { global, response } => {
            let _ = response.send(create_bridge(worker, &global));
        }
        Command::TakeException { response } => {
            let _ = response.send(Ok(worker.take_exception()));
        }
        Command::Destroy { response } => {
            worker.destroy();
            let _ = response.send(Ok(()));
        }
        Command::Shutdown => {}
    }
}

fn dispatch_host_event(
    worker: &mut ServiceWorker,
    event: HostEvent,
) -> RuntimeResult<EventOutcome> {
    match event {
        HostEvent::Install => run_extendable(worker, &ExtendableEvent::new("install")),
        HostEvent::Activate => run_extendable(worker, &ExtendableEvent::new("activate")),
        HostEvent::Message(data) => {
            run_extendable(worker, &ExtendableEvent::with_data("message", data))
        }
        HostEvent::Fetch(request) => {
            let fetch = FetchEvent::new(request);
            worker.dispatch_and_wait(&fetch)?;
            let response = fetch
                .response()
                .transpose()?
                .map(|response| response.snapshot());
            Ok(EventOutcome { response })
        }
        HostEvent::Custom { event_type, data } => {
            let event = match data {
                Some(data) => Event::with_data(event_type, data),
                None => Event::new(event_type),
            };
            worker.dispatch_event(&event)?;
            Ok(EventOutcome::default())
        }
    }
}

fn run_extendable(
    worker: &mut ServiceWorker,
    event: &dyn WorkerEvent,
) -> RuntimeResult<EventOutcome> {
    worker.dispatch_and_wait(event)?;
    Ok(EventOutcome::default())
}

fn evaluate_to_json(worker: &mut ServiceWorker, script: &str) -> RuntimeResult<Value> {
    let value = worker.evaluate(script)?;
    let context = worker.execution_environment()?.context_mut()?;
    let json = value
        .to_json(context)
        .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
    Ok(json.unwrap_or(Value::Null))
}

fn create_bridge(worker: &mut ServiceWorker, global: &str) -> RuntimeResult<PromiseSettler> {
    let env = worker.execution_environment()?;
    let bridge = PromiseBridge::new(env)?;
    env.set_global(global, bridge.to_js_value())?;
    Ok(bridge.detach())
}

// ============================================================================
// Handle
// ============================================================================

/// `Send` handle to a worker thread.
///
/// The plain methods block the calling thread until the worker answers and
/// must not be called from inside an async runtime; use the `_async`
/// variants there.
#[derive(Clone)]
pub struct WorkerThreadHandle {
    command_tx: Sender<Command>,
}

impl WorkerThreadHandle {
    fn send<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> RuntimeResult<oneshot::Receiver<RuntimeResult<T>>> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(build(tx))
            .map_err(|_| ServiceWorkerError::ThreadUnavailable)?;
        Ok(rx)
    }

    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> RuntimeResult<T> {
        self.send(build)?
            .blocking_recv()
            .map_err(|_| ServiceWorkerError::ThreadUnavailable)?
    }

    async fn request_async<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> RuntimeResult<T> {
        self.send(build)?
            .await
            .map_err(|_| ServiceWorkerError::ThreadUnavailable)?
    }

    /// Dispatch `event` and wait until it and its extensions settled.
    pub fn dispatch(&self, event: HostEvent) -> RuntimeResult<EventOutcome> {
        self.request(|response| Command::Dispatch { event, response })
    }

    pub async fn dispatch_async(&self, event: HostEvent) -> RuntimeResult<EventOutcome> {
        self.request_async(|response| Command::Dispatch { event, response })
            .await
    }

    /// Evaluate `script` and return its completion value as JSON.
    pub fn evaluate(&self, script: impl Into<String>) -> RuntimeResult<Value> {
        let script = script.into();
        self.request(|response| Command::Evaluate { script, response })
    }

    pub async fn evaluate_async(&self, script: impl Into<String>) -> RuntimeResult<Value> {
        let script = script.into();
        self.request_async(|response| Command::Evaluate { script, response })
            .await
    }

    pub fn install_state(&self) -> RuntimeResult<InstallState> {
        self.request(|response| Command::InstallState { response })
    }

    pub fn set_install_state(&self, state: InstallState) -> RuntimeResult<()> {
        self.request(|response| Command::SetInstallState { state, response })
    }

    pub fn skip_waiting_status(&self) -> RuntimeResult<bool> {
        self.request(|response| Command::SkipWaitingStatus { response })
    }

    /// Expose a pending promise as the global `global` and return the
    /// handle that settles it from any thread.
    pub fn create_bridge(&self, global: impl Into<String>) -> RuntimeResult<PromiseSettler> {
        let global = global.into();
        self.request(|response| Command::CreateBridge { global, response })
    }

    pub async fn create_bridge_async(
        &self,
        global: impl Into<String>,
    ) -> RuntimeResult<PromiseSettler> {
        let global = global.into();
        self.request_async(|response| Command::CreateBridge { global, response })
            .await
    }

    pub fn take_exception(&self) -> RuntimeResult<Option<ServiceWorkerError>> {
        self.request(|response| Command::TakeException { response })
    }

    /// Destroy the worker. The thread keeps answering, with
    /// `WorkerDestroyed` for anything that needs the environment.
    pub fn destroy(&self) -> RuntimeResult<()> {
        self.request(|response| Command::Destroy { response })
    }
}

impl std::fmt::Debug for WorkerThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThreadHandle")
            .field("queued", &self.command_tx.len())
            .finish()
    }
}

/// Convenience for hosts keeping registrations behind an `Arc`.
pub fn registration_ref<R>(registration: &Arc<R>) -> Weak<dyn ServiceWorkerRegistration>
where
    R: ServiceWorkerRegistration + 'static,
{
    let weak: Weak<R> = Arc::downgrade(registration);
    weak
}
