//! Service Worker runtime powered by the Boa engine
//!
//! This module owns the script side of a worker:
//! - [`ExecutionEnvironment`]: one Boa context, its job queue and the
//!   exception hook that turns asynchronous throws into failures
//! - [`worker::ServiceWorker`]: identity, lifecycle state and the lazily
//!   built environment
//! - Events: listener registry, extendable events and fetch events
//! - [`promise::PromiseBridge`]: host-settled JS promises
//! - [`stream::ReadableStream`]: response body buffer
//! - [`thread::WorkerThread`]: a worker on its own thread, reachable from
//!   any host thread
//!
//! Console output from worker scripts goes to the [`LogInterface`] passed in
//! [`RuntimeConfig`].

use boa_engine::{
    Context, JsError, JsResult, JsValue, Source,
    context::ContextBuilder,
    js_string,
};
use boa_gc::{Finalize, Trace};
use boa_runtime::{
    ConsoleState, Logger,
    extensions::{ConsoleExtension, MicrotaskExtension, TimeoutExtension},
    register_extensions,
};
use colored::Colorize;
use std::{
    cell::RefCell,
    fmt,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;

mod event_loop;
pub mod events;
pub mod extendable;
pub mod fetch;
mod global_scope;
pub mod inbox;
pub mod promise;
pub mod stream;
pub mod thread;
pub mod worker;

use event_loop::{ExceptionHook, WorkerEventLoop};
use inbox::{EnvironmentHandle, HostInbox, HostTask};
use promise::{BridgeArena, settle_from_host};

/// Errors that can occur while driving a service worker
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Cannot run script while context has an exception")]
    ContextInErrorState,

    #[error("{0}")]
    ScriptError(String),

    #[error("Service worker has been destroyed")]
    WorkerDestroyed,

    #[error("Cannot enqueue data after stream is closed")]
    StreamClosed,

    #[error("{0} has not been configured")]
    NotConfigured(&'static str),

    #[error("Event extensions did not settle")]
    ExtensionsUnsettled,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Engine error: {0}")]
    EngineError(String),

    #[error("Worker thread is no longer running")]
    ThreadUnavailable,
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, ServiceWorkerError>;

/// A single log sink.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Injected log sinks. Each level is optional; an unset level is a no-op.
#[derive(Clone, Default)]
pub struct LogInterface {
    pub debug: Option<LogSink>,
    pub info: Option<LogSink>,
    pub warn: Option<LogSink>,
    pub error: Option<LogSink>,
}

impl LogInterface {
    /// Discard everything.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Forward every level to the matching `tracing` macro.
    pub fn tracing() -> Self {
        Self {
            debug: Some(Arc::new(|msg| tracing::debug!(target: "swrun::worker", "{}", msg))),
            info: Some(Arc::new(|msg| tracing::info!(target: "swrun::worker", "{}", msg))),
            warn: Some(Arc::new(|msg| tracing::warn!(target: "swrun::worker", "{}", msg))),
            error: Some(Arc::new(|msg| tracing::error!(target: "swrun::worker", "{}", msg))),
        }
    }

    /// Print to stdout/stderr with colored level prefixes.
    pub fn terminal() -> Self {
        Self {
            debug: Some(Arc::new(|msg| println!("{} {}", "[DEBUG]".dimmed(), msg))),
            info: Some(Arc::new(|msg| println!("{} {}", "[INFO]".cyan(), msg))),
            warn: Some(Arc::new(|msg| eprintln!("{} {}", "[WARN]".yellow(), msg))),
            error: Some(Arc::new(|msg| eprintln!("{} {}", "[ERROR]".red(), msg))),
        }
    }

    pub fn debug(&self, msg: &str) {
        if let Some(sink) = &self.debug {
            sink(msg);
        }
    }

    pub fn info(&self, msg: &str) {
        if let Some(sink) = &self.info {
            sink(msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        if let Some(sink) = &self.warn {
            sink(msg);
        }
    }

    pub fn error(&self, msg: &str) {
        if let Some(sink) = &self.error {
            sink(msg);
        }
    }
}

impl fmt::Debug for LogInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogInterface")
            .field("debug", &self.debug.is_some())
            .field("info", &self.info.is_some())
            .field("warn", &self.warn.is_some())
            .field("error", &self.error.is_some())
            .finish()
    }
}

/// Console logger that forwards `console.*` calls to a [`LogInterface`]
#[derive(Debug, Clone, Trace, Finalize)]
pub struct WorkerLogger {
    #[unsafe_ignore_trace]
    sinks: LogInterface,
}

impl WorkerLogger {
    pub fn new(sinks: LogInterface) -> Self {
        Self { sinks }
    }
}

impl Logger for WorkerLogger {
    fn log(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.sinks.info(&msg);
        Ok(())
    }

    fn info(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.sinks.info(&msg);
        Ok(())
    }

    fn warn(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.sinks.warn(&msg);
        Ok(())
    }

    fn error(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.sinks.error(&msg);
        Ok(())
    }
}

/// Configuration for a worker's execution environment
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Where console output and runtime diagnostics go
    pub log: LogInterface,
    /// How long `dispatch_and_wait` waits for extensions to settle
    pub event_timeout: Duration,
    /// Engine recursion limit
    pub recursion_limit: usize,
    /// Engine stack size limit
    pub stack_size_limit: usize,
    /// How often an idle worker thread drives timers and host tasks
    pub idle_tick: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log: LogInterface::default(),
            event_timeout: Duration::from_secs(30),
            recursion_limit: 16384,
            stack_size_limit: 1024 * 1024,
            idle_tick: Duration::from_millis(5),
        }
    }
}

impl RuntimeConfig {
    /// Create a config with the given log sinks
    pub fn with_log(log: LogInterface) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }
}

/// Best-effort description of a thrown or rejected JS value.
pub(crate) fn describe_value(value: &JsValue, context: &mut Context) -> String {
    if let Some(object) = value.as_object() {
        if let Ok(message) = object.get(js_string!("message"), context) {
            if let Some(text) = message.as_string() {
                return text.to_std_string_escaped();
            }
        }
    }
    value
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| "Unknown script error".to_string())
}

pub(crate) fn describe_error(err: &JsError, context: &mut Context) -> String {
    let value = err.to_opaque(context);
    describe_value(&value, context)
}

/// One isolated script execution context
pub struct ExecutionEnvironment {
    context: Option<Context>,
    event_loop: Rc<WorkerEventLoop>,
    hook: ExceptionHook,
    bridges: Rc<RefCell<BridgeArena>>,
    inbox: Arc<HostInbox>,
    config: RuntimeConfig,
}

impl ExecutionEnvironment {
    /// Create a new environment with its own context and job queue
    pub fn new(config: RuntimeConfig) -> RuntimeResult<Self> {
        let hook = ExceptionHook::new();
        let event_loop = Rc::new(WorkerEventLoop::new(hook.clone()));

        let mut context = ContextBuilder::default()
            .job_executor(event_loop.clone())
            .build()
            .map_err(|e| ServiceWorkerError::EngineError(e.to_string()))?;

        context
            .runtime_limits_mut()
            .set_recursion_limit(config.recursion_limit);
        context
            .runtime_limits_mut()
            .set_stack_size_limit(config.stack_size_limit);

        // console.*, setTimeout/setInterval and queueMicrotask
        register_extensions(
            (
                ConsoleExtension(WorkerLogger::new(config.log.clone())),
                TimeoutExtension,
                MicrotaskExtension,
            ),
            None,
            &mut context,
        )
        .map_err(|e| ServiceWorkerError::EngineError(e.to_string()))?;

        Ok(Self {
            context: Some(context),
            event_loop,
            hook,
            bridges: Rc::new(RefCell::new(BridgeArena::new())),
            inbox: HostInbox::new(),
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn log(&self) -> &LogInterface {
        &self.config.log
    }

    /// `Send` handle for marshalling work onto this environment's thread
    pub fn handle(&self) -> EnvironmentHandle {
        EnvironmentHandle::new(self.inbox.clone())
    }

    pub fn is_destroyed(&self) -> bool {
        self.context.is_none()
    }

    pub fn context_mut(&mut self) -> RuntimeResult<&mut Context> {
        self.context
            .as_mut()
            .ok_or(ServiceWorkerError::WorkerDestroyed)
    }

    pub fn bridges(&self) -> &Rc<RefCell<BridgeArena>> {
        &self.bridges
    }

    pub(crate) fn bridge_parts(
        &mut self,
    ) -> RuntimeResult<(&mut Context, &Rc<RefCell<BridgeArena>>, &Arc<HostInbox>)> {
        let context = self
            .context
            .as_mut()
            .ok_or(ServiceWorkerError::WorkerDestroyed)?;
        Ok((context, &self.bridges, &self.inbox))
    }

    /// Define a property on the global object
    pub fn set_global(&mut self, name: &str, value: impl Into<JsValue>) -> RuntimeResult<()> {
        let context = self.context_mut()?;
        context
            .global_object()
            .set(js_string!(name), value.into(), false, context)
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
        Ok(())
    }

    pub fn has_pending_exception(&self) -> bool {
        self.hook.is_pending()
    }

    /// Surface the pending exception, clearing it.
    pub fn take_exception(&mut self) -> Option<ServiceWorkerError> {
        self.hook.take().map(ServiceWorkerError::ScriptError)
    }

    /// Leave `message` pending so later evaluations refuse to run.
    pub(crate) fn retain_exception(&self, message: String) {
        self.hook.record(message);
    }

    /// Evaluate `script`, reporting asynchronous throws that happened while
    /// it and its ready jobs ran.
    pub fn evaluate(&mut self, script: &str, source_url: &str) -> RuntimeResult<JsValue> {
        if self.hook.is_pending() {
            return Err(ServiceWorkerError::ContextInErrorState);
        }
        let context = self
            .context
            .as_mut()
            .ok_or(ServiceWorkerError::WorkerDestroyed)?;

        let result = context.eval(Source::from_bytes(script.as_bytes()));
        let result = result.map_err(|err| describe_error(&err, context));

        self.pump()?;

        if let Some(message) = self.hook.take() {
            self.config
                .log
                .debug(&format!("Exception while evaluating {}: {}", source_url, message));
            return Err(ServiceWorkerError::ScriptError(message));
        }
        result.map_err(|message| {
            self.config
                .log
                .debug(&format!("Error evaluating {}: {}", source_url, message));
            ServiceWorkerError::ScriptError(message)
        })
    }

    /// Run host tasks and every ready job until nothing is immediately
    /// runnable. Errors go to the exception hook.
    pub fn pump(&mut self) -> RuntimeResult<()> {
        let context = self
            .context
            .as_mut()
            .ok_or(ServiceWorkerError::WorkerDestroyed)?;

        loop {
            for task in self.inbox.drain() {
                let result = match task {
                    HostTask::Settle { bridge, outcome } => {
                        settle_from_host(&self.bridges, bridge, outcome, context)
                    }
                    HostTask::Call(task) => task(context),
                };
                if let Err(err) = result {
                    let message = describe_error(&err, context);
                    self.hook.record(message);
                }
            }

            self.event_loop.run_ready(context);

            if !self.event_loop.has_ready_work() && self.inbox.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Whether anything queued could still change script state
    pub fn has_pending_work(&self) -> bool {
        self.event_loop.has_pending_work()
            || self.bridges.borrow().outstanding() > 0
            || !self.inbox.is_empty()
    }

    /// Drive the environment until `done` holds. Returns `Ok(false)` if the
    /// timeout passes, an exception is raised, or nothing queued could make
    /// progress.
    pub fn run_until<F>(&mut self, done: F, timeout: Duration) -> RuntimeResult<bool>
    where
        F: Fn(&Self) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump()?;
            if done(self) {
                return Ok(true);
            }
            if self.hook.is_pending() || !self.has_pending_work() {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let mut wait = deadline - now;
            if let Some(next_timer) = self.event_loop.time_until_next_timer() {
                wait = wait.min(next_timer);
            }
            if !wait.is_zero() {
                self.inbox.wait(wait);
            }
        }
    }

    /// Tear down the context. Outstanding bridges and settlers become inert.
    pub fn destroy(&mut self) {
        if self.context.is_none() {
            return;
        }
        self.hook.detach();
        self.inbox.close();
        self.bridges.borrow_mut().clear();
        self.event_loop.clear();
        self.context = None;
    }
}

impl Drop for ExecutionEnvironment {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn environment() -> ExecutionEnvironment {
        ExecutionEnvironment::new(RuntimeConfig::default()).unwrap()
    }

    fn to_text(env: &mut ExecutionEnvironment, value: JsValue) -> String {
        let context = env.context_mut().unwrap();
        value.to_string(context).unwrap().to_std_string_escaped()
    }

    #[test]
    fn test_environment_creation() {
        let env = ExecutionEnvironment::new(RuntimeConfig::default());
        assert!(env.is_ok());
    }

    #[test]
    fn test_basic_javascript() {
        let mut env = environment();
        let value = env.evaluate("1 + 1", "test.js").unwrap();
        assert_eq!(to_text(&mut env, value), "2");
    }

    #[test]
    fn test_synchronous_throw_is_script_error() {
        let mut env = environment();
        let err = env
            .evaluate("throw new Error('sync failure')", "test.js")
            .unwrap_err();
        assert_eq!(err, ServiceWorkerError::ScriptError("sync failure".into()));
        // Synchronous throws do not poison the context.
        assert!(env.evaluate("1", "test.js").is_ok());
    }

    #[test]
    fn test_async_throw_surfaces_on_evaluate() {
        let mut env = environment();
        let err = env
            .evaluate(
                "queueMicrotask(function() { throw new Error('async failure'); }); 1",
                "test.js",
            )
            .unwrap_err();
        assert_eq!(err, ServiceWorkerError::ScriptError("async failure".into()));
        assert!(!env.has_pending_exception());
    }

    #[test]
    fn test_pending_exception_blocks_evaluation() {
        let mut env = environment();
        env.evaluate(
            "setTimeout(function() { throw new Error('timer failure'); }, 10);",
            "test.js",
        )
        .unwrap();

        let fired = env
            .run_until(|env| env.has_pending_exception(), Duration::from_secs(5))
            .unwrap();
        assert!(fired);

        assert_eq!(
            env.evaluate("1", "test.js").unwrap_err(),
            ServiceWorkerError::ContextInErrorState
        );
        assert_eq!(
            env.take_exception(),
            Some(ServiceWorkerError::ScriptError("timer failure".into()))
        );
        assert!(env.evaluate("1", "test.js").is_ok());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut env = environment();
        env.destroy();
        env.destroy();
        assert!(env.is_destroyed());
        assert_eq!(
            env.evaluate("1", "test.js").unwrap_err(),
            ServiceWorkerError::WorkerDestroyed
        );
        assert!(!env.handle().is_alive());
    }

    #[test]
    fn test_console_goes_to_log_interface() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let info_lines = lines.clone();
        let warn_lines = lines.clone();
        let log = LogInterface {
            info: Some(Arc::new(move |msg| {
                info_lines.lock().unwrap().push(format!("info:{msg}"))
            })),
            warn: Some(Arc::new(move |msg| {
                warn_lines.lock().unwrap().push(format!("warn:{msg}"))
            })),
            ..Default::default()
        };
        let mut env = ExecutionEnvironment::new(RuntimeConfig::with_log(log)).unwrap();
        env.evaluate(
            "console.log('hello'); console.warn('careful'); console.error('dropped');",
            "test.js",
        )
        .unwrap();

        assert_eq!(
            *lines.lock().unwrap(),
            vec!["info:hello".to_string(), "warn:careful".to_string()]
        );
    }

    #[test]
    fn test_handle_runs_closure_on_environment() {
        let mut env = environment();
        let handle = env.handle();
        std::thread::spawn(move || {
            handle.run_on_environment(|context| {
                context.global_object().set(
                    js_string!("fromHost"),
                    JsValue::from(7),
                    false,
                    context,
                )?;
                Ok(())
            })
        })
        .join()
        .unwrap();

        env.pump().unwrap();
        let value = env.evaluate("fromHost", "test.js").unwrap();
        assert_eq!(to_text(&mut env, value), "7");
    }

    #[test]
    fn test_run_until_stops_when_nothing_pending() {
        let mut env = environment();
        let start = Instant::now();
        let done = env.run_until(|_| false, Duration::from_secs(5)).unwrap();
        assert!(!done);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
