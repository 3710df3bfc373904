//! Service worker instances
//!
//! A [`ServiceWorker`] is an id, a URL, a lifecycle state and, once first
//! needed, an [`ExecutionEnvironment`] running the worker's source. The
//! host dispatches events into it and reads back what the script did.
//!
//! Worker source and imported scripts come from injected functions, so the
//! worker itself never touches storage or the network.

use boa_engine::JsValue;
use serde::{Deserialize, Serialize};
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
    sync::{Arc, Weak},
};
use url::Url;

use super::events::{JsListenerRegistry, WorkerEvent, dispatch_to_listeners};
use super::global_scope;
use super::{
    ExecutionEnvironment, LogInterface, RuntimeConfig, RuntimeResult, ServiceWorkerError,
    describe_error,
};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallState {
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl InstallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallState::Installing => "installing",
            InstallState::Installed => "installed",
            InstallState::Activating => "activating",
            InstallState::Activated => "activated",
            InstallState::Redundant => "redundant",
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity handed to injected collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: String,
    pub url: Url,
}

/// What a worker's global scope can ask of the registration that owns it.
pub trait ServiceWorkerRegistration: Send + Sync {
    fn show_notification(
        &self,
        title: &str,
        options: Option<serde_json::Value>,
    ) -> RuntimeResult<()>;
}

struct Unregistered;

impl ServiceWorkerRegistration for Unregistered {
    fn show_notification(&self, _: &str, _: Option<serde_json::Value>) -> RuntimeResult<()> {
        Err(ServiceWorkerError::NotConfigured("registration"))
    }
}

/// A registration reference that never upgrades.
pub fn no_registration() -> Weak<dyn ServiceWorkerRegistration> {
    Weak::<Unregistered>::new()
}

/// Fetches the worker's own source.
pub type LoadContent = Arc<dyn Fn(&WorkerInfo) -> RuntimeResult<String> + Send + Sync>;

/// Fetches the sources of already-resolved `importScripts` URLs, in order.
/// May block.
pub type ImportScripts =
    Arc<dyn Fn(&WorkerInfo, &[Url]) -> RuntimeResult<Vec<String>> + Send + Sync>;

fn import_scripts_not_configured() -> ImportScripts {
    Arc::new(|_, _| Err(ServiceWorkerError::NotConfigured("importScripts")))
}

/// Where the worker source comes from.
#[derive(Clone)]
pub enum ContentSource {
    Inline(String),
    Loader(LoadContent),
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentSource::Inline(source) => f.debug_tuple("Inline").field(&source.len()).finish(),
            ContentSource::Loader(_) => f.write_str("Loader"),
        }
    }
}

/// Worker state the global scope reads and writes.
pub(crate) struct WorkerShared {
    pub(crate) info: WorkerInfo,
    install_state: Cell<InstallState>,
    skip_waiting: Cell<bool>,
    registration: Weak<dyn ServiceWorkerRegistration>,
    import_scripts: RefCell<ImportScripts>,
    pub(crate) log: LogInterface,
}

impl WorkerShared {
    pub(crate) fn install_state(&self) -> InstallState {
        self.install_state.get()
    }

    pub(crate) fn skip_waiting(&self) {
        self.skip_waiting.set(true);
    }

    pub(crate) fn registration(&self) -> Option<Arc<dyn ServiceWorkerRegistration>> {
        self.registration.upgrade()
    }

    /// Resolve `specifiers` against the worker URL.
    pub(crate) fn resolve_urls<S: AsRef<str>>(&self, specifiers: &[S]) -> RuntimeResult<Vec<Url>> {
        specifiers
            .iter()
            .map(|spec| {
                let spec = spec.as_ref();
                self.info
                    .url
                    .join(spec)
                    .map_err(|e| ServiceWorkerError::InvalidUrl(format!("{spec}: {e}")))
            })
            .collect()
    }

    /// Run the injected import hook.
    pub(crate) fn fetch_imports(&self, urls: &[Url]) -> RuntimeResult<Vec<String>> {
        let hook = self.import_scripts.borrow().clone();
        let sources = hook(&self.info, urls)?;
        if sources.len() != urls.len() {
            return Err(ServiceWorkerError::ScriptError(format!(
                "importScripts expected {} sources, got {}",
                urls.len(),
                sources.len()
            )));
        }
        Ok(sources)
    }
}

/// One service worker instance.
pub struct ServiceWorker {
    shared: Rc<WorkerShared>,
    content: ContentSource,
    config: RuntimeConfig,
    environment: Option<ExecutionEnvironment>,
    registry: Option<Rc<JsListenerRegistry>>,
    destroyed: bool,
}

impl ServiceWorker {
    pub fn new(
        id: impl Into<String>,
        url: Url,
        registration: Weak<dyn ServiceWorkerRegistration>,
        install_state: InstallState,
        content: ContentSource,
    ) -> Self {
        Self::with_config(
            id,
            url,
            registration,
            install_state,
            content,
            RuntimeConfig::default(),
        )
    }

    pub fn with_config(
        id: impl Into<String>,
        url: Url,
        registration: Weak<dyn ServiceWorkerRegistration>,
        install_state: InstallState,
        content: ContentSource,
        config: RuntimeConfig,
    ) -> Self {
        let shared = WorkerShared {
            info: WorkerInfo {
                id: id.into(),
                url,
            },
            install_state: Cell::new(install_state),
            skip_waiting: Cell::new(false),
            registration,
            import_scripts: RefCell::new(import_scripts_not_configured()),
            log: config.log.clone(),
        };
        Self {
            shared: Rc::new(shared),
            content,
            config,
            environment: None,
            registry: None,
            destroyed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.info.id
    }

    pub fn url(&self) -> &Url {
        &self.shared.info.url
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.shared.info
    }

    pub fn install_state(&self) -> InstallState {
        self.shared.install_state()
    }

    pub fn set_install_state(&self, state: InstallState) {
        self.shared.install_state.set(state);
    }

    /// Whether the script called `skipWaiting()`.
    pub fn skip_waiting_status(&self) -> bool {
        self.shared.skip_waiting.get()
    }

    pub fn registration(&self) -> Option<Arc<dyn ServiceWorkerRegistration>> {
        self.shared.registration()
    }

    /// Install the collaborator that fetches `importScripts` sources.
    pub fn set_import_scripts(&self, hook: ImportScripts) {
        *self.shared.import_scripts.borrow_mut() = hook;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// The worker's environment, created and loaded on first access.
    ///
    /// A failure while loading the worker source does not fail this call: it
    /// stays pending on the environment, so dispatch refuses to run until the
    /// host takes it with [`ServiceWorker::take_exception`].
    pub fn execution_environment(&mut self) -> RuntimeResult<&mut ExecutionEnvironment> {
        if self.destroyed {
            return Err(ServiceWorkerError::WorkerDestroyed);
        }
        if self.environment.is_none() {
            let env = self.load_environment()?;
            self.environment = Some(env);
        }
        self.environment
            .as_mut()
            .ok_or(ServiceWorkerError::WorkerDestroyed)
    }

    fn load_environment(&mut self) -> RuntimeResult<ExecutionEnvironment> {
        let mut env = ExecutionEnvironment::new(self.config.clone())?;
        let registry = Rc::new(JsListenerRegistry::new(self.config.log.clone()));
        {
            let context = env.context_mut()?;
            global_scope::install(context, registry.clone(), self.shared.clone())
                .map_err(|e| ServiceWorkerError::EngineError(e.to_string()))?;
        }
        self.registry = Some(registry);

        let url = self.shared.info.url.clone();
        let source = match &self.content {
            ContentSource::Inline(source) => Ok(source.clone()),
            ContentSource::Loader(load) => load(&self.shared.info),
        };
        let loaded = source.and_then(|script| env.evaluate(&script, url.as_str()));
        if let Err(err) = loaded {
            self.config
                .log
                .error(&format!("Failed to load worker {}: {}", url, err));
            env.retain_exception(err.to_string());
        }
        Ok(env)
    }

    /// Evaluate a script in the worker's environment.
    pub fn evaluate(&mut self, script: &str) -> RuntimeResult<JsValue> {
        let url = self.shared.info.url.to_string();
        self.execution_environment()?.evaluate(script, &url)
    }

    /// Run every listener for `event` on the global scope.
    ///
    /// Fails with the first error a listener threw, or with an error thrown
    /// by a job that ran before this call returned.
    pub fn dispatch_event(&mut self, event: &dyn WorkerEvent) -> RuntimeResult<()> {
        if self.destroyed {
            return Err(ServiceWorkerError::WorkerDestroyed);
        }
        self.execution_environment()?;
        let registry = self
            .registry
            .clone()
            .ok_or(ServiceWorkerError::WorkerDestroyed)?;
        let env = self
            .environment
            .as_mut()
            .ok_or(ServiceWorkerError::WorkerDestroyed)?;
        if env.has_pending_exception() {
            return Err(ServiceWorkerError::ContextInErrorState);
        }

        let context = env.context_mut()?;
        let target: JsValue = context.global_object().into();
        let result = event.to_js(context).and_then(|object| {
            dispatch_to_listeners(&registry, event.event_type(), &target, &object, context)
        });
        let result =
            result.map_err(|err| ServiceWorkerError::ScriptError(describe_error(&err, context)));

        env.pump()?;
        event.dispatch_complete();
        env.pump()?;

        if let Some(exception) = env.take_exception() {
            return Err(exception);
        }
        result
    }

    /// Dispatch `event` and drive the environment until its extensions
    /// settle. Returns the first rejection as the error.
    pub fn dispatch_and_wait(&mut self, event: &dyn WorkerEvent) -> RuntimeResult<()> {
        self.dispatch_event(event)?;
        let Some(extendable) = event.extendable() else {
            return Ok(());
        };
        let timeout = self.config.event_timeout;
        let env = self.execution_environment()?;
        let settled = env.run_until(|_| extendable.is_resolved(), timeout)?;
        if let Some(exception) = env.take_exception() {
            return Err(exception);
        }
        if !settled {
            return Err(ServiceWorkerError::ExtensionsUnsettled);
        }
        match extendable.resolved_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolve `urls` against the worker URL, fetch them through the import
    /// hook and evaluate each in order.
    pub fn import_scripts<S: AsRef<str>>(&mut self, urls: &[S]) -> RuntimeResult<()> {
        let resolved = self.shared.resolve_urls(urls)?;
        let sources = self.shared.fetch_imports(&resolved)?;
        let env = self.execution_environment()?;
        for (source, url) in sources.iter().zip(&resolved) {
            env.evaluate(source, url.as_str())?;
        }
        Ok(())
    }

    /// Run whatever jobs and host tasks are ready. Does nothing before the
    /// environment exists.
    pub fn pump(&mut self) -> RuntimeResult<()> {
        match self.environment.as_mut() {
            Some(env) => env.pump(),
            None => Ok(()),
        }
    }

    /// Surface and clear a pending script exception.
    pub fn take_exception(&mut self) -> Option<ServiceWorkerError> {
        self.environment.as_mut().and_then(|env| env.take_exception())
    }

    /// Tear the worker down. Further dispatch fails with `WorkerDestroyed`.
    pub fn destroy(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.clear();
        }
        if let Some(mut env) = self.environment.take() {
            env.destroy();
        }
        self.destroyed = true;
    }
}

impl Drop for ServiceWorker {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.shared.info.id)
            .field("url", &self.shared.info.url.as_str())
            .field("install_state", &self.install_state())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}
