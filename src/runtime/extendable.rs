//! Extendable events
//!
//! An extendable event completes when every promise handed to
//! `waitUntil` has settled. The bookkeeping lives in [`ExtensionTracker`],
//! a plain state machine; [`ExtendableEvent`] connects it to the engine.
//!
//! States: `Valid -> Resolved`, `Valid -> Invalid -> Resolved`. Extensions
//! are only accepted while `Valid`. Resolution waits for the dispatch pass
//! to finish and for every extension to settle. The first rejection in
//! append order is the event's error.

use boa_engine::{
    Context, JsArgs, JsData, JsNativeError, JsResult, JsValue, NativeFunction, js_string,
    object::JsObject, property::Attribute,
};
use boa_gc::{Finalize, Trace};
use std::{cell::RefCell, fmt, rc::Rc};

use super::ServiceWorkerError;
use super::events::{WorkerEvent, constructor_from_factory, event_object};
use super::promise::resolve_external;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendableState {
    Valid,
    Invalid,
    Resolved,
}

pub type ResolveCallback = Box<dyn FnOnce(Option<ServiceWorkerError>)>;

/// Callbacks released by a state change, to be run outside any borrow.
#[must_use]
pub struct Completion {
    callbacks: Vec<ResolveCallback>,
    error: Option<ServiceWorkerError>,
}

impl Completion {
    pub fn run(self) {
        for callback in self.callbacks {
            callback(self.error.clone());
        }
    }
}

/// Error for `waitUntil` outside the `Valid` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidState;

/// Extension bookkeeping for one event.
pub struct ExtensionTracker {
    state: ExtendableState,
    appended: usize,
    pending: usize,
    dispatched: bool,
    /// First rejection by append index.
    first_error: Option<(usize, ServiceWorkerError)>,
    callbacks: Vec<ResolveCallback>,
}

impl Default for ExtensionTracker {
    fn default() -> Self {
        Self {
            state: ExtendableState::Valid,
            appended: 0,
            pending: 0,
            dispatched: false,
            first_error: None,
            callbacks: Vec::new(),
        }
    }
}

impl ExtensionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ExtendableState {
        self.state
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn error(&self) -> Option<&ServiceWorkerError> {
        self.first_error.as_ref().map(|(_, err)| err)
    }

    /// Append an extension and return its index.
    pub fn append(&mut self) -> Result<usize, InvalidState> {
        if self.state != ExtendableState::Valid {
            return Err(InvalidState);
        }
        let index = self.appended;
        self.appended += 1;
        self.pending += 1;
        Ok(index)
    }

    /// Record that extension `index` settled.
    pub fn settle(
        &mut self,
        index: usize,
        outcome: Result<(), ServiceWorkerError>,
    ) -> Option<Completion> {
        if let Err(err) = outcome {
            let replace = match &self.first_error {
                Some((first, _)) => index < *first,
                None => true,
            };
            if replace {
                self.first_error = Some((index, err));
            }
        }
        self.pending = self.pending.saturating_sub(1);
        self.try_resolve()
    }

    /// The synchronous listener pass has finished.
    pub fn complete_dispatch(&mut self) -> Option<Completion> {
        self.dispatched = true;
        self.try_resolve()
    }

    /// Stop accepting extensions. Pending ones still settle.
    pub fn invalidate(&mut self) {
        if self.state == ExtendableState::Valid {
            self.state = ExtendableState::Invalid;
        }
    }

    /// Subscribe to completion. Returns the callback with its outcome if it
    /// can run right away.
    pub fn subscribe(
        &mut self,
        callback: ResolveCallback,
    ) -> Option<(ResolveCallback, Option<ServiceWorkerError>)> {
        if self.state == ExtendableState::Resolved || self.pending == 0 {
            return Some((callback, self.error().cloned()));
        }
        self.callbacks.push(callback);
        None
    }

    fn try_resolve(&mut self) -> Option<Completion> {
        if self.state == ExtendableState::Resolved || !self.dispatched || self.pending > 0 {
            return None;
        }
        self.state = ExtendableState::Resolved;
        Some(Completion {
            callbacks: std::mem::take(&mut self.callbacks),
            error: self.error().cloned(),
        })
    }
}

impl fmt::Debug for ExtensionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionTracker")
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("dispatched", &self.dispatched)
            .field("error", &self.error())
            .finish()
    }
}

struct ExtendableInner {
    event_type: String,
    data: Option<serde_json::Value>,
    tracker: RefCell<ExtensionTracker>,
}

/// Shared handle to an extendable event.
#[derive(Clone)]
pub struct ExtendableEvent {
    inner: Rc<ExtendableInner>,
}

impl ExtendableEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self::build(event_type.into(), None)
    }

    /// An extendable event whose script object carries `data`.
    pub fn with_data(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self::build(event_type.into(), Some(data))
    }

    fn build(event_type: String, data: Option<serde_json::Value>) -> Self {
        Self {
            inner: Rc::new(ExtendableInner {
                event_type,
                data,
                tracker: RefCell::new(ExtensionTracker::new()),
            }),
        }
    }

    pub fn state(&self) -> ExtendableState {
        self.inner.tracker.borrow().state()
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == ExtendableState::Resolved
    }

    pub fn pending_extensions(&self) -> usize {
        self.inner.tracker.borrow().pending()
    }

    /// First rejection among the extensions, if any.
    pub fn resolved_error(&self) -> Option<ServiceWorkerError> {
        self.inner.tracker.borrow().error().cloned()
    }

    /// Extend the event with `value`, normalized through `Promise.resolve`.
    /// Throws a `TypeError` in the engine unless the event is `Valid`.
    pub fn wait_until(&self, value: &JsValue, context: &mut Context) -> JsResult<()> {
        let index = self
            .inner
            .tracker
            .borrow_mut()
            .append()
            .map_err(|_| JsNativeError::typ().with_message("Invalid state for waitUntil()"))?;

        let event = self.clone();
        resolve_external(value, context, move |outcome, _context| {
            let completion = event
                .inner
                .tracker
                .borrow_mut()
                .settle(index, outcome.map(|_| ()));
            if let Some(completion) = completion {
                completion.run();
            }
        });
        Ok(())
    }

    /// Run `callback` once every extension has settled.
    pub fn resolve<F>(&self, callback: F)
    where
        F: FnOnce(Option<ServiceWorkerError>) + 'static,
    {
        let ready = self.inner.tracker.borrow_mut().subscribe(Box::new(callback));
        if let Some((callback, error)) = ready {
            callback(error);
        }
    }

    pub fn invalidate(&self) {
        self.inner.tracker.borrow_mut().invalidate();
    }

    fn complete_dispatch(&self) {
        let completion = self.inner.tracker.borrow_mut().complete_dispatch();
        if let Some(completion) = completion {
            completion.run();
        }
    }
}

impl WorkerEvent for ExtendableEvent {
    fn event_type(&self) -> &str {
        &self.inner.event_type
    }

    fn to_js(&self, context: &mut Context) -> JsResult<JsValue> {
        Ok(extendable_object(self, context)?.into())
    }

    fn dispatch_complete(&self) {
        self.complete_dispatch();
    }

    fn extendable(&self) -> Option<&ExtendableEvent> {
        Some(self)
    }
}

impl fmt::Debug for ExtendableEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendableEvent")
            .field("type", &self.inner.event_type)
            .field("tracker", &*self.inner.tracker.borrow())
            .finish()
    }
}

/// Native data behind script-visible extendable events.
#[derive(Trace, Finalize, JsData)]
pub(crate) struct ExtendableEventMarker {
    #[unsafe_ignore_trace]
    pub(crate) event: ExtendableEvent,
}

fn extendable_from_this(this: &JsValue) -> JsResult<ExtendableEvent> {
    let object = this
        .as_object()
        .ok_or_else(|| JsNativeError::typ().with_message("this is not an ExtendableEvent"))?;
    let marker = object
        .downcast_ref::<ExtendableEventMarker>()
        .ok_or_else(|| JsNativeError::typ().with_message("this is not an ExtendableEvent"))?;
    Ok(marker.event.clone())
}

fn wait_until(this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let event = extendable_from_this(this)?;
    event.wait_until(args.get_or_undefined(0), context)?;
    Ok(JsValue::undefined())
}

/// Script object for `event`: `type`, optional `data` and `waitUntil`.
pub(crate) fn extendable_object(event: &ExtendableEvent, context: &mut Context) -> JsResult<JsObject> {
    let prototype = event_object(&event.inner.event_type, context)?;
    let object = JsObject::from_proto_and_data(
        Some(prototype),
        ExtendableEventMarker {
            event: event.clone(),
        },
    );
    if let Some(data) = &event.inner.data {
        let data = JsValue::from_json(data, context)?;
        object.set(js_string!("data"), data, false, context)?;
    }
    object.set(
        js_string!("waitUntil"),
        NativeFunction::from_fn_ptr(wait_until).to_js_function(context.realm()),
        false,
        context,
    )?;
    Ok(object)
}

/// Register the `ExtendableEvent` constructor on the global object.
pub fn register_extendable_event(context: &mut Context) -> JsResult<()> {
    let factory = NativeFunction::from_fn_ptr(|_this, args, context| {
        let event_type = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
        let event = ExtendableEvent::new(event_type);
        Ok(extendable_object(&event, context)?.into())
    })
    .to_js_function(context.realm());
    let constructor = constructor_from_factory("ExtendableEvent", factory.into(), context)?;
    context.register_global_property(js_string!("ExtendableEvent"), constructor, Attribute::all())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::events::register_event_constructors;
    use crate::runtime::{ExecutionEnvironment, RuntimeConfig};
    use std::cell::Cell;
    use std::time::Duration;

    fn recorder() -> (Rc<RefCell<Vec<Option<ServiceWorkerError>>>>, ResolveCallback) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |err| sink.borrow_mut().push(err)))
    }

    #[test]
    fn test_zero_extensions_resolve_on_dispatch_complete() {
        let mut tracker = ExtensionTracker::new();
        assert_eq!(tracker.state(), ExtendableState::Valid);
        let completion = tracker.complete_dispatch().unwrap();
        assert_eq!(tracker.state(), ExtendableState::Resolved);
        assert!(completion.error.is_none());
        completion.run();
    }

    #[test]
    fn test_waits_for_every_extension() {
        let mut tracker = ExtensionTracker::new();
        let a = tracker.append().unwrap();
        let b = tracker.append().unwrap();
        assert!(tracker.complete_dispatch().is_none());

        let (seen, callback) = recorder();
        assert!(tracker.subscribe(callback).is_none());

        assert!(tracker.settle(b, Ok(())).is_none());
        assert!(seen.borrow().is_empty());
        tracker.settle(a, Ok(())).unwrap().run();
        assert_eq!(*seen.borrow(), vec![None]);
        assert_eq!(tracker.state(), ExtendableState::Resolved);
    }

    #[test]
    fn test_first_rejection_by_append_order_wins() {
        let mut tracker = ExtensionTracker::new();
        let indices: Vec<_> = (0..4).map(|_| tracker.append().unwrap()).collect();
        assert!(tracker.complete_dispatch().is_none());

        let fail = |n: usize| Err(ServiceWorkerError::ScriptError(format!("ext {n}")));
        assert!(tracker.settle(indices[3], fail(3)).is_none());
        assert!(tracker.settle(indices[0], Ok(())).is_none());
        assert!(tracker.settle(indices[1], fail(1)).is_none());
        // Still waiting on extension 2 despite the rejections.
        assert_eq!(tracker.state(), ExtendableState::Valid);

        let completion = tracker.settle(indices[2], Ok(())).unwrap();
        assert_eq!(
            completion.error,
            Some(ServiceWorkerError::ScriptError("ext 1".into()))
        );
    }

    #[test]
    fn test_extension_added_after_subscription_extends_set() {
        let mut tracker = ExtensionTracker::new();
        let first = tracker.append().unwrap();
        let (seen, callback) = recorder();
        assert!(tracker.subscribe(callback).is_none());
        let second = tracker.append().unwrap();
        assert!(tracker.complete_dispatch().is_none());

        assert!(tracker.settle(first, Ok(())).is_none());
        assert!(seen.borrow().is_empty());
        tracker.settle(second, Ok(())).unwrap().run();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_subscribe_with_nothing_pending_fires_immediately() {
        let mut tracker = ExtensionTracker::new();
        let (callback, error) = tracker.subscribe(Box::new(|_| {})).unwrap();
        assert!(error.is_none());
        callback(error);
    }

    #[test]
    fn test_subscribe_after_resolution_gets_stored_error() {
        let mut tracker = ExtensionTracker::new();
        let index = tracker.append().unwrap();
        assert!(tracker.complete_dispatch().is_none());
        tracker
            .settle(index, Err(ServiceWorkerError::ScriptError("nope".into())))
            .unwrap()
            .run();

        let (_, error) = tracker.subscribe(Box::new(|_| {})).unwrap();
        assert_eq!(error, Some(ServiceWorkerError::ScriptError("nope".into())));
    }

    #[test]
    fn test_invalid_rejects_new_extensions() {
        let mut tracker = ExtensionTracker::new();
        let index = tracker.append().unwrap();
        tracker.invalidate();
        assert_eq!(tracker.append(), Err(InvalidState));
        assert_eq!(tracker.pending(), 1);

        assert!(tracker.complete_dispatch().is_none());
        assert_eq!(tracker.state(), ExtendableState::Invalid);
        assert!(tracker.settle(index, Ok(())).is_some());
        assert_eq!(tracker.state(), ExtendableState::Resolved);
    }

    fn environment() -> ExecutionEnvironment {
        ExecutionEnvironment::new(RuntimeConfig::default()).unwrap()
    }

    fn expose(env: &mut ExecutionEnvironment, event: &ExtendableEvent) {
        let context = env.context_mut().unwrap();
        let object = event.to_js(context).unwrap();
        env.set_global("evt", object).unwrap();
    }

    #[test]
    fn test_wait_until_from_script() {
        let mut env = environment();
        let event = ExtendableEvent::new("install");
        expose(&mut env, &event);

        env.evaluate(
            r#"
            var release;
            evt.waitUntil(new Promise(function(resolve) { release = resolve; }));
            evt.waitUntil(42);
            "#,
            "test.js",
        )
        .unwrap();
        event.dispatch_complete();

        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        event.resolve(move |err| {
            assert!(err.is_none());
            flag.set(true);
        });

        assert_eq!(event.pending_extensions(), 1);
        assert!(!fired.get());

        env.evaluate("release('done')", "test.js").unwrap();
        assert!(fired.get());
        assert!(event.is_resolved());
    }

    #[test]
    fn test_rejection_from_script_becomes_error() {
        let mut env = environment();
        let event = ExtendableEvent::new("install");
        expose(&mut env, &event);

        env.evaluate(
            r#"
            evt.waitUntil(new Promise(function(_, reject) {
                setTimeout(function() { reject(new Error('late failure')); }, 10);
            }));
            evt.waitUntil(Promise.reject(new Error('early failure')));
            "#,
            "test.js",
        )
        .unwrap();
        event.dispatch_complete();

        let done = env
            .run_until(|_| event.is_resolved(), Duration::from_secs(5))
            .unwrap();
        assert!(done);
        assert_eq!(
            event.resolved_error(),
            Some(ServiceWorkerError::ScriptError("late failure".into()))
        );
    }

    #[test]
    fn test_wait_until_on_invalid_event_throws_in_script() {
        let mut env = environment();
        let event = ExtendableEvent::new("install");
        event.invalidate();
        expose(&mut env, &event);

        let value = env
            .evaluate(
                "var msg; try { evt.waitUntil(1); } catch (e) { msg = e.name + ': ' + e.message; } msg",
                "test.js",
            )
            .unwrap();
        let context = env.context_mut().unwrap();
        assert_eq!(
            value.to_string(context).unwrap().to_std_string_escaped(),
            "TypeError: Invalid state for waitUntil()"
        );
        assert_eq!(event.state(), ExtendableState::Invalid);
        assert_eq!(event.pending_extensions(), 0);
    }

    #[test]
    fn test_script_constructed_extendable_event() {
        let mut env = environment();
        {
            let context = env.context_mut().unwrap();
            register_event_constructors(context, Default::default()).unwrap();
            register_extendable_event(context).unwrap();
        }

        env.evaluate(
                r#"
                var target = new EventTarget();
                var log = [];
                target.addEventListener('custom', function(e) {
                    e.waitUntil(Promise.resolve().then(function() { log.push('extended'); }));
                });
                var e = new ExtendableEvent('custom');
                target.dispatchEvent(e);
                log.push(e.type);
                "#,
                "test.js",
            )
            .unwrap();
        let log = env.evaluate("log.join(',')", "test.js").unwrap();
        let context = env.context_mut().unwrap();
        assert_eq!(
            log.to_string(context).unwrap().to_std_string_escaped(),
            "custom,extended"
        );
    }
}
