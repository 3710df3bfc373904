//! Event listeners and the `EventTarget` binding
//!
//! [`EventListenerRegistry`] is the name-keyed listener store behind every
//! dispatchable object in a worker: the global scope and any `EventTarget`
//! created by script. Dispatch takes a snapshot of the listeners for the
//! event's name first, so listeners may add or remove listeners while a
//! pass is running:
//! - a listener added during a pass runs from the next dispatch on
//! - a listener removed during a pass is skipped if not yet reached

use boa_engine::{
    Context, JsArgs, JsData, JsNativeError, JsResult, JsValue, NativeFunction, Source, js_string,
    object::{FunctionObjectBuilder, JsObject, ObjectInitializer},
    property::{Attribute, PropertyDescriptor},
};
use boa_gc::{Finalize, Trace};
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use super::LogInterface;
use super::extendable::{ExtendableEvent, ExtendableEventMarker};

/// One registered listener.
#[derive(Debug)]
pub struct EventListener<H> {
    event_name: String,
    handler: H,
    removed: Cell<bool>,
}

impl<H> EventListener<H> {
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

/// Ordered, identity-deduplicated listener storage.
pub struct EventListenerRegistry<H> {
    listeners: RefCell<Vec<Rc<EventListener<H>>>>,
    log: LogInterface,
}

impl<H: PartialEq + Clone> EventListenerRegistry<H> {
    pub fn new(log: LogInterface) -> Self {
        Self {
            listeners: RefCell::new(Vec::new()),
            log,
        }
    }

    /// Register `handler` for `name`. Returns false if the same pair is
    /// already registered.
    pub fn add_listener(&self, name: &str, handler: H) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        if listeners
            .iter()
            .any(|l| l.event_name == name && l.handler == handler)
        {
            return false;
        }
        listeners.push(Rc::new(EventListener {
            event_name: name.to_string(),
            handler,
            removed: Cell::new(false),
        }));
        true
    }

    /// Remove the matching listener. A miss is logged, never an error.
    pub fn remove_listener(&self, name: &str, handler: &H) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let position = listeners
            .iter()
            .position(|l| l.event_name == name && &l.handler == handler);
        match position {
            Some(index) => {
                let listener = listeners.remove(index);
                listener.removed.set(true);
                true
            }
            None => {
                self.log.debug(&format!(
                    "Tried to remove event listener for '{}' when it was not attached",
                    name
                ));
                false
            }
        }
    }

    /// Listeners registered for `name`, in registration order.
    pub fn snapshot(&self, name: &str) -> Vec<Rc<EventListener<H>>> {
        self.listeners
            .borrow()
            .iter()
            .filter(|l| l.event_name == name)
            .cloned()
            .collect()
    }

    /// Invoke `call` for every listener of `name`. Every listener runs even
    /// if an earlier one fails; the first failure is returned.
    pub fn dispatch<E, F>(&self, name: &str, mut call: F) -> Result<(), E>
    where
        F: FnMut(&H) -> Result<(), E>,
    {
        let mut first_error = None;
        for listener in self.snapshot(name) {
            if listener.removed.get() {
                continue;
            }
            if let Err(err) = call(&listener.handler) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|l| l.event_name == name)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.borrow().is_empty()
    }

    /// Drop every listener.
    pub fn clear(&self) {
        for listener in self.listeners.borrow_mut().drain(..) {
            listener.removed.set(true);
        }
    }
}

impl<H> fmt::Debug for EventListenerRegistry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListenerRegistry")
            .field("listeners", &self.listeners.borrow().len())
            .finish()
    }
}

/// A script listener: a function, or an object with `handleEvent`.
#[derive(Debug, Clone)]
pub struct JsListener(JsObject);

impl PartialEq for JsListener {
    fn eq(&self, other: &Self) -> bool {
        JsObject::equals(&self.0, &other.0)
    }
}

impl JsListener {
    pub fn new(object: JsObject) -> Self {
        Self(object)
    }

    fn invoke(&self, target: &JsValue, event: &JsValue, context: &mut Context) -> JsResult<()> {
        if self.0.is_callable() {
            self.0.call(target, std::slice::from_ref(event), context)?;
            return Ok(());
        }
        let handle_event = self.0.get(js_string!("handleEvent"), context)?;
        if let Some(method) = handle_event.as_callable() {
            method.call(&self.0.clone().into(), std::slice::from_ref(event), context)?;
        }
        Ok(())
    }
}

pub type JsListenerRegistry = EventListenerRegistry<JsListener>;

/// Run every script listener of `event_type` with `target` as `this`.
pub fn dispatch_to_listeners(
    registry: &JsListenerRegistry,
    event_type: &str,
    target: &JsValue,
    event: &JsValue,
    context: &mut Context,
) -> JsResult<()> {
    registry.dispatch(event_type, |listener| listener.invoke(target, event, context))
}

/// Something the host can dispatch into a worker.
pub trait WorkerEvent {
    fn event_type(&self) -> &str;

    /// Build the object handed to listeners.
    fn to_js(&self, context: &mut Context) -> JsResult<JsValue>;

    /// Called once the synchronous listener pass has finished.
    fn dispatch_complete(&self) {}

    /// The extendable part of the event, if it has one.
    fn extendable(&self) -> Option<&ExtendableEvent> {
        None
    }
}

/// A plain event with an optional JSON payload exposed as `event.data`.
#[derive(Debug, Clone)]
pub struct Event {
    event_type: String,
    data: Option<serde_json::Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: None,
        }
    }

    pub fn with_data(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data: Some(data),
        }
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }
}

impl WorkerEvent for Event {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn to_js(&self, context: &mut Context) -> JsResult<JsValue> {
        let object = event_object(&self.event_type, context)?;
        if let Some(data) = &self.data {
            let data = JsValue::from_json(data, context)?;
            object.set(js_string!("data"), data, false, context)?;
        }
        Ok(object.into())
    }
}

/// An ordinary object with a read-only `type`.
pub(crate) fn event_object(event_type: &str, context: &mut Context) -> JsResult<JsObject> {
    Ok(ObjectInitializer::new(context)
        .property(
            js_string!("type"),
            js_string!(event_type),
            Attribute::ENUMERABLE | Attribute::CONFIGURABLE,
        )
        .build())
}

#[derive(Trace, Finalize)]
struct RegistryCaptures {
    #[unsafe_ignore_trace]
    registry: Rc<JsListenerRegistry>,
}

#[derive(Trace, Finalize)]
struct LogCaptures {
    #[unsafe_ignore_trace]
    log: LogInterface,
}

/// Marker data for objects created by the `EventTarget` constructor.
#[derive(Trace, Finalize, JsData)]
struct EventTargetData {
    #[unsafe_ignore_trace]
    registry: Rc<JsListenerRegistry>,
}

fn listener_arg(value: &JsValue) -> JsResult<Option<JsListener>> {
    if value.is_null_or_undefined() {
        return Ok(None);
    }
    value
        .as_object()
        .map(|object| Some(JsListener::new(object.clone())))
        .ok_or_else(|| {
            JsNativeError::typ()
                .with_message("The listener must be an object or a function")
                .into()
        })
}

fn add_event_listener(
    _this: &JsValue,
    args: &[JsValue],
    captures: &RegistryCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let name = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    if let Some(listener) = listener_arg(args.get_or_undefined(1))? {
        captures.registry.add_listener(&name, listener);
    }
    Ok(JsValue::undefined())
}

fn remove_event_listener(
    _this: &JsValue,
    args: &[JsValue],
    captures: &RegistryCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let name = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    if let Some(listener) = listener_arg(args.get_or_undefined(1))? {
        captures.registry.remove_listener(&name, &listener);
    }
    Ok(JsValue::undefined())
}

fn dispatch_event(
    this: &JsValue,
    args: &[JsValue],
    captures: &RegistryCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let event = args.get_or_undefined(0);
    let object = event
        .as_object()
        .ok_or_else(|| JsNativeError::typ().with_message("dispatchEvent requires an event object"))?
        .clone();
    let event_type = object
        .get(js_string!("type"), context)?
        .to_string(context)?
        .to_std_string_escaped();

    let result = dispatch_to_listeners(&captures.registry, &event_type, this, event, context);

    let extendable = object
        .downcast_ref::<ExtendableEventMarker>()
        .map(|marker| marker.event.clone());
    if let Some(extendable) = extendable {
        extendable.dispatch_complete();
    }

    result?;
    Ok(JsValue::from(true))
}

/// Define `addEventListener`, `removeEventListener` and `dispatchEvent` on
/// `object`, all backed by `registry`.
pub fn install_event_target(
    object: &JsObject,
    registry: Rc<JsListenerRegistry>,
    context: &mut Context,
) -> JsResult<()> {
    let methods: [(_, _, fn(&JsValue, &[JsValue], &RegistryCaptures, &mut Context) -> JsResult<JsValue>); 3] = [
        ("addEventListener", 2, add_event_listener),
        ("removeEventListener", 2, remove_event_listener),
        ("dispatchEvent", 1, dispatch_event),
    ];
    for (name, length, method) in methods {
        let function = FunctionObjectBuilder::new(
            context.realm(),
            NativeFunction::from_copy_closure_with_captures(
                method,
                RegistryCaptures {
                    registry: registry.clone(),
                },
            ),
        )
        .name(js_string!(name))
        .length(length)
        .build();
        object.define_property_or_throw(
            js_string!(name),
            PropertyDescriptor::builder()
                .value(function)
                .writable(true)
                .enumerable(false)
                .configurable(true),
            context,
        )?;
    }
    Ok(())
}

/// Wrap a native factory in a plain JS function so `new Name(...)` returns
/// the native object.
pub(crate) fn constructor_from_factory(
    name: &str,
    factory: JsObject,
    context: &mut Context,
) -> JsResult<JsValue> {
    let wrapper = format!(
        r#"(function(create) {{
            function {name}() {{
                return create.apply(undefined, arguments);
            }}
            return {name};
        }})"#
    );
    let make = context.eval(Source::from_bytes(wrapper.as_bytes()))?;
    let make = make
        .as_callable()
        .ok_or_else(|| JsNativeError::typ().with_message("constructor wrapper is not callable"))?;
    make.call(&JsValue::undefined(), &[factory.into()], context)
}

/// Register the `Event` and `EventTarget` constructors on the global object.
pub fn register_event_constructors(context: &mut Context, log: LogInterface) -> JsResult<()> {
    let event_factory = NativeFunction::from_fn_ptr(|_this, args, context| {
        let event_type = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
        Ok(event_object(&event_type, context)?.into())
    })
    .to_js_function(context.realm());
    let event_constructor = constructor_from_factory("Event", event_factory.into(), context)?;
    context.register_global_property(js_string!("Event"), event_constructor, Attribute::all())?;

    let target_factory = FunctionObjectBuilder::new(
        context.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, _args, captures: &LogCaptures, context| {
                let registry = Rc::new(JsListenerRegistry::new(captures.log.clone()));
                let prototype = context.intrinsics().constructors().object().prototype();
                let object = JsObject::from_proto_and_data(
                    Some(prototype),
                    EventTargetData {
                        registry: registry.clone(),
                    },
                );
                install_event_target(&object, registry, context)?;
                Ok(object.into())
            },
            LogCaptures { log },
        ),
    )
    .build();
    let target_constructor = constructor_from_factory("EventTarget", target_factory.into(), context)?;
    context.register_global_property(
        js_string!("EventTarget"),
        target_constructor,
        Attribute::all(),
    )?;

    Ok(())
}
