//! Worker global scope
//!
//! Installs the worker-facing globals on a fresh context:
//! - `self`, pointing at the global object
//! - `addEventListener`, `removeEventListener`, `dispatchEvent`
//! - `skipWaiting()`, `importScripts(...)`
//! - `registration.showNotification(title, options)`
//! - `serviceWorker.state` and `serviceWorker.scriptURL`
//! - the `Event`, `EventTarget` and `ExtendableEvent` constructors

use boa_engine::{
    Context, JsArgs, JsError, JsNativeError, JsResult, JsValue, NativeFunction, Source, js_string,
    object::{FunctionObjectBuilder, ObjectInitializer, builtins::JsPromise},
    property::Attribute,
};
use boa_gc::{Finalize, Trace};
use std::rc::Rc;

use super::events::{JsListenerRegistry, install_event_target, register_event_constructors};
use super::extendable::register_extendable_event;
use super::worker::WorkerShared;

#[derive(Trace, Finalize)]
struct ScopeCaptures {
    #[unsafe_ignore_trace]
    shared: Rc<WorkerShared>,
}

fn native_error(message: impl Into<String>) -> JsError {
    JsNativeError::error().with_message(message.into()).into()
}

/// Flatten `importScripts` arguments: each may be a string or an array of
/// strings.
fn import_specifiers(args: &[JsValue], context: &mut Context) -> JsResult<Vec<String>> {
    let mut specifiers = Vec::new();
    for arg in args {
        let array = match arg.as_object() {
            Some(object) if object.is_array() => Some(object.clone()),
            _ => None,
        };
        match array {
            Some(array) => {
                let length =
                    array.get(js_string!("length"), context)?.to_number(context)? as u32;
                for i in 0..length {
                    let item = array.get(i, context)?;
                    specifiers.push(item.to_string(context)?.to_std_string_escaped());
                }
            }
            None => specifiers.push(arg.to_string(context)?.to_std_string_escaped()),
        }
    }
    Ok(specifiers)
}

fn import_scripts(
    _this: &JsValue,
    args: &[JsValue],
    captures: &ScopeCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let shared = &captures.shared;
    let specifiers = import_specifiers(args, context)?;
    if specifiers.is_empty() {
        return Ok(JsValue::undefined());
    }

    let urls = shared
        .resolve_urls(&specifiers)
        .map_err(|e| JsError::from(JsNativeError::typ().with_message(e.to_string())))?;
    // The hook may block on I/O; only this worker's thread waits.
    let sources = shared
        .fetch_imports(&urls)
        .map_err(|e| native_error(e.to_string()))?;

    for (source, url) in sources.iter().zip(&urls) {
        if let Err(err) = context.eval(Source::from_bytes(source.as_bytes())) {
            shared
                .log
                .debug(&format!("Error in imported script {}: {}", url, err));
            return Err(err);
        }
    }
    Ok(JsValue::undefined())
}

fn skip_waiting(
    _this: &JsValue,
    _args: &[JsValue],
    captures: &ScopeCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    captures.shared.skip_waiting();
    Ok(JsPromise::resolve(JsValue::undefined(), context).into())
}

fn show_notification(
    _this: &JsValue,
    args: &[JsValue],
    captures: &ScopeCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let registration = captures
        .shared
        .registration()
        .ok_or_else(|| native_error("Service worker registration is no longer available"))?;

    let title = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    let options = args.get_or_undefined(1);
    let options = if options.is_null_or_undefined() {
        None
    } else {
        options.to_json(context)?
    };

    registration
        .show_notification(&title, options)
        .map_err(|e| native_error(e.to_string()))?;
    Ok(JsPromise::resolve(JsValue::undefined(), context).into())
}

fn service_worker_state(
    _this: &JsValue,
    _args: &[JsValue],
    captures: &ScopeCaptures,
    _context: &mut Context,
) -> JsResult<JsValue> {
    Ok(js_string!(captures.shared.install_state().as_str()).into())
}

fn scope_function(
    name: &str,
    length: usize,
    function: fn(&JsValue, &[JsValue], &ScopeCaptures, &mut Context) -> JsResult<JsValue>,
    shared: &Rc<WorkerShared>,
    context: &mut Context,
) -> boa_engine::object::builtins::JsFunction {
    FunctionObjectBuilder::new(
        context.realm(),
        NativeFunction::from_copy_closure_with_captures(
            function,
            ScopeCaptures {
                shared: shared.clone(),
            },
        ),
    )
    .name(js_string!(name))
    .length(length)
    .build()
}

/// Install the worker global scope into `context`.
pub(crate) fn install(
    context: &mut Context,
    registry: Rc<JsListenerRegistry>,
    shared: Rc<WorkerShared>,
) -> JsResult<()> {
    let global = context.global_object();
    context.register_global_property(js_string!("self"), global.clone(), Attribute::all())?;

    install_event_target(&global, registry, context)?;
    register_event_constructors(context, shared.log.clone())?;
    register_extendable_event(context)?;

    let skip = scope_function("skipWaiting", 0, skip_waiting, &shared, context);
    context.register_global_property(js_string!("skipWaiting"), skip, Attribute::all())?;

    let import = scope_function("importScripts", 1, import_scripts, &shared, context);
    context.register_global_property(js_string!("importScripts"), import, Attribute::all())?;

    let notify = scope_function("showNotification", 1, show_notification, &shared, context);
    let registration = ObjectInitializer::new(context)
        .property(js_string!("showNotification"), notify, Attribute::all())
        .build();
    context.register_global_property(
        js_string!("registration"),
        registration,
        Attribute::READONLY | Attribute::ENUMERABLE,
    )?;

    let state_getter = scope_function("state", 0, service_worker_state, &shared, context);
    let script_url = js_string!(shared.info.url.as_str());
    let service_worker = ObjectInitializer::new(context)
        .accessor(
            js_string!("state"),
            Some(state_getter),
            None,
            Attribute::ENUMERABLE | Attribute::CONFIGURABLE,
        )
        .property(js_string!("scriptURL"), script_url, Attribute::ENUMERABLE)
        .build();
    context.register_global_property(
        js_string!("serviceWorker"),
        service_worker,
        Attribute::READONLY | Attribute::ENUMERABLE,
    )?;

    Ok(())
}
