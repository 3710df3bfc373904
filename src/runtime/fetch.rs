//! Fetch events and worker-authored responses
//!
//! A [`FetchEvent`] is an extendable event of type `fetch` carrying the
//! request. `respondWith(value)` may be called once; the resolved value is
//! turned into a [`WorkerResponse`] and the event waits for it.

use boa_engine::{
    Context, JsArgs, JsNativeError, JsResult, JsValue, NativeFunction, js_string,
    object::{FunctionObjectBuilder, builtins::JsUint8Array},
};
use boa_gc::{Finalize, Trace};
use serde::{Deserialize, Serialize};
use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use super::events::WorkerEvent;
use super::extendable::{ExtendableEvent, ExtendableState, extendable_object};
use super::promise::resolve_external;
use super::stream::ReadableStream;
use super::{RuntimeResult, ServiceWorkerError, describe_error};

fn default_method() -> String {
    "GET".to_string()
}

/// The request a fetch event asks the worker to answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
        }
    }
}

/// A response produced by a worker.
#[derive(Debug, Clone)]
pub struct WorkerResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ReadableStream,
}

impl WorkerResponse {
    /// Copy out everything needed to hand the response to another thread.
    /// Takes the body bytes buffered so far.
    pub fn snapshot(&self) -> ResponseSnapshot {
        let (body, _) = self.body.take_available();
        ResponseSnapshot {
            status: self.status,
            headers: self.headers.clone(),
            body,
        }
    }
}

/// `Send` copy of a [`WorkerResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl ResponseSnapshot {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Default)]
struct FetchState {
    responded: bool,
    response: Option<RuntimeResult<WorkerResponse>>,
}

/// Extendable `fetch` event.
#[derive(Clone)]
pub struct FetchEvent {
    event: ExtendableEvent,
    request: FetchRequest,
    state: Rc<RefCell<FetchState>>,
}

impl FetchEvent {
    pub fn new(request: FetchRequest) -> Self {
        Self {
            event: ExtendableEvent::new("fetch"),
            request,
            state: Rc::new(RefCell::new(FetchState::default())),
        }
    }

    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    pub fn event(&self) -> &ExtendableEvent {
        &self.event
    }

    pub fn has_responded(&self) -> bool {
        self.state.borrow().responded
    }

    /// The response, once the value passed to `respondWith` resolved.
    pub fn response(&self) -> Option<RuntimeResult<WorkerResponse>> {
        self.state.borrow().response.clone()
    }

    pub fn respond_with(&self, value: &JsValue, context: &mut Context) -> JsResult<()> {
        if self.event.state() != ExtendableState::Valid {
            return Err(JsNativeError::typ()
                .with_message("Invalid state for respondWith()")
                .into());
        }
        {
            let mut state = self.state.borrow_mut();
            if state.responded {
                return Err(JsNativeError::typ()
                    .with_message("respondWith() has already been called")
                    .into());
            }
            state.responded = true;
        }

        // Registered before the extension so the response is in place by
        // the time the event resolves.
        let state = self.state.clone();
        resolve_external(value, context, move |outcome, context| {
            let response = outcome.and_then(|value| extract_response(&value, context));
            state.borrow_mut().response = Some(response);
        });
        self.event.wait_until(value, context)
    }
}

impl WorkerEvent for FetchEvent {
    fn event_type(&self) -> &str {
        "fetch"
    }

    fn to_js(&self, context: &mut Context) -> JsResult<JsValue> {
        let object = extendable_object(&self.event, context)?;

        let request = serde_json::to_value(&self.request)
            .map_err(|e| JsNativeError::typ().with_message(e.to_string()))?;
        let request = JsValue::from_json(&request, context)?;
        object.set(js_string!("request"), request, false, context)?;

        let respond_with = FunctionObjectBuilder::new(
            context.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &FetchCaptures, context| {
                    captures
                        .fetch
                        .respond_with(args.get_or_undefined(0), context)?;
                    Ok(JsValue::undefined())
                },
                FetchCaptures {
                    fetch: self.clone(),
                },
            ),
        )
        .name(js_string!("respondWith"))
        .length(1)
        .build();
        object.set(js_string!("respondWith"), respond_with, false, context)?;

        Ok(object.into())
    }

    fn dispatch_complete(&self) {
        self.event.dispatch_complete();
    }

    fn extendable(&self) -> Option<&ExtendableEvent> {
        Some(&self.event)
    }
}

#[derive(Trace, Finalize)]
struct FetchCaptures {
    #[unsafe_ignore_trace]
    fetch: FetchEvent,
}

fn script_error(err: boa_engine::JsError, context: &mut Context) -> ServiceWorkerError {
    ServiceWorkerError::ScriptError(describe_error(&err, context))
}

fn body_bytes(value: &JsValue, context: &mut Context) -> JsResult<Vec<u8>> {
    if value.is_null_or_undefined() {
        return Ok(Vec::new());
    }
    if let Some(object) = value.as_object() {
        if let Ok(array) = JsUint8Array::from_object(object.clone()) {
            let len = array.length(context)?;
            let mut bytes = Vec::with_capacity(len as usize);
            for i in 0..len {
                bytes.push(array.get(i, context)?.to_number(context)? as u8);
            }
            return Ok(bytes);
        }
    }
    Ok(value.to_string(context)?.to_std_string_escaped().into_bytes())
}

fn response_headers(value: &JsValue, context: &mut Context) -> JsResult<BTreeMap<String, String>> {
    let mut headers = BTreeMap::new();
    if value.is_null_or_undefined() {
        return Ok(headers);
    }
    if let Some(serde_json::Value::Object(map)) = value.to_json(context)? {
        for (name, value) in map {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            headers.insert(name.to_ascii_lowercase(), value);
        }
    }
    Ok(headers)
}

/// Statuses a worker may answer with: integers in 200..=599.
fn response_status(number: f64) -> RuntimeResult<u16> {
    if number.fract() != 0.0 || !(200.0..=599.0).contains(&number) {
        return Err(ServiceWorkerError::ScriptError(format!(
            "Invalid response status: {number}"
        )));
    }
    Ok(number as u16)
}

/// Read `{ status, headers, body }` (or a bare string body) from the value
/// a worker responded with.
fn extract_response(value: &JsValue, context: &mut Context) -> RuntimeResult<WorkerResponse> {
    let Some(object) = value.as_object() else {
        if value.is_string() {
            let body = body_bytes(value, context).map_err(|e| script_error(e, context))?;
            return Ok(WorkerResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: ReadableStream::from_bytes(body),
            });
        }
        return Err(ServiceWorkerError::ScriptError(
            "respondWith() expects a response object".to_string(),
        ));
    };

    let read = |key: &'static str, context: &mut Context| {
        object
            .get(js_string!(key), context)
            .map_err(|e| script_error(e, context))
    };

    let status = read("status", context)?;
    let status = if status.is_undefined() {
        200
    } else {
        let number = status
            .to_number(context)
            .map_err(|e| script_error(e, context))?;
        response_status(number)?
    };
    let headers = read("headers", context)?;
    let headers = response_headers(&headers, context).map_err(|e| script_error(e, context))?;
    let body = read("body", context)?;
    let body = body_bytes(&body, context).map_err(|e| script_error(e, context))?;

    Ok(WorkerResponse {
        status,
        headers,
        body: ReadableStream::from_bytes(body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExecutionEnvironment, RuntimeConfig};
    use std::time::Duration;

    fn run_fetch(script: &str) -> (ExecutionEnvironment, FetchEvent) {
        let mut env = ExecutionEnvironment::new(RuntimeConfig::default()).unwrap();
        let fetch = FetchEvent::new(FetchRequest::get("https://example.com/data.json"));
        let object = fetch.to_js(env.context_mut().unwrap()).unwrap();
        env.set_global("evt", object).unwrap();
        env.evaluate(script, "test.js").unwrap();
        fetch.dispatch_complete();
        let event = fetch.event().clone();
        assert!(
            env.run_until(|_| event.is_resolved(), Duration::from_secs(5))
                .unwrap()
        );
        (env, fetch)
    }

    #[test]
    fn test_respond_with_object() {
        let (_env, fetch) = run_fetch(
            r#"
            evt.respondWith(new Promise(function(resolve) {
                setTimeout(function() {
                    resolve({
                        status: 201,
                        headers: { 'Content-Type': 'text/plain' },
                        body: 'from ' + evt.request.url,
                    });
                }, 5);
            }));
            "#,
        );
        let response = fetch.response().unwrap().unwrap();
        let snapshot = response.snapshot();
        assert_eq!(snapshot.status, 201);
        assert_eq!(
            snapshot.headers.get("content-type").map(String::as_str),
            Some("text/plain")
        );
        assert_eq!(snapshot.text(), "from https://example.com/data.json");
    }

    #[test]
    fn test_response_defaults() {
        let (_env, fetch) = run_fetch("evt.respondWith({});");
        let snapshot = fetch.response().unwrap().unwrap().snapshot();
        assert_eq!(snapshot.status, 200);
        assert!(snapshot.headers.is_empty());
        assert!(snapshot.body.is_empty());
    }

    #[test]
    fn test_uint8array_body() {
        let (_env, fetch) = run_fetch("evt.respondWith({ body: new Uint8Array([1, 2, 3]) });");
        let snapshot = fetch.response().unwrap().unwrap().snapshot();
        assert_eq!(snapshot.body, vec![1, 2, 3]);
    }

    #[test]
    fn test_respond_with_twice_throws() {
        let (mut env, fetch) = run_fetch(
            r#"
            evt.respondWith('first');
            var second;
            try { evt.respondWith('second'); } catch (e) { second = e.message; }
            "#,
        );
        let value = env.evaluate("second", "test.js").unwrap();
        let context = env.context_mut().unwrap();
        assert_eq!(
            value.to_string(context).unwrap().to_std_string_escaped(),
            "respondWith() has already been called"
        );
        assert_eq!(fetch.response().unwrap().unwrap().snapshot().text(), "first");
    }

    #[test]
    fn test_rejected_response() {
        let (_env, fetch) = run_fetch("evt.respondWith(Promise.reject(new Error('offline')));");
        assert_eq!(
            fetch.response().unwrap().unwrap_err(),
            ServiceWorkerError::ScriptError("offline".into())
        );
        assert_eq!(
            fetch.event().resolved_error(),
            Some(ServiceWorkerError::ScriptError("offline".into()))
        );
    }

    #[test]
    fn test_non_object_response_is_an_error() {
        let (_env, fetch) = run_fetch("evt.respondWith(Promise.resolve(42));");
        assert_eq!(
            fetch.response().unwrap().unwrap_err(),
            ServiceWorkerError::ScriptError("respondWith() expects a response object".into())
        );
        assert!(fetch.event().resolved_error().is_none());
    }

    #[test]
    fn test_invalid_status_is_rejected() {
        let cases = [
            ("'abc'", "NaN"),
            ("70000", "70000"),
            ("99", "99"),
            ("201.5", "201.5"),
        ];
        for (status, shown) in cases {
            let (_env, fetch) = run_fetch(&format!("evt.respondWith({{ status: {status} }});"));
            assert_eq!(
                fetch.response().unwrap().unwrap_err(),
                ServiceWorkerError::ScriptError(format!("Invalid response status: {shown}"))
            );
        }
        let (_env, fetch) = run_fetch("evt.respondWith({ status: 599 });");
        assert_eq!(fetch.response().unwrap().unwrap().status, 599);
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let request: FetchRequest =
            serde_json::from_value(serde_json::json!({ "url": "https://example.com/" })).unwrap();
        assert_eq!(request, FetchRequest::get("https://example.com/"));
    }
}
