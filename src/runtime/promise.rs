//! Host-side handles for engine promises
//!
//! [`PromiseBridge`] owns one pending JS promise and the resolving functions
//! captured when it was created. The handles live in the environment's
//! [`BridgeArena`] under a generation-checked [`BridgeId`], so a stale id
//! (released slot, destroyed environment) can never reach a reclaimed
//! function.
//!
//! [`resolve_external`] goes the other way: it subscribes a host callback to
//! any JS value, promise or not.

use boa_engine::{
    Context, JsArgs, JsError, JsNativeError, JsResult, JsValue, NativeFunction,
    builtins::promise::ResolvingFunctions,
    object::{FunctionObjectBuilder, builtins::JsPromise},
};
use boa_gc::{Finalize, Trace};
use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
    sync::Arc,
};

use super::inbox::{HostInbox, HostTask};
use super::{ExecutionEnvironment, RuntimeResult, ServiceWorkerError, describe_value};

/// Generation-checked index into a [`BridgeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeId {
    index: u32,
    generation: u32,
}

impl BridgeId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

struct BridgeEntry {
    promise: JsPromise,
    /// Taken on first settlement.
    resolvers: Option<ResolvingFunctions>,
    detached: bool,
}

struct Slot {
    generation: u32,
    entry: Option<BridgeEntry>,
}

/// Storage for every live bridge of one environment.
#[derive(Default)]
pub struct BridgeArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    detached: usize,
}

impl BridgeArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, promise: JsPromise, resolvers: ResolvingFunctions) -> BridgeId {
        let entry = BridgeEntry {
            promise,
            resolvers: Some(resolvers),
            detached: false,
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return BridgeId::new(index, slot.generation);
        }
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        BridgeId::new((self.slots.len() - 1) as u32, 0)
    }

    fn entry_mut(&mut self, id: BridgeId) -> Option<&mut BridgeEntry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub fn contains(&self, id: BridgeId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.entry.is_some())
    }

    /// The promise stored under `id`, if the slot is still live.
    pub fn promise(&self, id: BridgeId) -> Option<JsPromise> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .map(|entry| entry.promise.clone())
    }

    /// Hand out the resolving functions exactly once. A detached entry is
    /// released as part of settling.
    fn settle(&mut self, id: BridgeId) -> Option<ResolvingFunctions> {
        let entry = self.entry_mut(id)?;
        let resolvers = entry.resolvers.take()?;
        if entry.detached {
            self.release(id);
        }
        Some(resolvers)
    }

    fn detach(&mut self, id: BridgeId) -> bool {
        let Some(entry) = self.entry_mut(id) else {
            return false;
        };
        if entry.detached {
            return true;
        }
        if entry.resolvers.is_none() {
            // Already settled; nothing left for a settler to do.
            self.release(id);
            return false;
        }
        entry.detached = true;
        self.detached += 1;
        true
    }

    fn release(&mut self, id: BridgeId) {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.generation != id.generation {
            return;
        }
        if let Some(entry) = slot.entry.take() {
            if entry.detached {
                self.detached -= 1;
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index);
        }
    }

    /// Release on behalf of the owning [`PromiseBridge`]; detached entries
    /// now belong to the environment.
    fn release_owned(&mut self, id: BridgeId) {
        let detached = self.entry_mut(id).is_some_and(|entry| entry.detached);
        if !detached {
            self.release(id);
        }
    }

    /// Number of detached bridges still waiting for a settler.
    pub fn outstanding(&self) -> usize {
        self.detached
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every slot. Bumps generations so old ids stay invalid.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.detached = 0;
    }
}

fn error_object(message: &str, context: &mut Context) -> JsValue {
    JsError::from_native(JsNativeError::error().with_message(message.to_string()))
        .to_opaque(context)
}

fn call_resolver(
    resolvers: ResolvingFunctions,
    outcome: Result<JsValue, JsValue>,
    context: &mut Context,
) -> JsResult<()> {
    match outcome {
        Ok(value) => resolvers
            .resolve
            .call(&JsValue::undefined(), &[value], context)?,
        Err(reason) => resolvers
            .reject
            .call(&JsValue::undefined(), &[reason], context)?,
    };
    Ok(())
}

/// Settle a bridge from a task drained out of the host inbox.
pub(crate) fn settle_from_host(
    arena: &RefCell<BridgeArena>,
    id: BridgeId,
    outcome: Result<serde_json::Value, String>,
    context: &mut Context,
) -> JsResult<()> {
    let resolvers = arena.borrow_mut().settle(id);
    let Some(resolvers) = resolvers else {
        return Ok(());
    };
    let outcome = match outcome {
        Ok(json) => match JsValue::from_json(&json, context) {
            Ok(value) => Ok(value),
            Err(err) => Err(error_object(
                &format!("Could not convert host value: {err}"),
                context,
            )),
        },
        Err(message) => Err(error_object(&message, context)),
    };
    call_resolver(resolvers, outcome, context)
}

/// A pending JS promise that host code settles.
pub struct PromiseBridge {
    id: BridgeId,
    promise: JsPromise,
    arena: Weak<RefCell<BridgeArena>>,
    inbox: Arc<HostInbox>,
}

impl PromiseBridge {
    pub fn new(env: &mut ExecutionEnvironment) -> RuntimeResult<Self> {
        let (context, arena, inbox) = env.bridge_parts()?;
        let (promise, resolvers) = JsPromise::new_pending(context);
        let id = arena.borrow_mut().insert(promise.clone(), resolvers);
        Ok(Self {
            id,
            promise,
            arena: Rc::downgrade(arena),
            inbox: inbox.clone(),
        })
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn promise(&self) -> &JsPromise {
        &self.promise
    }

    pub fn to_js_value(&self) -> JsValue {
        self.promise.clone().into()
    }

    /// Hand out the resolvers if `env` owns this bridge and it is still
    /// unsettled, along with the context to call them in.
    fn take_resolvers<'a>(
        &self,
        env: &'a mut ExecutionEnvironment,
    ) -> RuntimeResult<Option<(ResolvingFunctions, &'a mut Context)>> {
        let Some(arena) = self.arena.upgrade() else {
            return Ok(None);
        };
        if !Rc::ptr_eq(&arena, env.bridges()) {
            return Err(ServiceWorkerError::EngineError(
                "promise bridge belongs to another environment".to_string(),
            ));
        }
        let Some(resolvers) = arena.borrow_mut().settle(self.id) else {
            return Ok(None);
        };
        Ok(Some((resolvers, env.context_mut()?)))
    }

    /// Fulfill the promise. Returns false if it was already settled or the
    /// environment is destroyed.
    pub fn fulfill(&self, value: JsValue, env: &mut ExecutionEnvironment) -> RuntimeResult<bool> {
        let Some((resolvers, context)) = self.take_resolvers(env)? else {
            return Ok(false);
        };
        call_resolver(resolvers, Ok(value), context)
            .map_err(|err| ServiceWorkerError::ScriptError(err.to_string()))?;
        Ok(true)
    }

    /// Reject the promise with a JS `Error` carrying `error`'s message.
    pub fn reject(
        &self,
        error: impl fmt::Display,
        env: &mut ExecutionEnvironment,
    ) -> RuntimeResult<bool> {
        let Some((resolvers, context)) = self.take_resolvers(env)? else {
            return Ok(false);
        };
        let reason = error_object(&error.to_string(), context);
        call_resolver(resolvers, Err(reason), context)
            .map_err(|err| ServiceWorkerError::ScriptError(err.to_string()))?;
        Ok(true)
    }

    /// Give ownership of the handles to the environment and get a settler
    /// that works from any thread. The environment releases the slot on
    /// settlement or teardown.
    pub fn detach(self) -> PromiseSettler {
        if let Some(arena) = self.arena.upgrade() {
            arena.borrow_mut().detach(self.id);
        }
        PromiseSettler {
            id: self.id,
            inbox: self.inbox.clone(),
        }
    }
}

impl Drop for PromiseBridge {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.upgrade() {
            if let Ok(mut arena) = arena.try_borrow_mut() {
                arena.release_owned(self.id);
            }
        }
    }
}

impl fmt::Debug for PromiseBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseBridge").field("id", &self.id).finish()
    }
}

/// `Send` settlement handle for a detached bridge.
#[derive(Clone)]
pub struct PromiseSettler {
    id: BridgeId,
    inbox: Arc<HostInbox>,
}

impl PromiseSettler {
    pub fn id(&self) -> BridgeId {
        self.id
    }

    /// Queue a fulfillment. Returns false if the environment is destroyed.
    /// Only the first settlement that reaches the environment takes effect.
    pub fn fulfill(&self, value: serde_json::Value) -> bool {
        self.inbox.push(HostTask::Settle {
            bridge: self.id,
            outcome: Ok(value),
        })
    }

    pub fn reject(&self, message: impl Into<String>) -> bool {
        self.inbox.push(HostTask::Settle {
            bridge: self.id,
            outcome: Err(message.into()),
        })
    }
}

impl fmt::Debug for PromiseSettler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseSettler").field("id", &self.id).finish()
    }
}

type ExternalCallbackFn = Box<dyn FnOnce(Result<JsValue, ServiceWorkerError>, &mut Context)>;

#[derive(Trace, Finalize)]
struct ExternalCallback {
    #[unsafe_ignore_trace]
    slot: Rc<RefCell<Option<ExternalCallbackFn>>>,
}

impl ExternalCallback {
    fn complete(&self, outcome: Result<JsValue, ServiceWorkerError>, context: &mut Context) {
        let callback = self.slot.borrow_mut().take();
        if let Some(callback) = callback {
            callback(outcome, context);
        }
    }
}

/// Subscribe `callback` to `value` as if by `Promise.resolve(value).then()`.
///
/// The callback runs exactly once, from a promise job. Rejection values are
/// turned into a `ScriptError` message at this boundary. Returns the chained
/// promise.
pub fn resolve_external<F>(value: &JsValue, context: &mut Context, callback: F) -> JsPromise
where
    F: FnOnce(Result<JsValue, ServiceWorkerError>, &mut Context) + 'static,
{
    let boxed: ExternalCallbackFn = Box::new(callback);
    let slot = Rc::new(RefCell::new(Some(boxed)));

    let on_fulfilled = FunctionObjectBuilder::new(
        context.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &ExternalCallback, context| {
                let value = args.get_or_undefined(0).clone();
                captures.complete(Ok(value), context);
                Ok(JsValue::undefined())
            },
            ExternalCallback { slot: slot.clone() },
        ),
    )
    .length(1)
    .build();

    let on_rejected = FunctionObjectBuilder::new(
        context.realm(),
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &ExternalCallback, context| {
                let reason = args.get_or_undefined(0).clone();
                let message = describe_value(&reason, context);
                captures.complete(Err(ServiceWorkerError::ScriptError(message)), context);
                Ok(JsValue::undefined())
            },
            ExternalCallback { slot },
        ),
    )
    .length(1)
    .build();

    JsPromise::resolve(value.clone(), context).then(Some(on_fulfilled), Some(on_rejected), context)
}
