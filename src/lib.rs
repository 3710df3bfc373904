//! swrun - A Service Worker execution runtime powered by the Boa JS engine
//!
//! swrun hosts service worker scripts outside a browser:
//! - Boa: ECMAScript engine written in Rust
//! - boa_runtime: console, timers and microtasks
//! - An event loop that reports asynchronous script errors to the host
//! - Extendable and fetch events with `waitUntil` / `respondWith`
//! - Worker threads reachable from any host thread or async task

pub mod runtime;

// Re-export commonly used types
pub use runtime::events::{Event, EventListenerRegistry, WorkerEvent};
pub use runtime::extendable::{ExtendableEvent, ExtendableState};
pub use runtime::fetch::{FetchEvent, FetchRequest, ResponseSnapshot, WorkerResponse};
pub use runtime::inbox::EnvironmentHandle;
pub use runtime::promise::{PromiseBridge, PromiseSettler, resolve_external};
pub use runtime::stream::{ReadableStream, ReadableStreamController, StreamReadResult};
pub use runtime::thread::{EventOutcome, HostEvent, WorkerOptions, WorkerThread, WorkerThreadHandle};
pub use runtime::worker::{
    ContentSource, ImportScripts, InstallState, LoadContent, ServiceWorker,
    ServiceWorkerRegistration, WorkerInfo,
};
pub use runtime::{
    ExecutionEnvironment, LogInterface, RuntimeConfig, RuntimeResult, ServiceWorkerError,
};
