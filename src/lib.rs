//! # brrtworker
//!
//! **brrtworker** keeps one execution context alive across an unbounded sequence
//! of requests, handed to it one at a time by an external collaborator, and
//! enforces the lifecycle rules that make that safe: request-scoped state never
//! leaks from one request into the next, while the state an application shares on
//! purpose (environment variables, an in-process cache) survives for the whole
//! life of the worker.
//!
//! ## Architecture
//!
//! - **[`dispatcher`]** - the persistent dispatch loop ([`Worker`]), the
//!   [`Handler`] trait and the per-request [`RequestScope`]
//! - **[`headers`]** - incoming header capture and outgoing header/status staging
//! - **[`cache`]** - worker-lifetime key/value store with per-entry TTL
//! - **[`environ`]** - worker-lifetime environment variables
//! - **[`suspend`]** - cooperative suspend/resume of a handler mid-request
//! - **[`finalizer`]** - exactly-once, reverse-order release of per-request resources
//! - **[`context`]** - [`WorkerContext`], owner of everything that outlives a request
//! - **[`unit`]** - the collaborator boundary: request units in, response events out
//! - **[`runner`]** - runs a worker loop on a `may` coroutine
//! - **[`config`]**, **[`logging`]**, **[`error`]**, **[`ids`]** - ambient plumbing
//!
//! ## Request lifecycle
//!
//! ```mermaid
//! sequenceDiagram
//!     participant C as Collaborator
//!     participant W as Worker (dispatch loop)
//!     participant H as Handler
//!     participant F as Finalizer
//!
//!     C->>W: submit(WireRequest)
//!     W->>W: AwaitingUnit -> Running<br/>fresh RequestContext
//!     W->>H: invoke(&mut RequestScope)
//!     H-->>W: Outcome::Suspend(yielded, continuation)
//!     W->>C: ResponseEvent::Suspended(yielded)
//!     C->>W: resume(value)
//!     W->>H: continuation(&mut RequestScope, value)
//!     H-->>W: Outcome::Complete
//!     W->>C: Head, Body, End (Flushing)
//!     W->>F: run_all() (reverse order, exactly once)
//!     W-->>C: handle_request() -> true
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use brrtworker::{handler_fn, Outcome, WireRequest, Worker, WorkerConfig};
//!
//! let (mut worker, units) = Worker::from_config(WorkerConfig::default())?;
//! let pending = units.submit(WireRequest::new("GET", "/hello"))?;
//!
//! let mut handler = handler_fn(|scope| {
//!     scope.env().set("LAST_PATH", scope.path()).ok();
//!     scope.write("hello");
//!     Outcome::Complete
//! });
//! assert!(worker.handle_request(&mut handler));
//! assert_eq!(pending.wait()?.body, b"hello");
//! ```
//!
//! ## Failure classes
//!
//! Per-request problems (bad header lines, cache misses, handler errors, panics)
//! become error responses and the loop keeps serving. Worker-fatal problems
//! (tainted shared stores, panicking resource releases, explicit fatal errors,
//! too many consecutive failures) make [`Worker::handle_request`] return `false`
//! so the supervisor can recycle the process.

pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod echo;
pub mod environ;
pub mod error;
pub mod finalizer;
pub mod headers;
pub mod ids;
pub mod logging;
pub mod runner;
pub mod suspend;
pub mod unit;

pub use config::WorkerConfig;
pub use context::{WorkerContext, WorkerStats};
pub use dispatcher::{handler_fn, ExitReason, Handler, LoopPhase, RequestScope, Worker};
pub use error::{HandlerError, HeaderError};
pub use headers::HeaderMode;
pub use ids::{RequestId, WorkerId};
pub use suspend::{HandlerState, Outcome, Resume};
pub use unit::{CompletedResponse, PendingResponse, ResponseEvent, UnitSender, WireRequest};
