//! # Dispatch Loop
//!
//! [`Worker`] is the persistent request loop. The external collaborator feeds it
//! [`RequestUnit`](crate::unit::RequestUnit)s through a
//! [`UnitSender`](crate::unit::UnitSender); each call to
//! [`Worker::handle_request`] admits one unit and drives it through
//!
//! ```text
//! Idle -> AwaitingUnit -> Running -> Flushing -> Idle
//!                \            \          \
//!                 `------------`----------`--> Terminating
//! ```
//!
//! `AwaitingUnit` is the only phase in which the loop itself blocks; a handler
//! suspension blocks on the unit's own resume channel and never admits a second
//! unit while the first is open.
//!
//! ## Handlers
//!
//! Anything implementing [`Handler`] (including `FnMut(&mut RequestScope) -> Outcome`
//! closures) can serve requests. The handler sees the request only through a
//! [`RequestScope`], which borrows the per-request context for the duration of
//! one call; the context is dropped before the next unit is admitted.
//!
//! ## Failure handling
//!
//! - `Outcome::Fail` and panics become a generic JSON error response (status
//!   from the error, default 500) and the loop continues.
//! - A failure after streaming started aborts the response: the collaborator
//!   sees the connection drop instead of a truncated success.
//! - Fatal handler errors, panicking resource releases, tainted shared stores
//!   and `max_consecutive_failures` in a row stop the loop.
//! - A unit whose method is not a valid HTTP token is answered `400` without
//!   calling the handler.
//!
//! ## Example
//!
//! ```rust,ignore
//! use brrtworker::dispatcher::{handler_fn, Worker};
//! use brrtworker::suspend::Outcome;
//!
//! let (mut worker, units) = Worker::from_config(Default::default())?;
//! let mut handler = handler_fn(|scope| {
//!     let hits = scope.cache_get("hits").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
//!     scope.cache_put("hits", hits.into(), None);
//!     scope.write(format!("hit {hits}"));
//!     Outcome::Complete
//! });
//! while worker.handle_request(&mut handler) {}
//! ```

mod core;
mod scope;

pub use core::{handler_fn, ExitReason, Handler, LoopPhase, Worker};
pub use scope::{RequestScope, ResponseState};
