//! # Resource Finalizer
//!
//! Every per-request external handle a handler opens (upload temp files, open
//! streams, session handles) is registered with the request's [`Finalizer`].
//! The dispatch loop calls [`Finalizer::run_all`] once the handler has fully
//! returned, after any number of suspend/resume cycles.
//!
//! Guarantees:
//!
//! - each registered resource is released exactly once, newest first
//! - registering the same key twice tracks it once
//! - a resource that is already closed (`NotFound`) is not an error
//! - a finalizer dropped without running (cancelled suspension, aborted
//!   response) still releases everything
//!
//! A release that panics leaves its handle in an undefined state; the dispatch
//! loop treats that as worker-fatal.

mod core;
mod resources;

pub use core::{FinalizeReport, Finalizer, Resource};
pub use resources::{Deferred, OwnedHandle, UploadTempFile};
