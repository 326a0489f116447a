//! # Suspension Bridge
//!
//! A handler suspends by returning [`Outcome::Suspend`] with a value to hand to
//! the collaborator and a continuation closure. The dispatch loop parks the
//! continuation in a [`SuspensionBridge`], forwards the yielded value as a
//! `Suspended` response event, blocks on the unit's resume channel, and re-enters
//! the continuation with the value the collaborator sends back.
//!
//! The request unit stays owned by the loop the whole time; only
//! [`Outcome::Complete`], [`Outcome::Fail`] or an explicit `finish_request`
//! completes it. A [`Resume::Cancel`] (or the collaborator going away) drops the
//! parked continuation and the request's finalizer still runs.

use crate::dispatcher::RequestScope;
use crate::error::HandlerError;
use serde_json::Value;
use tracing::debug;

/// Re-entry point for a suspended handler.
pub type Continuation = Box<dyn FnOnce(&mut RequestScope<'_>, Value) -> Outcome + Send>;

/// What one handler invocation (or continuation) produced.
pub enum Outcome {
    /// Handler returned normally.
    Complete,
    /// Handler yielded and wants to be resumed later.
    Suspend(Suspension),
    /// Handler failed; the loop renders an error response.
    Fail(HandlerError),
}

impl Outcome {
    /// Suspend with `yielded`, resuming in `resume` with the collaborator's value.
    pub fn suspend<F>(yielded: Value, resume: F) -> Self
    where
        F: FnOnce(&mut RequestScope<'_>, Value) -> Outcome + Send + 'static,
    {
        Outcome::Suspend(Suspension::new(yielded, resume))
    }
}

impl From<Result<(), HandlerError>> for Outcome {
    fn from(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => Outcome::Complete,
            Err(e) => Outcome::Fail(e),
        }
    }
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Complete => f.write_str("Complete"),
            Outcome::Suspend(s) => f.debug_tuple("Suspend").field(&s.yielded).finish(),
            Outcome::Fail(e) => f.debug_tuple("Fail").field(e).finish(),
        }
    }
}

/// A yielded value plus the state needed to continue the request.
pub struct Suspension {
    yielded: Value,
    continuation: Continuation,
}

impl Suspension {
    pub fn new<F>(yielded: Value, resume: F) -> Self
    where
        F: FnOnce(&mut RequestScope<'_>, Value) -> Outcome + Send + 'static,
    {
        Self {
            yielded,
            continuation: Box::new(resume),
        }
    }

    #[must_use]
    pub fn yielded(&self) -> &Value {
        &self.yielded
    }
}

/// Value sent back by the collaborator for a suspended request.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// Continue the handler with this value.
    Value(Value),
    /// Abandon the request; its resources are still released.
    Cancel,
}

/// Whether the request a handler is serving is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Handler code is executing.
    Running,
    /// A continuation is parked waiting for a resume value.
    Suspended,
    /// Handler returned, failed, or was cancelled.
    Completed,
}

/// Per-request bookkeeping for suspend/resume cycles.
pub struct SuspensionBridge {
    state: HandlerState,
    cycles: u32,
    parked: Option<Continuation>,
}

impl std::fmt::Debug for SuspensionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspensionBridge")
            .field("state", &self.state)
            .field("cycles", &self.cycles)
            .finish()
    }
}

impl Default for SuspensionBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspensionBridge {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: HandlerState::Running,
            cycles: 0,
            parked: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Completed suspend cycles so far.
    #[must_use]
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    /// Park a suspension. Returns the value to forward to the collaborator.
    pub fn park(&mut self, suspension: Suspension) -> Value {
        self.parked = Some(suspension.continuation);
        self.state = HandlerState::Suspended;
        self.cycles += 1;
        debug!(cycle = self.cycles, "Handler suspended");
        suspension.yielded
    }

    /// Take the parked continuation to resume it.
    pub fn resume(&mut self) -> Option<Continuation> {
        let continuation = self.parked.take()?;
        self.state = HandlerState::Running;
        Some(continuation)
    }

    pub fn complete(&mut self) {
        self.parked = None;
        self.state = HandlerState::Completed;
    }

    /// Drop the parked continuation. Returns whether one was parked.
    pub fn cancel(&mut self) -> bool {
        let had = self.parked.take().is_some();
        self.state = HandlerState::Completed;
        had
    }
}
