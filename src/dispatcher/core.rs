use super::scope::{RequestContext, RequestScope, ResponseState};
use crate::config::WorkerConfig;
use crate::context::WorkerContext;
use crate::error::{EnvError, HandlerError};
use crate::suspend::{Outcome, Resume, SuspensionBridge};
use crate::unit::{self, Admission, UnitReceiver, UnitSender};
use std::any::Any;
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often a suspended request re-checks the shutdown flag.
const RESUME_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A unit of work the dispatch loop can hand requests to.
///
/// Closures `FnMut(&mut RequestScope<'_>) -> Outcome` implement this directly;
/// wrap them in [`handler_fn`] when the parameter type cannot be inferred.
pub trait Handler {
    fn invoke(&mut self, scope: &mut RequestScope<'_>) -> Outcome;
}

impl<F> Handler for F
where
    F: FnMut(&mut RequestScope<'_>) -> Outcome,
{
    fn invoke(&mut self, scope: &mut RequestScope<'_>) -> Outcome {
        self(scope)
    }
}

/// Pin a closure's signature so it is usable as a [`Handler`].
pub fn handler_fn<F>(f: F) -> F
where
    F: FnMut(&mut RequestScope<'_>) -> Outcome,
{
    f
}

/// Where the dispatch loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    /// Between requests.
    Idle,
    /// Blocked waiting for the collaborator to deliver a unit.
    AwaitingUnit,
    /// Handler (or a continuation) executing.
    Running,
    /// Sending the response and releasing request resources.
    Flushing,
    /// No more units will be admitted.
    Terminating,
}

/// Why a worker stopped accepting units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown requested through the unit channel or the context flag.
    Shutdown,
    /// Every unit sender was dropped.
    CollaboratorGone,
    /// Shared state can no longer be trusted.
    Fatal(String),
    /// The configured request budget is spent; the supervisor should recycle.
    MaxRequestsReached,
}

impl Display for ExitReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Shutdown => write!(f, "shutdown"),
            ExitReason::CollaboratorGone => write!(f, "collaborator gone"),
            ExitReason::Fatal(reason) => write!(f, "fatal: {reason}"),
            ExitReason::MaxRequestsReached => write!(f, "max requests reached"),
        }
    }
}

/// How the handler side of one request ended.
enum Driven {
    Completed,
    Failed(HandlerError),
    Panicked(String),
    Cancelled,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run one handler entry (first call or a continuation) behind `catch_unwind`.
fn invoke_guarded<F>(ctx: &mut RequestContext, worker: &WorkerContext, f: F) -> Result<Outcome, String>
where
    F: FnOnce(&mut RequestScope<'_>) -> Outcome,
{
    catch_unwind(AssertUnwindSafe(|| {
        let mut scope = RequestScope::new(ctx, worker);
        f(&mut scope)
    }))
    .map_err(|panic| panic_message(panic.as_ref()))
}

/// Invoke the handler and service its suspend/resume cycles until it is done.
fn drive<H: Handler + ?Sized>(
    handler: &mut H,
    ctx: &mut RequestContext,
    worker: &WorkerContext,
) -> (Driven, u32) {
    let mut bridge = SuspensionBridge::new();
    let mut entry = invoke_guarded(ctx, worker, |scope| handler.invoke(scope));

    loop {
        let outcome = match entry {
            Ok(outcome) => outcome,
            Err(message) => {
                bridge.complete();
                return (Driven::Panicked(message), bridge.cycles());
            }
        };

        match outcome {
            Outcome::Complete => {
                bridge.complete();
                return (Driven::Completed, bridge.cycles());
            }
            Outcome::Fail(err) => {
                bridge.complete();
                return (Driven::Failed(err), bridge.cycles());
            }
            Outcome::Suspend(suspension) => {
                let yielded = bridge.park(suspension);
                worker.stats().record_suspension();
                ctx.notify_suspended(yielded);

                // S1: Waiting for the collaborator's resume value
                debug!(
                    request_id = %ctx.id(),
                    cycle = bridge.cycles(),
                    "Handler suspended - awaiting resume"
                );
                match wait_for_resume(ctx, worker) {
                    Some(Resume::Value(value)) => {
                        let Some(continuation) = bridge.resume() else {
                            return (Driven::Cancelled, bridge.cycles());
                        };
                        // S2: Re-entering the handler
                        debug!(request_id = %ctx.id(), cycle = bridge.cycles(), "Handler resumed");
                        entry = invoke_guarded(ctx, worker, move |scope| continuation(scope, value));
                    }
                    Some(Resume::Cancel) | None => {
                        // S3: Suspended request cancelled
                        bridge.cancel();
                        info!(
                            request_id = %ctx.id(),
                            cycle = bridge.cycles(),
                            "Suspended request cancelled"
                        );
                        return (Driven::Cancelled, bridge.cycles());
                    }
                }
            }
        }
    }
}

/// Block on the collaborator's answer to a suspension, giving up once the
/// worker is asked to shut down. `None` means the request must be cancelled.
fn wait_for_resume(ctx: &RequestContext, worker: &WorkerContext) -> Option<Resume> {
    loop {
        match ctx.responder().recv_resume_timeout(RESUME_POLL_INTERVAL) {
            Ok(resume) => return Some(resume),
            Err(RecvTimeoutError::Timeout) => {
                if worker.is_shutting_down() {
                    warn!(
                        request_id = %ctx.id(),
                        "Shutdown requested while suspended - cancelling request"
                    );
                    return None;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// The persistent dispatch loop for one worker.
///
/// Each [`Worker::handle_request`] call admits exactly one unit, runs the
/// handler to completion (including any suspensions), flushes the response,
/// runs the finalizer and reports whether the worker should keep going.
pub struct Worker {
    context: Arc<WorkerContext>,
    config: WorkerConfig,
    default_headers: Vec<(String, String)>,
    units: Option<UnitReceiver>,
    phase: LoopPhase,
    exit: Option<ExitReason>,
    active: Option<RequestContext>,
    consecutive_failures: u32,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker", &self.context.id())
            .field("phase", &self.phase)
            .field("exit", &self.exit)
            .finish()
    }
}

impl Worker {
    /// Create a worker over `context` together with the sender that feeds it.
    pub fn new(context: Arc<WorkerContext>, config: WorkerConfig) -> (Self, UnitSender) {
        let (sender, units) = unit::channel();
        let default_headers = config
            .default_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let worker = Self {
            context,
            config,
            default_headers,
            units: Some(units),
            phase: LoopPhase::Idle,
            exit: None,
            active: None,
            consecutive_failures: 0,
        };
        (worker, sender)
    }

    /// Build the worker context from `config` as well.
    pub fn from_config(config: WorkerConfig) -> Result<(Self, UnitSender), EnvError> {
        let context = Arc::new(WorkerContext::from_config(&config)?);
        Ok(Self::new(context, config))
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.context
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    /// Set once the loop has stopped admitting units.
    pub fn exit_reason(&self) -> Option<&ExitReason> {
        self.exit.as_ref()
    }

    /// Headers staged for the active request.
    ///
    /// `handle_request` holds the worker for the whole request, so callers only
    /// ever observe this between requests, where it is always `None`. Handlers
    /// read their own staged headers through [`RequestScope::response_headers`].
    pub fn response_headers(&self) -> Option<Vec<(String, String)>> {
        self.active.as_ref().map(RequestContext::response_headers)
    }

    fn terminate(&mut self, reason: ExitReason) -> bool {
        // W9: Worker terminating
        match &reason {
            ExitReason::Fatal(why) => error!(
                worker = %self.context.id(),
                reason = %why,
                requests = self.context.request_count(),
                "Worker-fatal condition - no longer accepting requests"
            ),
            other => info!(
                worker = %self.context.id(),
                reason = %other,
                requests = self.context.request_count(),
                "Worker stopping"
            ),
        }
        if let Some(units) = self.units.take() {
            let abandoned = units.drain();
            if abandoned > 0 {
                warn!(
                    worker = %self.context.id(),
                    abandoned = abandoned,
                    "Dropping queued request units"
                );
            }
        }
        self.phase = LoopPhase::Terminating;
        self.exit = Some(reason);
        false
    }

    /// Serve one request. Returns `false` when the worker should stop accepting work.
    pub fn handle_request<H: Handler + ?Sized>(&mut self, handler: &mut H) -> bool {
        if self.exit.is_some() {
            return false;
        }

        // W1: Shutdown requested out of band
        if self.context.is_shutting_down() {
            return self.terminate(ExitReason::Shutdown);
        }

        // W2: Awaiting unit - the only place the loop itself blocks
        let Some(units) = self.units.as_ref() else {
            return false;
        };
        self.phase = LoopPhase::AwaitingUnit;
        debug!(worker = %self.context.id(), "Awaiting request unit");
        let unit = match units.recv() {
            Some(Admission::Unit(unit)) => unit,
            Some(Admission::Shutdown) => return self.terminate(ExitReason::Shutdown),
            None => return self.terminate(ExitReason::CollaboratorGone),
        };

        let seq = self.context.next_request();
        let started = Instant::now();

        // W3: Malformed unit - answer without involving the handler
        if http::Method::from_bytes(unit.request.method.as_bytes()).is_err() {
            self.context.stats().record_malformed();
            let mut ctx = RequestContext::new(unit.request, unit.responder, seq, &[], None);
            warn!(
                worker = %self.context.id(),
                request_id = %ctx.id(),
                seq = seq,
                "Malformed request unit - responding 400"
            );
            self.phase = LoopPhase::Flushing;
            ctx.fail(400);
            drop(ctx);
            return self.after_request(seq, None);
        }

        let method = unit.request.method.clone();
        let uri = unit.request.uri.clone();
        let ctx = self.active.insert(RequestContext::new(
            unit.request,
            unit.responder,
            seq,
            &self.default_headers,
            self.config.upload_dir.clone(),
        ));
        let request_id = ctx.id();

        // W4: Request admitted
        info!(
            worker = %self.context.id(),
            request_id = %request_id,
            seq = seq,
            method = %method,
            uri = %uri,
            "Request admitted"
        );

        // W5: Handler running
        self.phase = LoopPhase::Running;
        let (driven, cycles) = drive(handler, ctx, &self.context);

        // W6: Flushing response
        self.phase = LoopPhase::Flushing;
        let mut fatal: Option<String> = None;
        match driven {
            Driven::Completed => {
                ctx.complete();
                self.consecutive_failures = 0;
            }
            Driven::Failed(err) => {
                self.context.stats().record_failure();
                self.consecutive_failures += 1;
                warn!(
                    request_id = %request_id,
                    error = %err.message,
                    fatal = err.is_fatal(),
                    "Handler failed"
                );
                render_failure(ctx, err.response_status());
                if err.is_fatal() {
                    fatal = Some(err.message);
                }
            }
            Driven::Panicked(message) => {
                self.context.stats().record_panic();
                self.consecutive_failures += 1;
                error!(
                    request_id = %request_id,
                    panic_message = %message,
                    "Handler panicked - CRITICAL"
                );
                render_failure(ctx, 500);
            }
            Driven::Cancelled if ctx.state() == ResponseState::Sent => {
                // finish_request already delivered the full response
                self.consecutive_failures = 0;
                debug!(
                    request_id = %request_id,
                    "Suspension cancelled after the response was finished"
                );
            }
            Driven::Cancelled => {
                // the response is dropped without an end marker
                self.context.stats().record_cancellation();
            }
        }

        // W7: Releasing request resources
        let report = ctx.finalizer_mut().run_all();
        self.context.stats().record_released(report.released);
        if report.is_fatal() && fatal.is_none() {
            fatal = Some(format!("{} resource release(s) panicked", report.panicked));
        }

        // W8: Request complete
        info!(
            worker = %self.context.id(),
            request_id = %request_id,
            status = ctx.status(),
            complete = ctx.state() == ResponseState::Sent,
            finished_early = ctx.finished_early(),
            suspensions = cycles,
            released = report.released,
            latency_ms = started.elapsed().as_millis() as u64,
            "Request complete"
        );
        self.context.stats().record_served();
        self.active = None;

        self.after_request(seq, fatal)
    }

    fn after_request(&mut self, seq: u64, fatal: Option<String>) -> bool {
        let interval = self.config.cache.sweep_interval;
        if interval > 0 && seq % interval == 0 {
            self.context.cache().sweep();
        }

        if let Some(reason) = fatal {
            return self.terminate(ExitReason::Fatal(reason));
        }
        if !self.context.is_healthy() {
            return self.terminate(ExitReason::Fatal("shared store tainted".to_string()));
        }
        let threshold = self.config.max_consecutive_failures;
        if threshold > 0 && self.consecutive_failures >= threshold {
            return self.terminate(ExitReason::Fatal(format!(
                "{} consecutive handler failures",
                self.consecutive_failures
            )));
        }
        if self.config.max_requests > 0 && seq >= self.config.max_requests {
            return self.terminate(ExitReason::MaxRequestsReached);
        }
        if self.context.is_shutting_down() {
            return self.terminate(ExitReason::Shutdown);
        }

        self.phase = LoopPhase::Idle;
        true
    }

    /// Serve until the loop stops, then report why.
    pub fn run<H: Handler + ?Sized>(&mut self, handler: &mut H) -> ExitReason {
        info!(
            worker = %self.context.id(),
            name = %self.config.name,
            max_requests = self.config.max_requests,
            "Worker loop started"
        );
        while self.handle_request(handler) {}
        self.exit.clone().unwrap_or(ExitReason::Shutdown)
    }
}

/// Error response for a failed handler: generic body if nothing was sent yet,
/// otherwise the partial response is abandoned.
fn render_failure(ctx: &mut RequestContext, status: u16) {
    match ctx.state() {
        ResponseState::Pending => {
            ctx.fail(status);
        }
        ResponseState::Streaming => {
            warn!(
                request_id = %ctx.id(),
                status = status,
                "Handler failed after streaming started - aborting response"
            );
        }
        ResponseState::Sent => {
            debug!(request_id = %ctx.id(), "Handler failed after finishing its response");
        }
    }
}
