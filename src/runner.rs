//! # Coroutine Runner
//!
//! Runs a [`Worker`] loop on its own `may` coroutine so a collaborator can feed
//! it from elsewhere. One coroutine per worker; workers share nothing but the
//! runtime.

use crate::config::WorkerConfig;
use crate::context::WorkerContext;
use crate::dispatcher::{ExitReason, Handler, Worker};
use crate::error::SubmitError;
use crate::unit::{PendingResponse, UnitSender, WireRequest};
use may::coroutine;
use std::io;
use std::sync::Arc;
use tracing::{debug, error};

/// Handle to a worker running on a coroutine.
pub struct WorkerHandle {
    units: UnitSender,
    context: Arc<WorkerContext>,
    join: coroutine::JoinHandle<ExitReason>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker", &self.context.id())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub fn submit(&self, request: WireRequest) -> Result<PendingResponse, SubmitError> {
        self.units.submit(request)
    }

    /// Sender for feeding the worker from other threads or coroutines.
    pub fn units(&self) -> &UnitSender {
        &self.units
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.context
    }

    /// Stop after the request in progress (if any). Idempotent.
    pub fn shutdown(&self) {
        self.context.request_shutdown();
        self.units.shutdown();
    }

    /// Wait for the loop to stop and report why.
    pub fn join(self) -> ExitReason {
        match self.join.join() {
            Ok(reason) => reason,
            Err(panic) => {
                error!(worker = %self.context.id(), panic_message = ?panic, "Worker coroutine panicked - CRITICAL");
                ExitReason::Fatal("worker coroutine panicked".to_string())
            }
        }
    }
}

/// Spawn a worker loop for `handler` on a coroutine with `config.stack_size`.
///
/// # Safety
///
/// `may::coroutine::Builder::spawn` is unsafe: the caller must make sure the
/// handler does not block the OS thread in ways the `may` scheduler cannot see
/// (thread-local state, blocking syscalls outside `may` I/O) and that the
/// configured stack is large enough for the handler's deepest call.
///
/// A zero `stack_size` is rejected with [`io::ErrorKind::InvalidInput`].
pub unsafe fn spawn_worker<H>(
    config: WorkerConfig,
    context: Arc<WorkerContext>,
    handler: H,
) -> io::Result<WorkerHandle>
where
    H: Handler + Send + 'static,
{
    let stack_size = config.stack_size;
    if stack_size == 0 {
        error!(worker = %context.id(), "Refusing to spawn worker with a zero stack size");
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "worker stack_size must be greater than zero",
        ));
    }
    let name = config.name.clone();
    let (mut worker, units) = Worker::new(Arc::clone(&context), config);

    // SAFETY: forwarded to the caller, see `# Safety` above.
    let spawned = unsafe {
        coroutine::Builder::new()
            .name(name.clone())
            .stack_size(stack_size)
            .spawn(move || {
                let mut handler = handler;
                // R1: Worker coroutine start
                debug!(name = %name, stack_size = stack_size, "Worker coroutine start");
                worker.run(&mut handler)
            })
    };
    let join = spawned.inspect_err(|e| {
        error!(
            worker = %context.id(),
            error = %e,
            stack_size = stack_size,
            "Failed to spawn worker coroutine - CRITICAL"
        );
    })?;

    Ok(WorkerHandle {
        units,
        context,
        join,
    })
}
