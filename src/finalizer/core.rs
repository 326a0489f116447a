use crate::ids::RequestId;
use std::collections::HashSet;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, warn};

/// A per-request external handle that must be released when the request ends.
pub trait Resource: Send {
    /// Identity used to collapse repeated registration of the same handle.
    fn key(&self) -> &str;

    /// Release the handle. `NotFound` means it was already closed and counts as released.
    fn release(&mut self) -> io::Result<()>;
}

/// Outcome of one finalization pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeReport {
    /// Resources released (including ones found already closed)
    pub released: usize,
    /// Releases that returned an error
    pub failed: usize,
    /// Releases that panicked, leaving the handle in an unknown state
    pub panicked: usize,
}

impl FinalizeReport {
    /// A panicking release leaves shared state undefined.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.panicked > 0
    }

    fn record(&mut self, outcome: Released) {
        match outcome {
            Released::Ok => self.released += 1,
            Released::Failed => self.failed += 1,
            Released::Panicked => self.panicked += 1,
        }
    }
}

/// Registry of per-request resources, released exactly once in reverse order.
///
/// Dropping a finalizer that never ran releases everything, so teardown of a
/// suspended or aborted request still cleans up.
pub struct Finalizer {
    request_id: RequestId,
    entries: Vec<Box<dyn Resource>>,
    keys: HashSet<String>,
    ran: bool,
    late: FinalizeReport,
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer")
            .field("request_id", &self.request_id)
            .field("pending", &self.entries.len())
            .field("ran", &self.ran)
            .finish()
    }
}

impl Finalizer {
    #[must_use]
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            entries: Vec::new(),
            keys: HashSet::new(),
            ran: false,
            late: FinalizeReport::default(),
        }
    }

    /// Track `resource` for release at the end of the request.
    ///
    /// Returns `false` when a resource with the same key is already tracked (the
    /// duplicate is dropped unreleased) or when finalization already ran (the
    /// resource is released immediately and the outcome lands in
    /// [`Finalizer::late_report`]).
    pub fn register(&mut self, mut resource: Box<dyn Resource>) -> bool {
        if self.ran {
            warn!(
                request_id = %self.request_id,
                resource = %resource.key(),
                "Resource registered after finalization - releasing immediately"
            );
            let outcome = release_one(self.request_id, resource.as_mut());
            self.late.record(outcome);
            return false;
        }
        if !self.keys.insert(resource.key().to_string()) {
            debug!(
                request_id = %self.request_id,
                resource = %resource.key(),
                "Ignoring duplicate resource registration"
            );
            return false;
        }
        self.entries.push(resource);
        true
    }

    /// Release everything, newest first. Only the first call does any work.
    pub fn run_all(&mut self) -> FinalizeReport {
        let mut report = FinalizeReport::default();
        if self.ran {
            return report;
        }
        self.ran = true;

        while let Some(mut resource) = self.entries.pop() {
            report.record(release_one(self.request_id, resource.as_mut()));
        }
        self.keys.clear();

        debug!(
            request_id = %self.request_id,
            released = report.released,
            failed = report.failed,
            panicked = report.panicked,
            "Request resources finalized"
        );
        report
    }

    /// Releases of resources registered after [`Finalizer::run_all`].
    #[must_use]
    pub fn late_report(&self) -> FinalizeReport {
        self.late
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.ran
    }

    /// Resources waiting for release.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if !self.ran && !self.entries.is_empty() {
            warn!(
                request_id = %self.request_id,
                pending = self.entries.len(),
                "Finalizer dropped before running - releasing resources"
            );
            self.run_all();
        }
    }
}

enum Released {
    Ok,
    Failed,
    Panicked,
}

fn release_one(request_id: RequestId, resource: &mut dyn Resource) -> Released {
    let key = resource.key().to_string();
    match catch_unwind(AssertUnwindSafe(|| resource.release())) {
        Ok(Ok(())) => Released::Ok,
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => {
            debug!(request_id = %request_id, resource = %key, "Resource already closed");
            Released::Ok
        }
        Ok(Err(e)) => {
            warn!(
                request_id = %request_id,
                resource = %key,
                error = %e,
                "Resource release failed"
            );
            Released::Failed
        }
        Err(panic) => {
            error!(
                request_id = %request_id,
                resource = %key,
                panic_message = ?panic,
                "Resource release panicked - CRITICAL"
            );
            Released::Panicked
        }
    }
}
