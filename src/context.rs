//! # Worker Context
//!
//! [`WorkerContext`] is the one piece of state that outlives every request a
//! worker serves. It owns the [`ScopedCache`], the [`EnvStore`], the request
//! counter and the worker's statistics, and is passed explicitly to the
//! dispatch loop and through it to every handler invocation. There is no
//! process-global instance: tests construct as many independent contexts as
//! they need.

use crate::cache::{Clock, ScopedCache};
use crate::config::WorkerConfig;
use crate::environ::{EnvStore, WORKER_MARKER};
use crate::error::EnvError;
use crate::ids::WorkerId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Counters for one worker's lifetime.
#[derive(Debug, Default)]
pub struct WorkerStats {
    requests_served: AtomicU64,
    handler_failures: AtomicU64,
    handler_panics: AtomicU64,
    suspensions: AtomicU64,
    cancellations: AtomicU64,
    early_finishes: AtomicU64,
    resources_released: AtomicU64,
    malformed_units: AtomicU64,
}

impl WorkerStats {
    pub fn record_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A panic is also counted as a failure.
    pub fn record_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
        self.record_failure();
    }

    pub fn record_suspension(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_early_finish(&self) {
        self.early_finishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_released(&self, count: usize) {
        self.resources_released
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_units.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    pub fn get_handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    pub fn get_handler_panics(&self) -> u64 {
        self.handler_panics.load(Ordering::Relaxed)
    }

    pub fn get_suspensions(&self) -> u64 {
        self.suspensions.load(Ordering::Relaxed)
    }

    pub fn get_cancellations(&self) -> u64 {
        self.cancellations.load(Ordering::Relaxed)
    }

    pub fn get_early_finishes(&self) -> u64 {
        self.early_finishes.load(Ordering::Relaxed)
    }

    pub fn get_resources_released(&self) -> u64 {
        self.resources_released.load(Ordering::Relaxed)
    }

    pub fn get_malformed_units(&self) -> u64 {
        self.malformed_units.load(Ordering::Relaxed)
    }
}

/// State shared by every request one worker serves.
#[derive(Debug)]
pub struct WorkerContext {
    id: WorkerId,
    cache: ScopedCache,
    env: EnvStore,
    requests: AtomicU64,
    stats: WorkerStats,
    shutdown: AtomicBool,
}

impl WorkerContext {
    /// Context with an empty environment (plus the worker marker) and an unbounded cache.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(ScopedCache::default(), EnvStore::new())
    }

    /// Context built from configuration: cache bound, inherited and injected variables.
    pub fn from_config(config: &WorkerConfig) -> Result<Self, EnvError> {
        let env = if config.inherit_process_env {
            EnvStore::from_process()
        } else {
            EnvStore::new()
        };
        env.extend(&config.env)?;
        let context = Self::with_parts(ScopedCache::new(config.cache.max_entries), env);
        info!(
            worker = %context.id,
            name = %config.name,
            env_vars = context.env.len(),
            cache_bound = config.cache.max_entries,
            "Worker context created"
        );
        Ok(context)
    }

    /// Context whose cache reads time from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_parts(ScopedCache::with_clock(0, clock), EnvStore::new())
    }

    #[must_use]
    pub fn with_parts(cache: ScopedCache, env: EnvStore) -> Self {
        if let Err(e) = env.set(WORKER_MARKER, "1") {
            warn!(error = %e, "Could not set worker marker variable");
        }
        Self {
            id: WorkerId::next(),
            cache,
            env,
            requests: AtomicU64::new(0),
            stats: WorkerStats::default(),
            shutdown: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn cache(&self) -> &ScopedCache {
        &self.cache
    }

    pub fn env(&self) -> &EnvStore {
        &self.env
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Requests admitted so far (monotonic).
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Bump the request counter; returns the new sequence number (1-based).
    pub(crate) fn next_request(&self) -> u64 {
        self.requests.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Ask the dispatch loop to stop before admitting its next unit.
    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!(worker = %self.id, "Worker shutdown requested");
        }
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Whether the shared stores can still be trusted.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self.cache.is_tainted() && !self.env.is_tainted()
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}
