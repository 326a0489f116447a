//! # Environment Persistence
//!
//! Worker-wide variable store that deliberately survives across requests: a value
//! set while serving request N is visible to request N+1 unless it is unset in
//! between. Nothing is written to disk and the real process environment is never
//! mutated, so concurrent workers in one process cannot race on `setenv`.
//!
//! Setting a variable to `""` is distinct from unsetting it: `get` returns
//! `Some("")` for the former and `None` for the latter.

use crate::error::EnvError;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

/// Marker variable present in every worker's environment.
pub const WORKER_MARKER: &str = "BRRTW_WORKER";

fn validate_name(name: &str) -> Result<(), EnvError> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return Err(EnvError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Process-lifetime environment for one worker.
#[derive(Debug, Default)]
pub struct EnvStore {
    vars: RwLock<HashMap<String, String>>,
    tainted: AtomicBool,
}

impl EnvStore {
    /// Empty store (no marker, nothing inherited).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded from the process environment at worker start.
    ///
    /// Variables whose name or value is not valid Unicode are skipped.
    #[must_use]
    pub fn from_process() -> Self {
        let vars: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        debug!(inherited = vars.len(), "Seeded worker environment from process");
        Self {
            vars: RwLock::new(vars),
            tainted: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, String>> {
        self.vars.read().unwrap_or_else(|poisoned| {
            self.mark_tainted();
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, String>> {
        self.vars.write().unwrap_or_else(|poisoned| {
            self.mark_tainted();
            poisoned.into_inner()
        })
    }

    fn mark_tainted(&self) {
        if !self.tainted.swap(true, Ordering::SeqCst) {
            error!("Environment store lock poisoned - variables no longer trusted");
        }
    }

    pub fn set(&self, name: &str, value: &str) -> Result<(), EnvError> {
        validate_name(name)?;
        if value.contains('\0') {
            return Err(EnvError::InvalidValue(name.to_string()));
        }
        self.write().insert(name.to_string(), value.to_string());
        Ok(())
    }

    /// Remove `name`. Unsetting an unknown name is a no-op; returns whether it existed.
    pub fn unset(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.read().get(name).cloned()
    }

    /// `putenv`-style mutation: `"K=V"` sets, a bare `"K"` unsets.
    pub fn put(&self, setting: &str) -> Result<(), EnvError> {
        match setting.split_once('=') {
            Some((name, value)) => self.set(name, value),
            None => {
                validate_name(setting)?;
                self.unset(setting);
                Ok(())
            }
        }
    }

    /// Apply several variables at once (worker start).
    pub fn extend<I, K, V>(&self, vars: I) -> Result<(), EnvError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (k, v) in vars {
            self.set(k.as_ref(), v.as_ref())?;
        }
        Ok(())
    }

    /// Every variable, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set once a lock holder panicked; the worker must be recycled.
    #[must_use]
    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_unset() {
        let env = EnvStore::new();
        env.set("KEY", "value1").unwrap();
        assert_eq!(env.get("KEY").as_deref(), Some("value1"));
        assert!(env.unset("KEY"));
        assert_eq!(env.get("KEY"), None);
    }

    #[test]
    fn test_empty_is_not_unset() {
        let env = EnvStore::new();
        env.set("EMPTY", "").unwrap();
        assert_eq!(env.get("EMPTY").as_deref(), Some(""));
        env.unset("EMPTY");
        assert_eq!(env.get("EMPTY"), None);
    }

    #[test]
    fn test_unset_unknown_is_noop() {
        let env = EnvStore::new();
        assert!(!env.unset("NEVER_SET"));
        assert!(env.is_empty());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let env = EnvStore::new();
        assert!(matches!(env.set("", "x"), Err(EnvError::InvalidName(_))));
        assert!(matches!(env.set("A=B", "x"), Err(EnvError::InvalidName(_))));
        assert!(matches!(
            env.set("OK", "nul\0"),
            Err(EnvError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_put_setting() {
        let env = EnvStore::new();
        env.put("A=1").unwrap();
        env.put("B=x=y").unwrap();
        env.put("C=").unwrap();
        assert_eq!(env.get("A").as_deref(), Some("1"));
        assert_eq!(env.get("B").as_deref(), Some("x=y"));
        assert_eq!(env.get("C").as_deref(), Some(""));
        env.put("A").unwrap();
        assert_eq!(env.get("A"), None);
        assert!(env.put("=oops").is_err());
    }

    #[test]
    fn test_snapshot_sorted() {
        let env = EnvStore::new();
        env.extend([("B", "2"), ("A", "1")]).unwrap();
        let keys: Vec<String> = env.snapshot().into_keys().collect();
        assert_eq!(keys, vec!["A".to_string(), "B".to_string()]);
    }
}
