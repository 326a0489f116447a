#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

pub mod workers {
    use brrtworker::cache::Clock;
    use brrtworker::{UnitSender, Worker, WorkerConfig, WorkerContext};
    use std::sync::Arc;

    /// Config that does not read the process environment.
    pub fn test_config() -> WorkerConfig {
        WorkerConfig {
            inherit_process_env: false,
            ..WorkerConfig::default()
        }
    }

    pub fn new_worker() -> (Worker, UnitSender) {
        Worker::new(Arc::new(WorkerContext::new()), test_config())
    }

    pub fn new_worker_with(config: WorkerConfig) -> (Worker, UnitSender) {
        Worker::new(Arc::new(WorkerContext::new()), config)
    }

    pub fn new_worker_with_clock(clock: Arc<dyn Clock>) -> (Worker, UnitSender) {
        Worker::new(Arc::new(WorkerContext::with_clock(clock)), test_config())
    }
}

pub mod resources {
    use brrtworker::finalizer::Resource;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Resource that counts its releases and records the release order.
    pub struct Counted {
        pub key: String,
        pub releases: Arc<AtomicUsize>,
        pub order: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl Counted {
        pub fn boxed(key: &str, releases: &Arc<AtomicUsize>) -> Box<dyn Resource> {
            Box::new(Self {
                key: key.to_string(),
                releases: Arc::clone(releases),
                order: None,
            })
        }

        pub fn ordered(
            key: &str,
            releases: &Arc<AtomicUsize>,
            order: &Arc<Mutex<Vec<String>>>,
        ) -> Box<dyn Resource> {
            Box::new(Self {
                key: key.to_string(),
                releases: Arc::clone(releases),
                order: Some(Arc::clone(order)),
            })
        }
    }

    impl Resource for Counted {
        fn key(&self) -> &str {
            &self.key
        }

        fn release(&mut self) -> io::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            if let Some(order) = &self.order {
                order.lock().unwrap().push(self.key.clone());
            }
            Ok(())
        }
    }
}

pub mod test_runtime {
    use std::sync::Once;

    /// Ensures May coroutines are configured only once
    static MAY_INIT: Once = Once::new();

    pub fn setup_may_runtime() {
        MAY_INIT.call_once(|| {
            may::config().set_stack_size(0x8000);
        });
    }
}

pub mod temp_files {
    use std::path::PathBuf;

    /// Write `content` to a fresh YAML file inside `dir`.
    pub fn write_yaml(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}
