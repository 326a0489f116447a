use super::core::Resource;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Temporary file holding an uploaded request body part.
///
/// The file is deleted on release. A handler that already removed or moved the
/// file gets a `NotFound`, which the finalizer treats as released.
#[derive(Debug)]
pub struct UploadTempFile {
    key: String,
    path: PathBuf,
    file: Option<NamedTempFile>,
}

impl UploadTempFile {
    /// Create a temp file in `dir` (system temp dir when `None`) containing `contents`.
    pub fn create_in(dir: Option<&Path>, contents: &[u8]) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("brrtw-upload-");
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(contents)?;
        file.flush()?;
        let path = file.path().to_path_buf();
        Ok(Self {
            key: format!("upload:{}", path.display()),
            path,
            file: Some(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Resource for UploadTempFile {
    fn key(&self) -> &str {
        &self.key
    }

    fn release(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => file.close(),
            None => Ok(()),
        }
    }
}

/// Arbitrary owned handle (file, socket, session) closed by dropping it.
pub struct OwnedHandle<T: Send> {
    key: String,
    inner: Option<T>,
}

impl<T: Send> OwnedHandle<T> {
    pub fn new(key: impl Into<String>, inner: T) -> Self {
        Self {
            key: key.into(),
            inner: Some(inner),
        }
    }
}

impl<T: Send> Resource for OwnedHandle<T> {
    fn key(&self) -> &str {
        &self.key
    }

    fn release(&mut self) -> io::Result<()> {
        drop(self.inner.take());
        Ok(())
    }
}

type DeferredFn = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// Cleanup closure run during finalization.
pub struct Deferred {
    key: String,
    action: Option<DeferredFn>,
}

impl Deferred {
    pub fn new<F>(key: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        Self {
            key: key.into(),
            action: Some(Box::new(action)),
        }
    }
}

impl Resource for Deferred {
    fn key(&self) -> &str {
        &self.key
    }

    fn release(&mut self) -> io::Result<()> {
        match self.action.take() {
            Some(action) => action(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_upload_temp_file_deleted_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut upload = UploadTempFile::create_in(Some(dir.path()), b"payload").unwrap();
        let path = upload.path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
        upload.release().unwrap();
        assert!(!path.exists());
        // second release is a no-op
        upload.release().unwrap();
    }

    #[test]
    fn test_upload_removed_by_handler_reports_not_found() {
        let mut upload = UploadTempFile::create_in(None, b"x").unwrap();
        std::fs::remove_file(upload.path()).unwrap();
        let err = upload.release().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_deferred_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut deferred = Deferred::new("session", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        deferred.release().unwrap();
        deferred.release().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_owned_handle_drops_inner() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut handle = OwnedHandle::new("stream", Guard(Arc::clone(&dropped)));
        handle.release().unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
