use crate::error::StorageError;
use crate::retry::{RetryFailure, RetryPolicy};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Object storage for rendered question images: store bytes, get back a
/// stable URL to put in the item's `src`.
pub trait AssetStorage: Send + Sync {
    fn store(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError>;

    fn name(&self) -> &str;
}

impl<S: AssetStorage + ?Sized> AssetStorage for Arc<S> {
    fn store(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError> {
        (**self).store(name, bytes, content_type)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

fn check_object_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
        && !name.starts_with('/');
    if valid {
        Ok(())
    } else {
        Err(StorageError::Rejected {
            name: name.to_string(),
            reason: "object names must be relative and URL-safe".to_string(),
        })
    }
}

/// Writes objects under a local directory.
pub struct FileStorage {
    root: PathBuf,
    /// URL prefix objects are served from; `file://` URLs when absent
    base_url: Option<String>,
}

impl FileStorage {
    pub fn new(root: impl AsRef<Path>, base_url: Option<String>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }
}

impl AssetStorage for FileStorage {
    fn store(&self, name: &str, bytes: &[u8], _content_type: &str) -> Result<String, StorageError> {
        check_object_name(name)?;
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        Ok(match &self.base_url {
            Some(base) => format!("{}/{}", base, name),
            None => format!("file://{}", path.display()),
        })
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// PUTs objects to `{base_url}/{name}`.
pub struct HttpStorage {
    agent: ureq::Agent,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpStorage {
    pub fn new(base_url: &str, auth_token: Option<String>, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }
}

impl AssetStorage for HttpStorage {
    fn store(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError> {
        check_object_name(name)?;
        let url = format!("{}/{}", self.base_url, name);
        let mut request = self.agent.put(&url).set("Content-Type", content_type);
        if let Some(token) = &self.auth_token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }

        match request.send_bytes(bytes) {
            Ok(response) => Ok(response.header("Location").map(str::to_string).unwrap_or(url)),
            Err(ureq::Error::Status(code, response)) if code == 429 || code >= 500 => Err(StorageError::Transient(
                format!("{} returned {} {}", url, code, response.status_text()),
            )),
            Err(ureq::Error::Status(code, response)) => Err(StorageError::Rejected {
                name: name.to_string(),
                reason: format!("{} {}", code, response.status_text()),
            }),
            Err(ureq::Error::Transport(transport)) => Err(StorageError::Transient(transport.to_string())),
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Keeps objects in memory. Failures can be queued up front to exercise retry paths.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    queued_failures: Mutex<VecDeque<StorageError>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `store` calls fail with these errors, in order.
    pub fn fail_with(&self, errors: impl IntoIterator<Item = StorageError>) {
        if let Ok(mut queue) = self.queued_failures.lock() {
            queue.extend(errors);
        }
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().ok()?.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl AssetStorage for MemoryStorage {
    fn store(&self, name: &str, bytes: &[u8], _content_type: &str) -> Result<String, StorageError> {
        check_object_name(name)?;
        if let Some(error) = self.queued_failures.lock().ok().and_then(|mut q| q.pop_front()) {
            return Err(error);
        }
        self.objects
            .lock()
            .map_err(|_| StorageError::Transient("memory storage lock poisoned".to_string()))?
            .insert(name.to_string(), bytes.to_vec());
        Ok(format!("memory://{}", name))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Retries transient failures of the wrapped storage with exponential backoff.
pub struct RetryingStorage<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: AssetStorage> RetryingStorage<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: AssetStorage> AssetStorage for RetryingStorage<S> {
    fn store(&self, name: &str, bytes: &[u8], content_type: &str) -> Result<String, StorageError> {
        let what = format!("storing {}", name);
        self.policy
            .run(&what, || self.inner.store(name, bytes, content_type), StorageError::is_transient)
            .map_err(|failure| match failure {
                RetryFailure::Permanent(e) => e,
                RetryFailure::Exhausted { attempts, last } => StorageError::RetriesExhausted {
                    attempts,
                    last: last.to_string(),
                },
            })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_uses_base_url_when_given() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), Some("https://cdn.example.org/items/".into())).unwrap();
        let url = storage.store("Q1_img1.png", b"png", "image/png").unwrap();
        assert_eq!(url, "https://cdn.example.org/items/Q1_img1.png");
        assert!(dir.path().join("Q1_img1.png").exists());
    }

    #[test]
    fn unsafe_names_are_rejected() {
        let storage = MemoryStorage::new();
        let err = storage.store("../escape.png", b"x", "image/png").unwrap_err();
        assert!(matches!(err, StorageError::Rejected { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn retrying_storage_recovers_from_transient_failures() {
        let memory = MemoryStorage::new();
        memory.fail_with([
            StorageError::Transient("503".into()),
            StorageError::Transient("503".into()),
        ]);
        let storage = RetryingStorage::new(memory, RetryPolicy::immediate(3));
        let url = storage.store("Q2_altA.png", b"png", "image/png").unwrap();
        assert_eq!(url, "memory://Q2_altA.png");
        assert_eq!(storage.inner().names(), vec!["Q2_altA.png".to_string()]);
    }

    #[test]
    fn retrying_storage_gives_up_after_max_attempts() {
        let memory = MemoryStorage::new();
        memory.fail_with((0..5).map(|_| StorageError::Transient("down".into())));
        let storage = RetryingStorage::new(memory, RetryPolicy::immediate(3));
        let err = storage.store("Q3_img1.png", b"png", "image/png").unwrap_err();
        assert!(matches!(err, StorageError::RetriesExhausted { attempts: 3, .. }));
    }

    #[test]
    fn rejection_is_not_retried() {
        let memory = MemoryStorage::new();
        memory.fail_with([
            StorageError::Rejected { name: "Q4_img1.png".into(), reason: "too large".into() },
        ]);
        let storage = RetryingStorage::new(memory, RetryPolicy::immediate(3));
        let err = storage.store("Q4_img1.png", b"png", "image/png").unwrap_err();
        assert!(matches!(err, StorageError::Rejected { .. }));
        // queue drained by the single attempt
        assert!(storage.store("Q4_img1.png", b"png", "image/png").is_ok());
    }
}
