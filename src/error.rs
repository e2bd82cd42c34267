use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// The closed set of failure kinds surfaced by the queue, lock and worker layers.
///
/// Lock contention is deliberately absent: losing a claim is an ordinary
/// `Ok(false)` from [`crate::lock::LockManager::try_acquire`].
#[derive(Error, Debug)]
pub enum SwarmError {
    /// Rejected input: bad CLI arguments, duplicate ids, unknown dependencies,
    /// dependency cycles, out-of-range budgets or worker counts, bad config.
    #[error("validation error: {0}")]
    Validation(String),

    /// The backing filesystem could not be used (permission denied, disk full, ...).
    #[error("store unavailable at '{}': {source}", path.display())]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),
}

impl SwarmError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SwarmError::Validation(msg.into())
    }

    pub fn store(path: &Path, source: std::io::Error) -> Self {
        SwarmError::StoreUnavailable {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, SwarmError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_store_errors_are_distinct_kinds() {
        let dup = SwarmError::validation("task 't1' already exists");
        let io = SwarmError::store(
            Path::new("/nope/queue.json"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );

        assert!(dup.is_validation());
        assert!(!io.is_validation());
        assert_eq!(
            dup.to_string(),
            "validation error: task 't1' already exists"
        );
        assert!(io.to_string().contains("/nope/queue.json"), "{io}");
    }

    #[test]
    fn timeout_reports_duration() {
        let err = SwarmError::ExecutionTimeout(Duration::from_secs(600));
        assert_eq!(err.to_string(), "execution timed out after 600s");
        let err = SwarmError::ExecutionTimeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "execution timed out after 250ms");
    }
}
