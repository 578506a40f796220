use std::error::Error;
use std::sync::Arc;

use thiserror::Error;

/// Errors returned by pool construction and task submission.
#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
  #[error("Invalid pool configuration: {0}")]
  Config(&'static str),

  #[error("Failed to spawn a pool thread: {0}")]
  Spawn(String),

  #[error("Pool is shutting down or already stopped, cannot accept new tasks")]
  ShuttingDown,
}

/// The failure outcome of a single task, stored on its `TaskResult`.
///
/// Clones share the underlying cause, so every handle to the same result
/// observes the same error.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
  /// The task body returned an error. The pool never interprets it.
  #[error("Task failed: {0}")]
  Failed(Arc<dyn Error + Send + Sync>),

  /// The task body panicked; the payload message was captured by the
  /// worker that contained the unwind.
  #[error("Task panicked: {0}")]
  Panicked(String),
}

impl TaskError {
  /// Returns `true` if this error was produced by panic containment
  /// rather than a normal error return.
  pub fn is_panic(&self) -> bool {
    matches!(self, TaskError::Panicked(_))
  }
}
