use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::result::TaskResult;

/// The error type a task body may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A type-erased task argument. Build a list with [`task_args!`] and read
/// entries back with [`arg`].
pub type TaskArg = Box<dyn Any + Send + Sync>;

/// A unit of work executed by the pool.
///
/// The trait is implemented for every closure and function of the matching
/// signature, so plain functions need no adapter type:
///
/// ```ignore
/// fn double(_: &TaskContext, args: &[TaskArg]) -> Result<u64, BoxError> {
///   Ok(arg::<u64>(args, 0).copied().unwrap_or(0) * 2)
/// }
/// pool.submit(TaskContext::new(), double, task_args![21u64])?;
/// ```
pub trait Task<T>: Send + Sync {
  fn run(&self, ctx: &TaskContext, args: &[TaskArg]) -> Result<T, BoxError>;
}

impl<T, F> Task<T> for F
where
  F: Fn(&TaskContext, &[TaskArg]) -> Result<T, BoxError> + Send + Sync,
{
  fn run(&self, ctx: &TaskContext, args: &[TaskArg]) -> Result<T, BoxError> {
    self(ctx, args)
  }
}

/// A cancellation flag handed to every task body.
///
/// The pool only carries the context from the submitter to the task; it
/// never trips or inspects it, and it never interrupts a running task. A
/// long-running task should poll [`TaskContext::is_cancelled`] and return
/// early once it reads `true`.
#[derive(Clone, Debug, Default)]
pub struct TaskContext {
  cancelled: Arc<AtomicBool>,
}

impl TaskContext {
  pub fn new() -> Self {
    Self::default()
  }

  /// Asks the task to stop at its next cancellation check.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Release);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
  }
}

/// Reads the argument at `index` as a `V`, or `None` if the position is
/// out of range or holds a different type.
pub fn arg<V: Any>(args: &[TaskArg], index: usize) -> Option<&V> {
  args.get(index).and_then(|a| a.downcast_ref::<V>())
}

/// Builds an argument vector for `submit`, boxing each value as a
/// [`TaskArg`].
#[macro_export]
macro_rules! task_args {
  () => {
    ::std::vec::Vec::<$crate::TaskArg>::new()
  };
  ($($value:expr),+ $(,)?) => {
    ::std::vec![$(::std::boxed::Box::new($value) as $crate::TaskArg),+]
  };
}

/// A queued unit of work: the task, its context and arguments, and the
/// pre-allocated result handle when the submitter asked for one.
pub(crate) struct TaskEntry<T: Send + 'static> {
  pub(crate) ctx: TaskContext,
  pub(crate) task: Arc<dyn Task<T>>,
  pub(crate) args: Arc<[TaskArg]>,
  pub(crate) result: Option<TaskResult<T>>,
}

impl<T: Send + 'static> fmt::Debug for TaskEntry<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskEntry")
      .field("args", &self.args.len())
      .field("has_result", &self.result.is_some())
      .finish_non_exhaustive()
  }
}
