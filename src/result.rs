use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::sync::WaitGroup;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::TaskError;
use crate::recycle::WeakObjectPool;
use crate::task::{Task, TaskArg};

const STAGE_CREATED: u8 = 0;
const STAGE_SCHEDULED: u8 = 1;
const STAGE_DONE: u8 = 2;

/// A registered completion callback. Taken out of its slot exactly once,
/// by whichever side fires it.
pub(crate) type Callback<T> = Box<dyn FnOnce(&TaskResult<T>) + Send>;

/// The shared result cell behind every `TaskResult` handle.
///
/// The guarded body owns the authoritative stage; the atomics mirror it
/// for the non-blocking checks.
pub(crate) struct ResultCore<T: Send + 'static> {
  stage: AtomicU8,
  wid: AtomicU64,
  body: Mutex<ResultBody<T>>,
  cv: Condvar,
  callback: Mutex<Option<Callback<T>>>,
}

struct ResultBody<T: Send + 'static> {
  stage: u8,
  task: Option<Arc<dyn Task<T>>>,
  args: Arc<[TaskArg]>,
  start: Option<Instant>,
  cost: Duration,
  outcome: Option<Result<T, TaskError>>,
}

impl<T: Send + 'static> ResultCore<T> {
  pub(crate) fn new() -> Self {
    Self {
      stage: AtomicU8::new(STAGE_CREATED),
      wid: AtomicU64::new(0),
      body: Mutex::new(ResultBody {
        stage: STAGE_CREATED,
        task: None,
        args: Arc::from(Vec::new()),
        start: None,
        cost: Duration::ZERO,
        outcome: None,
      }),
      cv: Condvar::new(),
      callback: Mutex::new(None),
    }
  }

  /// Binds a fresh or recycled cell to the task it will carry.
  pub(crate) fn prepare(&self, task: Arc<dyn Task<T>>, args: Arc<[TaskArg]>) {
    let mut body = self.body.lock();
    debug_assert_eq!(body.stage, STAGE_CREATED);
    body.task = Some(task);
    body.args = args;
  }

  /// Returns a completed cell to its created state so it can carry a new
  /// task. The caller must hold the only reference to the cell.
  pub(crate) fn reset(&mut self) {
    *self.stage.get_mut() = STAGE_CREATED;
    *self.wid.get_mut() = 0;
    let body = self.body.get_mut();
    body.stage = STAGE_CREATED;
    body.task = None;
    body.args = Arc::from(Vec::new());
    body.start = None;
    body.cost = Duration::ZERO;
    body.outcome = None;
    *self.callback.get_mut() = None;
  }
}

/// A handle to the eventual outcome of a submitted task.
///
/// Handles are clonable and every clone observes the same result cell. A
/// result moves through three stages, each exactly once: created, then
/// scheduled (a worker has picked it up, its id is recorded), then done
/// (outcome recorded, registered callback fired). Waits block on the
/// stage the caller asks for; the non-blocking checks read an atomic
/// snapshot.
pub struct TaskResult<T: Send + 'static> {
  core: Arc<ResultCore<T>>,
  origin: WeakObjectPool<Arc<ResultCore<T>>>,
}

impl<T: Send + 'static> Clone for TaskResult<T> {
  fn clone(&self) -> Self {
    Self {
      core: self.core.clone(),
      origin: self.origin.clone(),
    }
  }
}

impl<T: Send + 'static> fmt::Debug for TaskResult<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let stage = match self.core.stage.load(Ordering::Acquire) {
      STAGE_CREATED => "created",
      STAGE_SCHEDULED => "scheduled",
      _ => "done",
    };
    f.debug_struct("TaskResult")
      .field("stage", &stage)
      .field("worker_id", &self.worker_id())
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static> TaskResult<T> {
  pub(crate) fn new(
    core: Arc<ResultCore<T>>,
    origin: WeakObjectPool<Arc<ResultCore<T>>>,
  ) -> Self {
    Self { core, origin }
  }

  /// Non-blocking completion check.
  pub fn is_done(&self) -> bool {
    self.core.stage.load(Ordering::Acquire) == STAGE_DONE
  }

  /// Non-blocking check that a worker has picked the task up.
  pub fn is_scheduled(&self) -> bool {
    self.core.stage.load(Ordering::Acquire) >= STAGE_SCHEDULED
  }

  /// The id of the worker executing this task, or 0 while unassigned.
  pub fn worker_id(&self) -> u64 {
    self.core.wid.load(Ordering::Acquire)
  }

  /// `true` once the task has completed with a value.
  pub fn is_success(&self) -> bool {
    if !self.is_done() {
      return false;
    }
    let body = self.core.body.lock();
    matches!(body.outcome, Some(Ok(_)))
  }

  /// Blocks until a worker has been assigned.
  pub fn wait_scheduled(&self) {
    let mut body = self.core.body.lock();
    while body.stage == STAGE_CREATED {
      self.core.cv.wait(&mut body);
    }
  }

  /// Blocks until the task has completed.
  pub fn wait(&self) {
    let _ = self.wait_done();
  }

  /// Blocks until the task has completed or `timeout` elapses, returning
  /// whether it completed. A task abandoned in the submission queue at
  /// shutdown never completes; this is the escape hatch for waiting on it.
  pub fn wait_timeout(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut body = self.core.body.lock();
    while body.stage != STAGE_DONE {
      if self.core.cv.wait_until(&mut body, deadline).timed_out() {
        return body.stage == STAGE_DONE;
      }
    }
    true
  }

  /// Waits for completion, then returns the task's value. `None` when the
  /// task failed or panicked.
  pub fn result(&self) -> Option<T>
  where
    T: Clone,
  {
    let body = self.wait_done();
    match &body.outcome {
      Some(Ok(value)) => Some(value.clone()),
      _ => None,
    }
  }

  /// Waits for completion, then returns the task's error. `None` when the
  /// task succeeded.
  pub fn error(&self) -> Option<TaskError> {
    let body = self.wait_done();
    match &body.outcome {
      Some(Err(err)) => Some(err.clone()),
      _ => None,
    }
  }

  /// Waits for completion, then returns how long the task body ran.
  pub fn duration(&self) -> Duration {
    self.wait_done().cost
  }

  /// When execution began, or `None` while unscheduled.
  pub fn start_time(&self) -> Option<Instant> {
    self.core.body.lock().start
  }

  /// The task this result belongs to, once bound by `submit`.
  pub fn task(&self) -> Option<Arc<dyn Task<T>>> {
    self.core.body.lock().task.clone()
  }

  /// The arguments the task was submitted with.
  pub fn args(&self) -> Arc<[TaskArg]> {
    self.core.body.lock().args.clone()
  }

  /// Registers a completion callback, replacing any callback registered
  /// earlier.
  ///
  /// If the task is already done the callback runs immediately on the
  /// calling thread; the done check happens under the slot lock but the
  /// call itself does not, so a callback may safely touch this handle.
  /// Otherwise it fires exactly once, on the worker thread that completes
  /// the task.
  pub fn set_callback(&self, callback: impl FnOnce(&TaskResult<T>) + Send + 'static) {
    let mut slot = self.core.callback.lock();
    if self.is_done() {
      drop(slot);
      callback(self);
      return;
    }
    *slot = Some(Box::new(callback));
  }

  /// Hands the result cell back to the recycling pool it came from, for
  /// reuse by a later `submit`.
  ///
  /// Releasing is optional; dropping the handle simply forgoes reuse. The
  /// cell is recycled only when this is the last handle to it, so a
  /// release racing a clone held elsewhere degrades to a plain drop.
  pub fn release(self) {
    let TaskResult { core, origin } = self;
    if let Some(pool) = origin.upgrade() {
      pool.recycle_value(core);
    }
  }

  /// Records the executing worker and the start timestamp, and fires the
  /// "scheduled" signal. The worker id is stored first so that any
  /// observer of the scheduled stage also sees it.
  pub(crate) fn mark_scheduled(&self, worker_id: u64) {
    self.core.wid.store(worker_id, Ordering::Release);
    {
      let mut body = self.core.body.lock();
      debug_assert_eq!(body.stage, STAGE_CREATED);
      body.stage = STAGE_SCHEDULED;
      body.start = Some(Instant::now());
    }
    self.core.stage.store(STAGE_SCHEDULED, Ordering::Release);
    self.core.cv.notify_all();
  }

  /// Records the outcome, fires the "done" signal, and takes the
  /// registered callback for the caller to invoke.
  pub(crate) fn complete(&self, outcome: Result<T, TaskError>) -> Option<Callback<T>> {
    {
      let mut body = self.core.body.lock();
      debug_assert_ne!(body.stage, STAGE_DONE, "result completed twice");
      if body.stage == STAGE_DONE {
        return None;
      }
      body.cost = body.start.map(|start| start.elapsed()).unwrap_or_default();
      body.outcome = Some(outcome);
      body.stage = STAGE_DONE;
    }
    self.core.stage.store(STAGE_DONE, Ordering::Release);
    self.core.cv.notify_all();
    self.core.callback.lock().take()
  }

  fn wait_done(&self) -> MutexGuard<'_, ResultBody<T>> {
    let mut body = self.core.body.lock();
    while body.stage != STAGE_DONE {
      self.core.cv.wait(&mut body);
    }
    body
  }

  /// Wraps the currently registered callback so `next` also fires at
  /// completion; fires `next` immediately if already done.
  fn chain_callback(&self, next: Callback<T>) {
    let mut slot = self.core.callback.lock();
    if self.is_done() {
      drop(slot);
      next(self);
      return;
    }
    let previous = slot.take();
    *slot = Some(Box::new(move |result: &TaskResult<T>| {
      if let Some(previous) = previous {
        previous(result);
      }
      next(result);
    }));
  }
}

/// Blocks until every result in `results` is done.
///
/// Each result's completion path drops one guard and the call returns
/// once the last guard is gone, so no assumption is made about the order
/// in which the results complete. Callbacks already registered on the
/// results still fire, before their guard is dropped.
pub fn wait_all<T: Send + 'static>(results: &[TaskResult<T>]) {
  let wg = WaitGroup::new();
  for result in results {
    let guard = wg.clone();
    result.chain_callback(Box::new(move |_| drop(guard)));
  }
  wg.wait();
}
