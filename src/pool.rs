use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use crossbeam_utils::sync::WaitGroup;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::error::PoolError;
use crate::recycle::ObjectPool;
use crate::result::{ResultCore, TaskResult};
use crate::task::{Task, TaskArg, TaskContext, TaskEntry};
use crate::worker::Worker;

pub(crate) type PanicHandler<T> = Arc<dyn Fn(&TaskResult<T>) + Send + Sync>;

/// State shared by the pool handle, the dispatcher and every worker.
pub(crate) struct PoolShared<T: Send + 'static> {
  pub(crate) name: String,
  pub(crate) workers: usize,
  pub(crate) done_count: AtomicU64,
  panic_handler: RwLock<Option<PanicHandler<T>>>,
}

impl<T: Send + 'static> PoolShared<T> {
  /// Runs the registered fault handler, if any, containing its panics.
  pub(crate) fn notify_fault(&self, result: &TaskResult<T>) {
    let handler = self.panic_handler.read().clone();
    if let Some(handler) = handler {
      if catch_unwind(AssertUnwindSafe(|| handler(result))).is_err() {
        error!(pool = %self.name, "A panic handler panicked while handling a task fault.");
      }
    }
  }

  fn set_panic_handler(&self, handler: PanicHandler<T>) {
    *self.panic_handler.write() = Some(handler);
  }
}

struct WorkerLink<T: Send + 'static> {
  id: u64,
  handoff: Sender<TaskEntry<T>>,
}

/// Owns the submission queue and matches each accepted entry to an idle
/// worker. Runs on its own thread for the lifetime of the pool.
struct Dispatcher<T: Send + 'static> {
  shared: Arc<PoolShared<T>>,
  task_rx: Receiver<TaskEntry<T>>,
  idle_rx: Receiver<u64>,
  stop_rx: Receiver<()>,
  links: Vec<WorkerLink<T>>,
  workers: WaitGroup,
  done_tx: Sender<()>,
}

impl<T: Send + 'static> Dispatcher<T> {
  fn run(self) {
    let Dispatcher {
      shared,
      task_rx,
      idle_rx,
      stop_rx,
      links,
      workers,
      done_tx,
    } = self;
    debug!(pool = %shared.name, "Dispatcher started.");

    'dispatch: loop {
      let mut entry = select! {
        recv(stop_rx) -> _ => break 'dispatch,
        recv(task_rx) -> msg => match msg {
          Ok(entry) => entry,
          // Every pool handle is gone; Drop already signalled the stop.
          Err(_) => break 'dispatch,
        },
      };

      // Match the entry to an idle worker. A worker that observed the
      // stop first drops its handoff, so a failed send just means trying
      // the next announcement.
      loop {
        let worker_id = select! {
          recv(stop_rx) -> _ => break 'dispatch,
          recv(idle_rx) -> msg => match msg {
            Ok(id) => id,
            Err(_) => break 'dispatch,
          },
        };
        let link = &links[(worker_id - 1) as usize];
        debug_assert_eq!(link.id, worker_id);
        match link.handoff.send(entry) {
          Ok(()) => {
            trace!(pool = %shared.name, worker = worker_id, "Task handed to worker.");
            continue 'dispatch;
          }
          Err(send_error) => {
            entry = send_error.into_inner();
            debug!(pool = %shared.name, worker = worker_id, "Worker rejected the handoff; trying another.");
          }
        }
      }
    }

    debug!(pool = %shared.name, "Dispatcher stopping; waiting for workers to drain.");
    // Dropping the idle receiver and the handoff senders tells every
    // worker that no further work is coming.
    drop(idle_rx);
    drop(links);
    drop(task_rx);
    workers.wait();
    info!(
      pool = %shared.name,
      done = shared.done_count.load(Ordering::Relaxed),
      "Pool drained; all workers stopped."
    );
    drop(done_tx);
  }
}

struct PoolCore<T: Send + 'static> {
  shared: Arc<PoolShared<T>>,
  task_tx: Sender<TaskEntry<T>>,
  /// Send side kept only for queue-depth snapshots; the workers own the
  /// clones that actually carry announcements.
  idle_probe: Sender<u64>,
  stop_tx: Mutex<Option<Sender<()>>>,
  stop_rx: Receiver<()>,
  done_rx: Receiver<()>,
  results: ObjectPool<Arc<ResultCore<T>>>,
}

impl<T: Send + 'static> PoolCore<T> {
  fn signal_stop(&self) {
    if let Some(stop_tx) = self.stop_tx.lock().take() {
      info!(pool = %self.shared.name, "Stop requested; workers will drain and exit.");
      drop(stop_tx);
    }
  }

  fn is_stopping(&self) -> bool {
    self.stop_tx.lock().is_none()
  }
}

impl<T: Send + 'static> Drop for PoolCore<T> {
  fn drop(&mut self) {
    // Last handle gone. Signal the stop without blocking; the dispatcher
    // and the workers own everything they need to finish draining.
    if let Some(stop_tx) = self.stop_tx.get_mut().take() {
      info!(pool = %self.shared.name, "Task pool dropped; signaling workers to stop.");
      drop(stop_tx);
    }
  }
}

/// A bounded pool of worker threads executing submitted tasks.
///
/// Submissions block once the queue holds `buffer` undispatched entries,
/// which keeps producers from outrunning the workers. Each submission
/// yields a [`TaskResult`] future that can be waited on, polled, read and
/// finally released back into the pool's result-cell reserve.
///
/// The handle is cheaply cloneable and every clone controls the same
/// pool. Dropping the last clone signals the workers to stop without
/// waiting for them.
pub struct TaskPool<T: Send + 'static> {
  core: Arc<PoolCore<T>>,
}

impl<T: Send + 'static> Clone for TaskPool<T> {
  fn clone(&self) -> Self {
    Self {
      core: self.core.clone(),
    }
  }
}

impl<T: Send + 'static> fmt::Debug for TaskPool<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskPool")
      .field("name", &self.core.shared.name)
      .field("workers", &self.core.shared.workers)
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static> TaskPool<T> {
  /// Creates a pool of `workers` threads with a submission buffer of the
  /// same size.
  ///
  /// # Errors
  /// See [`TaskPool::named`].
  pub fn new(workers: usize) -> Result<Self, PoolError> {
    Self::named("taskpool", workers, workers)
  }

  /// Creates a pool of `workers` threads with an explicit submission
  /// buffer capacity.
  ///
  /// # Errors
  /// See [`TaskPool::named`].
  pub fn with_buffer(workers: usize, buffer: usize) -> Result<Self, PoolError> {
    Self::named("taskpool", workers, buffer)
  }

  /// Creates a named pool. The name shows up in the log fields and in
  /// the names of the pool's threads.
  ///
  /// # Errors
  /// Returns [`PoolError::Config`] when `workers` or `buffer` is zero,
  /// before any thread starts, and [`PoolError::Spawn`] when the OS
  /// refuses a thread; threads already started then drain and exit.
  pub fn named(name: &str, workers: usize, buffer: usize) -> Result<Self, PoolError> {
    if workers == 0 {
      return Err(PoolError::Config("worker count must be positive"));
    }
    if buffer == 0 {
      return Err(PoolError::Config("buffer size must be positive"));
    }

    let (task_tx, task_rx) = bounded(buffer);
    let (idle_tx, idle_rx) = bounded(workers);
    let (stop_tx, stop_rx) = bounded::<()>(0);
    let (done_tx, done_rx) = bounded::<()>(0);

    let shared = Arc::new(PoolShared {
      name: name.to_string(),
      workers,
      done_count: AtomicU64::new(0),
      panic_handler: RwLock::new(None),
    });

    // Result cells are recycled through an object pool. The reset closure
    // only clears a cell it holds uniquely; a cell whose handle clones
    // survive the release is discarded instead of handed out again.
    let results = ObjectPool::with_reset(
      || Arc::new(ResultCore::new()),
      |mut cell: Arc<ResultCore<T>>| match Arc::get_mut(&mut cell) {
        Some(core) => {
          core.reset();
          Some(cell)
        }
        None => None,
      },
    );

    let wg = WaitGroup::new();
    let mut links = Vec::with_capacity(workers);

    for id in 1..=workers as u64 {
      // Rendezvous: a handoff send completes only while the worker is
      // receiving, so an accepted entry is either executed or comes back
      // through the send error for redispatch. A buffered slot could
      // swallow an entry a stopping worker never reads.
      let (handoff_tx, handoff_rx) = bounded(0);
      let worker = Worker {
        id,
        shared: shared.clone(),
        handoff: handoff_rx,
        idle_tx: idle_tx.clone(),
        stop_rx: stop_rx.clone(),
      };
      let wg_guard = wg.clone();
      let spawned = thread::Builder::new()
        .name(format!("{}-worker-{}", name, id))
        .spawn(move || {
          let _wg = wg_guard;
          let _span = info_span!("pool_worker", pool = %worker.shared.name, worker = worker.id).entered();
          worker.run();
        });
      if let Err(spawn_error) = spawned {
        // Dropping the stop sender on the way out tells the workers
        // already running to exit.
        return Err(PoolError::Spawn(spawn_error.to_string()));
      }
      links.push(WorkerLink {
        id,
        handoff: handoff_tx,
      });
    }

    let dispatcher = Dispatcher {
      shared: shared.clone(),
      task_rx,
      idle_rx,
      stop_rx: stop_rx.clone(),
      links,
      workers: wg,
      done_tx,
    };
    let dispatcher_shared = shared.clone();
    let spawned = thread::Builder::new()
      .name(format!("{}-dispatcher", name))
      .spawn(move || {
        let _span = info_span!("pool_dispatcher", pool = %dispatcher_shared.name).entered();
        if catch_unwind(AssertUnwindSafe(|| dispatcher.run())).is_err() {
          error!(
            pool = %dispatcher_shared.name,
            "Dispatcher panicked; the pool will not dispatch further tasks."
          );
        }
      });
    if let Err(spawn_error) = spawned {
      return Err(PoolError::Spawn(spawn_error.to_string()));
    }

    info!(pool = %name, workers, buffer, "Task pool created.");

    Ok(Self {
      core: Arc::new(PoolCore {
        shared,
        task_tx,
        idle_probe: idle_tx,
        stop_tx: Mutex::new(Some(stop_tx)),
        stop_rx,
        done_rx,
        results,
      }),
    })
  }

  /// Submits a task and returns a handle to its eventual result.
  ///
  /// Blocks while the submission queue is full. Fails once a stop has
  /// been requested; entries accepted earlier may still be abandoned by
  /// the shutdown drain (see [`TaskPool::shutdown_timeout`]).
  ///
  /// # Errors
  /// Returns [`PoolError::ShuttingDown`] when the pool no longer accepts
  /// work.
  pub fn submit(
    &self,
    ctx: TaskContext,
    task: impl Task<T> + 'static,
    args: Vec<TaskArg>,
  ) -> Result<TaskResult<T>, PoolError> {
    let task: Arc<dyn Task<T>> = Arc::new(task);
    let args: Arc<[TaskArg]> = args.into();

    let cell = self.core.results.acquire_value();
    cell.prepare(task.clone(), args.clone());
    let result = TaskResult::new(cell, self.core.results.downgrade());

    let entry = TaskEntry {
      ctx,
      task,
      args,
      result: Some(result.clone()),
    };
    if let Err(rejected) = self.enqueue(entry) {
      // The entry clone died with the rejection, so the cell recycles.
      result.release();
      return Err(rejected);
    }
    Ok(result)
  }

  /// Fire-and-forget submission. No result handle is allocated, so the
  /// outcome is observable only through [`TaskPool::stats`] and the logs.
  ///
  /// # Errors
  /// Returns [`PoolError::ShuttingDown`] when the pool no longer accepts
  /// work.
  pub fn submit_detached(
    &self,
    ctx: TaskContext,
    task: impl Task<T> + 'static,
    args: Vec<TaskArg>,
  ) -> Result<(), PoolError> {
    self.enqueue(TaskEntry {
      ctx,
      task: Arc::new(task),
      args: args.into(),
      result: None,
    })
  }

  fn enqueue(&self, entry: TaskEntry<T>) -> Result<(), PoolError> {
    if self.core.is_stopping() {
      warn!(pool = %self.core.shared.name, "Submit rejected: the pool is stopping.");
      return Err(PoolError::ShuttingDown);
    }
    select! {
      send(self.core.task_tx, entry) -> sent => sent.map_err(|_| PoolError::ShuttingDown),
      recv(self.core.stop_rx) -> _ => Err(PoolError::ShuttingDown),
    }
  }

  /// Registers a handler invoked with the result of any task whose body
  /// panicked, after the panic has been captured as the result's error.
  /// Detached tasks have no result and bypass the handler.
  pub fn set_panic_handler(&self, handler: impl Fn(&TaskResult<T>) + Send + Sync + 'static) {
    self.core.shared.set_panic_handler(Arc::new(handler));
  }

  /// A non-blocking snapshot of pool activity.
  pub fn stats(&self) -> TaskStat {
    let idle = self.core.idle_probe.len();
    TaskStat {
      workers: self.core.shared.workers,
      pending: self.core.task_tx.len(),
      running: self.core.shared.workers.saturating_sub(idle),
      done: self.core.shared.done_count.load(Ordering::Relaxed),
    }
  }

  /// The number of worker threads, fixed at construction.
  pub fn worker_count(&self) -> usize {
    self.core.shared.workers
  }

  pub fn name(&self) -> &str {
    &self.core.shared.name
  }

  /// Signals shutdown and blocks until every worker has drained and
  /// exited. Repeated calls are harmless.
  pub fn stop(&self) {
    self.core.signal_stop();
    self.wait();
  }

  /// Signals shutdown, then waits up to `deadline` for the drain to
  /// finish. Returns whether the pool fully stopped in time; on `false`
  /// the workers keep draining in the background.
  ///
  /// Entries still sitting in the submission queue when the dispatcher
  /// observes the stop are never dispatched and their results stay
  /// incomplete. [`TaskResult::wait_timeout`] is the way to wait on a
  /// result that may have been abandoned.
  pub fn shutdown_timeout(&self, deadline: Duration) -> bool {
    self.core.signal_stop();
    match self.core.done_rx.recv_timeout(deadline) {
      // Nothing is ever sent on the done channel; it only disconnects,
      // which the dispatcher does after the last worker exited.
      Err(RecvTimeoutError::Disconnected) | Ok(()) => true,
      Err(RecvTimeoutError::Timeout) => {
        warn!(pool = %self.core.shared.name, "Shutdown deadline elapsed before the drain completed.");
        false
      }
    }
  }

  /// Blocks until the pool has fully terminated. Does not itself request
  /// a stop.
  pub fn wait(&self) {
    let _ = self.core.done_rx.recv();
  }
}

/// A point-in-time snapshot of pool activity.
///
/// `pending` counts entries still in the submission queue, `running`
/// counts workers not currently announced as idle, and `done` counts
/// completed tasks monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStat {
  pub workers: usize,
  pub pending: usize,
  pub running: usize,
  pub done: u64,
}

impl fmt::Display for TaskStat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "TaskStat(workers={}, pending={}, running={}, done={})",
      self.workers, self.pending, self.running, self.done
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::arg;
  use crate::task_args;
  use crate::BoxError;

  fn echo(_: &TaskContext, args: &[TaskArg]) -> Result<u64, BoxError> {
    Ok(arg::<u64>(args, 0).copied().unwrap_or(0))
  }

  #[test]
  fn test_zero_sizes_are_config_errors() {
    assert_eq!(
      TaskPool::<u64>::named("cfg", 0, 4).unwrap_err(),
      PoolError::Config("worker count must be positive")
    );
    assert_eq!(
      TaskPool::<u64>::named("cfg", 4, 0).unwrap_err(),
      PoolError::Config("buffer size must be positive")
    );
  }

  #[test]
  fn test_released_result_cell_is_reset_and_reused() {
    let pool = TaskPool::<u64>::with_buffer(1, 2).unwrap();
    let result = pool
      .submit(TaskContext::new(), echo, task_args![7u64])
      .unwrap();
    assert_eq!(result.result(), Some(7));

    // Stopping first guarantees the worker dropped its handle clone, so
    // the release below sees a uniquely held cell.
    pool.stop();
    assert_eq!(pool.core.results.free_count(), 0);
    result.release();
    assert_eq!(pool.core.results.free_count(), 1);

    let cell = pool.core.results.acquire_value();
    let recycled = TaskResult::new(cell, pool.core.results.downgrade());
    assert!(!recycled.is_done());
    assert!(!recycled.is_scheduled());
    assert_eq!(recycled.worker_id(), 0);
    assert!(recycled.task().is_none());
    assert_eq!(pool.core.results.free_count(), 0);
  }

  #[test]
  fn test_released_cell_with_live_clone_is_discarded() {
    let pool = TaskPool::<u64>::with_buffer(1, 2).unwrap();
    let result = pool
      .submit(TaskContext::new(), echo, task_args![9u64])
      .unwrap();
    result.wait();
    pool.stop();

    let keeper = result.clone();
    result.release();
    assert_eq!(pool.core.results.free_count(), 0);
    // The surviving clone still reads its own cell.
    assert_eq!(keeper.result(), Some(9));
  }

  #[test]
  fn test_handoff_racing_stop_is_run_or_returned() {
    // The handoff is a rendezvous: a send that returns Ok was taken by
    // the worker (serve loop or stop drain) and must execute; a send
    // that loses the race against the worker's exit hands the entry
    // back for redispatch. Repeating the round covers both outcomes.
    for _ in 0..100 {
      let shared = Arc::new(PoolShared::<u64> {
        name: "handoff".to_string(),
        workers: 1,
        done_count: AtomicU64::new(0),
        panic_handler: RwLock::new(None),
      });
      let (handoff_tx, handoff_rx) = bounded(0);
      let (idle_tx, idle_rx) = bounded(1);
      let (stop_tx, stop_rx) = bounded::<()>(0);
      let worker = Worker {
        id: 1,
        shared: shared.clone(),
        handoff: handoff_rx,
        idle_tx,
        stop_rx,
      };
      let serving = thread::spawn(move || worker.run());

      assert_eq!(idle_rx.recv(), Ok(1));
      drop(stop_tx);

      let results: ObjectPool<Arc<ResultCore<u64>>> =
        ObjectPool::new(|| Arc::new(ResultCore::new()));
      let task: Arc<dyn Task<u64>> = Arc::new(echo);
      let args: Arc<[TaskArg]> = task_args![5u64].into();
      let cell = results.acquire_value();
      cell.prepare(task.clone(), args.clone());
      let result = TaskResult::new(cell, results.downgrade());

      let entry = TaskEntry {
        ctx: TaskContext::new(),
        task,
        args,
        result: Some(result.clone()),
      };
      match handoff_tx.send(entry) {
        Ok(()) => {
          assert!(
            result.wait_timeout(Duration::from_secs(5)),
            "delivered entry never executed"
          );
          assert_eq!(result.result(), Some(5));
          assert_eq!(shared.done_count.load(Ordering::Relaxed), 1);
        }
        Err(send_error) => {
          let entry = send_error.into_inner();
          assert!(entry.result.is_some(), "returned entry lost its result");
          assert!(!result.is_done());
          assert_eq!(shared.done_count.load(Ordering::Relaxed), 0);
        }
      }
      serving.join().expect("worker thread exits");
    }
  }

  #[test]
  fn test_stat_display_format() {
    let stat = TaskStat {
      workers: 3,
      pending: 2,
      running: 1,
      done: 10,
    };
    assert_eq!(
      stat.to_string(),
      "TaskStat(workers=3, pending=2, running=1, done=10)"
    );
  }
}
