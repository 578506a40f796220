use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender, TryRecvError};
use tracing::{debug, error, trace, warn};

use crate::error::TaskError;
use crate::pool::PoolShared;
use crate::task::TaskEntry;

/// One persistent execution unit. It announces itself on the idle queue,
/// accepts a single task at a time through its one-slot handoff, runs it,
/// and announces again unless the pool is stopping.
pub(crate) struct Worker<T: Send + 'static> {
  pub(crate) id: u64,
  pub(crate) shared: Arc<PoolShared<T>>,
  pub(crate) handoff: Receiver<TaskEntry<T>>,
  pub(crate) idle_tx: Sender<u64>,
  pub(crate) stop_rx: Receiver<()>,
}

impl<T: Send + 'static> Worker<T> {
  /// Outer containment boundary around the serving loop. A panic that
  /// escapes task containment can only come from the loop's own
  /// bookkeeping; the worker logs it and ends for good, the pool does not
  /// restart it.
  pub(crate) fn run(self) {
    let id = self.id;
    let shared = self.shared.clone();
    if catch_unwind(AssertUnwindSafe(|| self.serve())).is_err() {
      error!(
        pool = %shared.name,
        worker = id,
        "Worker loop panicked outside task execution; the worker will not be restarted."
      );
    }
  }

  fn serve(&self) {
    debug!(pool = %self.shared.name, worker = self.id, "Worker started.");
    loop {
      if matches!(self.stop_rx.try_recv(), Err(TryRecvError::Disconnected)) {
        self.drain_one();
        break;
      }
      // Announce idle. The dispatcher holds the only receiver, so a
      // failed send means the pool is gone.
      if self.idle_tx.send(self.id).is_err() {
        break;
      }
      select! {
        recv(self.stop_rx) -> _ => {
          self.drain_one();
          break;
        }
        recv(self.handoff) -> msg => match msg {
          Ok(entry) => self.run_entry(entry),
          Err(_) => break,
        },
      }
    }
    debug!(pool = %self.shared.name, worker = self.id, "Worker stopped.");
  }

  /// The dispatcher may be blocked mid-handoff when the stop arrives;
  /// take its entry and run it to completion so accepted work is not
  /// lost. With nobody blocked on the send side there is nothing to
  /// drain.
  fn drain_one(&self) {
    if let Ok(entry) = self.handoff.try_recv() {
      self.run_entry(entry);
    }
  }

  fn run_entry(&self, entry: TaskEntry<T>) {
    let TaskEntry {
      ctx,
      task,
      args,
      result,
    } = entry;

    if let Some(result) = &result {
      result.mark_scheduled(self.id);
    }
    trace!(pool = %self.shared.name, worker = self.id, "Executing task.");

    let outcome = match catch_unwind(AssertUnwindSafe(|| task.run(&ctx, &args))) {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(err)) => Err(TaskError::Failed(Arc::from(err))),
      Err(payload) => {
        let message = panic_message(payload.as_ref());
        error!(pool = %self.shared.name, worker = self.id, "Task panicked: {}", message);
        Err(TaskError::Panicked(message))
      }
    };
    let faulted = matches!(&outcome, Err(TaskError::Panicked(_)));
    self.shared.done_count.fetch_add(1, Ordering::Relaxed);

    match result {
      Some(result) => {
        if let Some(callback) = result.complete(outcome) {
          if catch_unwind(AssertUnwindSafe(|| callback(&result))).is_err() {
            error!(pool = %self.shared.name, worker = self.id, "A completion callback panicked.");
          }
        }
        if faulted {
          self.shared.notify_fault(&result);
        }
      }
      None => {
        if faulted {
          warn!(
            pool = %self.shared.name,
            worker = self.id,
            "Detached task panicked; no result handle carries the error."
          );
        }
      }
    }
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "opaque panic payload".to_string()
  }
}
