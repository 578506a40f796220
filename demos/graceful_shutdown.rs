use taskforce::{arg, task_args, BoxError, TaskArg, TaskContext, TaskPool, TaskResult};
use std::thread;
use std::time::Duration;
use tracing::info;

fn work_task_fn(_ctx: &TaskContext, args: &[TaskArg]) -> Result<String, BoxError> {
  let id = arg::<usize>(args, 0).copied().unwrap_or(0);
  let duration_ms = arg::<u64>(args, 1).copied().unwrap_or(0);
  info!("Task {} starting (will run for {}ms)", id, duration_ms);
  thread::sleep(Duration::from_millis(duration_ms));
  let result = format!("Task {} finished after {}ms", id, duration_ms);
  info!("{}", result);
  Ok(result)
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Graceful Shutdown Example ---");

  let pool = TaskPool::<String>::named("graceful_shutdown_pool", 2, 10).expect("Failed to create pool");

  let mut results: Vec<TaskResult<String>> = Vec::new();

  // Submit 5 tasks, each takes 400ms.
  // With 2 workers:
  // Tasks 0, 1 start.
  // Tasks 2, 3, 4 wait their turn.
  for i in 0..5usize {
    match pool.submit(TaskContext::new(), work_task_fn, task_args![i, 400u64]) {
      Ok(result) => {
        info!("Submitted task {}", i);
        results.push(result);
      }
      Err(e) => tracing::error!("Failed to submit task {}: {:?}", i, e),
    }
  }

  info!("All 5 tasks submitted. {}", pool.stats());
  thread::sleep(Duration::from_millis(100)); // Let some tasks start

  info!("Requesting shutdown with a deadline shorter than the backlog...");
  if pool.shutdown_timeout(Duration::from_millis(150)) {
    info!("Pool drained within the first deadline.");
  } else {
    info!("Deadline elapsed; workers are still draining in the background.");
  }

  // Try submitting another task after shutdown initiated (should fail)
  info!("Attempting to submit a task after the stop...");
  match pool.submit(TaskContext::new(), work_task_fn, task_args![99usize, 100u64]) {
    Ok(_) => tracing::error!("LATE SUBMISSION SUCCEEDED (UNEXPECTED!)"),
    Err(e) => info!("Late submission correctly failed: {}", e),
  }

  info!("Waiting for the drain to finish...");
  pool.wait();

  // Expected: the tasks that reached a worker finished; entries still
  // queued when the stop landed stay incomplete forever.
  for (i, result) in results.iter().enumerate() {
    if result.wait_timeout(Duration::from_millis(10)) {
      info!("Task {} result: {:?}", i, result.result());
    } else {
      info!("Task {} was abandoned by the shutdown (expected for queued tasks)", i);
    }
  }

  info!("Final stats: {}", pool.stats());
  info!("--- Graceful Shutdown Example End ---");
}
