use taskforce::{arg, task_args, wait_all, BoxError, TaskArg, TaskContext, TaskPool, TaskResult};
use std::thread;
use std::time::Duration;
use tracing::info;

fn my_task_fn(ctx: &TaskContext, args: &[TaskArg]) -> Result<String, BoxError> {
  let id = arg::<usize>(args, 0).copied().unwrap_or(0);
  let delay_ms = arg::<u64>(args, 1).copied().unwrap_or(0);
  info!("Task {} starting, will sleep for {}ms", id, delay_ms);
  if ctx.is_cancelled() {
    return Err("cancelled before doing any work".into());
  }
  thread::sleep(Duration::from_millis(delay_ms));
  let result = format!("Task {} finished successfully after {}ms", id, delay_ms);
  info!("{}", result);
  Ok(result)
}

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Basic Usage Example ---");

  let pool = TaskPool::<String>::named("basic_pool", 2, 10).expect("Failed to create pool");

  let mut results: Vec<TaskResult<String>> = Vec::new();

  for i in 0..5usize {
    // Alternate sleep times for variety
    let sleep_duration: u64 = 100 + (i as u64 % 3 * 50);
    match pool.submit(TaskContext::new(), my_task_fn, task_args![i, sleep_duration]) {
      Ok(result) => {
        info!("Submitted task {}", i);
        results.push(result);
      }
      Err(e) => {
        tracing::error!("Failed to submit task {}: {:?}", i, e);
      }
    }
  }

  info!("All tasks submitted. Waiting for every result...");
  wait_all(&results);
  info!("Pool stats after the batch: {}", pool.stats());

  for (i, result) in results.iter().enumerate() {
    match result.result() {
      Some(value) => info!("Result for task {}: {}", i, value),
      None => info!("Error for task {}: {:?}", i, result.error()),
    }
  }

  // Hand the result cells back for reuse by later submissions.
  for result in results {
    result.release();
  }

  info!("All task results processed. Shutting down pool.");
  pool.stop();
  info!("Pool shutdown complete.");
  info!("--- Basic Usage Example End ---");
}
