use taskforce::{task_args, BoxError, TaskArg, TaskContext, TaskPool};
use std::thread;
use std::time::Duration;
use tracing::info;

fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Panic Handler Example ---");

  let pool = TaskPool::<String>::named("panic_pool", 1, 5).expect("Failed to create pool");

  // The handler sees every task whose body panicked, after the panic has
  // become the result's error.
  pool.set_panic_handler(|result| {
    info!(
      "Panic handler: worker {} caught: {:?}",
      result.worker_id(),
      result.error()
    );
  });

  let panicking = pool
    .submit(
      TaskContext::new(),
      |_: &TaskContext, _: &[TaskArg]| -> Result<String, BoxError> {
        info!("Panicking Task: Starting...");
        thread::sleep(Duration::from_millis(100));
        info!("Panicking Task: About to panic!");
        panic!("This task is designed to panic!");
      },
      task_args![],
    )
    .expect("Failed to submit panicking task");

  info!("Panicking task submitted. Waiting for its result...");
  panicking.wait();
  match panicking.error() {
    Some(error) if error.is_panic() => info!("Task correctly reported its panic: {}", error),
    other => info!("Task reported an unexpected outcome: {:?}", other),
  }

  // The worker that absorbed the panic keeps serving.
  let follow_up = pool
    .submit(
      TaskContext::new(),
      |_: &TaskContext, _: &[TaskArg]| -> Result<String, BoxError> { Ok("still alive".to_string()) },
      task_args![],
    )
    .expect("Failed to submit follow-up task");
  info!("Follow-up task result: {:?}", follow_up.result());

  info!("Shutting down pool.");
  pool.stop();
  info!("Pool shutdown complete.");
  info!("--- Panic Handler Example End ---");
}
