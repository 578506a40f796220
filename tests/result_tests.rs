use taskforce::{arg, task_args, wait_all, BoxError, TaskArg, TaskContext, TaskPool};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// Helper to initialize tracing for tests (call once per test run, not per
// test function). Once ensures it runs once even though every test calls it.
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,taskforce=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn sleep_then_echo(duration_ms: u64) -> impl Fn(&TaskContext, &[TaskArg]) -> Result<String, BoxError> + Send + Sync {
  move |_ctx, args| {
    thread::sleep(Duration::from_millis(duration_ms));
    Ok(arg::<String>(args, 0).cloned().unwrap_or_default())
  }
}

#[test]
fn test_scheduled_strictly_precedes_done() {
  setup_tracing_for_test();
  let pool_name = "test_result_stage_order";
  tracing::info!("Starting test: {}", pool_name);
  let pool = TaskPool::<String>::named(pool_name, 1, 2).unwrap();

  let result = pool
    .submit(TaskContext::new(), sleep_then_echo(150), task_args!["staged".to_string()])
    .unwrap();

  result.wait_scheduled();
  assert!(result.is_scheduled());
  assert!(!result.is_done(), "a 150ms task cannot be done right after scheduling");
  assert_eq!(result.worker_id(), 1);
  assert!(result.start_time().is_some());

  result.wait();
  assert!(result.is_done());
  assert!(result.is_scheduled(), "done implies scheduled");
  assert!(result.duration() >= Duration::from_millis(120));

  pool.stop();
  tracing::info!("Finished test: {}", pool_name);
}

#[test]
fn test_result_exposes_task_and_args() {
  setup_tracing_for_test();
  let pool_name = "test_result_accessors";
  tracing::info!("Starting test: {}", pool_name);
  let pool = TaskPool::<String>::named(pool_name, 1, 2).unwrap();

  let result = pool
    .submit(
      TaskContext::new(),
      |_: &TaskContext, args: &[TaskArg]| -> Result<String, BoxError> {
        let label = arg::<String>(args, 0).cloned().unwrap_or_default();
        let count = arg::<u64>(args, 1).copied().unwrap_or(0);
        Ok(format!("{}x{}", label, count))
      },
      task_args!["widget".to_string(), 3u64],
    )
    .unwrap();

  assert_eq!(result.result(), Some("widgetx3".to_string()));

  let args = result.args();
  assert_eq!(args.len(), 2);
  assert_eq!(arg::<String>(&args, 0), Some(&"widget".to_string()));
  assert_eq!(arg::<u64>(&args, 1), Some(&3u64));
  assert!(arg::<u64>(&args, 0).is_none(), "index 0 holds a String, not a u64");
  assert!(result.task().is_some());

  pool.stop();
  tracing::info!("Finished test: {}", pool_name);
}

#[test]
fn test_failing_task_reports_its_error() {
  setup_tracing_for_test();
  let pool_name = "test_result_failure";
  tracing::info!("Starting test: {}", pool_name);
  let pool = TaskPool::<String>::named(pool_name, 1, 2).unwrap();

  let result = pool
    .submit(
      TaskContext::new(),
      |_: &TaskContext, _: &[TaskArg]| -> Result<String, BoxError> { Err("boom".into()) },
      task_args![],
    )
    .unwrap();

  result.wait();
  assert!(result.is_done());
  assert!(!result.is_success());
  assert_eq!(result.result(), None);
  let error = result.error().expect("failed task must carry an error");
  assert!(!error.is_panic());
  assert!(error.to_string().contains("boom"));

  pool.stop();
  tracing::info!("Finished test: {}", pool_name);
}

#[test]
fn test_callback_set_after_done_fires_immediately_once() {
  setup_tracing_for_test();
  let pool_name = "test_result_late_callback";
  tracing::info!("Starting test: {}", pool_name);
  let pool = TaskPool::<String>::named(pool_name, 1, 2).unwrap();

  let result = pool
    .submit(TaskContext::new(), sleep_then_echo(10), task_args!["late".to_string()])
    .unwrap();
  result.wait();

  let fired = Arc::new(AtomicUsize::new(0));
  let fired_in_callback = fired.clone();
  result.set_callback(move |done| {
    assert!(done.is_done());
    assert_eq!(done.result(), Some("late".to_string()));
    fired_in_callback.fetch_add(1, Ordering::SeqCst);
  });

  // The late registration path runs the callback on this thread.
  assert_eq!(fired.load(Ordering::SeqCst), 1);
  thread::sleep(Duration::from_millis(50));
  assert_eq!(fired.load(Ordering::SeqCst), 1, "the callback must fire exactly once");

  pool.stop();
  tracing::info!("Finished test: {}", pool_name);
}

#[test]
fn test_callback_set_before_done_fires_once_and_replacement_wins() {
  setup_tracing_for_test();
  let pool_name = "test_result_early_callback";
  tracing::info!("Starting test: {}", pool_name);
  let pool = TaskPool::<String>::named(pool_name, 1, 2).unwrap();

  let result = pool
    .submit(TaskContext::new(), sleep_then_echo(100), task_args!["early".to_string()])
    .unwrap();

  let replaced = Arc::new(AtomicUsize::new(0));
  let replaced_in_callback = replaced.clone();
  result.set_callback(move |_| {
    replaced_in_callback.fetch_add(1, Ordering::SeqCst);
  });

  let fired = Arc::new(AtomicUsize::new(0));
  let fired_in_callback = fired.clone();
  result.set_callback(move |done| {
    assert!(done.is_done());
    fired_in_callback.fetch_add(1, Ordering::SeqCst);
  });

  result.wait();
  // The worker invokes the callback right after completion; poll briefly
  // instead of racing it.
  let deadline = Instant::now() + Duration::from_secs(1);
  while fired.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
    thread::sleep(Duration::from_millis(5));
  }
  assert_eq!(fired.load(Ordering::SeqCst), 1);
  thread::sleep(Duration::from_millis(50));
  assert_eq!(fired.load(Ordering::SeqCst), 1, "the callback must fire exactly once");
  assert_eq!(replaced.load(Ordering::SeqCst), 0, "a replaced callback must never fire");

  pool.stop();
  tracing::info!("Finished test: {}", pool_name);
}

#[test]
fn test_wait_all_returns_after_every_result() {
  setup_tracing_for_test();
  let pool_name = "test_result_wait_all";
  tracing::info!("Starting test: {}", pool_name);
  let pool = TaskPool::<String>::named(pool_name, 3, 6).unwrap();

  let completed = Arc::new(AtomicUsize::new(0));
  let mut results = Vec::new();
  for i in 0..6u64 {
    let completed_in_task = completed.clone();
    let result = pool
      .submit(
        TaskContext::new(),
        move |_: &TaskContext, _: &[TaskArg]| -> Result<String, BoxError> {
          thread::sleep(Duration::from_millis(10 * (i + 1)));
          completed_in_task.fetch_add(1, Ordering::SeqCst);
          Ok(format!("wave_{}", i))
        },
        task_args![],
      )
      .unwrap();
    results.push(result);
  }

  wait_all(&results);
  assert_eq!(completed.load(Ordering::SeqCst), 6);
  for (i, result) in results.iter().enumerate() {
    assert!(result.is_done());
    assert_eq!(result.result(), Some(format!("wave_{}", i)));
  }

  pool.stop();
  tracing::info!("Finished test: {}", pool_name);
}

#[test]
fn test_context_cancellation_is_cooperative() {
  setup_tracing_for_test();
  let pool_name = "test_result_cooperative_cancel";
  tracing::info!("Starting test: {}", pool_name);
  let pool = TaskPool::<String>::named(pool_name, 1, 2).unwrap();

  let ctx = TaskContext::new();
  let result = pool
    .submit(
      ctx.clone(),
      |task_ctx: &TaskContext, _: &[TaskArg]| -> Result<String, BoxError> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !task_ctx.is_cancelled() {
          if Instant::now() >= deadline {
            return Ok("timed_out".to_string());
          }
          thread::sleep(Duration::from_millis(10));
        }
        Ok("cancelled_cooperatively".to_string())
      },
      task_args![],
    )
    .unwrap();

  result.wait_scheduled();
  tracing::info!("Test: cancelling the task's context.");
  ctx.cancel();

  assert_eq!(result.result(), Some("cancelled_cooperatively".to_string()));
  assert!(result.duration() < Duration::from_secs(1), "cancellation should cut the task short");

  pool.stop();
  tracing::info!("Finished test: {}", pool_name);
}

#[test]
fn test_release_after_pool_drop_is_quiet() {
  setup_tracing_for_test();
  let pool_name = "test_result_release_after_drop";
  tracing::info!("Starting test: {}", pool_name);

  let result = {
    let pool = TaskPool::<String>::named(pool_name, 1, 2).unwrap();
    let result = pool
      .submit(TaskContext::new(), sleep_then_echo(10), task_args!["orphan".to_string()])
      .unwrap();
    result.wait();
    pool.stop();
    result
  };

  assert_eq!(result.result(), Some("orphan".to_string()));
  // The owning pool is gone; releasing just drops the cell.
  result.release();
  tracing::info!("Finished test: {}", pool_name);
}
