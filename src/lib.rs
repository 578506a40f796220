//! A thread-based task pool for parallel execution of blocking work, with
//! bounded queuing, per-task result futures, completion callbacks and
//! object recycling.

mod error;
mod pool;
mod recycle;
mod result;
mod task;
mod worker;

pub use error::{PoolError, TaskError};
pub use pool::{TaskPool, TaskStat};
pub use recycle::{CapacityPool, ObjectPool, Pooled, WeakObjectPool};
pub use result::{wait_all, TaskResult};
pub use task::{arg, BoxError, Task, TaskArg, TaskContext};
