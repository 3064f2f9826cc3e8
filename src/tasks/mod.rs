pub mod record;
pub mod context;
pub mod dispatcher;

pub use record::{TaskArgs, TaskLimits, TaskRecord, TaskState};
pub use context::{CancelToken, TaskContext};
pub use dispatcher::{Control, DispatcherStats, ResultWrapper, TaskDispatcher, TaskHandler, ThreadPoolDispatcher};
