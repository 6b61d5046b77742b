//! Value types and invariants for tasks, backends, executions, schedules, and options.

mod backend;
mod execution;
mod schedule;
mod settings;
mod task;

pub use backend::{Backend, BackendKind};
pub use execution::{BackendResult, BackendResultStatus, Execution, ExecutionStatus};
pub use schedule::{Schedule, SimplePeriod};
pub use settings::Settings;
pub use task::{sanitize_name, ArchiveFormat, ArchiveOptions, RetentionPolicy, SyncOptions, Task};
