pub mod job_progress;
pub mod log_broadcaster;

pub use job_progress::{JobProgressBroadcaster, ProgressEvent};
pub use log_broadcaster::{LogBroadcaster, LogLine};
