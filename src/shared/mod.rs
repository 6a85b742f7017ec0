pub mod fs_atomic;
pub mod ids;
pub mod logging;
pub mod redact;
pub mod retry;
pub mod time;

pub use fs_atomic::atomic_write_file;
pub use ids::{RunId, WorkspaceName};
pub use logging::{EventLog, LogLevel};
pub use redact::{redact_token, Redactor};
pub use retry::{poll_until, retry_with, sleep_with_stop, PollPolicy, RetryPolicy};
