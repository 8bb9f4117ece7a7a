//! Host-facing log reporting.
//!
//! The runtime logs through `tracing` like every other component, but a host
//! application that embeds the runtime can also install a reporter callback at
//! init time. The callback receives every runtime-emitted line, including the
//! `Dropped <N>` lines the producer emits when frames are discarded under
//! backpressure, so loss can be monitored without a tracing subscriber.

use std::sync::Arc;

/// One log line delivered to the host reporter.
#[derive(Debug, Clone, Copy)]
pub struct LogRecord<'a> {
    pub is_error: bool,
    pub file: &'a str,
    pub line: u32,
    pub module: &'a str,
    pub message: &'a str,
}

/// Callback installed by the host at runtime creation.
pub type Reporter = Arc<dyn Fn(&LogRecord<'_>) + Send + Sync>;

/// Deliver a preformatted message to the reporter, if one is installed.
pub(crate) fn deliver(
    reporter: &Option<Reporter>,
    is_error: bool,
    file: &str,
    line: u32,
    module: &str,
    message: &str,
) {
    if let Some(reporter) = reporter {
        reporter(&LogRecord {
            is_error,
            file,
            line,
            module,
            message,
        });
    }
}

/// Emit a line through `tracing` and the optional host reporter.
macro_rules! report {
    ($reporter:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::info!("{}", message);
        $crate::report::deliver($reporter, false, file!(), line!(), module_path!(), &message);
    }};
}

/// Error-level variant of [`report!`].
macro_rules! report_err {
    ($reporter:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!("{}", message);
        $crate::report::deliver($reporter, true, file!(), line!(), module_path!(), &message);
    }};
}

pub(crate) use report;
pub(crate) use report_err;
