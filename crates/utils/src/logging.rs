//! provides logging helpers

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt::layer;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// When set, human-readable logs go to a daily-rotated file in this directory
/// instead of stderr.
pub const LOG_PATH_ENV_VAR: &str = "COMPUTE_LOG_PATH";

const LOG_FILE_PREFIX: &str = "compute-core.log";

/// Builds the formatting layer for regular (non-metrics) log lines.
///
/// Falls back to stderr when the rolling appender cannot be created in
/// `log_path`.
pub fn get_fmt_layer<S>(log_path: Option<String>) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let Some(log_path) = log_path else {
        return layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed();
    };

    match rolling_appender(Path::new(&log_path)) {
        Ok(appender) => layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_target(true)
            .boxed(),
        Err(err) => {
            eprintln!("failed to open log directory {log_path}: {err}; logging to stderr");
            layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .boxed()
        }
    }
}

fn rolling_appender(dir: &Path) -> Result<RollingFileAppender, tracing_appender::rolling::InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(7)
        .build(dir)
}
