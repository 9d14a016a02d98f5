//! CLI logging: a daily-rolling file under the state directory, with
//! warnings and errors echoed to stderr so failures are visible even when
//! nobody tails the log.

use anyhow::Result;
use log::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;

/// Rolled files older than this many days are pruned.
const KEEP_LOG_FILES: usize = 7;

/// Holds the background writer alive; dropping it flushes buffered log
/// lines. Keep it bound in `main` until exit.
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Wires the `log` facade to `<dir>/aifscli.<date>.log` at `level`, plus a
/// terse stderr echo for Warn and above.
pub fn init(dir: &str, level: &str) -> Result<LogGuard> {
    let level: LevelFilter = level.parse()?;

    let file = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix("aifscli")
        .filename_suffix("log")
        .max_log_files(KEEP_LOG_FILES)
        .build(dir)?;
    // The appender's worker thread already batches writes off the hot path,
    // so the writer is handed to fern unbuffered.
    let (writer, worker) = tracing_appender::non_blocking(file);

    let to_file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {}: {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(Box::new(writer) as Box<dyn std::io::Write + Send>);

    let to_stderr = fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("{}: {}", record.level(), message)))
        .level(LevelFilter::Warn)
        .chain(std::io::stderr());

    fern::Dispatch::new().chain(to_file).chain(to_stderr).apply()?;

    Ok(LogGuard { _worker: worker })
}
