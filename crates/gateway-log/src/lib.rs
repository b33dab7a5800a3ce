//! Logging bootstrap, adapted from the main gateway crate's own logging
//! module: a stdout layer plus a size-rotated file layer, both driven by a
//! single `EnvFilter`, with a background task that prunes log files older
//! than a fixed retention window.

#[macro_use]
extern crate tracing;

use std::io;

use anyhow::Context as _;
use async_trait::async_trait;
use camino::Utf8Path;
use gateway_task::{ShutdownSignal, Task};
use tokio::fs;
use tokio::time::{sleep, Duration};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const MAX_LOG_FILES: usize = 10;
const LOG_FILE_PREFIX: &str = "llm-gateway";

pub struct LoggerGuard {
    _file_guard: WorkerGuard,
    _stdio_guard: WorkerGuard,
}

/// Initializes the global `tracing` subscriber.
///
/// `log_directive` overrides the built-in default filter (`info`); it is
/// read from `LLM_GATEWAY_LOG_DIRECTIVE` by the caller.
pub fn init(log_dir: &Utf8Path, log_directive: Option<&str>) -> anyhow::Result<LoggerGuard> {
    let directive = log_directive.unwrap_or("info");

    let file_appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir.as_std_path())
        .context("couldn't create file appender")?;
    let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(file_non_blocking).with_ansi(false);

    let (stdio_non_blocking, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(stdio_non_blocking);

    let env_filter = EnvFilter::try_new(directive).context("invalid log filtering directive")?;

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdio_layer)
        .with(env_filter)
        .init();

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}

/// Deletes rolled-over log files older than `MAX_AGE`.
pub struct LogDeleterTask {
    pub log_dir: camino::Utf8PathBuf,
}

#[async_trait]
impl Task for LogDeleterTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "log deleter";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        const TASK_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24);
        const MAX_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 30);

        debug!("Task started");

        loop {
            match fs::read_dir(&self.log_dir).await {
                Ok(mut read_dir) => {
                    while let Ok(Some(entry)) = read_dir.next_entry().await {
                        let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
                            continue;
                        };

                        if !file_name.starts_with(LOG_FILE_PREFIX) {
                            continue;
                        }

                        match entry
                            .metadata()
                            .await
                            .and_then(|metadata| metadata.modified())
                            .and_then(|time| time.elapsed().map_err(io::Error::other))
                        {
                            Ok(age) if age > MAX_AGE => {
                                info!(file_name, "Delete log file");
                                if let Err(error) = fs::remove_file(entry.path()).await {
                                    warn!(%error, file_name, "Couldn't delete log file");
                                }
                            }
                            Ok(_) => {}
                            Err(error) => {
                                warn!(%error, file_name, "Couldn't retrieve metadata for file");
                            }
                        }
                    }
                }
                Err(error) => {
                    warn!(%error, "Couldn't read log folder");
                }
            }

            tokio::select! {
                _ = sleep(TASK_INTERVAL) => {}
                _ = shutdown_signal.wait() => break,
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}
