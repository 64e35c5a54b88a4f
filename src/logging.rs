//! Tracing subscriber setup: console output plus a daily-rotated log file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Settings;
use crate::error::Error;

/// Rotated log files kept on disk.
const MAX_LOG_FILES: usize = 5;

/// Build the rotating file appender for `dir`, creating the directory.
pub fn file_appender(dir: &Path) -> Result<RollingFileAppender, Error> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Logging(format!("cannot create {}: {e}", dir.display())))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("app")
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .map_err(|e| Error::Logging(e.to_string()))
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Keep the returned guard alive until exit or buffered file output is lost.
pub fn init(settings: &Settings) -> Result<WorkerGuard, Error> {
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender(&settings.log_dir)?);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            settings
                .log_level
                .as_tracing_level()
                .as_str()
                .to_ascii_lowercase(),
        )
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    tracing::info!(
        level = %settings.log_level,
        dir = %settings.log_dir.display(),
        "Logging setup completed"
    );

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn file_appender_creates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("logs");

        let mut appender = file_appender(&dir).unwrap();
        appender.write_all(b"hello\n").unwrap();
        appender.flush().unwrap();

        let files: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("app"));
        assert!(files[0].ends_with("log"));
    }
}
