// src/logging.rs
//
// Tracing subscriber setup. Logs go to stderr, or to a timestamped file in a
// log directory with a `wirestream.log` symlink to the newest one (Unix only).

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Name of the symlink pointing at the newest log file
pub const LATEST_LOG_LINK: &str = "wirestream.log";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// `logging` section of the application config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Write logs to a timestamped file here instead of stderr
    pub directory: Option<PathBuf>,
}

/// Create a timestamped log file in `dir` and point the `wirestream.log`
/// symlink at it.
pub fn open_log_file(dir: &Path) -> std::io::Result<(std::fs::File, PathBuf)> {
    std::fs::create_dir_all(dir)?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-wirestream.log")
        .to_string();
    let path = dir.join(&filename);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    // Windows symlinks need elevated privileges
    #[cfg(unix)]
    {
        let link = dir.join(LATEST_LOG_LINK);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            eprintln!("[logging] Failed to create {} symlink: {}", LATEST_LOG_LINK, e);
        }
    }

    Ok((file, path))
}

/// Install the global subscriber. Repeat calls leave the first one in place.
/// Returns the log file path when logging to a directory.
pub fn init_logging(config: &LoggingConfig) -> std::io::Result<Option<PathBuf>> {
    let (writer, path) = match &config.directory {
        Some(dir) => {
            let (file, path) = open_log_file(dir)?;
            (BoxMakeWriter::new(Mutex::new(file)), Some(path))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_max_level(config.level.as_filter())
        .with_timer(ChronoLocal::new("%H:%M:%S%.3f".to_string()))
        .with_ansi(false)
        .with_target(false);

    match config.format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }

    if let Some(path) = &path {
        tracing::info!("[logging] File logging started: {}", path.display());
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses_lowercase_names() {
        let cfg: LoggingConfig = toml::from_str("format = \"json\"\nlevel = \"debug\"").unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.level, LogLevel::Debug);
        assert_eq!(cfg.directory, None);
        assert_eq!(cfg.level.as_filter(), LevelFilter::DEBUG);
    }

    #[test]
    fn test_open_log_file_creates_file_and_link() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let (_file, path) = open_log_file(&logs).unwrap();
        assert!(path.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("-wirestream.log"));

        #[cfg(unix)]
        assert_eq!(
            std::fs::read_link(logs.join(LATEST_LOG_LINK)).unwrap(),
            PathBuf::from(path.file_name().unwrap())
        );
    }
}
