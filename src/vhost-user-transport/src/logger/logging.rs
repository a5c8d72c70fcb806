// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use std::thread;

use log::{Log, Metadata, Record};
use serde::{Deserialize, Deserializer, Serialize};

use super::extract_guard;
use super::metrics::{IncMetric, METRICS};
use super::time::LocalTime;

/// Level filter applied until a configuration says otherwise.
pub const DEFAULT_LEVEL: log::LevelFilter = log::LevelFilter::Info;
/// Back-end name printed when none was set.
pub const DEFAULT_BACKEND_NAME: &str = "vhost-user-backend";
/// Name of the back-end process, printed in every log line.
pub static BACKEND_NAME: OnceLock<String> = OnceLock::new();

/// The process logger.
pub static LOGGER: Logger = Logger::new();

/// Error type for [`Logger::init`].
pub type LoggerInitError = log::SetLoggerError;

/// Error type for [`Logger::update`].
#[derive(Debug, thiserror::Error)]
#[error("Failed to open log file: {0}")]
pub struct LoggerUpdateError(pub std::io::Error);

/// Errors associated with configuring the process logger.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum LoggerConfigError {
    /// Failed to install the logger: {0}
    Init(#[from] LoggerInitError),
    /// {0}
    Update(#[from] LoggerUpdateError),
}

#[derive(Debug)]
struct LoggerState {
    target: Option<File>,
    module: Option<String>,
    show_level: bool,
    show_log_origin: bool,
}

impl LoggerState {
    fn accepts(&self, record: &Record) -> bool {
        match (&self.module, record.module_path()) {
            (Some(filter), Some(source)) => source.starts_with(filter.as_str()),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    // `<time> [<backend>:<thread>[:<level>][:<file>:<line>]] <message>`
    fn format(&self, record: &Record) -> String {
        let thread = thread::current().name().unwrap_or("-").to_string();
        let level = match self.show_level {
            true => format!(":{}", record.level()),
            false => String::new(),
        };
        let origin = match self.show_log_origin {
            true => format!(
                ":{}:{}",
                record.file().unwrap_or("?"),
                record
                    .line()
                    .map_or_else(|| String::from("?"), |line| line.to_string())
            ),
            false => String::new(),
        };

        format!(
            "{} [{}:{thread}{level}{origin}] {}\n",
            LocalTime::now(),
            BACKEND_NAME
                .get()
                .map_or(DEFAULT_BACKEND_NAME, String::as_str),
            record.args()
        )
    }
}

/// Line-oriented logger writing to stdout or to a configured file.
#[derive(Debug)]
pub struct Logger(Mutex<LoggerState>);

impl Logger {
    /// A logger writing everything to stdout, without level or origin.
    pub const fn new() -> Self {
        Logger(Mutex::new(LoggerState {
            target: None,
            module: None,
            show_level: false,
            show_log_origin: false,
        }))
    }

    /// Installs the logger as the `log` facade backend.
    pub fn init(&'static self) -> Result<(), LoggerInitError> {
        log::set_logger(self)?;
        log::set_max_level(DEFAULT_LEVEL);
        Ok(())
    }

    /// Applies the given configuration to the logger. Unset fields keep their value.
    pub fn update(&self, config: LoggerConfig) -> Result<(), LoggerUpdateError> {
        // Open before locking so a failed open leaves the logger untouched.
        let target = match config.log_path {
            Some(path) => Some(
                std::fs::OpenOptions::new()
                    .custom_flags(libc::O_NONBLOCK)
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(LoggerUpdateError)?,
            ),
            None => None,
        };

        let mut state = extract_guard(self.0.lock());
        if let Some(level) = config.level {
            log::set_max_level(level.into());
        }
        if target.is_some() {
            state.target = target;
        }
        if let Some(show_level) = config.show_level {
            state.show_level = show_level;
        }
        if let Some(show_log_origin) = config.show_log_origin {
            state.show_log_origin = show_log_origin;
        }
        if let Some(module) = config.module {
            state.module = Some(module);
        }
        Ok(())
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for Logger {
    // Level filtering happens through `log::max_level`.
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut state = extract_guard(self.0.lock());
        if !state.accepts(record) {
            return;
        }

        let line = state.format(record);
        let result = match &mut state.target {
            Some(file) => file.write_all(line.as_bytes()),
            None => std::io::stdout().write_all(line.as_bytes()),
        };
        if result.is_err() {
            METRICS.logger.missed_log_count.inc();
        }
    }

    fn flush(&self) {
        let mut state = extract_guard(self.0.lock());
        let result = match &mut state.target {
            Some(file) => file.flush(),
            None => std::io::stdout().flush(),
        };
        if result.is_err() {
            METRICS.logger.missed_log_count.inc();
        }
    }
}

/// Installs [`LOGGER`] for the process and configures it.
///
/// Fails if a `log` backend is already installed; the logger can still be reconfigured
/// through [`Logger::update`] afterwards.
pub fn init_logger(config: LoggerConfig) -> Result<(), LoggerConfigError> {
    LOGGER.init()?;
    LOGGER.update(config)?;
    log::info!(
        "Running {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}

/// Logger settings of a back-end process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// File or named pipe receiving the log lines; stdout when unset.
    pub log_path: Option<PathBuf>,
    /// Most verbose level that is logged.
    pub level: Option<LevelFilter>,
    /// Whether lines carry the record level.
    pub show_level: Option<bool>,
    /// Whether lines carry the source file and line.
    pub show_log_origin: Option<bool>,
    /// Only records from modules starting with this path are logged.
    pub module: Option<String>,
}

/// Log level filter accepting case-insensitive names and the `warning` alias.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LevelFilter {
    /// [`log::LevelFilter::Off`]
    Off,
    /// [`log::LevelFilter::Trace`]
    Trace,
    /// [`log::LevelFilter::Debug`]
    Debug,
    /// [`log::LevelFilter::Info`]
    Info,
    /// [`log::LevelFilter::Warn`]
    Warn,
    /// [`log::LevelFilter::Error`]
    Error,
}

impl From<LevelFilter> for log::LevelFilter {
    fn from(filter: LevelFilter) -> log::LevelFilter {
        match filter {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Trace => log::LevelFilter::Trace,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Error => log::LevelFilter::Error,
        }
    }
}

impl<'de> Deserialize<'de> for LevelFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let key = String::deserialize(deserializer)?;
        LevelFilter::from_str(&key).map_err(D::Error::custom)
    }
}

/// Error type for [`<LevelFilter as FromStr>::from_str`].
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Failed to parse string to level filter: {0}")]
pub struct LevelFilterFromStrError(String);

impl FromStr for LevelFilter {
    type Err = LevelFilterFromStrError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(LevelFilterFromStrError(String::from(s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use log::Level;
    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    fn record_line(logger: &Logger, module: &str) {
        logger.log(
            &Record::builder()
                .args(format_args!("failed to bind"))
                .metadata(Metadata::builder().level(Level::Error).build())
                .file(Some("transport/af_unix/mod.rs"))
                .line(Some(42))
                .module_path(Some(module))
                .build(),
        );
    }

    #[test]
    fn test_levelfilter_from_str() {
        for (level, level_enum) in [
            ("off", LevelFilter::Off),
            ("TRACE", LevelFilter::Trace),
            ("Debug", LevelFilter::Debug),
            ("info", LevelFilter::Info),
            ("warn", LevelFilter::Warn),
            ("Warning", LevelFilter::Warn),
            ("error", LevelFilter::Error),
        ] {
            assert_eq!(LevelFilter::from_str(level), Ok(level_enum));
            let json = format!("{{ \"level\": \"{level}\" }}");
            let config: LoggerConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(config.level, Some(level_enum));
        }
        assert_eq!(
            LevelFilter::from_str("bad"),
            Err(LevelFilterFromStrError(String::from("bad")))
        );
        serde_json::from_str::<LoggerConfig>("{ \"level\": \"blah\" }").unwrap_err();
        serde_json::from_str::<LoggerConfig>("{ \"colour\": true }").unwrap_err();
    }

    #[test]
    fn test_update_and_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.as_path().join("log");
        let logger = Logger::new();

        // A bad path leaves the logger untouched.
        let bad = LoggerConfig {
            log_path: Some(dir.as_path().join("missing/log")),
            show_level: Some(true),
            ..Default::default()
        };
        logger.update(bad).unwrap_err();
        assert!(!extract_guard(logger.0.lock()).show_level);

        logger
            .update(LoggerConfig {
                log_path: Some(path.clone()),
                show_level: Some(true),
                show_log_origin: Some(true),
                module: Some(String::from("vhost_user_transport")),
                ..Default::default()
            })
            .unwrap();
        assert!(logger.enabled(&Metadata::builder().level(Level::Debug).build()));

        record_line(&logger, "vhost_user_transport::transport::af_unix");
        record_line(&logger, "other_crate");
        logger.flush();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        let (time, rest) = contents.split_once(' ').unwrap();
        assert_eq!(time.len(), "2026-10-19T09:41:07.000005000".len());
        assert_eq!(&time[10..11], "T");
        let thread = thread::current().name().unwrap_or("-").to_string();
        assert_eq!(
            rest,
            format!(
                "[{DEFAULT_BACKEND_NAME}:{thread}:ERROR:transport/af_unix/mod.rs:42] failed to bind\n"
            )
        );

        // Hiding the origin keeps the target and the filter.
        logger
            .update(LoggerConfig {
                show_log_origin: Some(false),
                ..Default::default()
            })
            .unwrap();
        record_line(&logger, "vhost_user_transport::manager");
        let contents = std::fs::read_to_string(&path).unwrap();
        let last = contents.lines().last().unwrap();
        assert!(last.ends_with(&format!("[{DEFAULT_BACKEND_NAME}:{thread}:ERROR] failed to bind")));
    }
}
