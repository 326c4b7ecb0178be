// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{Log, Metadata, Record};
use serde::{Deserialize, Serialize};

use crate::time::RtcTime;

/// Level used until a configuration says otherwise.
pub const DEFAULT_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// The process logger.
pub static LOGGER: Logger = Logger {
    state: Mutex::new(LoggerState {
        target: None,
        module: None,
        show_level: false,
        show_origin: false,
    }),
    dropped: AtomicU64::new(0),
};

/// Error type for [`Logger::init`].
pub type LoggerInitError = log::SetLoggerError;

/// Error type for [`Logger::update`].
#[derive(Debug, thiserror::Error)]
#[error("Failed to open log file: {0}")]
pub struct LoggerUpdateError(pub std::io::Error);

#[derive(Debug)]
struct LoggerState {
    // stderr when unset
    target: Option<File>,
    module: Option<String>,
    show_level: bool,
    show_origin: bool,
}

impl LoggerState {
    fn accepts(&self, record: &Record) -> bool {
        match (&self.module, record.module_path()) {
            (None, _) => true,
            (Some(prefix), Some(path)) => path.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        }
    }

    fn format(&self, record: &Record) -> String {
        let mut line = match RtcTime::now() {
            Some(now) => now.to_string(),
            None => String::from("-"),
        };
        let thread = std::thread::current();
        let _ = write!(line, " [{}", thread.name().unwrap_or("-"));
        if self.show_level {
            let _ = write!(line, ":{}", record.level());
        }
        if self.show_origin {
            let _ = write!(line, ":{}:", record.file().unwrap_or("?"));
            match record.line() {
                Some(number) => {
                    let _ = write!(line, "{number}");
                }
                None => line.push('?'),
            }
        }
        let _ = writeln!(line, "] {}", record.args());
        line
    }
}

/// Writes `log` records to a file or stderr.
#[derive(Debug)]
pub struct Logger {
    state: Mutex<LoggerState>,
    dropped: AtomicU64,
}

impl Logger {
    /// Installs the logger as the `log` backend at [`DEFAULT_LEVEL`].
    pub fn init(&'static self) -> Result<(), LoggerInitError> {
        log::set_logger(self)?;
        log::set_max_level(DEFAULT_LEVEL);
        Ok(())
    }

    // Logging from a panicking thread must not poison every later record.
    fn state(&self) -> MutexGuard<'_, LoggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `config`. Unset fields keep their current value.
    pub fn update(&self, config: LoggerConfig) -> Result<(), LoggerUpdateError> {
        let target = config
            .log_path
            .map(|path| {
                std::fs::OpenOptions::new()
                    .custom_flags(libc::O_NONBLOCK)
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(LoggerUpdateError)
            })
            .transpose()?;

        let mut state = self.state();
        if target.is_some() {
            state.target = target;
        }
        if let Some(module) = config.module {
            state.module = Some(module);
        }
        state.show_level = config.show_level.unwrap_or(state.show_level);
        state.show_origin = config.show_log_origin.unwrap_or(state.show_origin);
        drop(state);

        log::set_max_level(config.level.map_or(DEFAULT_LEVEL, log::LevelFilter::from));
        Ok(())
    }

    /// Records that could not be written.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut state = self.state();
        if !state.accepts(record) {
            return;
        }
        let line = state.format(record);
        let written = match state.target.as_mut() {
            Some(file) => file.write_all(line.as_bytes()),
            None => std::io::stderr().write_all(line.as_bytes()),
        };
        if written.is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn flush(&self) {}
}

/// Logger section of the machine configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// File or named pipe receiving the log.
    pub log_path: Option<PathBuf>,
    /// Maximum level logged.
    pub level: Option<LevelFilter>,
    /// Prefix records with their level.
    pub show_level: Option<bool>,
    /// Prefix records with their source file and line.
    pub show_log_origin: Option<bool>,
    /// Only log records whose module path starts with this, e.g. `spapr::ddw`.
    pub module: Option<String>,
}

/// Configurable log level.
///
/// Parsing ignores case and takes `warning` as an alias of `warn`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String")]
pub enum LevelFilter {
    Off,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

const LEVEL_NAMES: [(&str, LevelFilter); 7] = [
    ("off", LevelFilter::Off),
    ("trace", LevelFilter::Trace),
    ("debug", LevelFilter::Debug),
    ("info", LevelFilter::Info),
    ("warn", LevelFilter::Warn),
    ("warning", LevelFilter::Warn),
    ("error", LevelFilter::Error),
];

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

/// Unknown level name.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("Unknown log level: {0}")]
pub struct LevelFilterFromStrError(String);

impl FromStr for LevelFilter {
    type Err = LevelFilterFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LEVEL_NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
            .map(|(_, level)| *level)
            .ok_or_else(|| LevelFilterFromStrError(s.to_string()))
    }
}

impl TryFrom<String> for LevelFilter {
    type Error = LevelFilterFromStrError;

    fn try_from(s: String) -> Result<Self, LevelFilterFromStrError> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;
    use log::Level;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    fn capitalize(s: &str) -> String {
        let mut chars = s.chars();
        chars
            .next()
            .map(|first| first.to_ascii_uppercase().to_string() + chars.as_str())
            .unwrap_or_default()
    }

    #[test]
    fn test_level_names() {
        let spellings: [fn(&str) -> String; 3] = [str::to_lowercase, str::to_uppercase, capitalize];
        for ((name, level), spell) in LEVEL_NAMES.iter().cartesian_product(spellings) {
            let spelled = spell(name);
            assert_eq!(spelled.parse::<LevelFilter>(), Ok(*level));
            let config: LoggerConfig =
                serde_json::from_str(&format!(r#"{{ "level": "{spelled}" }}"#)).unwrap();
            assert_eq!(config.level, Some(*level));
        }
        assert_eq!(
            "loud".parse::<LevelFilter>(),
            Err(LevelFilterFromStrError(String::from("loud")))
        );
        assert!(serde_json::from_str::<LoggerConfig>(r#"{ "level": "loud" }"#).is_err());
        assert_eq!(log::LevelFilter::from(LevelFilter::Warn), log::LevelFilter::Warn);
    }

    #[test]
    fn test_config_deserialize() {
        let config: LoggerConfig =
            serde_json::from_str(r#"{ "level": "Debug", "show_level": true }"#).unwrap();
        assert_eq!(config.level, Some(LevelFilter::Debug));
        assert_eq!(config.show_level, Some(true));
        assert_eq!(config.log_path, None);
        assert!(serde_json::from_str::<LoggerConfig>(r#"{ "colour": true }"#).is_err());
    }

    #[test]
    fn test_module_filter_and_format() {
        let file = TempFile::new().unwrap();
        let path = file.as_path().to_path_buf();
        let logger = Logger {
            state: Mutex::new(LoggerState {
                target: None,
                module: None,
                show_level: false,
                show_origin: false,
            }),
            dropped: AtomicU64::new(0),
        };
        logger
            .update(LoggerConfig {
                log_path: Some(path.clone()),
                module: Some(String::from("spapr::ddw")),
                show_level: Some(true),
                show_log_origin: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert!(logger.enabled(&Metadata::builder().level(Level::Trace).build()));

        let metadata = Metadata::builder().level(Level::Warn).build();
        logger.log(
            &Record::builder()
                .args(format_args!("skipped"))
                .metadata(metadata.clone())
                .module_path(Some("spapr::eeh"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .args(format_args!("window created"))
                .metadata(metadata)
                .file(Some("src/ddw/mod.rs"))
                .line(Some(42))
                .module_path(Some("spapr::ddw"))
                .build(),
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let (_stamp, rest) = contents.split_once(' ').unwrap();
        let thread = std::thread::current().name().unwrap_or("-").to_string();
        assert_eq!(rest, format!("[{thread}:WARN:src/ddw/mod.rs:42] window created\n"));
        assert_eq!(logger.dropped(), 0);
    }
}
