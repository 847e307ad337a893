//! Structured logging through `tracing`.
//!
//! `LoggingConfig` picks the filter, format and sinks; the `CACHEFSD_LOG*`
//! environment variables override it at startup.

use crate::error::DaemonError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const ENV_FILTER: &str = "CACHEFSD_LOG";
const ENV_FORMAT: &str = "CACHEFSD_LOG_FORMAT";
const ENV_OUTPUT: &str = "CACHEFSD_LOG_OUTPUT";
const ENV_FILE: &str = "CACHEFSD_LOG_FILE";
const ENV_MODULES: &str = "CACHEFSD_LOG_MODULES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(DaemonError::ConfigError(format!(
                "log format {:?} is not text or json",
                other
            ))),
        }
    }
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum LogOutput {
    #[serde(rename = "stdout")]
    #[value(name = "stdout")]
    Stdout,
    #[serde(rename = "stderr")]
    #[value(name = "stderr")]
    Stderr,
    #[serde(rename = "file")]
    #[value(name = "file")]
    File,
    #[serde(rename = "file+stderr")]
    #[value(name = "file+stderr")]
    FileAndStderr,
    #[serde(rename = "both")]
    #[value(name = "both")]
    Both,
}

impl LogOutput {
    fn writes_file(self) -> bool {
        matches!(self, Self::File | Self::FileAndStderr)
    }

    fn is_terminal(self) -> bool {
        !self.writes_file()
    }
}

impl FromStr for LogOutput {
    type Err = DaemonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "stdout" => Self::Stdout,
            "stderr" => Self::Stderr,
            "file" => Self::File,
            "file+stderr" => Self::FileAndStderr,
            "both" => Self::Both,
            other => {
                return Err(DaemonError::ConfigError(format!(
                    "log output {:?} is not one of stdout, stderr, file, file+stderr, both",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Filter level: trace, debug, info, warn, error or off
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default = "default_format")]
    pub format: LogFormat,

    /// A daemon under an init system already has its stderr captured.
    #[serde(default = "default_output")]
    pub output: LogOutput,

    /// Log file when `output` writes one; unset means the state directory
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// ANSI colors for terminal text output
    #[serde(default = "default_true")]
    pub color: bool,

    /// Per-target levels, e.g. `cachefsd::server = "trace"`
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> LogFormat {
    LogFormat::Text
}

fn default_output() -> LogOutput {
    LogOutput::Stderr
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_level(),
            format: default_format(),
            output: default_output(),
            file: None,
            color: true,
            modules: BTreeMap::new(),
        }
    }
}

impl LoggingConfig {
    /// Apply the `CACHEFSD_LOG_*` overrides. The filter variable itself is
    /// read when the filter is built.
    fn with_env_overrides(&self) -> Result<Self, DaemonError> {
        let mut resolved = self.clone();
        if let Some(format) = env_value(ENV_FORMAT) {
            resolved.format = format.parse()?;
        }
        if let Some(output) = env_value(ENV_OUTPUT) {
            resolved.output = output.parse()?;
        }
        if let Some(file) = env_value(ENV_FILE) {
            resolved.file = Some(PathBuf::from(file));
        }
        if let Some(modules) = env_value(ENV_MODULES) {
            for pair in modules.split(',') {
                if let Some((target, level)) = pair.split_once('=') {
                    resolved
                        .modules
                        .insert(target.trim().to_string(), level.trim().to_string());
                }
            }
        }
        Ok(resolved)
    }

    fn filter(&self) -> Result<EnvFilter, DaemonError> {
        if let Ok(filter) = EnvFilter::try_from_env(ENV_FILTER) {
            return Ok(filter);
        }
        if self.level == "off" {
            return Ok(EnvFilter::new("off"));
        }
        self.modules
            .iter()
            .try_fold(EnvFilter::new(&self.level), |filter, (target, level)| {
                let directive = format!("{}={}", target, level).parse().map_err(|e| {
                    DaemonError::ConfigError(format!("log directive {}={}: {}", target, level, e))
                })?;
                Ok(filter.add_directive(directive))
            })
    }

    fn writer(&self) -> Result<BoxMakeWriter, DaemonError> {
        Ok(match self.output {
            LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
            LogOutput::Both => BoxMakeWriter::new(std::io::stdout.and(std::io::stderr)),
            LogOutput::File => BoxMakeWriter::new(open_log_file(&self.log_file()?)?),
            LogOutput::FileAndStderr => {
                BoxMakeWriter::new(open_log_file(&self.log_file()?)?.and(std::io::stderr))
            }
        })
    }

    fn log_file(&self) -> Result<PathBuf, DaemonError> {
        match self.file.as_ref().filter(|p| !p.as_os_str().is_empty()) {
            Some(path) => Ok(path.clone()),
            None => default_log_file(),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn default_log_file() -> Result<PathBuf, DaemonError> {
    let dirs = directories::ProjectDirs::from("", "cachefsd", "cachefsd")
        .ok_or_else(|| DaemonError::ConfigError("no home directory for the log file".to_string()))?;
    let state = dirs
        .state_dir()
        .ok_or_else(|| DaemonError::ConfigError("no state directory for the log file".to_string()))?;
    Ok(state.join("cachefsd.log"))
}

fn open_log_file(path: &Path) -> Result<File, DaemonError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            DaemonError::ConfigError(format!("log directory {}: {}", parent.display(), e))
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DaemonError::ConfigError(format!("log file {}: {}", path.display(), e)))
}

/// Install the global subscriber. Environment overrides win over `config`,
/// which wins over the defaults.
pub fn init_logging(config: Option<&LoggingConfig>) -> Result<(), DaemonError> {
    let base = config.cloned().unwrap_or_default();
    let installed = if !base.enabled {
        Registry::default()
            .with(EnvFilter::new("off"))
            .with(fmt::layer().with_writer(std::io::sink))
            .try_init()
    } else {
        let config = base.with_env_overrides()?;
        let registry = Registry::default().with(config.filter()?);
        let layer = fmt::layer()
            .with_target(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_writer(config.writer()?);
        match config.format {
            LogFormat::Json => registry.with(layer.json()).try_init(),
            LogFormat::Text => registry
                .with(layer.with_ansi(config.color && config.output.is_terminal()))
                .try_init(),
        }
    };
    installed.map_err(|e| DaemonError::ConfigError(format!("log subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_log_text_to_stderr() {
        let config = LoggingConfig::default();
        assert!(config.enabled);
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.output, LogOutput::Stderr);
        assert!(config.file.is_none());
    }

    #[test]
    fn output_names_parse() {
        assert_eq!("file+stderr".parse::<LogOutput>().unwrap(), LogOutput::FileAndStderr);
        assert!(LogOutput::FileAndStderr.writes_file());
        assert!(LogOutput::Both.is_terminal());
        assert!("syslog".parse::<LogOutput>().is_err());
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn config_reads_output_names() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"output": "file+stderr", "format": "json"}"#).unwrap();
        assert_eq!(config.output, LogOutput::FileAndStderr);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn explicit_log_file_wins() {
        let config = LoggingConfig {
            file: Some(PathBuf::from("/tmp/cachefsd-test.log")),
            ..LoggingConfig::default()
        };
        assert_eq!(config.log_file().unwrap(), PathBuf::from("/tmp/cachefsd-test.log"));
    }

    #[test]
    fn module_levels_become_directives() {
        if std::env::var(ENV_FILTER).is_ok() {
            return;
        }
        let mut config = LoggingConfig::default();
        config.modules.insert("cachefsd::server".to_string(), "trace".to_string());
        assert!(config.filter().is_ok());
        config.modules.insert("cachefsd::kernel".to_string(), "loud".to_string());
        assert!(config.filter().is_err());
    }
}
