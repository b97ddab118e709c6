// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging setup for faultfs binaries
//!
//! Console output by default; a log file when `--log-file` or `--log-dir`
//! is given; a bare `--log-file` name lands in [`get_standard_log_path`]'s
//! directory. `RUST_LOG` overrides the level chosen on the command line.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing::Level;

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plaintext,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {s}. Use 'plaintext' or 'json'")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

/// Logging flags; use with `#[command(flatten)]`.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    #[arg(long, value_enum, help = "Log verbosity level (default: info)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<CliLogLevel>,

    #[arg(long, value_enum, help = "Log output format (default: plaintext)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    #[arg(long, help = "Directory for log files")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    #[arg(
        long,
        help = "Log filename, relative to --log-dir unless absolute; a bare name without --log-dir lands in the standard log directory"
    )]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl CliLoggingArgs {
    /// Install the global subscriber for `component`.
    pub fn init(self, component: &str) -> anyhow::Result<()> {
        let level = self.log_level.unwrap_or_default().into();
        let format = self.log_format.unwrap_or_default();
        match self.log_path(component) {
            Some(path) => init_to_file(component, level, format, &path),
            None => init(component, level, format),
        }
    }

    /// File to log to, or `None` for the console.
    pub fn log_path(&self, component: &str) -> Option<PathBuf> {
        match (&self.log_dir, &self.log_file) {
            (None, None) => None,
            (_, Some(file)) if file.is_absolute() => Some(file.clone()),
            (Some(dir), Some(file)) => Some(dir.join(file)),
            (None, Some(file)) if is_bare_name(file) => {
                let standard = get_standard_log_path(component);
                Some(standard.parent().map_or_else(|| file.clone(), |dir| dir.join(file)))
            }
            (None, Some(file)) => Some(file.clone()),
            (Some(dir), None) => Some(dir.join(format!("{component}.log"))),
        }
    }
}

fn is_bare_name(file: &Path) -> bool {
    file.parent().map_or(true, |parent| parent.as_os_str().is_empty())
}

/// Platform log location for `component`:
/// `~/.local/share/faultfs/<component>.log` on Linux,
/// `~/Library/Logs/faultfs/<component>.log` on macOS.
pub fn get_standard_log_path(component: &str) -> PathBuf {
    #[cfg(target_os = "macos")]
    let mut path = {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        path.push("Library");
        path.push("Logs");
        path
    };

    #[cfg(not(target_os = "macos"))]
    let mut path = dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"));

    path.push("faultfs");
    path.push(format!("{component}.log"));
    path
}

pub fn init(component: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stderr)
}

/// Append to `log_path`, creating parent directories as needed.
pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let log_file = fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    init_with_writer(component, default_level, format, log_file)
}

pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(component, default_level)));

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);

            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }

    Ok(())
}

/// Filter directives used when `RUST_LOG` is unset. faultfs events log under
/// `faultfs::*` targets, which follow the same level as the component.
fn default_directives(component: &str, level: Level) -> String {
    let component = component.replace('-', "_");
    format!("{level},{component}={level},faultfs={level}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Args {
        #[command(flatten)]
        logging: CliLoggingArgs,
    }

    #[test]
    fn parses_flattened_flags() {
        let args = Args::parse_from([
            "faultfs",
            "--log-level",
            "debug",
            "--log-format",
            "json",
            "--log-dir",
            "/var/log/faultfs",
        ]);
        assert_eq!(args.logging.log_level, Some(CliLogLevel::Debug));
        assert_eq!(args.logging.log_format, Some(LogFormat::Json));
        assert_eq!(
            args.logging.log_path("faultfs-fuse-host"),
            Some(PathBuf::from("/var/log/faultfs/faultfs-fuse-host.log"))
        );
    }

    #[test]
    fn console_unless_a_file_option_is_given() {
        assert_eq!(CliLoggingArgs::default().log_path("x"), None);

        let relative = CliLoggingArgs {
            log_dir: Some(PathBuf::from("/logs")),
            log_file: Some(PathBuf::from("run/host.log")),
            ..Default::default()
        };
        assert_eq!(relative.log_path("x"), Some(PathBuf::from("/logs/run/host.log")));

        let absolute = CliLoggingArgs {
            log_dir: Some(PathBuf::from("/logs")),
            log_file: Some(PathBuf::from("/elsewhere/host.log")),
            ..Default::default()
        };
        assert_eq!(absolute.log_path("x"), Some(PathBuf::from("/elsewhere/host.log")));
    }

    #[test]
    fn level_and_format_conversions() {
        assert_eq!(Level::from(CliLogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(CliLogLevel::default()), Level::INFO);
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Plaintext.to_string(), "plaintext");
    }

    #[test]
    fn default_directives_cover_component_and_core() {
        assert_eq!(
            default_directives("faultfs-fuse-host", Level::DEBUG),
            "DEBUG,faultfs_fuse_host=DEBUG,faultfs=DEBUG"
        );
    }

    #[test]
    fn standard_path_is_per_component() {
        let path = get_standard_log_path("faultfs-fuse-host");
        assert!(path.ends_with("faultfs/faultfs-fuse-host.log"));
    }

    #[test]
    fn bare_log_file_lands_in_standard_directory() {
        let bare = CliLoggingArgs {
            log_file: Some(PathBuf::from("host.log")),
            ..Default::default()
        };
        let standard = get_standard_log_path("faultfs-fuse-host");
        let expected = standard.parent().expect("standard dir").join("host.log");
        assert_eq!(bare.log_path("faultfs-fuse-host"), Some(expected));

        let nested = CliLoggingArgs {
            log_file: Some(PathBuf::from("run/host.log")),
            ..Default::default()
        };
        assert_eq!(nested.log_path("faultfs-fuse-host"), Some(PathBuf::from("run/host.log")));
    }

    #[test]
    fn file_init_writes_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("host.log");
        init_to_file("faultfs-test", Level::INFO, LogFormat::Json, &path).expect("init");
        tracing::error!(target: "faultfs::test", answer = 42, "logged to file");

        let content = fs::read_to_string(&path).expect("log file");
        assert!(content.contains("logged to file"));
        assert!(content.contains("\"answer\":42"));
    }
}
