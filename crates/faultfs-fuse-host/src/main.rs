// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! faultfs FUSE host: mirrors a directory and corrupts selected reads
//!
//! Reads of configured files pass through the injection engine before
//! reaching the caller; a GPT read at offset 0 updates the partition table
//! that partition-relative rules resolve against.

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod adapter;
#[cfg_attr(not(all(feature = "fuse", target_os = "linux")), allow(dead_code))]
mod passthrough;

#[cfg(all(feature = "fuse", target_os = "linux"))]
use adapter::FaultFsFuse;
use anyhow::{Context, Result};
use clap::Parser;
use faultfs_core::{
    CallLog, FaultConfig, FileCallLog, InjectionEngine, PartitionTracker, ReadPipeline,
    SharedCallLog, SqliteCallLog,
};
use faultfs_logging::CliLoggingArgs;
use passthrough::{Passthrough, ReadInterceptor};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "faultfs-fuse-host", version, about = "Passthrough FUSE mount with GPT-aware read fault injection")]
struct Args {
    /// Directory exposed through the mount
    root: PathBuf,

    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Injection rules (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    /// Append call records to this text file
    #[arg(long)]
    call_log: Option<PathBuf>,

    /// Record calls into this SQLite database
    #[arg(long)]
    call_db: Option<PathBuf>,

    /// Store read buffers in the call database
    #[arg(long)]
    log_bytes: bool,

    /// Store SHA-256 of read buffers in the call database
    #[arg(long)]
    log_hash: bool,

    /// Call to record (repeatable; defaults to `read`)
    #[arg(long = "log-call", value_name = "CALL")]
    log_calls: Vec<String>,

    /// Record every call
    #[arg(long)]
    log_all_calls: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

fn load_config(config_path: Option<&Path>) -> Result<FaultConfig> {
    match config_path {
        Some(path) => FaultConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(FaultConfig::default()),
    }
}

fn build_call_log(args: &Args) -> Result<Option<SharedCallLog>> {
    if args.call_log.is_none() && args.call_db.is_none() {
        return Ok(None);
    }

    let mut log = CallLog::new().log_all_calls(args.log_all_calls);
    if args.log_calls.is_empty() {
        log = log.allow_call("read");
    }
    for call in &args.log_calls {
        log = log.allow_call(call.as_str());
    }
    if let Some(path) = &args.call_log {
        let sink = FileCallLog::open(path)
            .with_context(|| format!("opening call log {}", path.display()))?;
        log = log.with_sink(sink);
    }
    if let Some(path) = &args.call_db {
        let sink = SqliteCallLog::open(path, args.log_bytes, args.log_hash)
            .with_context(|| format!("opening call database {}", path.display()))?;
        log = log.with_sink(sink);
    }
    info!(target: "faultfs::calllog", sinks = ?log.sink_names(), "call logging enabled");
    Ok(Some(log.into_shared()))
}

fn build_reads(config: &FaultConfig, call_log: Option<SharedCallLog>) -> Result<ReadInterceptor> {
    let tracker = PartitionTracker::new(config.sector_size);
    let rules = config.build_rules(&tracker).context("building injection rules")?;
    info!(
        target: "faultfs::config",
        rules = rules.len(),
        sector_size = config.sector_size,
        "injection rules loaded"
    );
    let engine = InjectionEngine::new(rules, &tracker);
    Ok(ReadInterceptor::new(ReadPipeline::standard(engine, tracker, call_log)))
}

fn main() -> Result<()> {
    let args = Args::parse();
    args.logging.clone().init("faultfs-fuse-host")?;

    info!("Starting faultfs FUSE host");
    info!("Root: {}, mount point: {}", args.root.display(), args.mount_point.display());

    let config = load_config(args.config.as_deref())?;
    let host = Passthrough::new(&args.root)
        .with_context(|| format!("opening root {}", args.root.display()))?;
    let call_log = build_call_log(&args)?;
    let reads = build_reads(&config, call_log.clone())?;

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        let filesystem = FaultFsFuse::new(host, reads, call_log);

        let mut mount_options = vec![
            fuser::MountOption::FSName("faultfs".to_string()),
            fuser::MountOption::Subtype("faultfs".to_string()),
        ];
        if args.allow_other {
            mount_options.push(fuser::MountOption::AllowOther);
        }
        if args.auto_unmount {
            mount_options.push(fuser::MountOption::AutoUnmount);
        }

        info!("Mounting filesystem...");
        // Single-threaded session: reads reach the pipeline one at a time.
        fuser::mount2(filesystem, &args.mount_point, &mount_options)
            .with_context(|| format!("mounting {}", args.mount_point.display()))?;
        info!("faultfs unmounted");
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        warn!("FUSE support not compiled in. This binary is for testing only.");
        info!(
            root = %host.root().display(),
            stages = ?reads.stage_names(),
            call_log = call_log.is_some(),
            "faultfs configured; nothing mounted"
        );
        info!("To enable FUSE support, compile with: cargo build --features fuse");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["faultfs-fuse-host", "/srv/images", "/mnt/faultfs"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn config_loading_default() {
        let config = load_config(None).expect("default config");
        assert_eq!(config.sector_size, 512);
        assert!(config.modifiers.is_empty());
    }

    #[test]
    fn config_loading_from_file() {
        let mut temp_file = NamedTempFile::new().expect("temp");
        let config_json = r#"{
            "sector_size": 4096,
            "modifiers": [
                {"path": "/disk.img", "key": "smash",
                 "replace": {"source": "str", "value": "XXXX"},
                 "trigger": {"type": "byte_read_count", "byte": 4096, "value": 1}}
            ]
        }"#;
        temp_file.write_all(config_json.as_bytes()).expect("write");
        temp_file.flush().expect("flush");

        let config = load_config(Some(temp_file.path())).expect("config");
        assert_eq!(config.sector_size, 4096);
        assert_eq!(config.modifiers.len(), 1);

        let reads = build_reads(&config, None).expect("pipeline");
        assert_eq!(reads.stage_names(), vec!["inject", "track"]);
    }

    #[test]
    fn config_errors_name_the_file() {
        let mut temp_file = NamedTempFile::new().expect("temp");
        temp_file.write_all(b"{ not json").expect("write");
        let err = load_config(Some(temp_file.path())).expect_err("bad json");
        assert!(format!("{err:#}").contains("loading config"));
    }

    #[test]
    fn parses_mount_and_logging_flags() {
        let parsed = args(&[
            "--config",
            "/etc/faultfs.json",
            "--allow-other",
            "--log-call",
            "read",
            "--log-call",
            "write",
            "--log-level",
            "debug",
        ]);
        assert_eq!(parsed.root, PathBuf::from("/srv/images"));
        assert_eq!(parsed.mount_point, PathBuf::from("/mnt/faultfs"));
        assert_eq!(parsed.config, Some(PathBuf::from("/etc/faultfs.json")));
        assert!(parsed.allow_other);
        assert!(!parsed.auto_unmount);
        assert_eq!(parsed.log_calls, vec!["read", "write"]);
        assert!(parsed.logging.log_level.is_some());
    }

    #[test]
    fn call_log_disabled_without_sinks() {
        assert!(build_call_log(&args(&[])).expect("no log").is_none());
    }

    #[test]
    fn call_log_defaults_to_reads() {
        let dir = TempDir::new().expect("tempdir");
        let db = dir.path().join("calls.db");
        let text = dir.path().join("calls.log");
        let parsed = args(&[
            "--call-db",
            db.to_str().expect("utf8"),
            "--call-log",
            text.to_str().expect("utf8"),
        ]);
        let log = build_call_log(&parsed).expect("log").expect("enabled");
        let log = log.lock().expect("log");
        assert_eq!(log.sink_names(), vec!["file", "sqlite"]);
        assert!(log.is_enabled("read"));
        assert!(!log.is_enabled("write"));
        assert!(db.exists());
        assert!(text.exists());
    }
}
