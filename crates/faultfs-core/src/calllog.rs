// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Call logging for filesystem operations
//!
//! Records go to one or more sinks: an append-only text log and/or a SQLite
//! database. Only call names on the allow-list are recorded unless the log
//! is configured to record everything.

use crate::error::{CallLogResult, FaultResult};
use crate::pipeline::{ReadEvent, ReadStage};
use crate::tracker::SharedHistory;
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Longest string value written to the text log
pub const MAX_FIELD_CHARS: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    PostRun,
    Error,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            CallState::PostRun => "post-run",
            CallState::Error => "error",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed (or failed) filesystem call
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub call: String,
    pub state: CallState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip)]
    pub buffer: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

impl CallRecord {
    fn new(call: &str, state: CallState) -> Self {
        Self {
            call: call.to_string(),
            state,
            path: None,
            offset: None,
            length: None,
            buffer: None,
            error: None,
            partition: None,
        }
    }

    pub fn post_run(call: &str) -> Self {
        Self::new(call, CallState::PostRun)
    }

    pub fn error(call: &str, error: impl fmt::Display) -> Self {
        let mut record = Self::new(call, CallState::Error);
        record.error = Some(error.to_string());
        record
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_range(mut self, offset: u64, length: u64) -> Self {
        self.offset = Some(offset);
        self.length = Some(length);
        self
    }

    pub fn with_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn with_partition(mut self, partition: Option<String>) -> Self {
        self.partition = partition;
        self
    }

    /// `(offset << 8) + (length >> 12)`, when both are known and the result fits.
    pub fn composite_key(&self) -> Option<i64> {
        let (offset, length) = (self.offset?, self.length?);
        let key = ((offset as u128) << 8) + (length as u128 >> 12);
        i64::try_from(key).ok()
    }

    fn to_json_line(&self) -> CallLogResult<String> {
        let mut value = serde_json::to_value(self)?;
        if let (Value::Object(map), Some(buffer)) = (&mut value, &self.buffer) {
            map.insert("buffer_length".into(), Value::from(buffer.len()));
            map.insert("buffer".into(), Value::from(hex::encode(buffer)));
        }
        if let Value::Object(map) = &mut value {
            for field in map.values_mut() {
                if let Value::String(text) = field {
                    truncate_chars(text, MAX_FIELD_CHARS);
                }
            }
        }
        Ok(serde_json::to_string(&value)?)
    }
}

fn truncate_chars(text: &mut String, max: usize) {
    if let Some((idx, _)) = text.char_indices().nth(max) {
        text.truncate(idx);
    }
}

pub trait CallLogSink: Send {
    fn name(&self) -> &'static str;
    fn record(&mut self, record: &CallRecord) -> CallLogResult<()>;
}

/// Line-oriented text log: `<call>: state: <state>:   <json>`
pub struct FileCallLog {
    out: LineWriter<File>,
}

impl FileCallLog {
    /// Open (creating parent directories) in append mode and mark the start of a run.
    pub fn open(path: &Path) -> CallLogResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut out = LineWriter::new(file);
        writeln!(
            out,
            "=== faultfs run {} (pid {}) ===",
            Utc::now().to_rfc3339(),
            std::process::id()
        )?;
        Ok(Self { out })
    }
}

impl CallLogSink for FileCallLog {
    fn name(&self) -> &'static str {
        "file"
    }

    fn record(&mut self, record: &CallRecord) -> CallLogResult<()> {
        let json = record.to_json_line()?;
        writeln!(self.out, "{}: state: {}:   {}", record.call, record.state, json)?;
        Ok(())
    }
}

/// SQLite sink; one row per call in table `calls`.
pub struct SqliteCallLog {
    conn: Connection,
    log_bytes: bool,
    log_hash: bool,
}

const CREATE_CALLS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    call TEXT NOT NULL,
    state TEXT NOT NULL,
    path TEXT,
    offset INTEGER,
    length INTEGER,
    buffer BLOB,
    buffer_length INTEGER,
    buffer_hash TEXT,
    composite_key INTEGER,
    partition TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS calls_composite_key ON calls (composite_key);
";

impl SqliteCallLog {
    pub fn open(path: &Path, log_bytes: bool, log_hash: bool) -> CallLogResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Self::with_connection(Connection::open(path)?, log_bytes, log_hash)
    }

    pub fn in_memory(log_bytes: bool, log_hash: bool) -> CallLogResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, log_bytes, log_hash)
    }

    fn with_connection(conn: Connection, log_bytes: bool, log_hash: bool) -> CallLogResult<Self> {
        conn.execute_batch(CREATE_CALLS_TABLE)?;
        Ok(Self {
            conn,
            log_bytes,
            log_hash,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl CallLogSink for SqliteCallLog {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn record(&mut self, record: &CallRecord) -> CallLogResult<()> {
        let buffer = record.buffer.as_deref();
        let stored = buffer.filter(|_| self.log_bytes);
        let hash = buffer
            .filter(|_| self.log_hash)
            .map(|bytes| hex::encode(Sha256::digest(bytes)));
        let to_i64 = |value: Option<u64>| value.and_then(|v| i64::try_from(v).ok());

        self.conn.execute(
            "INSERT INTO calls (ts, call, state, path, offset, length, buffer, buffer_length,
                                buffer_hash, composite_key, partition, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                Utc::now().to_rfc3339(),
                record.call,
                record.state.as_str(),
                record.path,
                to_i64(record.offset),
                to_i64(record.length),
                stored,
                buffer.map(|bytes| bytes.len() as i64),
                hash,
                record.composite_key(),
                record.partition,
                record.error,
            ],
        )?;
        Ok(())
    }
}

/// Fan-out over the configured sinks, filtered by call name.
#[derive(Default)]
pub struct CallLog {
    sinks: Vec<Box<dyn CallLogSink>>,
    calls: HashSet<String>,
    log_all: bool,
}

pub type SharedCallLog = Arc<Mutex<CallLog>>;

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl CallLogSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn allow_call(mut self, call: impl Into<String>) -> Self {
        self.calls.insert(call.into());
        self
    }

    pub fn log_all_calls(mut self, log_all: bool) -> Self {
        self.log_all = log_all;
        self
    }

    pub fn into_shared(self) -> SharedCallLog {
        Arc::new(Mutex::new(self))
    }

    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|sink| sink.name()).collect()
    }

    pub fn is_enabled(&self, call: &str) -> bool {
        !self.sinks.is_empty() && (self.log_all || self.calls.contains(call))
    }

    /// Write `record` to every sink, skipping calls not on the allow-list.
    pub fn record(&mut self, record: &CallRecord) -> CallLogResult<()> {
        if !self.is_enabled(&record.call) {
            return Ok(());
        }
        for sink in &mut self.sinks {
            sink.record(record)?;
        }
        Ok(())
    }
}

/// Read-pipeline stage recording each delivered read with its partition.
///
/// The logged length is the size requested, so short reads keep the same
/// composite key as full ones.
pub struct CallLogStage {
    log: SharedCallLog,
    history: SharedHistory,
}

impl CallLogStage {
    pub fn new(log: SharedCallLog, history: SharedHistory) -> Self {
        Self { log, history }
    }
}

impl ReadStage for CallLogStage {
    fn name(&self) -> &'static str {
        "log"
    }

    fn process(&mut self, event: &ReadEvent<'_>, data: Vec<u8>) -> FaultResult<Vec<u8>> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if !log.is_enabled("read") {
            return Ok(data);
        }
        let partition = self
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest()
            .and_then(|snapshot| snapshot.partition_at(event.offset).map(str::to_owned));
        let record = CallRecord::post_run("read")
            .with_path(event.path)
            .with_range(event.offset, event.requested as u64)
            .with_buffer(data.clone())
            .with_partition(partition);
        log.record(&record)?;
        Ok(data)
    }
}
