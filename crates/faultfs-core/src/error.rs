// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for faultfs core

use std::io;
use std::path::PathBuf;

/// Failure to decode a GPT from an observed byte stream
#[derive(thiserror::Error, Debug)]
pub enum GptError {
    #[error("bad GPT signature: {0:02x?}")]
    BadSignature([u8; 8]),
    #[error("bad GPT revision: {0:02x?}")]
    BadRevision([u8; 4]),
    #[error("bad GPT header size: {0}")]
    BadHeaderSize(u32),
    #[error("short GPT header: {got} of {want} bytes")]
    ShortHeader { got: usize, want: usize },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl GptError {
    /// Whether the failure came from the header contents rather than the stream.
    pub fn is_malformed_header(&self) -> bool {
        !matches!(self, GptError::Io(_))
    }
}

pub type GptResult<T> = Result<T, GptError>;

/// Call-log sink failures
#[derive(thiserror::Error, Debug)]
pub enum CallLogError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type CallLogResult<T> = Result<T, CallLogError>;

/// Errors surfaced by rule construction and read injection
#[derive(thiserror::Error, Debug)]
pub enum FaultError {
    #[error("replacement source {} unavailable: {source}", path.display())]
    MissingReplacementSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid rule {rule}: {reason}")]
    InvalidRule { rule: String, reason: String },
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
    #[error("call log error: {0}")]
    CallLog(#[from] CallLogError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type FaultResult<T> = Result<T, FaultError>;
