// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! faultfs core: GPT-aware read fault injection
//!
//! Reads delivered by a passthrough filesystem flow through a [`ReadPipeline`]:
//! the [`InjectionEngine`] rewrites bytes according to configured rules, the
//! [`PartitionTracker`] decodes any GPT read at offset 0, and an optional
//! [`CallLog`] records what the caller received. Partition-relative rules
//! resolve their target through the tracker's snapshot history.

pub mod calllog;
pub mod config;
pub mod engine;
pub mod error;
pub mod gpt;
pub mod pipeline;
pub mod rules;
pub mod testing;
pub mod tracker;

pub use calllog::{
    CallLog, CallLogSink, CallLogStage, CallRecord, CallState, FileCallLog, SharedCallLog,
    SqliteCallLog,
};
pub use config::{FaultConfig, ModifierSpec, ReplaceSpec, TriggerSpec};
pub use engine::InjectionEngine;
pub use error::{CallLogError, CallLogResult, FaultError, FaultResult, GptError, GptResult};
pub use gpt::{GptHeader, PartitionEntry, DEFAULT_SECTOR_SIZE};
pub use pipeline::{GptObserver, ReadEvent, ReadPipeline, ReadStage};
pub use rules::{InjectionRule, Placement, ReadWindow, ReplacementSource, RuleSet, Trigger};
pub use tracker::{GptSnapshot, PartitionTracker, SharedHistory, SnapshotHistory};
