// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! JSON configuration for the injection rules

use crate::error::FaultResult;
use crate::gpt::DEFAULT_SECTOR_SIZE;
use crate::rules::{InjectionRule, ReplacementSource, RuleSet, Trigger};
use crate::tracker::PartitionTracker;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FaultConfig {
    #[serde(default = "default_sector_size")]
    pub sector_size: u64,
    #[serde(default)]
    pub modifiers: Vec<ModifierSpec>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            sector_size: DEFAULT_SECTOR_SIZE,
            modifiers: Vec::new(),
        }
    }
}

fn default_sector_size() -> u64 {
    DEFAULT_SECTOR_SIZE
}

/// One rule as written in the config file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModifierSpec {
    /// Path inside the mount, e.g. `/disk.img`
    pub path: String,
    /// Optional label used in logs
    #[serde(default)]
    pub key: Option<String>,
    pub replace: ReplaceSpec,
    pub trigger: TriggerSpec,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ReplaceSpec {
    Str {
        value: String,
    },
    File {
        filename: PathBuf,
        #[serde(default)]
        start: Option<u64>,
        #[serde(default)]
        length: Option<u64>,
    },
    Cow {
        filename: PathBuf,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    ByteReadCount {
        byte: u64,
        value: u64,
    },
    #[serde(alias = "partition_read_count")]
    PartitionReplace {
        partition: String,
        value: u64,
    },
    Always {
        #[serde(default)]
        byte: Option<u64>,
    },
}

impl FaultConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn from_path(path: &Path) -> FaultResult<Self> {
        let bytes = fs::read(path)?;
        Ok(Self::from_json_bytes(&bytes)?)
    }

    /// Turn every modifier into a rule. Partition triggers are born at the
    /// tracker's current generation, so they resolve against the first table
    /// read after construction.
    pub fn build_rules(&self, tracker: &PartitionTracker) -> FaultResult<RuleSet> {
        let birth_generation = tracker.generation_count();
        let mut rules = RuleSet::new();
        for (idx, modifier) in self.modifiers.iter().enumerate() {
            let label = modifier
                .key
                .clone()
                .unwrap_or_else(|| format!("{}#{idx}", modifier.path));
            let rule = InjectionRule::new(
                label,
                modifier.path.clone(),
                modifier.replace.to_source(),
                modifier.trigger.to_trigger(birth_generation),
            )?;
            info!(
                target: "faultfs::config",
                rule = %rule.label,
                path = %rule.path,
                trigger = ?modifier.trigger,
                "registered injection rule"
            );
            rules.add(rule);
        }
        Ok(rules)
    }
}

impl ReplaceSpec {
    fn to_source(&self) -> ReplacementSource {
        match self {
            ReplaceSpec::Str { value } => ReplacementSource::Literal(value.as_bytes().to_vec()),
            ReplaceSpec::File {
                filename,
                start,
                length,
            } => ReplacementSource::FileRegion {
                path: filename.clone(),
                start: *start,
                length: *length,
            },
            ReplaceSpec::Cow { filename } => ReplacementSource::PartitionShadow {
                path: filename.clone(),
            },
        }
    }
}

impl TriggerSpec {
    fn to_trigger(&self, birth_generation: usize) -> Trigger {
        match self {
            TriggerSpec::ByteReadCount { byte, value } => Trigger::byte_read_count(*byte, *value),
            TriggerSpec::PartitionReplace { partition, value } => {
                Trigger::partition_relative(partition, *value, birth_generation)
            }
            TriggerSpec::Always { byte } => Trigger::Unconditional { target_byte: *byte },
        }
    }
}
