// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Injection engine: folds the triggered rules of a read over its buffer

use crate::error::FaultResult;
use crate::pipeline::{ReadEvent, ReadStage};
use crate::rules::{Placement, ReadWindow, RuleSet};
use crate::tracker::{PartitionTracker, SharedHistory};
use std::sync::PoisonError;
use tracing::debug;

pub struct InjectionEngine {
    rules: RuleSet,
    history: SharedHistory,
}

impl InjectionEngine {
    /// Partition-relative rules resolve against `tracker`'s history.
    pub fn new(rules: RuleSet, tracker: &PartitionTracker) -> Self {
        Self {
            rules,
            history: tracker.history(),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Rewrite the bytes of one read. The window is `min(length, raw.len())`
    /// bytes long and so is the result.
    pub fn apply(
        &mut self,
        path: &str,
        offset: u64,
        length: usize,
        mut raw: Vec<u8>,
    ) -> FaultResult<Vec<u8>> {
        let length = length.min(raw.len());
        raw.truncate(length);
        if length == 0 {
            return Ok(raw);
        }

        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        let fired = self.rules.match_and_advance(
            path,
            ReadWindow::new(offset, length as u64),
            &history,
        );

        let mut data = raw;
        for firing in fired {
            debug!(
                target: "faultfs::inject",
                rule = %firing.rule.label,
                path,
                offset,
                length,
                count = firing.rule.trigger.count(),
                placement = ?firing.placement,
                "injecting"
            );
            data = match firing.placement {
                Placement::Splice { at } => {
                    let pre_len = (at - offset) as usize;
                    let content = firing.rule.source.read(offset, length)?;
                    splice(&data, pre_len, &content)
                }
                Placement::Partition { first_byte } => {
                    let shadow = firing.rule.source.read(offset - first_byte, length)?;
                    overlay(&data, &shadow)
                }
            };
            debug_assert_eq!(data.len(), length);
        }
        Ok(data)
    }
}

impl ReadStage for InjectionEngine {
    fn name(&self) -> &'static str {
        "inject"
    }

    fn process(&mut self, event: &ReadEvent<'_>, data: Vec<u8>) -> FaultResult<Vec<u8>> {
        self.apply(event.path, event.offset, event.length, data)
    }
}

/// `data[..pre_len]`, then as much of `content` as fits, then the untouched tail.
fn splice(data: &[u8], pre_len: usize, content: &[u8]) -> Vec<u8> {
    let room = data.len() - pre_len;
    let content = &content[..content.len().min(room)];
    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&data[..pre_len]);
    out.extend_from_slice(content);
    out.extend_from_slice(&data[pre_len + content.len()..]);
    out
}

/// Shadow bytes first; where the shadow runs out, the real data shows through.
fn overlay(data: &[u8], shadow: &[u8]) -> Vec<u8> {
    let shadow = &shadow[..shadow.len().min(data.len())];
    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(shadow);
    out.extend_from_slice(&data[shadow.len()..]);
    out
}
