// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Injection rules: replacement sources, stateful triggers and the per-path rule set

use crate::error::{FaultError, FaultResult};
use crate::gpt::PartitionEntry;
use crate::tracker::SnapshotHistory;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Byte window `[offset, offset + length)` of one intercepted read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadWindow {
    pub offset: u64,
    pub length: u64,
}

impl ReadWindow {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn contains(&self, byte: u64) -> bool {
        self.offset <= byte && byte < self.end()
    }
}

/// Where replacement bytes come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplacementSource {
    Literal(Vec<u8>),
    /// Region of a side file; missing bounds default to the read's own window.
    FileRegion {
        path: PathBuf,
        start: Option<u64>,
        length: Option<u64>,
    },
    /// Shadow copy of a partition, addressed relative to the partition start.
    PartitionShadow { path: PathBuf },
}

impl ReplacementSource {
    /// Check that a file-backed source can be opened.
    pub fn verify(&self) -> FaultResult<()> {
        match self {
            ReplacementSource::Literal(_) => Ok(()),
            ReplacementSource::FileRegion { path, .. }
            | ReplacementSource::PartitionShadow { path } => open_source(path).map(drop),
        }
    }

    /// Bytes to inject for a read at `offset` of `length` bytes. For a shadow
    /// source `offset` is already partition-relative. File reads may come back
    /// short at end of file.
    pub fn read(&self, offset: u64, length: usize) -> FaultResult<Vec<u8>> {
        match self {
            ReplacementSource::Literal(bytes) => Ok(bytes.clone()),
            ReplacementSource::FileRegion {
                path,
                start,
                length: region_len,
            } => {
                let len = region_len.unwrap_or(length as u64);
                read_region(path, start.unwrap_or(offset), len)
            }
            ReplacementSource::PartitionShadow { path } => read_region(path, offset, length as u64),
        }
    }
}

fn open_source(path: &Path) -> FaultResult<File> {
    File::open(path).map_err(|source| FaultError::MissingReplacementSource {
        path: path.to_path_buf(),
        source,
    })
}

fn read_region(path: &Path, start: u64, len: u64) -> FaultResult<Vec<u8>> {
    let mut file = open_source(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.take(len).read_to_end(&mut buf)?;
    Ok(buf)
}

/// How a firing rule rewrites the window
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Splice replacement bytes in starting at absolute byte `at`.
    Splice { at: u64 },
    /// Replace the whole window from the shadow of a partition starting at `first_byte`.
    Partition { first_byte: u64 },
}

/// Stateful activation condition of a rule.
///
/// Counting triggers are level-triggered: once `count > threshold` every
/// matching read fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Always triggered. Without a target byte it matches every read and
    /// splices at the start of the window.
    Unconditional { target_byte: Option<u64> },
    ByteReadCount {
        target_byte: u64,
        threshold: u64,
        count: u64,
    },
    PartitionRelative {
        partition: String,
        threshold: u64,
        count: u64,
        /// Generation current when the rule was built
        birth_generation: usize,
        resolved: Option<PartitionEntry>,
    },
}

impl Trigger {
    pub fn byte_read_count(target_byte: u64, threshold: u64) -> Self {
        Trigger::ByteReadCount {
            target_byte,
            threshold,
            count: 0,
        }
    }

    pub fn partition_relative(partition: &str, threshold: u64, birth_generation: usize) -> Self {
        Trigger::PartitionRelative {
            partition: partition.to_string(),
            threshold,
            count: 0,
            birth_generation,
            resolved: None,
        }
    }

    /// Probe the byte-range predicate for `window`, advancing counters as a
    /// side effect. Returns where the rule would apply if it matches; whether
    /// it fires is then decided by [`Trigger::is_triggered`].
    pub fn observe_window(
        &mut self,
        window: ReadWindow,
        history: &SnapshotHistory,
    ) -> Option<Placement> {
        match self {
            Trigger::Unconditional { target_byte: None } => {
                Some(Placement::Splice { at: window.offset })
            }
            Trigger::Unconditional {
                target_byte: Some(byte),
            } => window.contains(*byte).then_some(Placement::Splice { at: *byte }),
            Trigger::ByteReadCount {
                target_byte, count, ..
            } => {
                if !window.contains(*target_byte) {
                    return None;
                }
                *count += 1;
                Some(Placement::Splice { at: *target_byte })
            }
            Trigger::PartitionRelative {
                partition,
                count,
                birth_generation,
                resolved,
                ..
            } => {
                if resolved.is_none() {
                    *resolved = history.lookup(*birth_generation, partition);
                }
                let entry = resolved.as_ref()?;
                // Counts fresh visits to the partition start, not every overlapping read.
                if window.contains(entry.first_byte) {
                    *count += 1;
                }
                entry
                    .contains_range(window.offset, window.end())
                    .then_some(Placement::Partition {
                        first_byte: entry.first_byte,
                    })
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        match self {
            Trigger::Unconditional { .. } => true,
            Trigger::ByteReadCount {
                threshold, count, ..
            }
            | Trigger::PartitionRelative {
                threshold, count, ..
            } => count > threshold,
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            Trigger::Unconditional { .. } => 0,
            Trigger::ByteReadCount { count, .. } | Trigger::PartitionRelative { count, .. } => {
                *count
            }
        }
    }

    /// Partition this trigger resolved to, once known.
    pub fn resolved_partition(&self) -> Option<&PartitionEntry> {
        match self {
            Trigger::PartitionRelative { resolved, .. } => resolved.as_ref(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InjectionRule {
    pub label: String,
    pub path: String,
    pub source: ReplacementSource,
    pub trigger: Trigger,
}

impl InjectionRule {
    /// Build a rule, rejecting source/trigger pairs that cannot work together
    /// and file sources that cannot be opened.
    pub fn new(
        label: impl Into<String>,
        path: impl Into<String>,
        source: ReplacementSource,
        trigger: Trigger,
    ) -> FaultResult<Self> {
        let label = label.into();
        let is_shadow = matches!(source, ReplacementSource::PartitionShadow { .. });
        let is_partition = matches!(trigger, Trigger::PartitionRelative { .. });
        if is_shadow != is_partition {
            return Err(FaultError::InvalidRule {
                rule: label,
                reason: "partition shadow sources pair only with partition triggers".to_string(),
            });
        }
        source.verify()?;
        Ok(Self {
            label,
            path: path.into(),
            source,
            trigger,
        })
    }
}

/// A rule selected to fire for the current read
#[derive(Debug)]
pub struct Firing<'a> {
    pub rule: &'a InjectionRule,
    pub placement: Placement,
}

/// Rules grouped by path, kept in registration order.
#[derive(Debug, Default)]
pub struct RuleSet {
    by_path: HashMap<String, Vec<InjectionRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: InjectionRule) {
        self.by_path.entry(rule.path.clone()).or_default().push(rule);
    }

    pub fn rules_for(&self, path: &str) -> &[InjectionRule] {
        self.by_path.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_path.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Probe every rule for `path` against the window (advancing counters on
    /// any byte-range match) and return the triggered ones in registration order.
    pub fn match_and_advance(
        &mut self,
        path: &str,
        window: ReadWindow,
        history: &SnapshotHistory,
    ) -> Vec<Firing<'_>> {
        let Some(rules) = self.by_path.get_mut(path) else {
            return Vec::new();
        };

        let hits: Vec<(usize, Placement)> = rules
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, rule)| {
                let placement = rule.trigger.observe_window(window, history)?;
                rule.trigger.is_triggered().then_some((idx, placement))
            })
            .collect();

        let rules: &[InjectionRule] = rules;
        hits.into_iter()
            .map(|(idx, placement)| Firing {
                rule: &rules[idx],
                placement,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::GptImageBuilder;
    use crate::tracker::PartitionTracker;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn empty_history() -> SnapshotHistory {
        SnapshotHistory::default()
    }

    #[test]
    fn byte_count_probe_counts_every_overlap() {
        let history = empty_history();
        let mut trigger = Trigger::byte_read_count(100, 2);

        assert!(trigger.observe_window(ReadWindow::new(0, 50), &history).is_none());
        assert_eq!(trigger.count(), 0);

        for expected in 1..=2 {
            let placement = trigger.observe_window(ReadWindow::new(64, 64), &history);
            assert_eq!(placement, Some(Placement::Splice { at: 100 }));
            assert_eq!(trigger.count(), expected);
            assert!(!trigger.is_triggered());
        }

        trigger.observe_window(ReadWindow::new(100, 1), &history);
        assert!(trigger.is_triggered());
        // Level-triggered from here on.
        trigger.observe_window(ReadWindow::new(0, 4096), &history);
        assert!(trigger.is_triggered());
        assert_eq!(trigger.count(), 4);
    }

    #[test]
    fn window_end_is_exclusive() {
        let history = empty_history();
        let mut trigger = Trigger::byte_read_count(10, 0);
        assert!(trigger.observe_window(ReadWindow::new(0, 10), &history).is_none());
        assert!(trigger.observe_window(ReadWindow::new(10, 1), &history).is_some());
    }

    #[test]
    fn unconditional_without_target_matches_everything() {
        let history = empty_history();
        let mut trigger = Trigger::Unconditional { target_byte: None };
        assert_eq!(
            trigger.observe_window(ReadWindow::new(4096, 512), &history),
            Some(Placement::Splice { at: 4096 })
        );
        assert!(trigger.is_triggered());

        let mut targeted = Trigger::Unconditional {
            target_byte: Some(9000),
        };
        assert!(targeted.observe_window(ReadWindow::new(4096, 512), &history).is_none());
    }

    fn history_with_partition() -> PartitionTracker {
        // "data" spans bytes [1024, 2048).
        let image = GptImageBuilder::new().partition("data", 2, 4).build().expect("gpt image");
        let tracker = PartitionTracker::default();
        tracker.observe(0, &image);
        tracker
    }

    #[test]
    fn partition_trigger_counts_fresh_opens() {
        let tracker = history_with_partition();
        let history = tracker.history();
        let history = history.read().expect("history");
        let mut trigger = Trigger::partition_relative("data", 1, 0);

        let first = trigger.observe_window(ReadWindow::new(1024, 512), &history);
        assert_eq!(first, Some(Placement::Partition { first_byte: 1024 }));
        assert_eq!(trigger.count(), 1);
        assert!(!trigger.is_triggered());

        // Inside the partition but away from its start: matches, no count.
        assert!(trigger.observe_window(ReadWindow::new(1536, 512), &history).is_some());
        assert_eq!(trigger.count(), 1);
        assert!(!trigger.is_triggered());

        trigger.observe_window(ReadWindow::new(1024, 1024), &history);
        assert_eq!(trigger.count(), 2);
        assert!(trigger.is_triggered());
    }

    #[test]
    fn partition_trigger_requires_window_inside_partition() {
        let tracker = history_with_partition();
        let history = tracker.history();
        let history = history.read().expect("history");
        let mut trigger = Trigger::partition_relative("data", 0, 0);

        // Covers the partition start but spills over both edges.
        assert!(trigger.observe_window(ReadWindow::new(512, 2048), &history).is_none());
        assert_eq!(trigger.count(), 1);
    }

    #[test]
    fn unresolved_partition_never_matches() {
        let tracker = history_with_partition();
        let history = tracker.history();
        let history = history.read().expect("history");

        let mut missing = Trigger::partition_relative("swap", 0, 0);
        assert!(missing.observe_window(ReadWindow::new(1024, 512), &history).is_none());

        // Born after generation 0 was recorded: waits for generation 1.
        let mut unborn = Trigger::partition_relative("data", 0, 1);
        assert!(unborn.observe_window(ReadWindow::new(1024, 512), &history).is_none());
        assert!(unborn.resolved_partition().is_none());
    }

    #[test]
    fn rule_rejects_mismatched_source_and_trigger() {
        let err = InjectionRule::new(
            "bad",
            "/disk.img",
            ReplacementSource::Literal(b"x".to_vec()),
            Trigger::partition_relative("root", 0, 0),
        )
        .expect_err("mismatch");
        assert!(matches!(err, FaultError::InvalidRule { .. }));
    }

    #[test]
    fn rule_rejects_missing_side_file() {
        let err = InjectionRule::new(
            "missing",
            "/disk.img",
            ReplacementSource::FileRegion {
                path: PathBuf::from("/nonexistent/faultfs/blob"),
                start: None,
                length: None,
            },
            Trigger::byte_read_count(0, 0),
        )
        .expect_err("missing file");
        assert!(matches!(err, FaultError::MissingReplacementSource { .. }));
    }

    #[test]
    fn file_region_defaults_to_read_window() {
        let mut file = NamedTempFile::new().expect("temp");
        file.write_all(b"0123456789").expect("write");
        let whole = ReplacementSource::FileRegion {
            path: file.path().to_path_buf(),
            start: None,
            length: None,
        };
        assert_eq!(whole.read(2, 3).expect("read"), b"234");
        assert_eq!(whole.read(8, 5).expect("read"), b"89");

        let pinned = ReplacementSource::FileRegion {
            path: file.path().to_path_buf(),
            start: Some(5),
            length: Some(2),
        };
        assert_eq!(pinned.read(0, 100).expect("read"), b"56");
    }

    #[test]
    fn match_and_advance_keeps_registration_order() {
        let mut rules = RuleSet::new();
        for (label, byte) in [("second-byte", 1u64), ("first-byte", 0)] {
            rules.add(
                InjectionRule::new(
                    label,
                    "/disk.img",
                    ReplacementSource::Literal(b"!".to_vec()),
                    Trigger::byte_read_count(byte, 0),
                )
                .expect("rule"),
            );
        }
        let history = empty_history();

        let fired = rules.match_and_advance("/disk.img", ReadWindow::new(0, 4), &history);
        let labels: Vec<_> = fired.iter().map(|f| f.rule.label.as_str()).collect();
        assert_eq!(labels, vec!["second-byte", "first-byte"]);

        assert!(rules.match_and_advance("/other.img", ReadWindow::new(0, 4), &history).is_empty());
        assert_eq!(rules.len(), 2);
    }
}
