// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Partition table tracking from observed read traffic
//!
//! Every read delivered at absolute offset 0 is fed to the GPT decoder. Each
//! successful decode is appended to an append-only [`SnapshotHistory`]; its
//! position in the history is its generation. Rules refer to a snapshot by
//! generation only.

use crate::gpt::{self, PartitionEntry};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// Partition layout decoded from one offset-0 read, keyed by partition name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GptSnapshot {
    generation: usize,
    partitions: BTreeMap<String, PartitionEntry>,
}

impl GptSnapshot {
    /// Later entries win on name collision.
    fn from_entries(generation: usize, entries: Vec<PartitionEntry>) -> Self {
        let partitions = entries.into_iter().map(|entry| (entry.name.clone(), entry)).collect();
        Self {
            generation,
            partitions,
        }
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn get(&self, name: &str) -> Option<&PartitionEntry> {
        self.partitions.get(name)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.partitions.values()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Name of the partition whose byte range holds `byte`.
    pub fn partition_at(&self, byte: u64) -> Option<&str> {
        self.partitions
            .values()
            .find(|entry| entry.contains_byte(byte))
            .map(|entry| entry.name.as_str())
    }
}

/// Append-only arena of snapshots, indexed by generation.
#[derive(Debug, Default)]
pub struct SnapshotHistory {
    snapshots: Vec<Arc<GptSnapshot>>,
    failed_decodes: u64,
}

impl SnapshotHistory {
    pub fn generation_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn snapshot_at(&self, generation: usize) -> Option<Arc<GptSnapshot>> {
        self.snapshots.get(generation).cloned()
    }

    pub fn lookup(&self, generation: usize, name: &str) -> Option<PartitionEntry> {
        self.snapshots.get(generation).and_then(|snapshot| snapshot.get(name).cloned())
    }

    pub fn latest(&self) -> Option<&Arc<GptSnapshot>> {
        self.snapshots.last()
    }

    /// Offset-0 observations that did not decode
    pub fn failed_decodes(&self) -> u64 {
        self.failed_decodes
    }

    fn append(&mut self, entries: Vec<PartitionEntry>) -> Arc<GptSnapshot> {
        let snapshot = Arc::new(GptSnapshot::from_entries(self.snapshots.len(), entries));
        self.snapshots.push(Arc::clone(&snapshot));
        snapshot
    }
}

pub type SharedHistory = Arc<RwLock<SnapshotHistory>>;

/// Handle over the shared history; `observe` is the only way to grow it.
#[derive(Clone, Debug)]
pub struct PartitionTracker {
    history: SharedHistory,
    sector_size: u64,
}

impl Default for PartitionTracker {
    fn default() -> Self {
        Self::new(gpt::DEFAULT_SECTOR_SIZE)
    }
}

impl PartitionTracker {
    pub fn new(sector_size: u64) -> Self {
        Self {
            history: Arc::new(RwLock::new(SnapshotHistory::default())),
            sector_size,
        }
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    /// Read-only view used by rules resolving partitions.
    pub fn history(&self) -> SharedHistory {
        Arc::clone(&self.history)
    }

    /// Feed one delivered read. Decode failures are logged and absorbed so the
    /// read itself never fails because of this side channel.
    pub fn observe(&self, offset: u64, bytes: &[u8]) {
        if offset != 0 {
            return;
        }

        let decoded = gpt::decode(Cursor::new(bytes), self.sector_size).and_then(|(_, entries)| {
            entries.collect::<Result<Vec<_>, _>>()
        });

        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        match decoded {
            Ok(entries) => {
                let snapshot = history.append(entries);
                info!(
                    target: "faultfs::gpt",
                    generation = snapshot.generation(),
                    partitions = snapshot.len(),
                    bytes = bytes.len(),
                    "parsed GPT"
                );
                for entry in snapshot.partitions() {
                    info!(
                        target: "faultfs::gpt",
                        name = %entry.name,
                        first_mb = entry.first_byte >> 20,
                        last_mb = entry.last_byte >> 20,
                        "partition"
                    );
                }
            }
            Err(err) => {
                history.failed_decodes += 1;
                warn!(
                    target: "faultfs::gpt",
                    %err,
                    bytes = bytes.len(),
                    generation_count = history.generation_count(),
                    "offset-0 read did not decode as GPT; no snapshot recorded"
                );
            }
        }
    }

    pub fn generation_count(&self) -> usize {
        self.read_history().generation_count()
    }

    pub fn snapshot_at(&self, generation: usize) -> Option<Arc<GptSnapshot>> {
        self.read_history().snapshot_at(generation)
    }

    pub fn lookup(&self, generation: usize, name: &str) -> Option<PartitionEntry> {
        self.read_history().lookup(generation, name)
    }

    /// Partition of the latest snapshot containing `byte`.
    pub fn partition_at(&self, byte: u64) -> Option<String> {
        let history = self.read_history();
        history.latest().and_then(|snapshot| snapshot.partition_at(byte).map(str::to_owned))
    }

    pub fn failed_observations(&self) -> u64 {
        self.read_history().failed_decodes()
    }

    fn read_history(&self) -> std::sync::RwLockReadGuard<'_, SnapshotHistory> {
        self.history.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::GptImageBuilder;

    fn two_partition_image() -> Vec<u8> {
        GptImageBuilder::new().partition("boot", 34, 2048).partition("root", 2048, 8192).build().expect("gpt image")
    }

    #[test]
    fn ignores_reads_not_at_offset_zero() {
        let tracker = PartitionTracker::default();
        tracker.observe(512, &two_partition_image());
        assert_eq!(tracker.generation_count(), 0);
        assert_eq!(tracker.failed_observations(), 0);
    }

    #[test]
    fn appends_one_generation_per_decoded_read() {
        let tracker = PartitionTracker::default();
        tracker.observe(0, &two_partition_image());
        tracker.observe(0, &two_partition_image());

        assert_eq!(tracker.generation_count(), 2);
        let first = tracker.snapshot_at(0).expect("generation 0");
        assert_eq!(first.generation(), 0);
        assert_eq!(first.len(), 2);
        assert!(tracker.snapshot_at(2).is_none());

        let root = tracker.lookup(1, "root").expect("root");
        assert_eq!(root.first_byte, 2048 * 512);
        assert!(tracker.lookup(0, "swap").is_none());
        assert!(tracker.lookup(5, "root").is_none());
    }

    #[test]
    fn decode_failure_is_absorbed() {
        let tracker = PartitionTracker::default();
        tracker.observe(0, &two_partition_image());
        tracker.observe(0, b"not a disk");

        assert_eq!(tracker.generation_count(), 1);
        assert_eq!(tracker.failed_observations(), 1);
    }

    #[test]
    fn later_entry_wins_on_name_collision() {
        let image = GptImageBuilder::new().partition("dup", 34, 100).partition("dup", 200, 300).build().expect("gpt image");
        let tracker = PartitionTracker::default();
        tracker.observe(0, &image);

        let snapshot = tracker.snapshot_at(0).expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("dup").map(|e| e.first_lba), Some(200));
    }

    #[test]
    fn partition_at_uses_latest_snapshot() {
        let tracker = PartitionTracker::default();
        assert!(tracker.partition_at(0).is_none());

        tracker.observe(0, &two_partition_image());
        assert_eq!(tracker.partition_at(2048 * 512).as_deref(), Some("root"));
        assert_eq!(tracker.partition_at(34 * 512).as_deref(), Some("boot"));
        assert!(tracker.partition_at(0).is_none());

        let moved = GptImageBuilder::new().partition("root", 34, 100).build().expect("gpt image");
        tracker.observe(0, &moved);
        assert_eq!(tracker.partition_at(50 * 512).as_deref(), Some("root"));
        assert!(tracker.partition_at(2048 * 512).is_none());
    }

    #[test]
    fn clones_share_one_history() {
        let tracker = PartitionTracker::default();
        let observer = tracker.clone();
        observer.observe(0, &two_partition_image());
        assert_eq!(tracker.generation_count(), 1);
        assert_eq!(tracker.history().read().expect("history").generation_count(), 1);
    }
}
