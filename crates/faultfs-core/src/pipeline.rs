// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ordered post-processing of delivered reads
//!
//! The standard composition is inject, then track, then log: the partition
//! tracker observes the bytes the caller will actually receive, injected
//! corruption included.

use crate::calllog::{CallLogStage, SharedCallLog};
use crate::engine::InjectionEngine;
use crate::error::FaultResult;
use crate::tracker::PartitionTracker;
use tracing::trace;

/// One read as seen by the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadEvent<'a> {
    pub path: &'a str,
    pub offset: u64,
    /// Bytes actually delivered, never more than `requested`
    pub length: usize,
    /// Size the caller asked for
    pub requested: usize,
}

pub trait ReadStage: Send {
    fn name(&self) -> &'static str;

    /// Transform or inspect `data`; the returned buffer feeds the next stage.
    fn process(&mut self, event: &ReadEvent<'_>, data: Vec<u8>) -> FaultResult<Vec<u8>>;
}

#[derive(Default)]
pub struct ReadPipeline {
    stages: Vec<Box<dyn ReadStage>>,
}

impl ReadPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine, then tracker, then (optionally) the call log.
    pub fn standard(
        engine: InjectionEngine,
        tracker: PartitionTracker,
        call_log: Option<SharedCallLog>,
    ) -> Self {
        let history = tracker.history();
        let mut pipeline = Self::new()
            .with_stage(engine)
            .with_stage(GptObserver::new(tracker));
        if let Some(log) = call_log {
            pipeline = pipeline.with_stage(CallLogStage::new(log, history));
        }
        pipeline
    }

    pub fn with_stage(mut self, stage: impl ReadStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run every stage in order. The buffer never grows past the requested length.
    pub fn run(
        &mut self,
        path: &str,
        offset: u64,
        length: usize,
        mut data: Vec<u8>,
    ) -> FaultResult<Vec<u8>> {
        data.truncate(length);
        let event = ReadEvent {
            path,
            offset,
            length: data.len(),
            requested: length,
        };
        for stage in &mut self.stages {
            data = stage.process(&event, data)?;
            trace!(
                target: "faultfs::pipeline",
                stage = stage.name(),
                path,
                offset,
                len = data.len()
            );
        }
        Ok(data)
    }
}

/// Feeds delivered bytes to the partition tracker.
pub struct GptObserver {
    tracker: PartitionTracker,
}

impl GptObserver {
    pub fn new(tracker: PartitionTracker) -> Self {
        Self { tracker }
    }
}

impl ReadStage for GptObserver {
    fn name(&self) -> &'static str {
        "track"
    }

    fn process(&mut self, event: &ReadEvent<'_>, data: Vec<u8>) -> FaultResult<Vec<u8>> {
        self.tracker.observe(event.offset, &data);
        Ok(data)
    }
}
