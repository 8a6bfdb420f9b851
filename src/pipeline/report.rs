//! Run phases and the summary returned by a run.

use std::fmt;

use crate::loader::LoadOutcome;
use crate::sink::UploadedSegment;

/// Orchestrator phases, in the order a run walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Resuming,
    Processing,
    Flushing,
    Loading,
    Done,
    DoneNothingLoaded,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Init => "init",
            RunPhase::Resuming => "resuming",
            RunPhase::Processing => "processing",
            RunPhase::Flushing => "flushing",
            RunPhase::Loading => "loading",
            RunPhase::Done => "done",
            RunPhase::DoneNothingLoaded => "done_nothing_loaded",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a completed run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Rows were loaded and the checkpoint was cleared.
    Done,
    /// Nothing was loaded; the checkpoint was kept.
    NothingLoaded,
}

impl RunOutcome {
    /// Label used for status reporting and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Done => "success",
            RunOutcome::NothingLoaded => "nothing_loaded",
        }
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Checkpoint offset the run started from.
    pub resumed_from: u64,
    /// Segments carried over from the manifest of an earlier attempt.
    pub resumed_segments: usize,
    pub batches_planned: usize,
    /// Batches handled by this run, failed ones included.
    pub batches_processed: usize,
    pub batches_failed: usize,
    pub api_calls: usize,
    pub rows_written: usize,
    pub items_skipped: usize,
    /// Segments handed to the loader, carried ones first.
    pub segments: Vec<UploadedSegment>,
    pub load: LoadOutcome,
    pub rows_loaded: u64,
    /// Phases entered, in order.
    pub phases: Vec<RunPhase>,
}
