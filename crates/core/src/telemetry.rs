use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStart,
    RunEnd,
    IterationStart,
    ToolCall,
    PatchRejected,
    PatchApplied,
    PatchApplyFailed,
    TestRunCompleted,
    SandboxFallback,
    ModelFallback,
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: Value,
}

/// On-disk layout of one run under the repository's metadata directory:
/// `.restitch/run-<stamp>/{events.jsonl, diffs/<n>.patch, test-<n>.json}`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    root: PathBuf,
}

impl RunPaths {
    pub fn create(repo_root: &Path, stamp: &str) -> Result<Self> {
        let root = restitch_config::metadata_dir(repo_root).join(format!("run-{stamp}"));
        std::fs::create_dir_all(root.join("diffs"))
            .with_context(|| format!("creating run directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn diff_path(&self, n: u32) -> PathBuf {
        self.root.join("diffs").join(format!("{n}.patch"))
    }

    pub fn test_report_path(&self, n: u32) -> PathBuf {
        self.root.join(format!("test-{n}.json"))
    }
}

/// Single-writer append-only event stream, newline-delimited JSON, flushed
/// per event.
pub struct EventLog {
    file: std::fs::File,
    path: PathBuf,
}

impl EventLog {
    pub fn open(paths: &RunPaths) -> Result<Self> {
        let path = paths.events_path();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn emit(&mut self, kind: EventKind, payload: Value) -> Result<()> {
        let event = Event {
            timestamp: Utc::now(),
            kind,
            payload,
        };
        let line = serde_json::to_string(&event)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }

    /// Telemetry failures never abort the run.
    pub fn record(&mut self, kind: EventKind, payload: Value) {
        if let Err(e) = self.emit(kind, payload) {
            tracing::warn!(error = %e, ?kind, "failed to write telemetry event");
        }
    }
}

pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}
