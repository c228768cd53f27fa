//! JSON summary written at the end of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::error::AppResult;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    /// Every timepoint was acquired.
    Completed,
    /// The run was cancelled and torn down cleanly.
    Cancelled,
    /// A device or output error aborted the run.
    Failed,
}

/// Metadata describing one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Unique id for this run
    pub run_id: Uuid,
    /// Host the run executed on
    pub hostname: String,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// Wall-clock end
    pub finished_at: DateTime<Utc>,
    /// Configured timepoints
    pub timepoints: usize,
    /// Configured rows per timepoint
    pub rows: usize,
    /// Frames handed to the output handler
    pub frames: u64,
    /// Fraction of the run completed
    pub progress: f64,
    /// How the run ended
    pub outcome: RunEnd,
    /// Error message for failed runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    /// A summary for a run that starts now.
    pub fn begin(timepoints: usize, rows: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            started_at: now,
            finished_at: now,
            timepoints,
            rows,
            frames: 0,
            progress: 0.0,
            outcome: RunEnd::Completed,
            error: None,
        }
    }

    /// Stamp the end time and outcome.
    pub fn finish(&mut self, outcome: RunEnd, frames: u64, progress: f64, error: Option<String>) {
        self.finished_at = Utc::now();
        self.outcome = outcome;
        self.frames = frames;
        self.progress = progress;
        self.error = error;
    }

    /// Run duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Write pretty-printed JSON to `path`, creating parent directories.
    pub async fn write_to(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}
