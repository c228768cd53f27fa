//! Wall-clock profiling of the acquisition loop.
//!
//! Sections are named with `/` separators (`acquisition/movement`) and may be
//! started and stopped repeatedly; the profiler accumulates total time and the
//! number of intervals per section.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use tokio::time::{Duration, Instant};

#[derive(Debug, Default, Clone)]
struct Section {
    total: Duration,
    intervals: u64,
    started: Option<Instant>,
}

/// Accumulating section timer.
#[derive(Debug, Clone)]
pub struct Profiler {
    name: String,
    began: Instant,
    sections: BTreeMap<String, Section>,
}

impl Profiler {
    /// A profiler whose clock starts now.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            began: Instant::now(),
            sections: BTreeMap::new(),
        }
    }

    /// Begin timing `section`. Starting a running section is a no-op.
    pub fn start(&mut self, section: &str) {
        let entry = self.sections.entry(section.to_string()).or_default();
        if entry.started.is_none() {
            entry.started = Some(Instant::now());
        }
    }

    /// Stop timing `section` and add the interval to its total.
    pub fn stop(&mut self, section: &str) {
        if let Some(entry) = self.sections.get_mut(section) {
            if let Some(started) = entry.started.take() {
                entry.total += started.elapsed();
                entry.intervals += 1;
            }
        }
    }

    /// Accumulated time for `section`.
    pub fn total(&self, section: &str) -> Duration {
        self.sections
            .get(section)
            .map(|s| s.total)
            .unwrap_or_default()
    }

    /// Number of completed intervals for `section`.
    pub fn intervals(&self, section: &str) -> u64 {
        self.sections.get(section).map(|s| s.intervals).unwrap_or(0)
    }

    /// Human-readable report, one line per section, indented by depth.
    pub fn report(&self) -> String {
        let overall = self.began.elapsed();
        let mut out = format!("{}: {:.3}s\n", self.name, overall.as_secs_f64());
        for (name, section) in &self.sections {
            let depth = name.matches('/').count() + 1;
            let label = name.rsplit('/').next().unwrap_or(name);
            let share = if overall.is_zero() {
                0.0
            } else {
                section.total.as_secs_f64() / overall.as_secs_f64() * 100.0
            };
            let _ = writeln!(
                out,
                "{}{}: {:.3}s over {} ({:.1}%)",
                "  ".repeat(depth),
                label,
                section.total.as_secs_f64(),
                section.intervals,
                share
            );
        }
        out
    }
}
