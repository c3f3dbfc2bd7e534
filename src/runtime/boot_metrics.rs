// src/runtime/boot_metrics.rs
//! Boot phase timing
//!
//! Tracks how long each startup phase took so the boot budget can be
//! enforced and `/meta` can report the breakdown. Phases are recorded
//! wall-clock with `Instant`; serialized durations are milliseconds.

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Canonical phase names, in boot order
pub const PHASES: [&str; 5] = [
    "load_package",
    "start_rpc",
    "start_http",
    "start_ui",
    "wait_ready",
];

/// Records per-phase and total boot durations
#[derive(Debug)]
pub struct BootMetrics {
    boot_start: Instant,
    open: HashMap<String, Instant>,
    completed: Vec<(String, Duration)>,
    total: Option<Duration>,
}

impl BootMetrics {
    pub fn new() -> Self {
        Self {
            boot_start: Instant::now(),
            open: HashMap::new(),
            completed: Vec::new(),
            total: None,
        }
    }

    /// Mark a phase as started
    pub fn begin(&mut self, phase: &str) {
        self.open.insert(phase.to_string(), Instant::now());
    }

    /// Mark a phase as finished; unknown phases are ignored
    pub fn end(&mut self, phase: &str) {
        if let Some(started) = self.open.remove(phase) {
            self.completed.push((phase.to_string(), started.elapsed()));
        }
    }

    /// Seal the total boot duration. First call wins.
    pub fn finalize(&mut self) -> Duration {
        if self.total.is_none() {
            self.total = Some(self.boot_start.elapsed());
        }
        self.total.unwrap_or_default()
    }

    /// Total boot duration, if finalized
    pub fn total(&self) -> Option<Duration> {
        self.total
    }

    pub fn phase(&self, phase: &str) -> Option<Duration> {
        self.completed
            .iter()
            .find(|(name, _)| name == phase)
            .map(|(_, duration)| *duration)
    }

    /// Serializable report with millisecond durations, in canonical
    /// boot order regardless of completion order
    pub fn to_json(&self) -> serde_json::Value {
        let mut phases: Vec<PhaseReport> = self
            .completed
            .iter()
            .map(|(name, duration)| PhaseReport {
                phase: name.clone(),
                duration_ms: duration.as_millis() as u64,
            })
            .collect();
        phases.sort_by_key(|report| {
            PHASES
                .iter()
                .position(|phase| *phase == report.phase)
                .unwrap_or(PHASES.len())
        });
        serde_json::json!({
            "phases": phases,
            "total_ms": self.total.map(|t| t.as_millis() as u64),
        })
    }
}

impl Default for BootMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct PhaseReport {
    phase: String,
    duration_ms: u64,
}
