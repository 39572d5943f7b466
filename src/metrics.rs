//! Metrics collection for recording sessions
//!
//! Tracks device acquisition time, per-attempt timing and size, and error
//! history. One attempt runs from entering `recording` until the artifact is
//! produced or the attempt is thrown away.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Maximum number of finished attempts to retain in history
const MAX_ATTEMPT_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptOutcome {
    Completed,
    /// Stopped before the minimum length.
    Discarded,
    /// Torn down before an artifact was produced.
    Abandoned,
}

/// Metrics for one finished recording attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptMetrics {
    pub attempt_id: String,
    pub started_at: DateTime<Utc>,
    /// Wall-clock time from start to outcome
    pub duration_ms: u64,
    pub time_units: u32,
    pub artifact_bytes: u64,
    pub truncated: bool,
    pub outcome: AttemptOutcome,
}

/// Summary statistics across all recorded attempts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_attempts: u64,
    pub completed_attempts: u64,
    pub discarded_attempts: u64,
    /// Average time units across completed attempts
    pub avg_time_units: u64,
    /// Average artifact size across completed attempts
    pub avg_artifact_bytes: u64,
    /// How long the last device acquisition took
    pub last_acquisition_ms: Option<u64>,
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// Category of error (e.g., "acquisition", "device")
    pub error_type: String,
    pub message: String,
    pub attempt_id: Option<String>,
}

struct AttemptInProgress {
    attempt_id: Uuid,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
}

impl AttemptInProgress {
    fn finish(
        self,
        outcome: AttemptOutcome,
        time_units: u32,
        artifact_bytes: u64,
        truncated: bool,
    ) -> AttemptMetrics {
        AttemptMetrics {
            attempt_id: self.attempt_id.to_string(),
            started_at: self.started_at_utc,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            time_units,
            artifact_bytes,
            truncated,
            outcome,
        }
    }
}

/// Collects and stores metrics for one session's attempts
pub struct MetricsCollector {
    /// Finished attempts (newest first)
    history: VecDeque<AttemptMetrics>,
    /// Errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current: Option<AttemptInProgress>,
    acquisition_started: Option<Instant>,
    last_acquisition: Option<Duration>,
    total_attempts: u64,
    completed_attempts: u64,
    discarded_attempts: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_ATTEMPT_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            acquisition_started: None,
            last_acquisition: None,
            total_attempts: 0,
            completed_attempts: 0,
            discarded_attempts: 0,
        }
    }

    pub fn acquisition_started(&mut self) {
        self.acquisition_started = Some(Instant::now());
    }

    pub fn acquisition_finished(&mut self) {
        if let Some(started) = self.acquisition_started.take() {
            let elapsed = started.elapsed();
            log::debug!("Metrics: device acquired in {:?}", elapsed);
            self.last_acquisition = Some(elapsed);
        }
    }

    /// Start tracking a new attempt
    ///
    /// An attempt still in progress is recorded as abandoned.
    pub fn start_attempt(&mut self, attempt_id: Uuid) {
        if let Some(old) = self.current.take() {
            log::warn!(
                "Metrics: abandoning attempt {} to start {}",
                old.attempt_id,
                attempt_id
            );
            self.add_to_history(old.finish(AttemptOutcome::Abandoned, 0, 0, false));
        }

        log::debug!("Metrics: starting attempt {}", attempt_id);
        self.current = Some(AttemptInProgress {
            attempt_id,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
        });
        self.total_attempts += 1;
    }

    pub fn attempt_completed(&mut self, time_units: u32, artifact_bytes: u64, truncated: bool) {
        if let Some(attempt) = self.current.take() {
            let metrics =
                attempt.finish(AttemptOutcome::Completed, time_units, artifact_bytes, truncated);
            log::info!(
                "Metrics: attempt {} completed - {}ms, {} units, {} bytes{}",
                metrics.attempt_id,
                metrics.duration_ms,
                time_units,
                artifact_bytes,
                if truncated { " (truncated)" } else { "" }
            );
            self.add_to_history(metrics);
            self.completed_attempts += 1;
        }
    }

    /// The attempt was stopped before the minimum length.
    pub fn attempt_discarded(&mut self, time_units: u32) {
        if let Some(attempt) = self.current.take() {
            let metrics = attempt.finish(AttemptOutcome::Discarded, time_units, 0, false);
            log::info!(
                "Metrics: attempt {} discarded after {} units",
                metrics.attempt_id,
                time_units
            );
            self.add_to_history(metrics);
            self.discarded_attempts += 1;
        }
    }

    pub fn attempt_abandoned(&mut self, time_units: u32) {
        if let Some(attempt) = self.current.take() {
            log::debug!("Metrics: attempt {} abandoned", attempt.attempt_id);
            self.add_to_history(attempt.finish(AttemptOutcome::Abandoned, time_units, 0, false));
        }
    }

    pub fn record_error(&mut self, error_type: impl Into<String>, message: impl Into<String>) {
        let error = ErrorRecord {
            timestamp: Utc::now(),
            error_type: error_type.into(),
            message: message.into(),
            attempt_id: self.current.as_ref().map(|a| a.attempt_id.to_string()),
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let completed: Vec<_> = self
            .history
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::Completed)
            .collect();
        let count = completed.len() as u64;

        let (avg_time_units, avg_artifact_bytes) = if count > 0 {
            let units: u64 = completed.iter().map(|a| a.time_units as u64).sum();
            let bytes: u64 = completed.iter().map(|a| a.artifact_bytes).sum();
            (units / count, bytes / count)
        } else {
            (0, 0)
        };

        MetricsSummary {
            total_attempts: self.total_attempts,
            completed_attempts: self.completed_attempts,
            discarded_attempts: self.discarded_attempts,
            avg_time_units,
            avg_artifact_bytes,
            last_acquisition_ms: self.last_acquisition.map(|d| d.as_millis() as u64),
            last_error: self.errors.front().cloned(),
        }
    }

    /// Finished attempts, newest first
    #[cfg(test)]
    fn history(&self) -> Vec<AttemptMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Errors, newest first
    #[cfg(test)]
    fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    #[cfg(test)]
    fn is_active_attempt(&self, attempt_id: Uuid) -> bool {
        self.current
            .as_ref()
            .map(|a| a.attempt_id == attempt_id)
            .unwrap_or(false)
    }

    fn add_to_history(&mut self, metrics: AttemptMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_ATTEMPT_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
