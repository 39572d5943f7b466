//! Published session snapshots
//!
//! Observers never see [`State`] itself. After every transition the session
//! derives a [`SessionStatus`] and publishes it on a watch channel.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::artifact::Artifact;
use crate::metrics::MetricsSummary;
use crate::state_machine::{DisabledReason, State};

const SECONDS_PER_MINUTE: u64 = 60;

/// Top-level state, without context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StateKind {
    Inactive,
    Preparing,
    Ready,
    Recording,
    Processing,
    Completed,
    Disabled,
}

impl From<&State> for StateKind {
    fn from(state: &State) -> Self {
        match state {
            State::Inactive => StateKind::Inactive,
            State::Preparing { .. } => StateKind::Preparing,
            State::Ready { .. } => StateKind::Ready,
            State::Recording { .. } | State::Stopping { .. } => StateKind::Recording,
            State::Processing { .. } => StateKind::Processing,
            State::Completed { .. } => StateKind::Completed,
            State::Disabled { .. } => StateKind::Disabled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: StateKind,
    /// Dotted state path, e.g. `ready.noData`
    pub state_path: &'static str,
    pub format: Option<String>,
    pub elapsed_time_units: u32,
    /// Elapsed recording time as `mm:ss`
    pub elapsed_display: String,
    pub disabled_reason: Option<DisabledReason>,
    pub artifact_bytes: Option<usize>,
    pub truncated: bool,
    #[serde(skip)]
    pub artifact: Option<Arc<Artifact>>,
    pub metrics: MetricsSummary,
}

impl SessionStatus {
    pub fn from_state(state: &State, time_slice: Duration, metrics: MetricsSummary) -> Self {
        let elapsed_time_units = state.elapsed_time_units();
        let artifact = match state {
            State::Completed { artifact, .. } => Some(Arc::clone(artifact)),
            _ => None,
        };
        let disabled_reason = match state {
            State::Disabled { reason } => Some(reason.clone()),
            _ => None,
        };
        let elapsed = time_slice.saturating_mul(elapsed_time_units);

        Self {
            state: StateKind::from(state),
            state_path: state.name(),
            format: state.format().map(|f| f.to_string()),
            elapsed_time_units,
            elapsed_display: as_minutes_and_seconds(elapsed.as_secs()),
            disabled_reason,
            artifact_bytes: artifact.as_ref().map(|a| a.len()),
            truncated: artifact.as_ref().map(|a| a.truncated()).unwrap_or(false),
            artifact,
            metrics,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, StateKind::Completed | StateKind::Disabled)
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::from_state(&State::Inactive, Duration::ZERO, MetricsSummary::default())
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed(Arc<Artifact>),
    Disabled(DisabledReason),
}

impl SessionOutcome {
    pub fn from_status(status: &SessionStatus) -> Option<Self> {
        match (status.state, &status.artifact, &status.disabled_reason) {
            (StateKind::Completed, Some(artifact), _) => {
                Some(SessionOutcome::Completed(Arc::clone(artifact)))
            }
            (StateKind::Disabled, _, Some(reason)) => Some(SessionOutcome::Disabled(reason.clone())),
            _ => None,
        }
    }
}

/// Format whole seconds as zero-padded `mm:ss`. Minutes keep growing past 99.
pub fn as_minutes_and_seconds(seconds: u64) -> String {
    format!(
        "{:02}:{:02}",
        seconds / SECONDS_PER_MINUTE,
        seconds % SECONDS_PER_MINUTE
    )
}
