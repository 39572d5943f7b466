//! Recording session: the root of the actor hierarchy
//!
//! [`RecordingSession::spawn`] starts a single state loop task that owns the
//! state, the supervisor and the metrics. Callers talk to it through the
//! handle; observers follow the published [`SessionStatus`].

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::device::{CaptureBackend, MicrophoneStatus};
use crate::effects::Supervisor;
use crate::format::{retrieve_supported_format, CaptureFormat};
use crate::metrics::MetricsCollector;
use crate::settings::{RecorderSettings, SessionConfig, SettingsError};
use crate::state_machine::{reduce, Effect, Event, Policy, SessionMailbox, State};
use crate::status::{SessionOutcome, SessionStatus};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Recording session has shut down")]
    Closed,
    #[error(transparent)]
    InvalidConfig(#[from] SettingsError),
}

/// Handle to a running session.
///
/// Dropping the handle tears the session down the same way
/// [`shutdown`](Self::shutdown) does, without waiting for it.
pub struct RecordingSession {
    tx: SessionMailbox,
    status_rx: watch::Receiver<SessionStatus>,
    backend: Arc<dyn CaptureBackend>,
    join: Option<JoinHandle<()>>,
}

impl RecordingSession {
    /// Start the session loop on the current tokio runtime.
    pub fn spawn(
        config: SessionConfig,
        backend: Arc<dyn CaptureBackend>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::from_state(
            &State::Inactive,
            config.time_slice,
            Default::default(),
        ));

        let supervisor = Supervisor::new(Arc::clone(&backend), config, tx.clone());
        let join = tokio::spawn(run_session_loop(
            config,
            Arc::clone(&backend),
            supervisor,
            rx,
            status_tx,
        ));

        Ok(Self {
            tx,
            status_rx,
            backend,
            join: Some(join),
        })
    }

    /// Choose the capture format. `None` disables the session.
    pub fn prepare(&self, format: Option<CaptureFormat>) -> Result<(), SessionError> {
        self.send(Event::Prepare { format })
    }

    /// Negotiate a format through the settings cache and prepare with it.
    /// Returns whether `settings` changed and should be saved.
    pub fn prepare_with_settings(
        &self,
        settings: &mut RecorderSettings,
    ) -> Result<bool, SessionError> {
        let (format, changed) = retrieve_supported_format(settings, self.backend.as_ref());
        self.prepare(format)?;
        Ok(changed)
    }

    /// Re-arm after a recording that was too short.
    pub fn start(&self) -> Result<(), SessionError> {
        self.send(Event::Start)
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.send(Event::Stop)
    }

    pub fn permission(&self) -> MicrophoneStatus {
        self.backend.permission()
    }

    /// Latest published snapshot.
    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Wait for `completed` or `disabled`. Returns `None` if the session was
    /// shut down first.
    pub async fn wait_for_outcome(&self) -> Option<SessionOutcome> {
        let mut rx = self.status_rx.clone();
        loop {
            let outcome = SessionOutcome::from_status(&rx.borrow_and_update());
            if outcome.is_some() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return SessionOutcome::from_status(&rx.borrow());
            }
        }
    }

    /// Tear down children, release the device and wait for the loop to end.
    /// Works from any state.
    pub async fn shutdown(mut self) {
        // fails if the loop already ended on a terminal state
        let _ = self.tx.send(Event::Exit);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                log::error!("Session loop task failed: {}", e);
            }
        }
    }

    fn send(&self, event: Event) -> Result<(), SessionError> {
        self.tx.send(event).map_err(|_| SessionError::Closed)
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if self.join.is_some() {
            let _ = self.tx.send(Event::Exit);
        }
    }
}

async fn run_session_loop(
    config: SessionConfig,
    backend: Arc<dyn CaptureBackend>,
    mut supervisor: Supervisor,
    mut rx: mpsc::UnboundedReceiver<Event>,
    status_tx: watch::Sender<SessionStatus>,
) {
    let mut state = State::default();
    let mut metrics = MetricsCollector::new();

    log::info!("Session loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Exit at the edge
        if matches!(event, Event::Exit) {
            log::info!("Exit requested in {}, shutting down", state.name());
            break;
        }

        let candidate = match (&state, &event) {
            (
                State::Inactive,
                Event::Prepare {
                    format: Some(format),
                },
            ) => Some(format.clone()),
            _ => None,
        };
        let policy = Policy {
            min_length: config.min_length,
            format_supported: match candidate {
                Some(format) => format_supported(&backend, format).await,
                None => false,
            },
        };
        let (next, effects) = reduce(&state, event, &policy);

        if state.name() != next.name() {
            log::info!("State transition: {} -> {}", state.name(), next.name());
            record_transition(&mut metrics, &state, &next);
        }
        state = next;

        for eff in effects {
            match eff {
                Effect::Publish => publish(&status_tx, &state, &config, &metrics),
                other => supervisor.run(other).await,
            }
        }

        if state.is_terminal() {
            break;
        }
    }

    if matches!(
        state,
        State::Recording { .. } | State::Stopping { .. } | State::Processing { .. }
    ) {
        metrics.attempt_abandoned(state.elapsed_time_units());
    }
    supervisor.teardown().await;
    log::info!("Session loop ended in {}", state.name());
}

/// Ask the backend off the session task; real backends enumerate hardware.
async fn format_supported(backend: &Arc<dyn CaptureBackend>, format: CaptureFormat) -> bool {
    let backend = Arc::clone(backend);
    match tokio::task::spawn_blocking(move || backend.is_format_supported(&format)).await {
        Ok(supported) => supported,
        Err(e) => {
            log::error!("Format check failed: {}", e);
            false
        }
    }
}

fn publish(
    status_tx: &watch::Sender<SessionStatus>,
    state: &State,
    config: &SessionConfig,
    metrics: &MetricsCollector,
) {
    let status = SessionStatus::from_state(state, config.time_slice, metrics.summary());
    status_tx.send_replace(status);
}

fn record_transition(metrics: &mut MetricsCollector, from: &State, to: &State) {
    match (from, to) {
        (State::Inactive, State::Preparing { .. }) => metrics.acquisition_started(),
        (State::Inactive, State::Disabled { reason }) => {
            metrics.record_error("format", reason.to_string())
        }
        (State::Preparing { .. }, State::Recording { recording_id, .. }) => {
            metrics.acquisition_finished();
            metrics.start_attempt(*recording_id);
        }
        (State::Preparing { .. }, State::Disabled { reason }) => {
            metrics.acquisition_finished();
            metrics.record_error("acquisition", reason.to_string());
        }
        (State::Ready { .. }, State::Recording { recording_id, .. }) => {
            metrics.start_attempt(*recording_id)
        }
        (
            State::Stopping {
                elapsed_time_units, ..
            },
            State::Ready { .. },
        ) => metrics.attempt_discarded(*elapsed_time_units),
        (
            _,
            State::Completed {
                elapsed_time_units,
                artifact,
                ..
            },
        ) => metrics.attempt_completed(
            *elapsed_time_units,
            artifact.len() as u64,
            artifact.truncated(),
        ),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::MemoryBackend;
    use crate::state_machine::DisabledReason;

    fn backend() -> Arc<dyn CaptureBackend> {
        Arc::new(MemoryBackend::new(["audio/ogg"]))
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = SessionConfig {
            max_length: 0,
            ..Default::default()
        };
        let err = RecordingSession::spawn(config, backend()).err();
        assert!(matches!(err, Some(SessionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn initial_status_is_inactive() {
        let session = RecordingSession::spawn(SessionConfig::default(), backend()).unwrap();
        assert_eq!(session.status().state_path, "inactive");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn missing_format_disables_and_closes() {
        let session = RecordingSession::spawn(SessionConfig::default(), backend()).unwrap();
        session.prepare(None).unwrap();

        assert_eq!(
            session.wait_for_outcome().await,
            Some(SessionOutcome::Disabled(DisabledReason::UnsupportedFormat))
        );
        let status = session.status();
        assert_eq!(status.metrics.last_error.unwrap().error_type, "format");

        // the loop ends on a terminal state
        for _ in 0..100 {
            if session.start().is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(matches!(session.stop(), Err(SessionError::Closed)));
    }

    #[tokio::test]
    async fn prepare_with_settings_caches_format() {
        let session = RecordingSession::spawn(SessionConfig::default(), backend()).unwrap();
        let mut settings = RecorderSettings {
            candidate_formats: vec!["audio/webm".into(), "audio/ogg".into()],
            ..Default::default()
        };

        assert!(session.prepare_with_settings(&mut settings).unwrap());
        assert_eq!(settings.supported_format.as_deref(), Some("audio/ogg"));
        assert_eq!(session.permission(), MicrophoneStatus::Granted);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn format_check_answers_from_the_backend() {
        let backend = backend();
        assert!(format_supported(&backend, CaptureFormat::new("audio/ogg").unwrap()).await);
        assert!(!format_supported(&backend, CaptureFormat::new("audio/webm").unwrap()).await);
    }

    #[tokio::test]
    async fn shutdown_before_prepare_returns() {
        let session = RecordingSession::spawn(SessionConfig::default(), backend()).unwrap();
        let mut rx = session.subscribe();
        session.shutdown().await;
        // sender dropped with the loop
        assert!(rx.changed().await.is_err());
    }
}
