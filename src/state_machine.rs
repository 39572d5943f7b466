//! State machine for a recording session
//!
//! This module implements the session as a single-writer reducer. All state
//! transitions go through `reduce()`, which returns the next state and a list
//! of effects for the supervisor to execute. Exit and entry actions of the
//! hierarchical states are applied here, so the supervisor never has to know
//! which state it is in.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::artifact::{Artifact, DataChunk};
use crate::device::DeviceHandle;
use crate::format::CaptureFormat;

/// Inbound mailbox of a session. Children hold clones of it.
pub type SessionMailbox = mpsc::UnboundedSender<Event>;

/// Substates of `ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadyPhase {
    /// Device held, accumulator not yet spawned. Left immediately.
    Empty,
    /// Previous attempt was discarded as too short.
    NoData,
}

/// Why a session ended up in `disabled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum DisabledReason {
    UnsupportedFormat,
    AcquisitionFailed(String),
}

impl std::fmt::Display for DisabledReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisabledReason::UnsupportedFormat => write!(f, "recording unavailable"),
            DisabledReason::AcquisitionFailed(e) => {
                write!(f, "recording unavailable: device acquisition failed: {}", e)
            }
        }
    }
}

/// Authoritative session state. Context lives inside the variants that need it.
#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Inactive,
    Preparing {
        format: CaptureFormat,
    },
    Ready {
        format: CaptureFormat,
        phase: ReadyPhase,
    },
    Recording {
        format: CaptureFormat,
        recording_id: Uuid,
        elapsed_time_units: u32,
        /// Chunks pushed to the accumulator so far.
        pushed: u32,
    },
    /// `recording.stopping`: STOP received, the device is being stopped and
    /// its last data is still on the way.
    Stopping {
        format: CaptureFormat,
        recording_id: Uuid,
        elapsed_time_units: u32,
        pushed: u32,
        device_stopped: bool,
    },
    Processing {
        format: CaptureFormat,
        recording_id: Uuid,
        elapsed_time_units: u32,
    },
    Completed {
        format: CaptureFormat,
        elapsed_time_units: u32,
        artifact: Arc<Artifact>,
    },
    Disabled {
        reason: DisabledReason,
    },
}

impl State {
    /// Dotted state path, e.g. `ready.noData`.
    pub fn name(&self) -> &'static str {
        match self {
            State::Inactive => "inactive",
            State::Preparing { .. } => "preparing",
            State::Ready {
                phase: ReadyPhase::Empty,
                ..
            } => "ready.empty",
            State::Ready {
                phase: ReadyPhase::NoData,
                ..
            } => "ready.noData",
            State::Recording { .. } => "recording",
            State::Stopping { .. } => "recording.stopping",
            State::Processing { .. } => "processing",
            State::Completed { .. } => "completed",
            State::Disabled { .. } => "disabled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Completed { .. } | State::Disabled { .. })
    }

    pub fn format(&self) -> Option<&CaptureFormat> {
        match self {
            State::Inactive | State::Disabled { .. } => None,
            State::Preparing { format }
            | State::Ready { format, .. }
            | State::Recording { format, .. }
            | State::Stopping { format, .. }
            | State::Processing { format, .. }
            | State::Completed { format, .. } => Some(format),
        }
    }

    pub fn elapsed_time_units(&self) -> u32 {
        match self {
            State::Recording {
                elapsed_time_units, ..
            }
            | State::Stopping {
                elapsed_time_units, ..
            }
            | State::Processing {
                elapsed_time_units, ..
            }
            | State::Completed {
                elapsed_time_units, ..
            } => *elapsed_time_units,
            _ => 0,
        }
    }

    /// Id of the accumulator generation this state listens to.
    fn recording_id(&self) -> Option<Uuid> {
        match self {
            State::Recording { recording_id, .. }
            | State::Stopping { recording_id, .. }
            | State::Processing { recording_id, .. } => Some(*recording_id),
            _ => None,
        }
    }
}

/// Everything a session can receive: caller commands, the acquisition
/// result, and messages from its children.
#[derive(Debug)]
pub enum Event {
    /// Choose a format. `None` means negotiation found nothing.
    Prepare { format: Option<CaptureFormat> },
    /// Re-arm after a too-short attempt.
    Start,
    Stop,
    /// Tear everything down, from any state.
    Exit,

    DeviceReady { device: DeviceHandle },
    DeviceFailed { err: String },

    /// From the listener.
    Chunk { chunk: DataChunk },
    /// The listener stopped the device and forwarded everything it emitted.
    DeviceStopped,
    /// Reply to a push, from the accumulator generation `id`.
    Time { id: Uuid, time_units: u32 },
    /// Final artifact from the accumulator generation `id`.
    Data { id: Uuid, artifact: Artifact },
}

/// Effects to be executed by the supervisor, in order.
#[derive(Debug)]
pub enum Effect {
    AcquireDevice { format: CaptureFormat },
    SpawnListener,
    BindDevice { device: DeviceHandle },
    /// Replaces any existing accumulator.
    SpawnAccumulator { id: Uuid, format: CaptureFormat },
    StartDevice,
    StopDevice,
    PushChunk { chunk: DataChunk },
    StopAccumulator,
    ClearAccumulator,
    TeardownChildren,
    /// Publish a status snapshot to observers.
    Publish,
}

/// Inputs to the guards.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    /// Minimum accepted recording, in time units.
    pub min_length: u32,
    /// Whether the capture backend can record the format carried by a
    /// `Prepare`. Checked off the session task before reducing.
    pub format_supported: bool,
}

impl Policy {
    fn has_enough_data(&self, elapsed_time_units: u32) -> bool {
        elapsed_time_units > 0 && elapsed_time_units >= self.min_length
    }
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore replies from accumulator generations other than the current one
/// - Emit Publish after every change
/// - Decide STOP only once the device has stopped and every pushed chunk
///   has been counted
pub fn reduce(state: &State, event: Event, policy: &Policy) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    let current_id = state.recording_id();
    let is_stale = |eid: Uuid| Some(eid) != current_id;

    match (state, event) {
        // -----------------
        // Inactive
        // -----------------
        (State::Inactive, Prepare { format: Some(format) }) if policy.format_supported => {
            goto(
                state,
                State::Preparing {
                    format: format.clone(),
                },
                vec![AcquireDevice { format }],
            )
        }
        (State::Inactive, Prepare { format }) => {
            log::info!("Format {:?} not supported, disabling", format);
            goto(
                state,
                State::Disabled {
                    reason: DisabledReason::UnsupportedFormat,
                },
                vec![],
            )
        }

        // -----------------
        // Preparing
        // -----------------
        (State::Preparing { format }, DeviceReady { device }) => goto(
            state,
            State::Ready {
                format: format.clone(),
                phase: ReadyPhase::Empty,
            },
            vec![SpawnListener, BindDevice { device }],
        ),
        (State::Preparing { .. }, DeviceFailed { err }) => goto(
            state,
            State::Disabled {
                reason: DisabledReason::AcquisitionFailed(err),
            },
            vec![],
        ),

        // -----------------
        // Ready
        // -----------------
        (
            State::Ready {
                format,
                phase: ReadyPhase::NoData,
            },
            Start,
        ) => {
            let id = Uuid::new_v4();
            goto(
                state,
                State::Recording {
                    format: format.clone(),
                    recording_id: id,
                    elapsed_time_units: 0,
                    pushed: 0,
                },
                vec![SpawnAccumulator {
                    id,
                    format: format.clone(),
                }],
            )
        }

        // -----------------
        // Recording
        // -----------------
        (
            State::Recording {
                format,
                recording_id,
                elapsed_time_units,
                pushed,
            },
            Chunk { chunk },
        ) => (
            State::Recording {
                format: format.clone(),
                recording_id: *recording_id,
                elapsed_time_units: *elapsed_time_units,
                pushed: *pushed + 1,
            },
            vec![PushChunk { chunk }],
        ),
        (
            State::Recording {
                format,
                recording_id,
                pushed,
                ..
            },
            Time { id, time_units },
        ) if !is_stale(id) => (
            State::Recording {
                format: format.clone(),
                recording_id: *recording_id,
                elapsed_time_units: time_units,
                pushed: *pushed,
            },
            vec![Publish],
        ),
        // Data the device emitted before STOP is still queued at the
        // listener. Wait for it before deciding.
        (
            State::Recording {
                format,
                recording_id,
                elapsed_time_units,
                pushed,
            },
            Stop,
        ) => (
            State::Stopping {
                format: format.clone(),
                recording_id: *recording_id,
                elapsed_time_units: *elapsed_time_units,
                pushed: *pushed,
                device_stopped: false,
            },
            vec![StopDevice, Publish],
        ),
        // Accumulator hit the maximum length and finalized on its own
        (
            State::Recording {
                format,
                recording_id,
                elapsed_time_units,
                ..
            }
            | State::Stopping {
                format,
                recording_id,
                elapsed_time_units,
                ..
            },
            Data { id, artifact },
        ) if !is_stale(id) => {
            log::warn!(
                "Recording {} reached maximum length after {} time units (truncated: {})",
                recording_id,
                elapsed_time_units,
                artifact.truncated()
            );
            goto(
                state,
                State::Completed {
                    format: format.clone(),
                    elapsed_time_units: (*elapsed_time_units).max(artifact.chunk_count() as u32),
                    artifact: Arc::new(artifact),
                },
                vec![],
            )
        }

        // -----------------
        // Recording.stopping
        // -----------------
        (
            State::Stopping {
                format,
                recording_id,
                elapsed_time_units,
                pushed,
                device_stopped,
            },
            Chunk { chunk },
        ) => (
            State::Stopping {
                format: format.clone(),
                recording_id: *recording_id,
                elapsed_time_units: *elapsed_time_units,
                pushed: *pushed + 1,
                device_stopped: *device_stopped,
            },
            vec![PushChunk { chunk }],
        ),
        (
            State::Stopping {
                format,
                recording_id,
                pushed,
                device_stopped,
                ..
            },
            Time { id, time_units },
        ) if !is_stale(id) => settle(
            state,
            State::Stopping {
                format: format.clone(),
                recording_id: *recording_id,
                elapsed_time_units: time_units,
                pushed: *pushed,
                device_stopped: *device_stopped,
            },
            policy,
        ),
        (
            State::Stopping {
                format,
                recording_id,
                elapsed_time_units,
                pushed,
                ..
            },
            DeviceStopped,
        ) => settle(
            state,
            State::Stopping {
                format: format.clone(),
                recording_id: *recording_id,
                elapsed_time_units: *elapsed_time_units,
                pushed: *pushed,
                device_stopped: true,
            },
            policy,
        ),

        // -----------------
        // Processing
        // -----------------
        // Replies to pushes queued before STOP still count
        (
            State::Processing {
                format,
                recording_id,
                ..
            },
            Time { id, time_units },
        ) if !is_stale(id) => (
            State::Processing {
                format: format.clone(),
                recording_id: *recording_id,
                elapsed_time_units: time_units,
            },
            vec![Publish],
        ),
        (
            State::Processing {
                format,
                elapsed_time_units,
                ..
            },
            Data { id, artifact },
        ) if !is_stale(id) => goto(
            state,
            State::Completed {
                format: format.clone(),
                elapsed_time_units: (*elapsed_time_units).max(artifact.chunk_count() as u32),
                artifact: Arc::new(artifact),
            },
            vec![],
        ),

        // -----------------
        // Dropped input
        // -----------------
        (_, Chunk { chunk }) => {
            log::debug!(
                "Dropping {} byte chunk received in {}",
                chunk.len(),
                state.name()
            );
            (state.clone(), vec![])
        }
        (_, Time { id, .. }) | (_, Data { id, .. }) if is_stale(id) => {
            log::debug!("Ignoring stale reply from accumulator {}", id);
            (state.clone(), vec![])
        }
        (_, DeviceReady { device }) => {
            log::warn!("Releasing late device {:?} in {}", device, state.name());
            (state.clone(), vec![])
        }

        // -----------------
        // Unhandled: no transition
        // -----------------
        (_, event) => {
            log::debug!("Ignoring {:?} in {}", event, state.name());
            (state.clone(), vec![])
        }
    }
}

/// Resolve `recording.stopping` once the device has stopped and every
/// pushed chunk has been counted. Until then stay, publishing progress.
fn settle(from: &State, stopping: State, policy: &Policy) -> (State, Vec<Effect>) {
    match stopping {
        State::Stopping {
            format,
            recording_id,
            elapsed_time_units,
            pushed,
            device_stopped: true,
        } if elapsed_time_units >= pushed => {
            if policy.has_enough_data(elapsed_time_units) {
                goto(
                    from,
                    State::Processing {
                        format,
                        recording_id,
                        elapsed_time_units,
                    },
                    vec![Effect::StopAccumulator],
                )
            } else {
                log::info!(
                    "Recording {} too short ({} < {} time units), discarding",
                    recording_id,
                    elapsed_time_units,
                    policy.min_length.max(1)
                );
                goto(
                    from,
                    State::Ready {
                        format,
                        phase: ReadyPhase::NoData,
                    },
                    vec![Effect::ClearAccumulator],
                )
            }
        }
        waiting => (waiting, vec![Effect::Publish]),
    }
}

/// External transition: exit actions of `from`, transition `actions`, entry
/// actions of `to`, then any eventless transition out of `to`.
fn goto(from: &State, to: State, mut actions: Vec<Effect>) -> (State, Vec<Effect>) {
    let mut effects = Vec::with_capacity(actions.len() + 3);

    // `recording.stopping` already asked the device to stop
    if matches!(from, State::Recording { .. }) {
        effects.push(Effect::StopDevice);
    }
    effects.append(&mut actions);

    match to {
        State::Ready {
            format,
            phase: ReadyPhase::Empty,
        } => {
            let id = Uuid::new_v4();
            effects.push(Effect::SpawnAccumulator {
                id,
                format: format.clone(),
            });
            effects.push(Effect::StartDevice);
            effects.push(Effect::Publish);
            (
                State::Recording {
                    format,
                    recording_id: id,
                    elapsed_time_units: 0,
                    pushed: 0,
                },
                effects,
            )
        }
        State::Recording { .. } => {
            effects.push(Effect::StartDevice);
            effects.push(Effect::Publish);
            (to, effects)
        }
        State::Completed { .. } | State::Disabled { .. } => {
            effects.push(Effect::TeardownChildren);
            effects.push(Effect::Publish);
            (to, effects)
        }
        _ => {
            effects.push(Effect::Publish);
            (to, effects)
        }
    }
}
