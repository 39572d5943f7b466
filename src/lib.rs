//! Clip recording engine
//!
//! Captures an audio clip from a live input device under a minimum and
//! maximum length policy and assembles it into a single artifact.
//!
//! ```text
//!              RecordingSession (state loop + supervisor)
//!                 │                        │
//!          Device listener           Chunk accumulator
//!                 │
//!          CaptureDevice (cpal or memory)
//! ```

pub mod accumulator;
pub mod artifact;
pub mod audio;
pub mod device;
mod effects;
pub mod format;
pub mod listener;
pub mod metrics;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod status;

pub use artifact::{Artifact, ArtifactError, DataChunk};
pub use audio::{CpalBackend, L16Spec};
pub use device::memory::{MemoryBackend, MemoryProbe};
pub use device::{CaptureBackend, CaptureDevice, DeviceError, DeviceHandle, MicrophoneStatus};
pub use format::{find_supported_format, retrieve_supported_format, CaptureFormat};
pub use session::{RecordingSession, SessionError};
pub use settings::{
    load_settings, save_settings, RecorderSettings, SessionConfig, SettingsError,
};
pub use state_machine::{DisabledReason, ReadyPhase};
pub use status::{SessionOutcome, SessionStatus, StateKind};
