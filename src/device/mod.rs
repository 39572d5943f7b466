//! Capture device surface consumed by the recording engine
//!
//! A [`CaptureBackend`] answers format questions and hands out devices. A
//! [`CaptureDevice`] is a push-style source: once subscribed and started it
//! emits [`DeviceData`] into the sink it was given, one event per time slice.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::format::CaptureFormat;

/// Where a device pushes its data events.
pub type DataSink = mpsc::UnboundedSender<DeviceData>;

/// A single data notification from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceData {
    pub payload: Vec<u8>,
}

impl DeviceData {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Errors raised by capture backends and devices.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("Microphone permission denied")]
    PermissionDenied,
    #[error("Unsupported capture format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to create audio stream: {0}")]
    StreamFailed(String),
    #[error("Capture device unavailable: {0}")]
    Unavailable(String),
}

/// Permission state of the input device, as far as the backend can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicrophoneStatus {
    Denied,
    Granted,
    Prompt,
    Unavailable,
    Unknown,
}

impl MicrophoneStatus {
    /// Map a platform permission string (`granted`, `prompt`, ...).
    pub fn parse(state: &str) -> Self {
        match state {
            "granted" => MicrophoneStatus::Granted,
            "prompt" => MicrophoneStatus::Prompt,
            _ => MicrophoneStatus::Denied,
        }
    }
}

/// A live capture device.
///
/// Only the device listener calls these methods; the session just holds the
/// handle while no listener is bound.
pub trait CaptureDevice: Send + 'static {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Register `sink` as the receiver of data events, replacing any previous one.
    fn subscribe(&mut self, sink: DataSink);

    /// Drop the registered sink. After this no events may reach the old sink.
    fn unsubscribe(&mut self);

    /// Begin emitting one data event per `slice`.
    fn start(&mut self, slice: Duration) -> Result<(), DeviceError>;

    /// Stop emitting. Any partially filled slice is flushed to the sink
    /// before this returns.
    fn stop(&mut self) -> Result<(), DeviceError>;

    fn is_running(&self) -> bool;
}

/// Owned, type-erased device.
pub struct DeviceHandle(Box<dyn CaptureDevice>);

impl DeviceHandle {
    pub fn new<D: CaptureDevice>(device: D) -> Self {
        Self(Box::new(device))
    }
}

impl std::ops::Deref for DeviceHandle {
    type Target = dyn CaptureDevice;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl std::ops::DerefMut for DeviceHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut()
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceHandle").field(&self.0.name()).finish()
    }
}

/// Format negotiation and device acquisition.
#[async_trait]
pub trait CaptureBackend: Send + Sync + 'static {
    /// Whether a device acquired with `format` could record it.
    fn is_format_supported(&self, format: &CaptureFormat) -> bool;

    fn permission(&self) -> MicrophoneStatus {
        MicrophoneStatus::Unknown
    }

    /// Acquire an input device for `format`. May prompt the user, so it can
    /// take arbitrarily long.
    async fn acquire(&self, format: &CaptureFormat) -> Result<DeviceHandle, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_strings_map_to_status() {
        assert_eq!(MicrophoneStatus::parse("granted"), MicrophoneStatus::Granted);
        assert_eq!(MicrophoneStatus::parse("prompt"), MicrophoneStatus::Prompt);
        assert_eq!(MicrophoneStatus::parse("denied"), MicrophoneStatus::Denied);
        assert_eq!(MicrophoneStatus::parse("whatever"), MicrophoneStatus::Denied);
    }

    #[test]
    fn device_error_display() {
        assert!(DeviceError::UnsupportedFormat("audio/x".into())
            .to_string()
            .contains("audio/x"));
        assert!(DeviceError::NoInputDevice.to_string().contains("input device"));
    }
}
