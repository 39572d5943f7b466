//! In-memory capture backend
//!
//! Stands in for real hardware in tests and demos. Every device handed out by
//! a [`MemoryBackend`] shares one [`MemoryProbe`], through which the caller
//! injects data events and inspects what the engine did to the device.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    CaptureBackend, CaptureDevice, DataSink, DeviceData, DeviceError, DeviceHandle,
    MicrophoneStatus,
};
use crate::format::CaptureFormat;

#[derive(Debug, Default)]
struct Shared {
    sink: Option<DataSink>,
    running: bool,
    slice: Option<Duration>,
    starts: u32,
    stops: u32,
    acquired: u32,
    released: u32,
    final_flush: Option<Vec<u8>>,
}

/// Test-side view of the devices produced by a [`MemoryBackend`].
#[derive(Debug, Clone, Default)]
pub struct MemoryProbe {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryProbe {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Emit a data event as the device would at the end of a slice.
    /// Returns false when the device is not running or nobody is subscribed.
    pub fn emit(&self, payload: impl Into<Vec<u8>>) -> bool {
        let shared = self.lock();
        if !shared.running {
            return false;
        }
        match &shared.sink {
            Some(sink) => sink.send(DeviceData::new(payload.into())).is_ok(),
            None => false,
        }
    }

    /// Payload the device flushes when it is stopped.
    pub fn set_final_flush(&self, payload: impl Into<Vec<u8>>) {
        self.lock().final_flush = Some(payload.into());
    }

    pub fn is_subscribed(&self) -> bool {
        self.lock().sink.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn slice(&self) -> Option<Duration> {
        self.lock().slice
    }

    pub fn start_count(&self) -> u32 {
        self.lock().starts
    }

    pub fn stop_count(&self) -> u32 {
        self.lock().stops
    }

    pub fn acquired_count(&self) -> u32 {
        self.lock().acquired
    }

    pub fn released_count(&self) -> u32 {
        self.lock().released
    }
}

/// A device backed by a [`MemoryProbe`].
pub struct MemoryDevice {
    name: String,
    probe: MemoryProbe,
}

impl CaptureDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&mut self, sink: DataSink) {
        self.probe.lock().sink = Some(sink);
    }

    fn unsubscribe(&mut self) {
        self.probe.lock().sink = None;
    }

    fn start(&mut self, slice: Duration) -> Result<(), DeviceError> {
        let mut shared = self.probe.lock();
        shared.running = true;
        shared.slice = Some(slice);
        shared.starts += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        let mut shared = self.probe.lock();
        shared.running = false;
        shared.stops += 1;
        if let Some(payload) = shared.final_flush.take() {
            if let Some(sink) = &shared.sink {
                let _ = sink.send(DeviceData::new(payload));
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.probe.lock().running
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        let mut shared = self.probe.lock();
        shared.released += 1;
        log::debug!("MemoryDevice {} released", self.name);
    }
}

/// Backend that supports a fixed list of formats.
pub struct MemoryBackend {
    formats: Vec<String>,
    permission: MicrophoneStatus,
    acquire_error: Option<DeviceError>,
    acquire_delay: Option<Duration>,
    probe: MemoryProbe,
}

impl MemoryBackend {
    pub fn new<I, S>(formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            formats: formats.into_iter().map(Into::into).collect(),
            permission: MicrophoneStatus::Granted,
            acquire_error: None,
            acquire_delay: None,
            probe: MemoryProbe::default(),
        }
    }

    /// Make every acquisition fail with `err`.
    pub fn failing(mut self, err: DeviceError) -> Self {
        self.permission = match err {
            DeviceError::PermissionDenied => MicrophoneStatus::Denied,
            DeviceError::NoInputDevice => MicrophoneStatus::Unavailable,
            _ => self.permission,
        };
        self.acquire_error = Some(err);
        self
    }

    /// Delay acquisitions, as a permission prompt would.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = Some(delay);
        self
    }

    pub fn probe(&self) -> MemoryProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl CaptureBackend for MemoryBackend {
    fn is_format_supported(&self, format: &CaptureFormat) -> bool {
        self.formats.iter().any(|f| f == format.as_str())
    }

    fn permission(&self) -> MicrophoneStatus {
        self.permission
    }

    async fn acquire(&self, format: &CaptureFormat) -> Result<DeviceHandle, DeviceError> {
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.acquire_error {
            return Err(err.clone());
        }
        if !self.is_format_supported(format) {
            return Err(DeviceError::UnsupportedFormat(format.to_string()));
        }

        let acquired = {
            let mut shared = self.probe.lock();
            shared.acquired += 1;
            shared.acquired
        };

        Ok(DeviceHandle::new(MemoryDevice {
            name: format!("memory-{}", acquired),
            probe: self.probe.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn device_emits_only_while_running_and_subscribed() {
        let backend = MemoryBackend::new(["audio/ogg"]);
        let probe = backend.probe();
        let format = CaptureFormat::new("audio/ogg").unwrap();
        let mut device = backend.acquire(&format).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(!probe.emit(vec![1]));

        device.subscribe(tx);
        assert!(!probe.emit(vec![1]));

        device.start(Duration::from_millis(1000)).unwrap();
        assert!(probe.emit(vec![2]));
        assert_eq!(rx.recv().await.unwrap().payload, vec![2]);

        probe.set_final_flush(vec![3]);
        device.stop().unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, vec![3]);

        device.unsubscribe();
        assert!(!probe.is_subscribed());
    }

    #[tokio::test]
    async fn failing_backend_reports_error() {
        let backend = MemoryBackend::new(["audio/ogg"]).failing(DeviceError::PermissionDenied);
        let format = CaptureFormat::new("audio/ogg").unwrap();
        let err = backend.acquire(&format).await.unwrap_err();
        assert_eq!(err, DeviceError::PermissionDenied);
        assert_eq!(backend.permission(), MicrophoneStatus::Denied);
    }

    #[tokio::test]
    async fn dropping_device_counts_release() {
        let backend = MemoryBackend::new(["audio/ogg"]);
        let probe = backend.probe();
        let format = CaptureFormat::new("audio/ogg").unwrap();
        let device = backend.acquire(&format).await.unwrap();
        assert_eq!(probe.acquired_count(), 1);
        drop(device);
        assert_eq!(probe.released_count(), 1);
    }
}
