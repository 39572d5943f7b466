//! CPAL capture backend
//!
//! The CPAL stream is not `Send` on every platform, so it never leaves the
//! dedicated capture thread that builds it. The thread collects converted
//! samples from the stream callback and pushes one PCM payload per time slice
//! to the subscribed sink. Stopping the device joins the thread, which flushes
//! the partially filled slice first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfig,
};

use super::L16Spec;
use crate::device::{
    CaptureBackend, CaptureDevice, DataSink, DeviceData, DeviceError, DeviceHandle,
    MicrophoneStatus,
};
use crate::format::CaptureFormat;

/// How often the capture thread checks for stop while waiting for samples.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Backend for the host's default input device.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureBackend for CpalBackend {
    fn is_format_supported(&self, format: &CaptureFormat) -> bool {
        let Some(spec) = L16Spec::from_format(format) else {
            return false;
        };
        match default_device() {
            Ok(device) => find_config(&device, spec).is_ok(),
            Err(_) => false,
        }
    }

    fn permission(&self) -> MicrophoneStatus {
        match default_device() {
            Ok(_) => MicrophoneStatus::Granted,
            Err(_) => MicrophoneStatus::Unavailable,
        }
    }

    async fn acquire(&self, format: &CaptureFormat) -> Result<DeviceHandle, DeviceError> {
        let spec = L16Spec::from_format(format)
            .ok_or_else(|| DeviceError::UnsupportedFormat(format.to_string()))?;

        let device = tokio::task::spawn_blocking(move || CpalDevice::open(spec))
            .await
            .map_err(|e| DeviceError::Unavailable(e.to_string()))??;
        Ok(DeviceHandle::new(device))
    }
}

struct CaptureWorker {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

/// The default input device, opened for one L16 format.
pub struct CpalDevice {
    name: String,
    spec: L16Spec,
    sink: Arc<Mutex<Option<DataSink>>>,
    worker: Option<CaptureWorker>,
}

impl CpalDevice {
    /// Check that the default device can record `spec`. The stream itself is
    /// only built on `start`.
    pub fn open(spec: L16Spec) -> Result<Self, DeviceError> {
        let device = default_device()?;
        let name = device.name().unwrap_or_else(|_| "default input".to_string());
        let config = find_config(&device, spec)?;

        log::info!(
            "Using audio input device: {} ({} Hz, {} channels, {:?})",
            name,
            spec.sample_rate,
            spec.channels,
            config.sample_format()
        );

        Ok(Self {
            name,
            spec,
            sink: Arc::new(Mutex::new(None)),
            worker: None,
        })
    }
}

impl CaptureDevice for CpalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn subscribe(&mut self, sink: DataSink) {
        *lock(&self.sink) = Some(sink);
    }

    fn unsubscribe(&mut self) {
        *lock(&self.sink) = None;
    }

    fn start(&mut self, slice: Duration) -> Result<(), DeviceError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let spec = self.spec;
        let sink = Arc::clone(&self.sink);
        let thread_stop = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("clip-capture".to_string())
            .spawn(move || capture_thread(spec, slice, sink, thread_stop, ready_tx))
            .map_err(|e| DeviceError::StreamFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("Capture started on {} ({:?} slices)", self.name, slice);
                self.worker = Some(CaptureWorker { stop, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(DeviceError::StreamFailed(
                    "capture thread exited before starting".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker.stop.store(true, Ordering::SeqCst);
        worker
            .thread
            .join()
            .map_err(|_| DeviceError::StreamFailed("capture thread panicked".to_string()))?;
        log::info!("Capture stopped on {}", self.name);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Failed to stop {} on release: {}", self.name, e);
        }
    }
}

fn capture_thread(
    spec: L16Spec,
    slice: Duration,
    sink: Arc<Mutex<Option<DataSink>>>,
    stop: Arc<AtomicBool>,
    ready: std_mpsc::Sender<Result<(), DeviceError>>,
) {
    let (sample_tx, sample_rx) = std_mpsc::channel::<Vec<i16>>();

    let stream = match build_stream(spec, sample_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(DeviceError::StreamFailed(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }
    let _ = ready.send(Ok(()));

    let mut pending = Vec::new();
    let mut slice_started = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        match sample_rx.recv_timeout(POLL_INTERVAL) {
            Ok(samples) => append_pcm16_le(&mut pending, &samples),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if slice_started.elapsed() >= slice {
            emit(&sink, std::mem::take(&mut pending));
            slice_started += slice;
        }
    }

    // Drop the stream first so no callback runs after the final flush.
    drop(stream);
    while let Ok(samples) = sample_rx.try_recv() {
        append_pcm16_le(&mut pending, &samples);
    }
    emit(&sink, pending);
}

fn emit(sink: &Mutex<Option<DataSink>>, payload: Vec<u8>) {
    if let Some(sink) = lock(sink).as_ref() {
        let _ = sink.send(DeviceData::new(payload));
    }
}

fn lock(sink: &Mutex<Option<DataSink>>) -> MutexGuard<'_, Option<DataSink>> {
    sink.lock().unwrap_or_else(|e| e.into_inner())
}

fn default_device() -> Result<Device, DeviceError> {
    cpal::default_host()
        .default_input_device()
        .ok_or(DeviceError::NoInputDevice)
}

/// Find a device config with the requested rate and channel count, preferring
/// native 16-bit samples.
fn find_config(device: &Device, spec: L16Spec) -> Result<SupportedStreamConfig, DeviceError> {
    let ranges = device
        .supported_input_configs()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

    ranges
        .filter(|r| r.channels() == spec.channels)
        .filter(|r| {
            r.min_sample_rate().0 <= spec.sample_rate && spec.sample_rate <= r.max_sample_rate().0
        })
        .filter_map(|r| sample_format_rank(r.sample_format()).map(|rank| (rank, r)))
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, r)| r.with_sample_rate(SampleRate(spec.sample_rate)))
        .ok_or_else(|| {
            DeviceError::UnsupportedFormat(format!(
                "{} Hz, {} channels",
                spec.sample_rate, spec.channels
            ))
        })
}

fn sample_format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::I16 => Some(0),
        SampleFormat::F32 => Some(1),
        SampleFormat::U16 => Some(2),
        _ => None,
    }
}

fn build_stream(spec: L16Spec, tx: std_mpsc::Sender<Vec<i16>>) -> Result<Stream, DeviceError> {
    let device = default_device()?;
    let supported = find_config(&device, spec)?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, tx),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, tx),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, tx),
        other => Err(DeviceError::UnsupportedFormat(format!("{:?} samples", other))),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    tx: std_mpsc::Sender<Vec<i16>>,
) -> Result<Stream, DeviceError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                // receiver gone means the capture thread is shutting down
                let _ = tx.send(samples);
            },
            |err| log::error!("Audio stream error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::StreamFailed(e.to_string()))
}

/// Convert any sample type to i16.
fn sample_to_i16<T>(sample: T) -> i16
where
    f32: FromSample<T>,
{
    let f32_sample = f32::from_sample_(sample);
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

fn append_pcm16_le(out: &mut Vec<u8>, samples: &[i16]) {
    out.reserve(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);

        // clamping
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }

    #[test]
    fn pcm_is_little_endian() {
        let mut out = Vec::new();
        append_pcm16_le(&mut out, &[1, -2, 0x0102]);
        assert_eq!(out, vec![0x01, 0x00, 0xFE, 0xFF, 0x02, 0x01]);
    }

    #[test]
    fn non_pcm_formats_are_never_supported() {
        let backend = CpalBackend::new();
        let format = CaptureFormat::new("audio/ogg;codecs=opus").unwrap();
        assert!(!backend.is_format_supported(&format));
    }

    #[tokio::test]
    async fn acquire_rejects_non_pcm_format() {
        let backend = CpalBackend::new();
        let format = CaptureFormat::new("audio/webm;codecs=opus").unwrap();
        assert!(matches!(
            backend.acquire(&format).await,
            Err(DeviceError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn native_i16_is_preferred() {
        assert!(sample_format_rank(SampleFormat::I16) < sample_format_rank(SampleFormat::F32));
        assert_eq!(sample_format_rank(SampleFormat::I8), None);
    }
}
