//! Microphone capture
//!
//! Real capture backend built on CPAL. It records
//! `audio/L16;rate=R;channels=C` and emits interleaved 16-bit little-endian
//! PCM, one data event per time slice.

pub mod recorder;

pub use recorder::{CpalBackend, CpalDevice};

use crate::format::CaptureFormat;

const L16_MIME: &str = "audio/L16";

/// Parameters of a linear PCM format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L16Spec {
    pub sample_rate: u32,
    pub channels: u16,
}

impl L16Spec {
    /// Parse `audio/L16;rate=48000;channels=1`. `channels` defaults to 1,
    /// `rate` is required.
    pub fn from_format(format: &CaptureFormat) -> Option<Self> {
        if !format.mime_type().eq_ignore_ascii_case(L16_MIME) {
            return None;
        }
        let sample_rate: u32 = format.param("rate")?.parse().ok()?;
        let channels: u16 = match format.param("channels") {
            Some(c) => c.parse().ok()?,
            None => 1,
        };
        if sample_rate == 0 || channels == 0 {
            return None;
        }
        Some(Self {
            sample_rate,
            channels,
        })
    }

    pub fn to_format(&self) -> Option<CaptureFormat> {
        CaptureFormat::new(format!(
            "{};rate={};channels={}",
            L16_MIME, self.sample_rate, self.channels
        ))
    }

    /// Bytes in one frame (one sample per channel).
    pub fn frame_bytes(&self) -> usize {
        2 * self.channels as usize
    }
}
