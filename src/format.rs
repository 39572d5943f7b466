//! Capture format identifiers and negotiation
//!
//! A format is an opaque MIME-like string such as `audio/webm;codecs=opus` or
//! `audio/L16;rate=48000;channels=1`. It is chosen once, before any device is
//! acquired, and never changes for the life of a session.

use serde::{Deserialize, Serialize};

use crate::device::CaptureBackend;
use crate::settings::RecorderSettings;

/// A negotiated capture encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureFormat(String);

impl CaptureFormat {
    /// Returns `None` for empty or whitespace-only identifiers.
    pub fn new(format: impl Into<String>) -> Option<Self> {
        let format = format.into();
        if format.trim().is_empty() {
            None
        } else {
            Some(Self(format))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare MIME type, without parameters (`audio/L16`).
    pub fn mime_type(&self) -> &str {
        self.0.split(';').next().unwrap_or_default().trim()
    }

    /// Look up a `;key=value` parameter. Keys compare case-insensitively.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.0.split(';').skip(1).find_map(|part| {
            let (k, v) = part.split_once('=')?;
            k.trim().eq_ignore_ascii_case(key).then(|| v.trim())
        })
    }
}

impl std::fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pick the first candidate the backend can record.
pub fn find_supported_format<B>(candidates: &[String], backend: &B) -> Option<CaptureFormat>
where
    B: CaptureBackend + ?Sized,
{
    candidates
        .iter()
        .filter_map(|c| CaptureFormat::new(c.as_str()))
        .find(|f| backend.is_format_supported(f))
}

/// Negotiate once and remember the answer in `settings.supported_format`.
///
/// A cached value is trusted as long as the backend still supports it;
/// otherwise negotiation runs again. Returns whether the settings changed so
/// the caller can decide to persist them.
pub fn retrieve_supported_format<B>(
    settings: &mut RecorderSettings,
    backend: &B,
) -> (Option<CaptureFormat>, bool)
where
    B: CaptureBackend + ?Sized,
{
    if let Some(cached) = settings
        .supported_format
        .as_deref()
        .and_then(CaptureFormat::new)
    {
        if backend.is_format_supported(&cached) {
            log::debug!("Format: using cached {}", cached);
            return (Some(cached), false);
        }
        log::info!("Format: cached {} no longer supported, renegotiating", cached);
    }

    let found = find_supported_format(&settings.candidate_formats, backend);
    let changed = settings.supported_format.as_deref() != found.as_ref().map(|f| f.as_str());
    settings.supported_format = found.as_ref().map(|f| f.as_str().to_string());

    match &found {
        Some(format) => log::info!("Format: negotiated {}", format),
        None => log::warn!(
            "Format: none of {} candidates is supported",
            settings.candidate_formats.len()
        ),
    }

    (found, changed)
}
