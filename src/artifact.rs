//! Captured data chunks and the assembled artifact

use std::io::Cursor;

use serde::Serialize;
use thiserror::Error;

use crate::audio::L16Spec;
use crate::format::CaptureFormat;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("WAV export needs an audio/L16 artifact, got {0}")]
    NotPcm(String),
    #[error("Artifact ends in a partial frame ({0} bytes)")]
    PartialFrame(usize),
    #[error("Failed to write WAV: {0}")]
    Wav(#[from] hound::Error),
}

/// One opaque slice of captured payload, in device emission order.
///
/// The engine never looks inside a chunk; it only counts and concatenates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk(Vec<u8>);

impl DataChunk {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for DataChunk {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for DataChunk {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// The finished recording: all accepted chunks joined in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    format: CaptureFormat,
    #[serde(skip)]
    bytes: Vec<u8>,
    chunk_count: usize,
    /// Set when the maximum length forced finalization and a chunk was dropped.
    truncated: bool,
}

impl Artifact {
    /// Concatenate `chunks` in order.
    pub fn assemble(format: CaptureFormat, chunks: Vec<DataChunk>, truncated: bool) -> Self {
        let total = chunks.iter().map(DataChunk::len).sum();
        let mut bytes = Vec::with_capacity(total);
        let chunk_count = chunks.len();
        for chunk in chunks {
            bytes.extend_from_slice(chunk.as_bytes());
        }

        Self {
            format,
            bytes,
            chunk_count,
            truncated,
        }
    }

    pub fn format(&self) -> &CaptureFormat {
        &self.format
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Wrap an L16 artifact in a WAV container.
    pub fn to_wav(&self) -> Result<Vec<u8>, ArtifactError> {
        let spec = L16Spec::from_format(&self.format)
            .ok_or_else(|| ArtifactError::NotPcm(self.format.to_string()))?;
        if self.bytes.len() % spec.frame_bytes() != 0 {
            return Err(ArtifactError::PartialFrame(self.bytes.len()));
        }

        let wav_spec = hound::WavSpec {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::with_capacity(self.bytes.len() + 44));
        {
            let mut writer = hound::WavWriter::new(&mut cursor, wav_spec)?;
            for pair in self.bytes.chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }
}
