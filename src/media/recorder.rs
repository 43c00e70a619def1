//! Call Recorder - Container Writer
//!
//! Serializes reassembled audio frames into a seekable Ogg/Opus container
//! with exactly one audio track. The track schema (sample rate, channel
//! count, codec, nominal frame duration) is fixed when the container is
//! opened and cannot change mid-call. Writes must carry strictly increasing
//! timestamps; close is idempotent and flushes the container so the file is
//! independently replayable.

use super::reassembler::AudioFrame;
use crate::config::CHANNELS;
use std::fs::File;
use std::io::{Seek, Write};
use std::path::Path;
use thiserror::Error;
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::media::io::Writer;
use webrtc::rtp;

/// Synchronization source stamped on the recorded track
const TRACK_SSRC: u32 = 1;

/// RTP payload type carried into the container (dynamic range, Opus)
const OPUS_PAYLOAD_TYPE: u8 = 111;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("container file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container error: {0}")]
    Container(String),

    #[error("non-monotonic timestamp: {got} after {last}")]
    NonMonotonicTimestamp { last: u32, got: u32 },

    #[error("recorder is closed")]
    Closed,
}

// ============================================================================
// RECORDER
// ============================================================================

/// Exclusive owner of one call's output file for the call's entire duration.
pub struct CallRecorder<W: Write + Seek + Send> {
    writer: Option<OggWriter<W>>,
    last_timestamp: Option<u32>,
    frames_written: u64,
}

impl CallRecorder<File> {
    /// Opens the container file and writes the track headers.
    pub fn create(path: &Path, sample_rate: u32) -> Result<Self, RecorderError> {
        let file = File::create(path)?;
        tracing::info!(path = %path.display(), sample_rate, "recording container opened");
        Self::with_writer(file, sample_rate)
    }
}

impl<W: Write + Seek + Send> CallRecorder<W> {
    /// Opens the container over an arbitrary seekable sink.
    pub fn with_writer(sink: W, sample_rate: u32) -> Result<Self, RecorderError> {
        let writer = OggWriter::new(sink, sample_rate, CHANNELS as u8)
            .map_err(|e| RecorderError::Container(e.to_string()))?;

        Ok(Self {
            writer: Some(writer),
            last_timestamp: None,
            frames_written: 0,
        })
    }

    /// Appends one frame. The frame's timestamp must be strictly greater
    /// than the previously written one; violations are rejected, not
    /// retried.
    pub fn write(&mut self, frame: &AudioFrame) -> Result<(), RecorderError> {
        let writer = self.writer.as_mut().ok_or(RecorderError::Closed)?;

        if let Some(last) = self.last_timestamp {
            if frame.timestamp <= last {
                return Err(RecorderError::NonMonotonicTimestamp {
                    last,
                    got: frame.timestamp,
                });
            }
        }

        let packet = rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: OPUS_PAYLOAD_TYPE,
                sequence_number: frame.sequence,
                timestamp: frame.timestamp,
                ssrc: TRACK_SSRC,
                ..Default::default()
            },
            payload: frame.payload.clone(),
        };

        writer
            .write_rtp(&packet)
            .map_err(|e| RecorderError::Container(e.to_string()))?;

        self.last_timestamp = Some(frame.timestamp);
        self.frames_written += 1;
        Ok(())
    }

    /// Flushes the container index and headers. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), RecorderError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .close()
                .map_err(|e| RecorderError::Container(e.to_string()))?;
            tracing::info!(frames = self.frames_written, "recording container closed");
        }
        Ok(())
    }

    /// Number of frames persisted so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl<W: Write + Seek + Send> Drop for CallRecorder<W> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close recording container");
        }
    }
}

impl<W: Write + Seek + Send> std::fmt::Debug for CallRecorder<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRecorder")
            .field("open", &self.writer.is_some())
            .field("frames_written", &self.frames_written)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
