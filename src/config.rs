//! Call Configuration
//!
//! The knobs a caller provides before starting a call. Everything else
//! (channel count, frame duration, plugin name) is fixed by the audio-bridge
//! protocol and lives in crate constants.

use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample rate of the negotiated audio track (48kHz, Opus native rate)
pub const SAMPLE_RATE: u32 = 48_000;

/// Channel count of the recorded track
pub const CHANNELS: u16 = 2;

/// Nominal frame duration in milliseconds (one Opus packet)
pub const FRAME_DURATION_MS: u32 = 20;

/// Default out-of-order packet tolerance of the frame reassembler
pub const DEFAULT_MAX_LATE: usize = 50;

// ============================================================================
// CONFIG
// ============================================================================

/// Configuration consumed by the call core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// WebSocket address of the signaling gateway, e.g. `ws://localhost:8188/`
    pub gateway_address: String,

    /// Maximum number of out-of-order packets the reassembler buffers before
    /// force-emitting the oldest buffered frame
    #[serde(default = "default_max_late")]
    pub max_late_tolerance: usize,

    /// Sample rate of the audio track
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

fn default_max_late() -> usize {
    DEFAULT_MAX_LATE
}

fn default_sample_rate() -> u32 {
    SAMPLE_RATE
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            gateway_address: "ws://127.0.0.1:8188/".to_string(),
            max_late_tolerance: DEFAULT_MAX_LATE,
            sample_rate: SAMPLE_RATE,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
