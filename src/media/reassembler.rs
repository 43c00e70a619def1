//! Frame Reassembler
//!
//! Inbound media packets arrive out of order and at sub-frame granularity.
//! The reassembler buffers them keyed by sequence number and emits playable
//! frames in strict timestamp order. Buffering is bounded: once more than
//! `max_late` packets wait behind a gap, the gap is abandoned and the oldest
//! buffered frame is emitted, trading an audible glitch for bounded memory
//! and latency.

use bytes::Bytes;
use std::collections::BTreeMap;

// ============================================================================
// PACKET / FRAME TYPES
// ============================================================================

/// One inbound network-level media unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Bytes,
}

/// One reassembled, time-ordered unit of decodable audio. Consumed exactly
/// once by the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub sequence: u16,
    pub timestamp: u32,
    pub payload: Bytes,
}

// ============================================================================
// REASSEMBLER
// ============================================================================

/// Reorders packets into frames. The first packet pushed anchors the
/// sequence; sequence numbers wrap at 16 bits and are extended internally.
pub struct FrameReassembler {
    max_late: usize,
    /// Buffered packets keyed by extended sequence number
    pending: BTreeMap<u64, MediaPacket>,
    /// Next extended sequence number to emit; set by the first packet
    next_seq: Option<u64>,
    /// Highest extended sequence number seen, for wrap extension
    highest_seq: Option<u64>,
    /// Timestamp of the last emitted frame
    last_timestamp: Option<u32>,
    dropped_malformed: u64,
    dropped_duplicate: u64,
}

impl FrameReassembler {
    pub fn new(max_late: usize) -> Self {
        Self {
            max_late,
            pending: BTreeMap::new(),
            next_seq: None,
            highest_seq: None,
            last_timestamp: None,
            dropped_malformed: 0,
            dropped_duplicate: 0,
        }
    }

    /// Feeds one packet in; returns the frames that became emittable, in
    /// timestamp order. Malformed and duplicate packets are dropped silently
    /// (counted, never an error).
    pub fn push(&mut self, packet: MediaPacket) -> Vec<AudioFrame> {
        if packet.payload.is_empty() {
            self.dropped_malformed += 1;
            tracing::trace!(sequence = packet.sequence, "malformed packet dropped");
            return Vec::new();
        }

        let extended = self.extend(packet.sequence);
        if self.highest_seq.map_or(true, |highest| extended > highest) {
            self.highest_seq = Some(extended);
        }

        let next = *self.next_seq.get_or_insert(extended);
        if extended < next || self.pending.contains_key(&extended) {
            self.dropped_duplicate += 1;
            tracing::trace!(sequence = packet.sequence, "duplicate or stale packet dropped");
            return Vec::new();
        }

        self.pending.insert(extended, packet);
        self.drain(false)
    }

    /// Drains everything still buffered, in order. Called at teardown so the
    /// tail of the call is not lost behind a gap.
    pub fn flush(&mut self) -> Vec<AudioFrame> {
        self.drain(true)
    }

    /// Number of packets dropped because their payload was unusable.
    pub fn dropped_malformed(&self) -> u64 {
        self.dropped_malformed
    }

    /// Number of packets dropped as duplicates or stale re-deliveries.
    pub fn dropped_duplicate(&self) -> u64 {
        self.dropped_duplicate
    }

    /// Extends a wrapping 16-bit sequence number to 64 bits, relative to the
    /// highest sequence seen so far.
    fn extend(&self, sequence: u16) -> u64 {
        let Some(highest) = self.highest_seq else {
            return u64::from(sequence);
        };

        let cycle = highest & !0xFFFF;
        let low = highest & 0xFFFF;
        let sequence = u64::from(sequence);

        if sequence > low && sequence - low > 0x8000 {
            // Belongs to the previous cycle
            (cycle | sequence).saturating_sub(0x1_0000)
        } else if low > sequence && low - sequence > 0x8000 {
            // Wrapped into the next cycle
            (cycle | sequence) + 0x1_0000
        } else {
            cycle | sequence
        }
    }

    fn drain(&mut self, force: bool) -> Vec<AudioFrame> {
        let mut frames = Vec::new();

        loop {
            let Some(next) = self.next_seq else { break };

            if let Some(packet) = self.pending.remove(&next) {
                self.next_seq = Some(next + 1);
                if let Some(frame) = self.into_frame(packet) {
                    frames.push(frame);
                }
                continue;
            }

            // Sequence gap. Wait for the missing packet until the window is
            // exceeded (or we are flushing), then abandon the gap.
            if self.pending.is_empty() || (!force && self.pending.len() <= self.max_late) {
                break;
            }
            let Some((&oldest, _)) = self.pending.iter().next() else {
                break;
            };
            tracing::debug!(expected = next, resumed = oldest, "sequence gap abandoned");
            self.next_seq = Some(oldest);
        }

        frames
    }

    fn into_frame(&mut self, packet: MediaPacket) -> Option<AudioFrame> {
        // Frames are emitted in strictly increasing timestamp order; a packet
        // that would step backwards (or repeat) is discarded.
        if let Some(last) = self.last_timestamp {
            if packet.timestamp <= last {
                self.dropped_duplicate += 1;
                return None;
            }
        }
        self.last_timestamp = Some(packet.timestamp);

        Some(AudioFrame {
            sequence: packet.sequence,
            timestamp: packet.timestamp,
            payload: packet.payload,
        })
    }
}

impl std::fmt::Debug for FrameReassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReassembler")
            .field("max_late", &self.max_late)
            .field("buffered", &self.pending.len())
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
