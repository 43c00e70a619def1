//! Media Module - Inbound Audio Pipeline
//!
//! This module owns the media side of a call:
//! - the local endpoint (SDP/ICE black box) producing inbound packets
//! - the frame reassembler turning unordered packets into ordered frames
//! - the recorder persisting frames into a replayable container file

mod endpoint;
mod reassembler;
mod recorder;

pub use endpoint::{default_ice_servers, MediaEndpoint, MediaError, WebRtcEndpoint};
pub use reassembler::{AudioFrame, FrameReassembler, MediaPacket};
pub use recorder::{CallRecorder, RecorderError};
