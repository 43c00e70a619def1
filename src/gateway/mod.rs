//! Gateway Module - Signaling with the SFU Gateway
//!
//! This module owns everything gateway-facing:
//! - the typed wire protocol (requests, replies, events)
//! - the WebSocket transport with request/response correlation
//! - the sequential room handshake (create / join / configure)
//! - the dispatcher loop for out-of-band gateway notifications

mod dispatcher;
mod messages;
mod session;
pub(crate) mod transport;

pub use dispatcher::dispatch_events;
pub use messages::{
    AudioBridgeReply, GatewayEvent, Jsep, Participant, PluginRequest, SdpType,
};
pub use session::{GatewaySession, ParticipantInfo, RoomDescriptor, AUDIO_BRIDGE_PLUGIN};
pub use transport::{GatewayError, PluginReply, SignalingTransport, WsTransport};
