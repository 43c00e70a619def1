//! Gateway Session
//!
//! One signaling session plus one negotiated plugin handle. The handshake is
//! strictly sequential: create room, join it, then configure with the local
//! offer. Each step validates the typed reply before any field is used, and
//! the session refuses steps taken out of order.

use super::messages::*;
use super::transport::{GatewayError, SignalingTransport};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Plugin the session attaches to
pub const AUDIO_BRIDGE_PLUGIN: &str = "janus.plugin.audiobridge";

// ============================================================================
// SESSION STATE
// ============================================================================

/// Where the session is in its handshake. Steps advance this strictly
/// forward; skipping a step is a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NegotiationState {
    Attached,
    RoomCreated,
    Joined,
    Configured,
}

/// Room identity for one call: the gateway-assigned room id, plus our
/// participant id once the join completes. Read-only outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomDescriptor {
    pub room: u64,
    pub participant: Option<u64>,
}

/// Result of joining a room: our participant id and the current roster
/// (informational only).
#[derive(Debug, Clone)]
pub struct ParticipantInfo {
    pub id: u64,
    pub participants: Vec<Participant>,
}

// ============================================================================
// GATEWAY SESSION
// ============================================================================

/// Owns the request/response protocol with the gateway for one call.
pub struct GatewaySession {
    transport: Arc<dyn SignalingTransport>,
    session_id: u64,
    handle_id: u64,
    state: NegotiationState,
    room: Option<RoomDescriptor>,
}

impl GatewaySession {
    /// Creates a gateway session and attaches the audio-bridge plugin.
    pub async fn open(transport: Arc<dyn SignalingTransport>) -> Result<Self, GatewayError> {
        let session_id = transport.create_session().await?;
        let handle_id = transport.attach(session_id, AUDIO_BRIDGE_PLUGIN).await?;

        Ok(Self {
            transport,
            session_id,
            handle_id,
            state: NegotiationState::Attached,
            room: None,
        })
    }

    /// The plugin handle this session negotiated.
    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    /// Room identity, once `create_room` has run.
    pub fn room(&self) -> Option<RoomDescriptor> {
        self.room
    }

    /// The event stream for this session's plugin handle.
    pub fn subscribe_events(&self) -> mpsc::Receiver<GatewayEvent> {
        self.transport.subscribe_events(self.handle_id)
    }

    /// Step 1: asks the gateway to create a room.
    pub async fn create_room(&mut self) -> Result<RoomDescriptor, GatewayError> {
        if self.state != NegotiationState::Attached {
            return Err(GatewayError::InvalidState("create_room after handshake started"));
        }

        let reply = self
            .transport
            .plugin_request(self.session_id, self.handle_id, PluginRequest::Create, None)
            .await?;

        match reply.data {
            AudioBridgeReply::Created { room } => {
                tracing::info!(room, "room created");
                let descriptor = RoomDescriptor {
                    room,
                    participant: None,
                };
                self.room = Some(descriptor);
                self.state = NegotiationState::RoomCreated;
                Ok(descriptor)
            }
            other => Err(GatewayError::UnexpectedReply(format!(
                "create room: {other:?}"
            ))),
        }
    }

    /// Step 2: joins the room created in step 1.
    pub async fn join(&mut self) -> Result<ParticipantInfo, GatewayError> {
        if self.state != NegotiationState::RoomCreated {
            return Err(GatewayError::InvalidState("join before create_room"));
        }
        let descriptor = self
            .room
            .ok_or(GatewayError::InvalidState("join without a room"))?;

        let reply = self
            .transport
            .plugin_request(
                self.session_id,
                self.handle_id,
                PluginRequest::Join {
                    room: descriptor.room,
                },
                None,
            )
            .await?;

        match reply.data {
            AudioBridgeReply::Joined {
                room,
                id,
                participants,
            } if room == descriptor.room => {
                tracing::info!(room, participant = id, roster = participants.len(), "joined room");
                self.room = Some(RoomDescriptor {
                    room,
                    participant: Some(id),
                });
                self.state = NegotiationState::Joined;
                Ok(ParticipantInfo { id, participants })
            }
            other => Err(GatewayError::UnexpectedReply(format!("join: {other:?}"))),
        }
    }

    /// Step 3: sends the local offer and returns the remote answer SDP.
    ///
    /// A reply without an embedded answer-typed description is a fatal
    /// protocol violation.
    pub async fn configure(&mut self, local_offer: &str) -> Result<String, GatewayError> {
        if self.state != NegotiationState::Joined {
            return Err(GatewayError::InvalidState("configure before join"));
        }

        let reply = self
            .transport
            .plugin_request(
                self.session_id,
                self.handle_id,
                PluginRequest::Configure,
                Some(Jsep::offer(local_offer.to_string())),
            )
            .await?;

        if let AudioBridgeReply::Event {
            error: Some(error), ..
        } = &reply.data
        {
            return Err(GatewayError::Gateway {
                code: 0,
                reason: error.clone(),
            });
        }

        match reply.jsep {
            Some(Jsep {
                kind: SdpType::Answer,
                sdp,
            }) => {
                tracing::info!("remote answer received");
                self.state = NegotiationState::Configured;
                Ok(sdp)
            }
            _ => Err(GatewayError::MissingAnswer),
        }
    }

}

impl std::fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySession")
            .field("session_id", &self.session_id)
            .field("handle_id", &self.handle_id)
            .field("state", &self.state)
            .field("room", &self.room)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
