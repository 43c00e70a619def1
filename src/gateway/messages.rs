//! Message Types for the Gateway Signaling Protocol
//!
//! Every request and reply exchanged with the SFU gateway is a typed,
//! serde-tagged structure. Payload fields are validated when a message is
//! deserialized, so nothing downstream ever pokes into untyped JSON maps.

use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT -> GATEWAY REQUESTS
// ============================================================================

/// Top-level envelope sent to the gateway. Tagged by the `janus` field,
/// mirroring the gateway's own wire format.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum GatewayRequest {
    /// Create a new gateway session
    Create { transaction: String },

    /// Attach a plugin handle to an existing session
    Attach {
        session_id: u64,
        plugin: String,
        transaction: String,
    },

    /// Send a plugin request (optionally carrying a negotiation payload)
    Message {
        session_id: u64,
        handle_id: u64,
        transaction: String,
        body: PluginRequest,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<Jsep>,
    },

    /// Keep the session alive
    Keepalive {
        session_id: u64,
        transaction: String,
    },

    /// Tear the session down
    Destroy {
        session_id: u64,
        transaction: String,
    },
}

/// Audio-bridge plugin request bodies, one variant per handshake step.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "request", rename_all = "lowercase")]
pub enum PluginRequest {
    /// Ask the bridge to create a room; the gateway assigns the room id
    Create,

    /// Join a previously created room
    Join { room: u64 },

    /// Exchange session descriptions for the joined room
    Configure,
}

// ============================================================================
// GATEWAY -> CLIENT MESSAGES
// ============================================================================

/// Everything the gateway can send us, tagged by its `janus` field. Replies
/// carry a `transaction` echoing the request; unsolicited notifications
/// carry only the `sender` handle id.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum GatewayMessage {
    /// Synchronous success reply
    Success {
        transaction: Option<String>,
        #[serde(default)]
        data: Option<CreatedId>,
        #[serde(default)]
        plugindata: Option<PluginData>,
        #[serde(default)]
        jsep: Option<Jsep>,
    },

    /// Acknowledgement that an asynchronous request was accepted; the real
    /// reply follows as an `Event` with the same transaction
    Ack { transaction: String },

    /// Plugin reply or unsolicited plugin notification
    Event {
        #[serde(default)]
        transaction: Option<String>,
        #[serde(default)]
        sender: Option<u64>,
        #[serde(default)]
        plugindata: Option<PluginData>,
        #[serde(default)]
        jsep: Option<Jsep>,
    },

    /// Gateway-reported failure
    Error {
        #[serde(default)]
        transaction: Option<String>,
        error: ErrorInfo,
    },

    /// The peer connection for a handle is up
    Webrtcup { sender: u64 },

    /// Media started or stopped flowing for a handle
    Media {
        sender: u64,
        #[serde(rename = "type")]
        kind: String,
        receiving: bool,
    },

    /// The gateway noticed packet loss on the link
    Slowlink {
        sender: u64,
        #[serde(default)]
        uplink: Option<bool>,
        #[serde(default)]
        lost: Option<u64>,
    },

    /// The gateway hung up the handle's peer connection
    Hangup {
        sender: u64,
        #[serde(default)]
        reason: Option<String>,
    },

    /// The session timed out on the gateway side
    Timeout { session_id: u64 },
}

/// Numeric id assigned by the gateway on `create`/`attach`
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CreatedId {
    pub id: u64,
}

/// Plugin-scoped portion of a reply
#[derive(Debug, Clone, Deserialize)]
pub struct PluginData {
    pub plugin: String,
    pub data: serde_json::Value,
}

/// Gateway error body
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    pub code: i64,
    pub reason: String,
}

// ============================================================================
// AUDIO-BRIDGE PLUGIN REPLIES
// ============================================================================

/// Typed audio-bridge reply payloads, tagged by the plugin's `audiobridge`
/// field. Parsed out of [`PluginData::data`] at the session boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "audiobridge", rename_all = "lowercase")]
pub enum AudioBridgeReply {
    /// Room created; carries the gateway-assigned room id
    Created { room: u64 },

    /// Joined a room; carries our participant id and the current roster
    Joined {
        room: u64,
        id: u64,
        #[serde(default)]
        participants: Vec<Participant>,
    },

    /// Plugin event reply (configure results arrive as these)
    Event {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// One participant in the joined room (informational only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: u64,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default)]
    pub muted: Option<bool>,
}

// ============================================================================
// SESSION DESCRIPTIONS
// ============================================================================

/// An embedded session-description payload (JSEP)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl Jsep {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

// ============================================================================
// OUT-OF-BAND GATEWAY EVENTS
// ============================================================================

/// An asynchronous, unsolicited notification from the gateway, routed to the
/// event dispatcher. Unordered relative to request/reply exchanges.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// The gateway noticed a lossy link
    SlowLink { uplink: bool, lost: u64 },

    /// Media started or stopped flowing
    Media { kind: String, receiving: bool },

    /// The peer connection came up on the gateway side
    WebRtcUp,

    /// The gateway hung up the peer connection
    Hangup { reason: String },

    /// Generic plugin notification
    Plugin { data: serde_json::Value },
}

// ============================================================================
// TESTS
// ============================================================================
