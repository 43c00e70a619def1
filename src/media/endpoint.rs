//! Local Media Endpoint
//!
//! The SDP/ICE black box the call controller negotiates through. The
//! [`MediaEndpoint`] trait is the seam; [`WebRtcEndpoint`] is the production
//! implementation on top of the `webrtc` crate. Inbound audio packets are
//! surfaced as a plain packet stream so the reassembler/recorder pipeline
//! never touches WebRTC types.

use super::reassembler::MediaPacket;
use crate::config::FRAME_DURATION_MS;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("webrtc error: {0}")]
    WebRtc(String),

    #[error("invalid session description: {0}")]
    InvalidSdp(String),

    #[error("no active peer connection")]
    NoConnection,
}

// ============================================================================
// ENDPOINT TRAIT
// ============================================================================

/// Local real-time media endpoint, treated purely as an SDP/ICE black box.
#[async_trait]
pub trait MediaEndpoint: Send + Sync {
    /// Creates the local offer and installs it as the local description.
    async fn create_and_set_local_offer(&self) -> Result<String, MediaError>;

    /// The currently installed local description.
    async fn local_description(&self) -> Result<String, MediaError>;

    /// Applies the remote answer to the peer connection.
    async fn set_remote_answer(&self, sdp: &str) -> Result<(), MediaError>;

    /// Adds the outbound audio track. Samples start flowing only once the
    /// transport-level connection is up, and stop when `done` fires. Must be
    /// called before the offer is created so the track is negotiated.
    async fn add_local_track(&self, done: CancellationToken) -> Result<(), MediaError>;

    /// Takes the inbound packet stream. Yields `None` once taken; there is
    /// exactly one media ingestion flow per call.
    fn take_packets(&self) -> Option<mpsc::Receiver<MediaPacket>>;

    /// Tears the peer connection down; the packet stream closes as a result.
    async fn close(&self) -> Result<(), MediaError>;
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Default STUN configuration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

// ============================================================================
// WEBRTC ENDPOINT
// ============================================================================

/// Production [`MediaEndpoint`] over a `webrtc` peer connection with one
/// bidirectional audio section: a local outbound track plus inbound track
/// ingestion.
pub struct WebRtcEndpoint {
    peer_connection: Arc<RTCPeerConnection>,
    packets: Mutex<Option<mpsc::Receiver<MediaPacket>>>,
    packet_tx: Arc<Mutex<Option<mpsc::Sender<MediaPacket>>>>,
    /// One-shot indicator fired when the transport-level connection is up;
    /// gates when the local track begins sending.
    ice_connected: CancellationToken,
}

impl WebRtcEndpoint {
    /// Builds a peer connection with the default STUN servers.
    pub async fn new() -> Result<Self, MediaError> {
        Self::with_ice_servers(default_ice_servers()).await
    }

    /// Builds a peer connection against a caller-provided ICE configuration.
    pub async fn with_ice_servers(ice_servers: Vec<RTCIceServer>) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| MediaError::WebRtc(e.to_string()))?,
        );

        let (packet_tx, packet_rx) = mpsc::channel(256);
        let packet_tx = Arc::new(Mutex::new(Some(packet_tx)));

        let endpoint = Self {
            peer_connection,
            packets: Mutex::new(Some(packet_rx)),
            packet_tx,
            ice_connected: CancellationToken::new(),
        };
        endpoint.setup_handlers();

        Ok(endpoint)
    }

    fn setup_handlers(&self) {
        self.peer_connection.on_peer_connection_state_change(Box::new(
            |state: RTCPeerConnectionState| {
                tracing::info!(?state, "peer connection state changed");
                Box::pin(async {})
            },
        ));

        let ice_connected = self.ice_connected.clone();
        self.peer_connection.on_ice_connection_state_change(Box::new(
            move |state: RTCIceConnectionState| {
                if state == RTCIceConnectionState::Connected {
                    tracing::info!("ice connected, media can flow");
                    ice_connected.cancel();
                } else {
                    tracing::debug!(?state, "ice connection state changed");
                }
                Box::pin(async {})
            },
        ));

        let packet_tx = Arc::clone(&self.packet_tx);
        self.peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let codec = track.codec();
            if !codec.capability.mime_type.to_lowercase().contains("opus") {
                tracing::warn!(mime = %codec.capability.mime_type, "ignoring non-opus track");
                return Box::pin(async {});
            }

            let tx = match packet_tx.lock().clone() {
                Some(tx) => tx,
                None => return Box::pin(async {}),
            };

            Box::pin(async move {
                read_track(track, tx).await;
            })
        }));
    }
}

/// Opus DTX silence frame
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];

/// Keeps the outbound track clocked until the call is done. Without a local
/// capture source the bridge still expects the track to stay alive, so it is
/// fed one silence frame per frame interval.
async fn feed_track(track: Arc<TrackLocalStaticSample>, done: CancellationToken) {
    let mut interval =
        tokio::time::interval(Duration::from_millis(u64::from(FRAME_DURATION_MS)));

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = interval.tick() => {
                let sample = Sample {
                    data: Bytes::from_static(OPUS_SILENCE),
                    duration: Duration::from_millis(u64::from(FRAME_DURATION_MS)),
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    tracing::debug!(error = %e, "outbound audio track ended");
                    break;
                }
            }
        }
    }
}

/// Reads RTP from a remote track into the packet stream until the track or
/// the stream goes away.
async fn read_track(track: Arc<TrackRemote>, tx: mpsc::Sender<MediaPacket>) {
    tracing::info!(id = %track.id(), "inbound audio track started");

    loop {
        match track.read_rtp().await {
            Ok((rtp_packet, _attributes)) => {
                let packet = MediaPacket {
                    sequence: rtp_packet.header.sequence_number,
                    timestamp: rtp_packet.header.timestamp,
                    payload: rtp_packet.payload,
                };
                if tx.send(packet).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "inbound audio track ended");
                break;
            }
        }
    }
}

#[async_trait]
impl MediaEndpoint for WebRtcEndpoint {
    async fn create_and_set_local_offer(&self) -> Result<String, MediaError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn local_description(&self) -> Result<String, MediaError> {
        self.peer_connection
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or(MediaError::NoConnection)
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), MediaError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))
    }

    async fn add_local_track(&self, done: CancellationToken) -> Result<(), MediaError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "bridgecall".to_owned(),
        ));

        self.peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))?;

        let ice_connected = self.ice_connected.clone();
        tokio::spawn(async move {
            // Sending before the connection is up would be discarded anyway.
            tokio::select! {
                _ = ice_connected.cancelled() => {}
                _ = done.cancelled() => return,
            }
            feed_track(track, done).await;
        });

        Ok(())
    }

    fn take_packets(&self) -> Option<mpsc::Receiver<MediaPacket>> {
        self.packets.lock().take()
    }

    async fn close(&self) -> Result<(), MediaError> {
        // Dropping the sender half closes the ingestion stream even if the
        // gateway never delivered a track.
        self.packet_tx.lock().take();

        self.peer_connection
            .close()
            .await
            .map_err(|e| MediaError::WebRtc(e.to_string()))
    }
}

impl std::fmt::Debug for WebRtcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcEndpoint")
            .field(
                "connection_state",
                &self.peer_connection.connection_state(),
            )
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_carries_the_negotiated_audio_track() {
        let endpoint = WebRtcEndpoint::with_ice_servers(vec![]).await.unwrap();

        // The outbound track must exist before the offer for its audio
        // section to be negotiated.
        endpoint
            .add_local_track(CancellationToken::new())
            .await
            .unwrap();

        let offer = endpoint.create_and_set_local_offer().await.unwrap();
        assert!(offer.contains("m=audio"));
        assert!(offer.to_lowercase().contains("opus"));

        let local = endpoint.local_description().await.unwrap();
        assert!(local.contains("m=audio"));

        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_packet_stream_can_only_be_taken_once() {
        let endpoint = WebRtcEndpoint::with_ice_servers(vec![]).await.unwrap();

        assert!(endpoint.take_packets().is_some());
        assert!(endpoint.take_packets().is_none());

        endpoint.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_the_packet_stream() {
        let endpoint = WebRtcEndpoint::with_ice_servers(vec![]).await.unwrap();
        let mut packets = endpoint.take_packets().unwrap();

        endpoint.close().await.unwrap();

        assert!(packets.recv().await.is_none());
    }
}
