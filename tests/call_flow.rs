//! End-to-end call flow tests against a scripted gateway and a scripted
//! media endpoint. The controller under test is the real one; only the two
//! I/O seams are mocked.

use async_trait::async_trait;
use bridgecall::gateway::{
    AudioBridgeReply, GatewayError, GatewayEvent, Jsep, PluginReply, PluginRequest,
    SignalingTransport,
};
use bridgecall::media::{MediaEndpoint, MediaError, MediaPacket};
use bridgecall::{CallConfig, CallController, CallError, CallEvent, CallState};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::media::io::ogg_reader::OggReader;

// ============================================================================
// SCRIPTED GATEWAY
// ============================================================================

/// Gateway that plays the canonical handshake: room 42, participant 7, and
/// (optionally) a fixed answer on configure.
struct ScriptedGateway {
    requests: Mutex<Vec<PluginRequest>>,
    answer: Option<Jsep>,
    event_tx: Mutex<Option<mpsc::Sender<GatewayEvent>>>,
    closed: AtomicBool,
}

impl ScriptedGateway {
    fn new(answer: Option<Jsep>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            answer,
            event_tx: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    async fn push_event(&self, event: GatewayEvent) {
        let tx = self.event_tx.lock().clone();
        if let Some(tx) = tx {
            tx.send(event).await.unwrap();
        }
    }
}

#[async_trait]
impl SignalingTransport for ScriptedGateway {
    async fn create_session(&self) -> Result<u64, GatewayError> {
        Ok(1)
    }

    async fn attach(&self, _session_id: u64, _plugin: &str) -> Result<u64, GatewayError> {
        Ok(2)
    }

    async fn plugin_request(
        &self,
        _session_id: u64,
        _handle_id: u64,
        body: PluginRequest,
        _jsep: Option<Jsep>,
    ) -> Result<PluginReply, GatewayError> {
        let reply = match &body {
            PluginRequest::Create => PluginReply {
                data: AudioBridgeReply::Created { room: 42 },
                jsep: None,
            },
            PluginRequest::Join { room } => PluginReply {
                data: AudioBridgeReply::Joined {
                    room: *room,
                    id: 7,
                    participants: vec![],
                },
                jsep: None,
            },
            PluginRequest::Configure => PluginReply {
                data: AudioBridgeReply::Event {
                    result: Some("ok".to_string()),
                    error: None,
                },
                jsep: self.answer.clone(),
            },
        };
        self.requests.lock().push(body);
        Ok(reply)
    }

    fn subscribe_events(&self, _handle_id: u64) -> mpsc::Receiver<GatewayEvent> {
        let (tx, rx) = mpsc::channel(16);
        *self.event_tx.lock() = Some(tx);
        rx
    }

    async fn close(&self) -> Result<(), GatewayError> {
        self.closed.store(true, Ordering::SeqCst);
        // Closing releases the event stream, which ends the dispatcher.
        self.event_tx.lock().take();
        Ok(())
    }
}

// ============================================================================
// SCRIPTED MEDIA ENDPOINT
// ============================================================================

struct ScriptedEndpoint {
    /// Names of the trait operations in invocation order
    calls: Mutex<Vec<&'static str>>,
    answers: Mutex<Vec<String>>,
    packets: Mutex<Option<mpsc::Receiver<MediaPacket>>>,
    packet_tx: Mutex<Option<mpsc::Sender<MediaPacket>>>,
    track_done: Mutex<Option<CancellationToken>>,
    closed: AtomicBool,
}

impl ScriptedEndpoint {
    /// Returns the endpoint plus the sender feeding its packet stream.
    fn new() -> (Arc<Self>, mpsc::Sender<MediaPacket>) {
        let (tx, rx) = mpsc::channel(64);
        let endpoint = Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
            packets: Mutex::new(Some(rx)),
            packet_tx: Mutex::new(Some(tx.clone())),
            track_done: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        (endpoint, tx)
    }
}

#[async_trait]
impl MediaEndpoint for ScriptedEndpoint {
    async fn create_and_set_local_offer(&self) -> Result<String, MediaError> {
        self.calls.lock().push("create_offer");
        Ok("v=0 local offer".to_string())
    }

    async fn local_description(&self) -> Result<String, MediaError> {
        Ok("v=0 local offer".to_string())
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), MediaError> {
        self.calls.lock().push("set_remote_answer");
        self.answers.lock().push(sdp.to_string());
        Ok(())
    }

    async fn add_local_track(&self, done: CancellationToken) -> Result<(), MediaError> {
        self.calls.lock().push("add_local_track");
        *self.track_done.lock() = Some(done);
        Ok(())
    }

    fn take_packets(&self) -> Option<mpsc::Receiver<MediaPacket>> {
        self.packets.lock().take()
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.closed.store(true, Ordering::SeqCst);
        self.packet_tx.lock().take();
        Ok(())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> CallConfig {
    CallConfig {
        gateway_address: "ws://127.0.0.1:8188/".to_string(),
        max_late_tolerance: 8,
        sample_rate: 48_000,
    }
}

fn fixed_answer() -> Jsep {
    Jsep::answer("v=0 remote answer".to_string())
}

fn packet(sequence: u16, timestamp: u32, payload: &str) -> MediaPacket {
    MediaPacket {
        sequence,
        timestamp,
        payload: Bytes::copy_from_slice(payload.as_bytes()),
    }
}

/// Reads every audio payload back out of a finished container file,
/// skipping the comment header the writer emits before the data pages.
fn read_payloads(path: &std::path::Path) -> Vec<Vec<u8>> {
    let file = std::fs::File::open(path).unwrap();
    let (mut reader, _header) = OggReader::new(BufReader::new(file), true).unwrap();

    let mut payloads = Vec::new();
    while let Ok((payload, _page_header)) = reader.parse_next_page() {
        if payload.starts_with(b"OpusTags") {
            continue;
        }
        payloads.push(payload.to_vec());
    }
    payloads
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_start_call_negotiates_to_active() {
    init_tracing();
    let gateway = ScriptedGateway::new(Some(fixed_answer()));
    let (endpoint, _tx) = ScriptedEndpoint::new();
    let controller = CallController::new(
        test_config(),
        Arc::clone(&endpoint) as Arc<dyn MediaEndpoint>,
        Arc::clone(&gateway) as Arc<dyn SignalingTransport>,
    );
    let mut events = controller.subscribe();

    controller.start_call(CancellationToken::new()).await.unwrap();

    assert_eq!(controller.state(), CallState::Active);

    // The remote answer was applied exactly once, and it is the gateway's.
    assert_eq!(*endpoint.answers.lock(), vec!["v=0 remote answer"]);

    // The outbound track was added before the offer was created, so its
    // audio section took part in the negotiation.
    assert_eq!(
        *endpoint.calls.lock(),
        vec!["add_local_track", "create_offer", "set_remote_answer"]
    );

    // Handshake ran in order, with the join targeting the created room.
    {
        let requests = gateway.requests.lock();
        assert_eq!(requests.len(), 3);
        assert!(matches!(requests[0], PluginRequest::Create));
        assert!(matches!(requests[1], PluginRequest::Join { room: 42 }));
        assert!(matches!(requests[2], PluginRequest::Configure));
    }

    // Observers saw the Negotiating -> Active transitions.
    assert!(matches!(
        events.recv().await.unwrap(),
        CallEvent::StateChanged(CallState::Negotiating)
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        CallEvent::StateChanged(CallState::Active)
    ));

    // Out-of-band gateway notifications reach the same observers.
    gateway.push_event(GatewayEvent::WebRtcUp).await;
    assert!(matches!(
        events.recv().await.unwrap(),
        CallEvent::Gateway(GatewayEvent::WebRtcUp)
    ));

    controller.hang_up().await.unwrap();
    assert_eq!(controller.state(), CallState::Closed);

    // Hang-up also stops the outbound track via the call-done indicator.
    assert!(endpoint.track_done.lock().as_ref().unwrap().is_cancelled());

    if let Some(path) = controller.recording_path() {
        let _ = std::fs::remove_file(path);
    }
}

#[tokio::test]
async fn test_hang_up_leaves_a_readable_recording() {
    init_tracing();
    let gateway = ScriptedGateway::new(Some(fixed_answer()));
    let (endpoint, tx) = ScriptedEndpoint::new();
    let controller = CallController::new(
        test_config(),
        Arc::clone(&endpoint) as Arc<dyn MediaEndpoint>,
        gateway as Arc<dyn SignalingTransport>,
    );

    controller.start_call(CancellationToken::new()).await.unwrap();

    // Frames arrive out of order; the container must hold them in order.
    for sequence in [0u16, 2, 1, 4, 3, 5] {
        let timestamp = (u32::from(sequence) + 1) * 960;
        tx.send(packet(sequence, timestamp, &format!("frame-{sequence}")))
            .await
            .unwrap();
    }
    drop(tx);

    controller.hang_up().await.unwrap();
    assert_eq!(controller.state(), CallState::Closed);
    assert!(endpoint.closed.load(Ordering::SeqCst));

    let path = controller.recording_path().unwrap();
    let payloads = read_payloads(&path);
    let expected: Vec<Vec<u8>> = (0..6)
        .map(|n| format!("frame-{n}").into_bytes())
        .collect();
    assert_eq!(payloads, expected);

    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_missing_answer_is_fatal() {
    init_tracing();
    let gateway = ScriptedGateway::new(None);
    let (endpoint, _tx) = ScriptedEndpoint::new();
    let controller = CallController::new(
        test_config(),
        Arc::clone(&endpoint) as Arc<dyn MediaEndpoint>,
        gateway as Arc<dyn SignalingTransport>,
    );

    let result = controller.start_call(CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(CallError::Gateway(GatewayError::MissingAnswer))
    ));

    // No answer was ever applied and the call did not survive.
    assert!(endpoint.answers.lock().is_empty());
    assert_eq!(controller.state(), CallState::Closed);

    if let Some(path) = controller.recording_path() {
        let _ = std::fs::remove_file(path);
    }
}

#[tokio::test]
async fn test_lifecycle_guards() {
    init_tracing();
    let gateway = ScriptedGateway::new(Some(fixed_answer()));
    let (endpoint, _tx) = ScriptedEndpoint::new();
    let controller = CallController::new(
        test_config(),
        endpoint as Arc<dyn MediaEndpoint>,
        gateway as Arc<dyn SignalingTransport>,
    );

    // Hanging up without a call is rejected.
    assert!(matches!(
        controller.hang_up().await,
        Err(CallError::NoActiveCall)
    ));

    controller.start_call(CancellationToken::new()).await.unwrap();

    // A second start while a call is in progress is rejected.
    assert!(matches!(
        controller.start_call(CancellationToken::new()).await,
        Err(CallError::AlreadyInCall)
    ));

    controller.hang_up().await.unwrap();

    // The controller stays closed; it is not reusable for another call.
    assert!(matches!(
        controller.hang_up().await,
        Err(CallError::NoActiveCall)
    ));

    if let Some(path) = controller.recording_path() {
        let _ = std::fs::remove_file(path);
    }
}
