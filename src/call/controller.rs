//! Call Controller
//!
//! Orchestrates one call: negotiates the session over the gateway, applies
//! the remote answer to the local media endpoint, and runs the event
//! dispatcher and the packet-to-container pipeline concurrently with the
//! signaling handshake. Owns the call's lifecycle state; nothing else
//! mutates it.

use crate::config::CallConfig;
use crate::error::CallError;
use crate::gateway::{
    dispatch_events, GatewayEvent, GatewaySession, SignalingTransport, WsTransport,
};
use crate::media::{
    CallRecorder, FrameReassembler, MediaEndpoint, MediaError, MediaPacket, RecorderError,
    WebRtcEndpoint,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// CALL STATE
// ============================================================================

/// Lifecycle of one call. Mutated only by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No call
    Idle,
    /// Handshaking with the gateway
    Negotiating,
    /// Answer applied; media is (optimistically) flowing
    Active,
    /// Hang-up in progress
    HangingUp,
    /// Torn down
    Closed,
}

/// Events observable by callers of the controller.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged(CallState),
    Gateway(GatewayEvent),
}

// ============================================================================
// CALL CONTROLLER
// ============================================================================

/// One controller per call; multiple concurrent calls are multiple
/// independent controllers.
pub struct CallController {
    config: CallConfig,
    endpoint: Arc<dyn MediaEndpoint>,
    transport: Arc<dyn SignalingTransport>,
    state: Arc<Mutex<CallState>>,
    event_tx: broadcast::Sender<CallEvent>,
    session: Mutex<Option<GatewaySession>>,
    pipeline: Mutex<Option<JoinHandle<Result<u64, RecorderError>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    done: Mutex<Option<CancellationToken>>,
    recording_path: Mutex<Option<PathBuf>>,
}

impl CallController {
    /// Builds a controller over caller-provided collaborators.
    pub fn new(
        config: CallConfig,
        endpoint: Arc<dyn MediaEndpoint>,
        transport: Arc<dyn SignalingTransport>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config,
            endpoint,
            transport,
            state: Arc::new(Mutex::new(CallState::Idle)),
            event_tx,
            session: Mutex::new(None),
            pipeline: Mutex::new(None),
            dispatcher: Mutex::new(None),
            done: Mutex::new(None),
            recording_path: Mutex::new(None),
        }
    }

    /// Builds a controller with the production collaborators: a WebRTC
    /// endpoint and a WebSocket connection to the configured gateway.
    pub async fn connect(config: CallConfig) -> Result<Self, CallError> {
        let endpoint = Arc::new(WebRtcEndpoint::new().await?);
        let transport = Arc::new(WsTransport::connect(&config.gateway_address).await?);
        Ok(Self::new(config, endpoint, transport))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    /// Observer stream for state changes and gateway events.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Path of the container file, once a call has started.
    pub fn recording_path(&self) -> Option<PathBuf> {
        self.recording_path.lock().clone()
    }

    /// Starts the call: offer, gateway handshake, answer, pipelines.
    ///
    /// The `done` token is the call-done indicator: cancelling it stops the
    /// media pipeline. Any failure here is fatal to the whole call; partially
    /// completed gateway steps (such as an already-created room) are
    /// abandoned, not rolled back.
    pub async fn start_call(&self, done: CancellationToken) -> Result<(), CallError> {
        {
            let mut state = self.state.lock();
            if *state != CallState::Idle {
                return Err(CallError::AlreadyInCall);
            }
            *state = CallState::Negotiating;
        }
        let _ = self
            .event_tx
            .send(CallEvent::StateChanged(CallState::Negotiating));
        *self.done.lock() = Some(done.clone());

        tracing::info!("starting call");
        match self.negotiate(&done).await {
            Ok(()) => {
                self.set_state(CallState::Active);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "call start failed");
                done.cancel();
                self.set_state(CallState::Closed);
                Err(e)
            }
        }
    }

    /// Ends the call. Ordering matters: stop inbound packets first, then let
    /// the pipeline close the container, then release the dispatcher's event
    /// source.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        {
            let mut state = self.state.lock();
            if *state != CallState::Active {
                return Err(CallError::NoActiveCall);
            }
            *state = CallState::HangingUp;
        }
        let _ = self
            .event_tx
            .send(CallEvent::StateChanged(CallState::HangingUp));

        tracing::info!("hanging up");

        // 1. Stop inbound packets.
        self.endpoint.close().await?;

        // 2. Drain and close the container. A recording failure must not
        // short-circuit teardown, so it is only propagated at the end.
        if let Some(token) = self.done.lock().take() {
            token.cancel();
        }
        let mut recording = Ok(());
        let pipeline = self.pipeline.lock().take();
        if let Some(pipeline) = pipeline {
            match pipeline.await {
                Ok(Ok(frames)) => tracing::info!(frames, "recording finished"),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "recording failed");
                    recording = Err(CallError::from(e));
                }
                Err(e) => tracing::warn!(error = %e, "pipeline task failed"),
            }
        }

        // 3. Release the dispatcher's event source.
        if let Some(session) = self.session.lock().take() {
            drop(session);
        }
        let dispatcher = self.dispatcher.lock().take();
        match self.transport.close().await {
            Ok(()) => {
                if let Some(dispatcher) = dispatcher {
                    let _ = dispatcher.await;
                }
            }
            Err(e) => {
                // The event source may never close now; do not wait on it.
                if let Some(dispatcher) = dispatcher {
                    dispatcher.abort();
                }
                self.set_state(CallState::Closed);
                return recording.and(Err(e.into()));
            }
        }

        self.set_state(CallState::Closed);
        recording
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// The Idle -> Negotiating leg: local offer, gateway handshake, remote
    /// answer, with the dispatcher and the media pipeline started
    /// concurrently with the signaling steps.
    async fn negotiate(&self, done: &CancellationToken) -> Result<(), CallError> {
        // The outbound track goes in before the offer so it is negotiated;
        // it starts sending only once the connection indicator fires.
        self.endpoint.add_local_track(done.child_token()).await?;

        let offer = self.endpoint.create_and_set_local_offer().await?;
        tracing::debug!(bytes = offer.len(), "local offer created");

        let mut session = GatewaySession::open(Arc::clone(&self.transport)).await?;

        // Concurrent flows: gateway notifications and media ingestion run
        // alongside the sequential handshake below.
        self.spawn_dispatcher(session.subscribe_events());
        self.spawn_pipeline(done.child_token())?;

        session.create_room().await?;
        let info = session.join().await?;
        tracing::info!(participant = info.id, "joined as participant");

        let local = self.endpoint.local_description().await?;
        let answer = session.configure(&local).await?;
        self.endpoint.set_remote_answer(&answer).await?;

        *self.session.lock() = Some(session);
        Ok(())
    }

    fn spawn_dispatcher(&self, events: mpsc::Receiver<GatewayEvent>) {
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(dispatch_events(events, move |event| {
            let _ = event_tx.send(CallEvent::Gateway(event));
        }));
        *self.dispatcher.lock() = Some(handle);
    }

    /// Wires inbound packets through the reassembler into a fresh container
    /// file in the process scratch directory.
    fn spawn_pipeline(&self, done: CancellationToken) -> Result<(), CallError> {
        let packets = self
            .endpoint
            .take_packets()
            .ok_or(CallError::Media(MediaError::NoConnection))?;

        let (file, path) = tempfile::Builder::new()
            .prefix("bridgecall-")
            .suffix(".ogg")
            .tempfile()
            .map_err(RecorderError::Io)?
            .keep()
            .map_err(|e| RecorderError::Io(e.error))?;

        let recorder = CallRecorder::with_writer(file, self.config.sample_rate)?;
        let reassembler = FrameReassembler::new(self.config.max_late_tolerance);

        tracing::info!(path = %path.display(), "recording to container file");
        *self.recording_path.lock() = Some(path);

        let handle = tokio::spawn(run_pipeline(packets, reassembler, recorder, done));
        *self.pipeline.lock() = Some(handle);
        Ok(())
    }

    fn set_state(&self, new_state: CallState) {
        *self.state.lock() = new_state;
        let _ = self.event_tx.send(CallEvent::StateChanged(new_state));
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("state", &self.state())
            .field("recording_path", &self.recording_path())
            .finish()
    }
}

// ============================================================================
// MEDIA PIPELINE
// ============================================================================

/// The media ingestion flow: packets in, ordered frames out, frames into the
/// container. Ends when the packet source closes or the done indicator
/// fires, then flushes the reassembler tail and closes the container.
async fn run_pipeline<W>(
    mut packets: mpsc::Receiver<MediaPacket>,
    mut reassembler: FrameReassembler,
    mut recorder: CallRecorder<W>,
    done: CancellationToken,
) -> Result<u64, RecorderError>
where
    W: std::io::Write + std::io::Seek + Send,
{
    loop {
        // Biased so already-delivered packets are drained before the done
        // indicator is honored; cancellation never clips an in-flight write.
        tokio::select! {
            biased;
            packet = packets.recv() => match packet {
                Some(packet) => {
                    for frame in reassembler.push(packet) {
                        recorder.write(&frame)?;
                    }
                }
                None => break,
            },
            _ = done.cancelled() => break,
        }
    }

    for frame in reassembler.flush() {
        recorder.write(&frame)?;
    }
    recorder.close()?;

    if reassembler.dropped_malformed() > 0 {
        tracing::warn!(
            dropped = reassembler.dropped_malformed(),
            "malformed packets dropped during call"
        );
    }

    Ok(recorder.frames_written())
}

// ============================================================================
// TESTS
// ============================================================================
