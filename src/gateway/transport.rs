//! Gateway Transport
//!
//! WebSocket connection to the signaling gateway:
//! - outbound requests through an mpsc queue and a dedicated write task
//! - request/response correlation via per-transaction oneshot channels
//! - unsolicited notifications routed to per-handle event streams
//!
//! The [`SignalingTransport`] trait is the seam the rest of the crate talks
//! to, so sessions and the call controller can be tested against a mock
//! gateway.

use super::messages::*;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("gateway connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected to the gateway")]
    NotConnected,

    #[error("failed to send request: {0}")]
    SendFailed(String),

    #[error("gateway error {code}: {reason}")]
    Gateway { code: i64, reason: String },

    #[error("unexpected gateway reply: {0}")]
    UnexpectedReply(String),

    #[error("configure reply carries no answer description")]
    MissingAnswer,

    #[error("handshake step out of order: {0}")]
    InvalidState(&'static str),
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Reply to a plugin request: the typed plugin payload plus the optional
/// embedded session description.
#[derive(Debug, Clone)]
pub struct PluginReply {
    pub data: AudioBridgeReply,
    pub jsep: Option<Jsep>,
}

/// Request/response and event-stream access to the signaling gateway,
/// keyed by session and plugin handle.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Creates a gateway session and returns its numeric id.
    async fn create_session(&self) -> Result<u64, GatewayError>;

    /// Attaches a plugin to a session and returns the handle id.
    async fn attach(&self, session_id: u64, plugin: &str) -> Result<u64, GatewayError>;

    /// Sends one plugin request and blocks until its matching reply arrives.
    async fn plugin_request(
        &self,
        session_id: u64,
        handle_id: u64,
        body: PluginRequest,
        jsep: Option<Jsep>,
    ) -> Result<PluginReply, GatewayError>;

    /// Returns the stream of unsolicited gateway events for a handle.
    fn subscribe_events(&self, handle_id: u64) -> mpsc::Receiver<GatewayEvent>;

    /// Destroys known sessions (best effort) and releases all event streams.
    async fn close(&self) -> Result<(), GatewayError>;
}

// ============================================================================
// SHARED ROUTING STATE
// ============================================================================

/// State shared between the transport handle and its socket read task.
struct Shared {
    /// In-flight transactions awaiting their reply
    pending: Mutex<HashMap<String, oneshot::Sender<Result<GatewayMessage, GatewayError>>>>,
    /// Per-handle event streams
    events: Mutex<HashMap<u64, mpsc::Sender<GatewayEvent>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Routes one inbound gateway message: replies complete their pending
    /// transaction, notifications go to the owning handle's event stream.
    fn route(&self, msg: GatewayMessage) {
        // Success and plugin-event replies complete the request waiting on
        // their transaction; anything else falls through as a notification.
        let transaction = match &msg {
            GatewayMessage::Success { transaction, .. }
            | GatewayMessage::Event { transaction, .. } => transaction.clone(),
            _ => None,
        };
        if let Some(transaction) = transaction {
            if self.pending.lock().contains_key(&transaction) {
                self.complete(&transaction, Ok(msg));
                return;
            }
        }

        match msg {
            // The real reply follows under the same transaction; keep waiting.
            GatewayMessage::Ack { transaction } => {
                tracing::trace!(%transaction, "request acknowledged");
            }

            GatewayMessage::Error {
                transaction: Some(transaction),
                error,
            } => {
                self.complete(
                    &transaction,
                    Err(GatewayError::Gateway {
                        code: error.code,
                        reason: error.reason,
                    }),
                );
            }

            GatewayMessage::Error { error, .. } => {
                tracing::error!(code = error.code, reason = %error.reason, "gateway error");
            }

            GatewayMessage::Success { .. } => {
                tracing::trace!("success reply for untracked transaction dropped");
            }

            GatewayMessage::Event {
                sender: Some(handle_id),
                plugindata: Some(plugindata),
                ..
            } => {
                self.notify(
                    handle_id,
                    GatewayEvent::Plugin {
                        data: plugindata.data,
                    },
                );
            }

            GatewayMessage::Event { .. } => {}

            GatewayMessage::Webrtcup { sender } => self.notify(sender, GatewayEvent::WebRtcUp),

            GatewayMessage::Media {
                sender,
                kind,
                receiving,
            } => self.notify(sender, GatewayEvent::Media { kind, receiving }),

            GatewayMessage::Slowlink {
                sender,
                uplink,
                lost,
            } => self.notify(
                sender,
                GatewayEvent::SlowLink {
                    uplink: uplink.unwrap_or(false),
                    lost: lost.unwrap_or(0),
                },
            ),

            GatewayMessage::Hangup { sender, reason } => self.notify(
                sender,
                GatewayEvent::Hangup {
                    reason: reason.unwrap_or_default(),
                },
            ),

            GatewayMessage::Timeout { session_id } => {
                tracing::warn!(session_id, "gateway session timed out");
            }
        }
    }

    fn complete(&self, transaction: &str, reply: Result<GatewayMessage, GatewayError>) {
        if let Some(tx) = self.pending.lock().remove(transaction) {
            let _ = tx.send(reply);
        } else {
            tracing::trace!(%transaction, "reply for unknown transaction dropped");
        }
    }

    fn notify(&self, handle_id: u64, event: GatewayEvent) {
        if let Some(tx) = self.events.lock().get(&handle_id) {
            // Never block the socket read loop on a slow consumer.
            if tx.try_send(event).is_err() {
                tracing::warn!(handle_id, "event stream full or gone, notification dropped");
            }
        }
    }

    /// Fails every in-flight request and closes every event stream.
    fn disconnect(&self) {
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err(GatewayError::NotConnected));
        }
        self.events.lock().clear();
    }
}

// ============================================================================
// WEBSOCKET TRANSPORT
// ============================================================================

/// WebSocket implementation of [`SignalingTransport`].
pub struct WsTransport {
    out: mpsc::Sender<String>,
    shared: Arc<Shared>,
    sessions: Mutex<Vec<u64>>,
    closed: Arc<AtomicBool>,
}

impl WsTransport {
    /// Connects to the gateway and spawns the socket read/write tasks.
    pub async fn connect(address: &str) -> Result<Self, GatewayError> {
        let url =
            Url::parse(address).map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;

        tracing::info!(%url, "connecting to signaling gateway");

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (out, mut out_rx) = mpsc::channel::<String>(100);

        let shared = Arc::new(Shared::new());
        let closed = Arc::new(AtomicBool::new(false));

        // Read task: parse and route everything the gateway sends.
        let shared_clone = Arc::clone(&shared);
        let closed_clone = Arc::clone(&closed);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<GatewayMessage>(&text)
                    {
                        Ok(msg) => shared_clone.route(msg),
                        Err(e) => {
                            tracing::warn!(error = %e, "unparseable gateway message dropped");
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("gateway closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "gateway socket error");
                        break;
                    }
                    _ => {}
                }
            }

            closed_clone.store(true, Ordering::SeqCst);
            shared_clone.disconnect();
        });

        // Write task: drain the outbound queue into the socket.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!(error = %e, "failed to send gateway message");
                    break;
                }
            }
        });

        Ok(Self {
            out,
            shared,
            sessions: Mutex::new(Vec::new()),
            closed,
        })
    }

    /// Sends one request and waits for the reply matching its transaction.
    async fn request(&self, request: GatewayRequest) -> Result<GatewayMessage, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::NotConnected);
        }

        let transaction = match &request {
            GatewayRequest::Create { transaction }
            | GatewayRequest::Attach { transaction, .. }
            | GatewayRequest::Message { transaction, .. }
            | GatewayRequest::Keepalive { transaction, .. }
            | GatewayRequest::Destroy { transaction, .. } => transaction.clone(),
        };

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(transaction.clone(), tx);

        let json =
            serde_json::to_string(&request).map_err(|e| GatewayError::SendFailed(e.to_string()))?;

        if let Err(e) = self.out.send(json).await {
            self.shared.pending.lock().remove(&transaction);
            return Err(GatewayError::SendFailed(e.to_string()));
        }

        rx.await.map_err(|_| GatewayError::NotConnected)?
    }

    /// Keeps a gateway session alive until the transport closes.
    fn spawn_keepalive(&self, session_id: u64) {
        let out = self.out.clone();
        let closed = Arc::clone(&self.closed);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
            interval.tick().await;
            loop {
                interval.tick().await;
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                let keepalive = GatewayRequest::Keepalive {
                    session_id,
                    transaction: Uuid::new_v4().to_string(),
                };
                let json = match serde_json::to_string(&keepalive) {
                    Ok(json) => json,
                    Err(_) => break,
                };
                if out.send(json).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl SignalingTransport for WsTransport {
    async fn create_session(&self) -> Result<u64, GatewayError> {
        let reply = self
            .request(GatewayRequest::Create {
                transaction: Uuid::new_v4().to_string(),
            })
            .await?;

        match reply {
            GatewayMessage::Success {
                data: Some(CreatedId { id }),
                ..
            } => {
                tracing::info!(session_id = id, "gateway session created");
                self.sessions.lock().push(id);
                self.spawn_keepalive(id);
                Ok(id)
            }
            other => Err(GatewayError::UnexpectedReply(format!(
                "create: {other:?}"
            ))),
        }
    }

    async fn attach(&self, session_id: u64, plugin: &str) -> Result<u64, GatewayError> {
        let reply = self
            .request(GatewayRequest::Attach {
                session_id,
                plugin: plugin.to_string(),
                transaction: Uuid::new_v4().to_string(),
            })
            .await?;

        match reply {
            GatewayMessage::Success {
                data: Some(CreatedId { id }),
                ..
            } => {
                tracing::info!(handle_id = id, plugin, "plugin handle attached");
                Ok(id)
            }
            other => Err(GatewayError::UnexpectedReply(format!(
                "attach: {other:?}"
            ))),
        }
    }

    async fn plugin_request(
        &self,
        session_id: u64,
        handle_id: u64,
        body: PluginRequest,
        jsep: Option<Jsep>,
    ) -> Result<PluginReply, GatewayError> {
        let reply = self
            .request(GatewayRequest::Message {
                session_id,
                handle_id,
                transaction: Uuid::new_v4().to_string(),
                body,
                jsep,
            })
            .await?;

        let (plugindata, jsep) = match reply {
            GatewayMessage::Success {
                plugindata: Some(plugindata),
                jsep,
                ..
            }
            | GatewayMessage::Event {
                plugindata: Some(plugindata),
                jsep,
                ..
            } => (plugindata, jsep),
            other => {
                return Err(GatewayError::UnexpectedReply(format!(
                    "plugin request: {other:?}"
                )))
            }
        };

        let data: AudioBridgeReply = serde_json::from_value(plugindata.data)
            .map_err(|e| GatewayError::UnexpectedReply(e.to_string()))?;

        Ok(PluginReply { data, jsep })
    }

    fn subscribe_events(&self, handle_id: u64) -> mpsc::Receiver<GatewayEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.shared.events.lock().insert(handle_id, tx);
        rx
    }

    async fn close(&self) -> Result<(), GatewayError> {
        let sessions: Vec<u64> = self.sessions.lock().drain(..).collect();
        for session_id in sessions {
            // Best effort; the gateway reaps dead sessions on its own anyway.
            let _ = self
                .request(GatewayRequest::Destroy {
                    session_id,
                    transaction: Uuid::new_v4().to_string(),
                })
                .await;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.shared.disconnect();
        Ok(())
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("sessions", &*self.sessions.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_reply(
        shared: &Shared,
        transaction: &str,
    ) -> oneshot::Receiver<Result<GatewayMessage, GatewayError>> {
        let (tx, rx) = oneshot::channel();
        shared
            .pending
            .lock()
            .insert(transaction.to_string(), tx);
        rx
    }

    #[test]
    fn test_success_completes_pending_transaction() {
        let shared = Shared::new();
        let mut rx = pending_reply(&shared, "t1");

        shared.route(GatewayMessage::Success {
            transaction: Some("t1".to_string()),
            data: Some(CreatedId { id: 99 }),
            plugindata: None,
            jsep: None,
        });

        match rx.try_recv().unwrap().unwrap() {
            GatewayMessage::Success { data, .. } => assert_eq!(data.unwrap().id, 99),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(shared.pending.lock().is_empty());
    }

    #[test]
    fn test_ack_leaves_transaction_pending() {
        let shared = Shared::new();
        let mut rx = pending_reply(&shared, "t1");

        shared.route(GatewayMessage::Ack {
            transaction: "t1".to_string(),
        });

        assert!(rx.try_recv().is_err());
        assert!(shared.pending.lock().contains_key("t1"));
    }

    #[test]
    fn test_gateway_error_fails_pending_transaction() {
        let shared = Shared::new();
        let mut rx = pending_reply(&shared, "t1");

        shared.route(GatewayMessage::Error {
            transaction: Some("t1".to_string()),
            error: ErrorInfo {
                code: 458,
                reason: "no such session".to_string(),
            },
        });

        match rx.try_recv().unwrap() {
            Err(GatewayError::Gateway { code, .. }) => assert_eq!(code, 458),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_notifications_route_to_handle_stream() {
        let shared = Shared::new();
        let (tx, mut rx) = mpsc::channel(8);
        shared.events.lock().insert(7, tx);

        shared.route(GatewayMessage::Webrtcup { sender: 7 });
        shared.route(GatewayMessage::Media {
            sender: 7,
            kind: "audio".to_string(),
            receiving: true,
        });
        // Different handle: must not show up on our stream.
        shared.route(GatewayMessage::Webrtcup { sender: 8 });

        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::WebRtcUp));
        assert!(matches!(
            rx.try_recv().unwrap(),
            GatewayEvent::Media { receiving: true, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_without_pending_transaction_is_notification() {
        let shared = Shared::new();
        let (tx, mut rx) = mpsc::channel(8);
        shared.events.lock().insert(7, tx);

        shared.route(GatewayMessage::Event {
            transaction: None,
            sender: Some(7),
            plugindata: Some(PluginData {
                plugin: "janus.plugin.audiobridge".to_string(),
                data: serde_json::json!({"audiobridge": "talking", "id": 3}),
            }),
            jsep: None,
        });

        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::Plugin { .. }));
    }

    #[test]
    fn test_disconnect_fails_pending_and_closes_streams() {
        let shared = Shared::new();
        let mut reply_rx = pending_reply(&shared, "t1");
        let (tx, mut event_rx) = mpsc::channel(8);
        shared.events.lock().insert(7, tx);

        shared.disconnect();

        assert!(matches!(
            reply_rx.try_recv().unwrap(),
            Err(GatewayError::NotConnected)
        ));
        assert!(matches!(
            event_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
