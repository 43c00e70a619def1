//! Gateway Event Dispatcher
//!
//! A single long-lived loop that drains the asynchronous notification stream
//! of a plugin handle and routes each event by kind. It never calls back into
//! the session's request/response protocol, so it cannot deadlock an
//! in-flight handshake step. It ends only when the event source closes.

use super::messages::GatewayEvent;
use tokio::sync::mpsc;

/// Drains `events` until the source closes, logging each notification and
/// handing it to `forward` (injectable so tests can observe the routing).
pub async fn dispatch_events<F>(mut events: mpsc::Receiver<GatewayEvent>, mut forward: F)
where
    F: FnMut(GatewayEvent) + Send,
{
    while let Some(event) = events.recv().await {
        match &event {
            GatewayEvent::SlowLink { uplink, lost } => {
                tracing::warn!(uplink, lost, "gateway reports a slow link");
            }
            GatewayEvent::Media { kind, receiving } => {
                tracing::info!(%kind, receiving, "media flow changed");
            }
            GatewayEvent::WebRtcUp => {
                tracing::info!("peer connection up on the gateway side");
            }
            GatewayEvent::Hangup { reason } => {
                tracing::info!(%reason, "gateway hung up");
            }
            GatewayEvent::Plugin { data } => {
                tracing::debug!(%data, "plugin event");
            }
        }
        forward(event);
    }

    tracing::debug!("gateway event stream closed, dispatcher done");
}

// ============================================================================
// TESTS
// ============================================================================
