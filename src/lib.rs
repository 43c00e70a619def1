//! bridgecall - Audio-Bridge Call Sessions
//!
//! A media-call session manager that bridges a local real-time peer
//! connection to a remote SFU signaling gateway, negotiates an audio-only
//! session via an offer/answer exchange, and concurrently captures the
//! inbound audio stream into a replayable container file.
//!
//! Three independently clocked flows run per call:
//! - the sequential signaling handshake (create room, join, configure)
//! - the dispatcher draining out-of-band gateway notifications
//! - the media pipeline reassembling packets and writing the container
//!
//! They share no mutable state; coordination happens through one-shot
//! completion signals and channel closure.
//!
//! ```no_run
//! use bridgecall::{CallConfig, CallController};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), bridgecall::CallError> {
//! let config = CallConfig {
//!     gateway_address: "ws://127.0.0.1:8188/".to_string(),
//!     ..CallConfig::default()
//! };
//!
//! let controller = CallController::connect(config).await?;
//! controller.start_call(CancellationToken::new()).await?;
//! // ... call is active, inbound audio is being captured ...
//! controller.hang_up().await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod config;
pub mod error;
pub mod gateway;
pub mod media;

pub use call::{CallController, CallEvent, CallState};
pub use config::CallConfig;
pub use error::CallError;
