//! Top-Level Error Type
//!
//! Each module defines its own error enum; `CallError` aggregates them so the
//! call controller can decide abort-vs-continue policy in one place instead
//! of every component terminating on its own.

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::media::{MediaError, RecorderError};

#[derive(Error, Debug)]
pub enum CallError {
    #[error("gateway failure: {0}")]
    Gateway(#[from] GatewayError),

    #[error("recorder failure: {0}")]
    Recorder(#[from] RecorderError),

    #[error("media endpoint failure: {0}")]
    Media(#[from] MediaError),

    #[error("a call is already in progress")]
    AlreadyInCall,

    #[error("no active call")]
    NoActiveCall,
}
