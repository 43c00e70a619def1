//! Call Module - Lifecycle Orchestration
//!
//! The call controller drives the lifecycle state machine and wires the
//! gateway session, the event dispatcher and the media pipeline together.

mod controller;

pub use controller::{CallController, CallEvent, CallState};
