//! Client for streaming RTCM3 correction data from an NTRIP caster.
//!
//! The crate is organized by concern:
//! - `stream`: caster connection, RTCM3 framing, and the message sink
//!   interface decoded frames are delivered through.
//! - `retry`: reconnect policy and backoff state used by the stream
//!   worker.

/// Reconnect policy and backoff state.
pub mod retry;
/// Caster connection, RTCM3 frame parsing, and message sink interface.
pub mod stream;
