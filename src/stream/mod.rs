//! Caster streaming modules.
//!
//! - `client`: HTTP streaming transport, session worker, and reconnect
//!   handling.
//! - `frame`: RTCM3 frame extraction and CRC24Q validation.
//! - `sink`: delivery interface for decoded frames.

/// Caster connection and session worker.
pub mod client;
/// RTCM3 frame parser and checksum.
pub mod frame;
/// Frame delivery interface.
pub mod sink;
