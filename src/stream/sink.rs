//! Delivery interface for decoded RTCM3 frames.
//!
//! The stream worker calls the sink synchronously for every frame in
//! arrival order, so a slow sink applies backpressure to ingestion. Sink
//! failures are logged by the worker and never terminate the session.

use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::stream::frame::RtcmFrame;

/// Error returned by a sink that could not accept a frame.
#[derive(Debug, Error)]
#[error("sink rejected frame: {0}")]
pub struct SinkError(pub String);

/// Consumer of decoded correction frames.
pub trait MessageSink: Send {
    /// Accepts one complete, CRC-valid frame with its capture timestamp.
    fn deliver(&mut self, frame: RtcmFrame, received_at: SystemTime) -> Result<(), SinkError>;
}

impl<F> MessageSink for F
where
    F: FnMut(RtcmFrame, SystemTime) -> Result<(), SinkError> + Send,
{
    fn deliver(&mut self, frame: RtcmFrame, received_at: SystemTime) -> Result<(), SinkError> {
        self(frame, received_at)
    }
}

/// Sink that hands frames off through an unbounded channel.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(RtcmFrame, SystemTime)>,
}

impl ChannelSink {
    /// Creates the sink together with the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(RtcmFrame, SystemTime)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn deliver(&mut self, frame: RtcmFrame, received_at: SystemTime) -> Result<(), SinkError> {
        self.tx
            .send((frame, received_at))
            .map_err(|_| SinkError("frame channel closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::{ChannelSink, MessageSink, SinkError};
    use crate::stream::frame::{crc24q, FrameParser, RtcmFrame, RTCM3_PREAMBLE};

    fn sample_frame() -> RtcmFrame {
        let mut bytes = vec![RTCM3_PREAMBLE, 0x00, 0x02, 0x3E, 0x80];
        let crc = crc24q(&bytes);
        bytes.extend_from_slice(&[(crc >> 16) as u8, (crc >> 8) as u8, crc as u8]);

        let mut parser = FrameParser::new();
        parser.push(&bytes);
        parser.next_frame().expect("valid frame")
    }

    #[test]
    fn channel_sink_hands_off_frames_in_order() {
        let (mut sink, mut rx) = ChannelSink::new();

        let frame = sample_frame();
        sink.deliver(frame.clone(), SystemTime::now()).expect("deliver");
        sink.deliver(frame.clone(), SystemTime::now()).expect("deliver");

        let (first, _) = rx.try_recv().expect("first frame");
        let (second, _) = rx.try_recv().expect("second frame");
        assert_eq!(first, frame);
        assert_eq!(second, frame);
    }

    #[test]
    fn channel_sink_reports_closed_receiver() {
        let (mut sink, rx) = ChannelSink::new();
        drop(rx);

        let err = sink
            .deliver(sample_frame(), SystemTime::now())
            .expect_err("closed channel");
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn closures_can_act_as_sinks() {
        let mut seen = 0usize;
        {
            let mut sink = |_frame: RtcmFrame, _at: SystemTime| -> Result<(), SinkError> {
                seen += 1;
                Ok(())
            };
            sink.deliver(sample_frame(), SystemTime::now()).expect("deliver");
        }
        assert_eq!(seen, 1);
    }
}
