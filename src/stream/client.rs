//! NTRIP caster connection and streaming session worker.
//!
//! The client issues a long-lived HTTP GET against a caster mountpoint
//! and spawns a background worker that owns the socket, feeds every read
//! through the RTCM3 frame parser, and delivers complete frames to the
//! configured sink. Lost streams are reopened under the reconnect
//! policy; a rejected request (non-200 status) is fatal.

use std::time::{Duration, SystemTime};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::retry::{FailureKind, ReconnectPolicy, RetryState};
use crate::stream::frame::FrameParser;
use crate::stream::sink::MessageSink;

/// User-Agent sent when none is configured.
pub const DEFAULT_USER_AGENT: &str = "NTRIP ntrip-client/0.1";

const READ_CHUNK_LEN: usize = 2048;
const MAX_RESPONSE_HEAD_LEN: usize = 8192;

/// Connection parameters for one caster mountpoint.
///
/// Immutable for the lifetime of a connection; the worker clones it and
/// reuses it verbatim on every reconnect.
#[derive(Clone, Debug, Deserialize)]
pub struct NtripConfig {
    /// Caster host name or address.
    pub host: String,
    /// Caster TCP port (2101 by convention).
    pub port: u16,
    /// Mountpoint identifying the correction stream.
    pub mountpoint: String,
    /// Basic-auth user.
    pub username: String,
    /// Basic-auth password.
    pub password: SecretString,
    /// NMEA GGA sentence sent as the request body. Enables
    /// virtual-reference-station streams computed for this position.
    #[serde(default)]
    pub position_gga: Option<String>,
}

/// Connection lifecycle updates produced by the stream worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Errors produced by caster transport and response handling.
#[derive(Debug, Error)]
pub enum NtripClientError {
    /// Connect or read/write failure on the transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The caster answered with something other than status 200. Wrong
    /// credentials and unknown mountpoints both surface here.
    #[error("caster rejected request with status {status}: {reason}")]
    Rejected { status: u16, reason: String },

    /// The response head could not be parsed.
    #[error("malformed caster response: {0}")]
    Protocol(String),

    /// Rejected client configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The reconnect policy gave up after consecutive failures.
    #[error("gave up after {attempts} failed reconnect attempts")]
    RetriesExhausted { attempts: usize },

    /// The stream worker stopped before the initial connect resolved.
    #[error("stream worker stopped before initial connect")]
    WorkerStopped,
}

/// Entry point for opening caster connections.
#[derive(Clone, Debug)]
pub struct NtripClient {
    config: NtripConfig,
    user_agent: String,
    policy: ReconnectPolicy,
}

impl NtripClient {
    /// Creates a client with the default user agent and a steady
    /// reconnect policy.
    pub fn new(config: NtripConfig) -> Self {
        Self {
            config,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            policy: ReconnectPolicy::steady(),
        }
    }

    /// Overrides the `User-Agent` header.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Overrides the reconnect policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Opens the stream and starts delivering frames to `sink`.
    ///
    /// Spawns a background worker that owns the socket and returns once
    /// the caster has accepted the request. A non-200 response or a
    /// transport failure on this first attempt is returned directly;
    /// failures after that point are handled by the reconnect policy and
    /// reported through [`NtripConnection::closed`].
    pub async fn connect<S>(&self, sink: S) -> Result<NtripConnection, NtripClientError>
    where
        S: MessageSink + 'static,
    {
        validate_config(&self.config)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let config = self.config.clone();
        let user_agent = self.user_agent.clone();
        let policy = self.policy.clone();

        tokio::spawn(async move {
            connection_worker(
                config,
                user_agent,
                policy,
                Box::new(sink),
                stop_rx,
                status_tx,
                ready_tx,
                done_tx,
            )
            .await;
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(NtripConnection {
                stop_tx,
                status: status_rx,
                done: done_rx,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(NtripClientError::WorkerStopped),
        }
    }
}

/// Handle to an active caster connection.
///
/// Dropping the handle stops the worker the same way [`stop`] does.
///
/// [`stop`]: NtripConnection::stop
#[derive(Debug)]
pub struct NtripConnection {
    stop_tx: watch::Sender<bool>,
    status: mpsc::UnboundedReceiver<ConnectionStatus>,
    done: oneshot::Receiver<Result<(), NtripClientError>>,
}

impl NtripConnection {
    /// Requests a cooperative stop.
    ///
    /// The worker observes the flag between reads and during backoff
    /// waits, so shutdown latency is bounded by the next transport event.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Receives the next connection status update.
    pub async fn next_status(&mut self) -> Option<ConnectionStatus> {
        self.status.recv().await
    }

    /// Waits for the worker to terminate and returns its outcome:
    /// `Ok(())` after a requested stop, otherwise the fatal error that
    /// ended the session.
    pub async fn closed(self) -> Result<(), NtripClientError> {
        self.done.await.unwrap_or(Ok(()))
    }
}

fn validate_config(config: &NtripConfig) -> Result<(), NtripClientError> {
    if config.host.trim().is_empty() {
        return Err(NtripClientError::InvalidConfig("host is empty".to_string()));
    }
    if config.port == 0 {
        return Err(NtripClientError::InvalidConfig("port is zero".to_string()));
    }
    let mountpoint = config.mountpoint.trim_start_matches('/');
    if mountpoint.is_empty() {
        return Err(NtripClientError::InvalidConfig(
            "mountpoint is empty".to_string(),
        ));
    }
    if mountpoint.chars().any(char::is_whitespace) {
        return Err(NtripClientError::InvalidConfig(
            "mountpoint contains whitespace".to_string(),
        ));
    }
    Ok(())
}

enum SessionOutcome {
    Stopped,
}

struct SessionFailure {
    kind: FailureKind,
    error: NtripClientError,
}

impl SessionFailure {
    fn network(error: NtripClientError) -> Self {
        Self {
            kind: FailureKind::NetworkError,
            error,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn connection_worker(
    config: NtripConfig,
    user_agent: String,
    policy: ReconnectPolicy,
    mut sink: Box<dyn MessageSink>,
    mut stop_rx: watch::Receiver<bool>,
    status_tx: mpsc::UnboundedSender<ConnectionStatus>,
    ready_tx: oneshot::Sender<Result<(), NtripClientError>>,
    done_tx: oneshot::Sender<Result<(), NtripClientError>>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut retry = RetryState::new();

    let result = loop {
        match run_streaming_session(
            &config,
            &user_agent,
            sink.as_mut(),
            &mut retry,
            &mut stop_rx,
            &status_tx,
            &mut ready_tx,
        )
        .await
        {
            Ok(SessionOutcome::Stopped) => break Ok(()),
            Err(failure) => {
                let _ = status_tx.send(ConnectionStatus::Disconnected);

                if let Some(tx) = ready_tx.take() {
                    // The initial attempt never got a usable stream;
                    // surface the error to the connect() caller.
                    let _ = tx.send(Err(failure.error));
                    return;
                }

                if failure.kind == FailureKind::AuthFailure {
                    break Err(failure.error);
                }

                match policy.next_delay(failure.kind, &mut retry) {
                    Some(delay) => {
                        warn!(
                            kind = ?failure.kind,
                            attempt = retry.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %failure.error,
                            "stream lost, reconnecting"
                        );
                        if !wait_before_reconnect(delay, &mut stop_rx).await {
                            break Ok(());
                        }
                    }
                    None => {
                        break Err(NtripClientError::RetriesExhausted {
                            attempts: retry.attempts(),
                        });
                    }
                }
            }
        }
    };

    let _ = done_tx.send(result);
}

async fn run_streaming_session(
    config: &NtripConfig,
    user_agent: &str,
    sink: &mut dyn MessageSink,
    retry: &mut RetryState,
    stop_rx: &mut watch::Receiver<bool>,
    status_tx: &mpsc::UnboundedSender<ConnectionStatus>,
    ready_tx: &mut Option<oneshot::Sender<Result<(), NtripClientError>>>,
) -> Result<SessionOutcome, SessionFailure> {
    if *stop_rx.borrow() {
        return Ok(SessionOutcome::Stopped);
    }

    let mut stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|err| SessionFailure::network(err.into()))?;

    let request = build_request(config, user_agent);
    stream
        .write_all(&request)
        .await
        .map_err(|err| SessionFailure::network(err.into()))?;

    let (status, reason, leftover) = read_response_head(&mut stream).await.map_err(|err| {
        // A garbled or truncated head is a transport-level problem, not
        // a caster rejection.
        SessionFailure::network(err)
    })?;

    if status != 200 {
        return Err(SessionFailure {
            kind: FailureKind::AuthFailure,
            error: NtripClientError::Rejected { status, reason },
        });
    }

    info!(
        host = %config.host,
        mountpoint = %config.mountpoint,
        "ntrip stream established"
    );
    let _ = status_tx.send(ConnectionStatus::Connected);
    if let Some(tx) = ready_tx.take() {
        let _ = tx.send(Ok(()));
    }

    // Fresh parser per session: a partial frame never survives a
    // reconnect.
    let mut parser = FrameParser::new();
    parser.push(&leftover);
    drain_frames(&mut parser, sink, retry);

    let mut chunk = [0u8; READ_CHUNK_LEN];
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow_and_update() {
                    return Ok(SessionOutcome::Stopped);
                }
            }
            read = stream.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        debug!(
                            crc_failures = parser.crc_failures(),
                            pending = parser.pending(),
                            "caster closed the stream"
                        );
                        return Err(SessionFailure {
                            kind: FailureKind::StreamClosed,
                            error: NtripClientError::Protocol(
                                "caster closed the stream".to_string(),
                            ),
                        });
                    }
                    Ok(n) => {
                        parser.push(&chunk[..n]);
                        drain_frames(&mut parser, sink, retry);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(SessionFailure::network(err.into())),
                }
            }
        }
    }
}

fn drain_frames(parser: &mut FrameParser, sink: &mut dyn MessageSink, retry: &mut RetryState) {
    while let Some(frame) = parser.next_frame() {
        let received_at = SystemTime::now();
        // Only a delivery the sink accepted clears the failure streak.
        match sink.deliver(frame, received_at) {
            Ok(()) => retry.reset(),
            Err(err) => warn!(error = %err, "message sink rejected frame"),
        }
    }
}

fn build_request(config: &NtripConfig, user_agent: &str) -> Vec<u8> {
    let mountpoint = config.mountpoint.trim_start_matches('/');
    let credentials = BASE64_STANDARD.encode(format!(
        "{}:{}",
        config.username,
        config.password.expose_secret()
    ));

    let mut request = format!(
        "GET /{mountpoint} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Ntrip-Version: Ntrip/2.0\r\n\
         User-Agent: {user_agent}\r\n\
         Connection: close\r\n\
         Authorization: Basic {credentials}\r\n",
        host = config.host,
        port = config.port,
    );
    if let Some(gga) = config.position_gga.as_deref() {
        request.push_str(&format!("Content-Length: {}\r\n", gga.len()));
    }
    request.push_str("\r\n");

    let mut bytes = request.into_bytes();
    if let Some(gga) = config.position_gga.as_deref() {
        bytes.extend_from_slice(gga.as_bytes());
    }
    bytes
}

/// Reads the response head up to the blank line and returns the status
/// code, the reason phrase, and any stream bytes read past the head.
async fn read_response_head(
    stream: &mut TcpStream,
) -> Result<(u16, String, Vec<u8>), NtripClientError> {
    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = std::str::from_utf8(&buf[..end])
                .map_err(|_| NtripClientError::Protocol("non-utf8 response head".to_string()))?;
            let (status, reason) = parse_status_line(head)?;
            return Ok((status, reason, buf[end + 4..].to_vec()));
        }
        if buf.len() > MAX_RESPONSE_HEAD_LEN {
            return Err(NtripClientError::Protocol(
                "response head too large".to_string(),
            ));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(NtripClientError::Protocol(
                "connection closed before response head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Parses the status line, accepting both `HTTP/1.x` and the bare `ICY`
/// responses older casters send.
fn parse_status_line(head: &str) -> Result<(u16, String), NtripClientError> {
    let line = head.lines().next().unwrap_or_default();
    let mut parts = line.splitn(3, ' ');

    let protocol = parts.next().unwrap_or_default();
    if !protocol.starts_with("HTTP/") && protocol != "ICY" {
        return Err(NtripClientError::Protocol(format!(
            "unexpected status line: {line}"
        )));
    }

    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| NtripClientError::Protocol(format!("unexpected status line: {line}")))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    Ok((status, reason))
}

async fn wait_before_reconnect(delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow_and_update() {
                    return false;
                }
            }
        }
    }
}
