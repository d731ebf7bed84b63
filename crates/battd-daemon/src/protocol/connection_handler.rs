//! Per-connection task of the control plane.
//!
//! # Connection Lifecycle
//!
//! 1. The credential is completed on a blocking worker
//!    ([`Connection::capture_auth`])
//! 2. Admission runs on a blocking worker while the Hello is awaited
//! 3. The server answers `HelloAck`, or `HelloNack` and closes
//! 4. Requests are dispatched one at a time, each on a blocking worker
//!
//! A reader task owns the read half for the whole lifetime of the
//! connection. When the peer hangs up, it sets the connection's
//! [`Cancellation`], which aborts any evaluation in flight; the result of a
//! request whose peer went away is dropped.
//!
//! # Security Considerations
//!
//! - Frames read before admission completes are limited to
//!   [`MAX_HANDSHAKE_FRAME_SIZE`]. Bytes pipelined behind the Hello are
//!   buffered up to that limit and decoded only after the verdict
//! - A peer that fails admission gets the same `HelloNack` whatever the
//!   reason, and no request is read from it
//! - A framing violation drops the peer; the stream cannot be resynchronized
//! - Slow platform queries never run on the async runtime threads

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use battd_core::{Cancellation, ConnectionAuth, IdentityVerifier};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::dispatch::dispatch;
use super::error::{MAX_HANDSHAKE_FRAME_SIZE, ProtocolError, ProtocolResult};
use super::framing::FrameCodec;
use super::handshake::{HelloNack, ServerHandshake, parse_hello, serialize_handshake_message};
use super::messages::{Response, Status, parse_request, serialize_response};
use super::server::Connection;
use crate::state::SharedState;

/// Default time a peer has to send its Hello.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames buffered between the reader task and the connection task.
const INBOX_CAPACITY: usize = 8;

/// Read size while waiting for the admission verdict.
const PENDING_CHUNK: usize = 4096;

type Inbox = mpsc::Receiver<ProtocolResult<Bytes>>;
type Reader = FramedRead<OwnedReadHalf, FrameCodec>;
type Writer = FramedWrite<OwnedWriteHalf, FrameCodec>;

/// Result of the handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    /// Handshake succeeded, connection is ready for requests.
    Success,
    /// Handshake failed (`HelloNack` sent), connection should be closed.
    Failed,
    /// Connection closed during handshake.
    ConnectionClosed,
}

/// Serves one accepted connection until the peer disconnects.
///
/// # Errors
///
/// Returns an error on I/O failures, a Hello that does not arrive in time
/// ([`ProtocolError::Timeout`]) and handshake framing violations. Denials
/// are not errors.
pub async fn handle_connection<V>(mut connection: Connection, state: SharedState<V>) -> Result<()>
where
    V: IdentityVerifier + 'static,
{
    let Some(auth) = connection.capture_auth().await? else {
        bail!("connection has no credential source");
    };
    let (reader, mut writer) = connection.into_split();

    let cancel = Cancellation::new();
    let (upgrade_tx, upgrade_rx) = oneshot::channel();
    let (inbox_tx, mut inbox) = mpsc::channel(INBOX_CAPACITY);
    let reader_task = tokio::spawn(read_frames(reader, inbox_tx, upgrade_rx, cancel.clone()));

    if let Some(metrics) = state.metrics() {
        metrics.daemon_metrics().connection_opened();
    }

    let result = async {
        match perform_handshake(&mut inbox, &mut writer, &state, &auth, &cancel).await? {
            HandshakeResult::Success => {
                // Receiver gone means the reader already stopped.
                let _ = upgrade_tx.send(());
                serve_requests(&mut inbox, &mut writer, &state, &auth, &cancel).await
            },
            HandshakeResult::Failed | HandshakeResult::ConnectionClosed => Ok(()),
        }
    }
    .await;

    cancel.cancel();
    reader_task.abort();
    if let Some(metrics) = state.metrics() {
        metrics.daemon_metrics().connection_closed();
    }
    result
}

/// Runs admission and the Hello/HelloAck exchange.
///
/// Admission starts right away, before the Hello has arrived.
///
/// # Errors
///
/// Returns [`ProtocolError::Timeout`] if no Hello arrives within the
/// state's handshake timeout, and I/O or framing errors.
pub async fn perform_handshake<V>(
    inbox: &mut Inbox,
    writer: &mut Writer,
    state: &SharedState<V>,
    auth: &Arc<ConnectionAuth>,
    cancel: &Cancellation,
) -> Result<HandshakeResult>
where
    V: IdentityVerifier + 'static,
{
    let admission = {
        let state = Arc::clone(state);
        let auth = Arc::clone(auth);
        let cancel = cancel.clone();
        task::spawn_blocking(move || state.gate().admit(&auth, &cancel))
    };

    let limit = state.handshake_timeout();
    let frame = match timeout(limit, inbox.recv()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(e))) => {
            warn!("Failed to receive handshake frame: {e}");
            return Err(e.into());
        },
        Ok(None) => return Ok(HandshakeResult::ConnectionClosed),
        Err(_) => {
            warn!("Peer did not send Hello in time");
            cancel.cancel();
            let millis = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
            return Err(ProtocolError::timeout(millis).into());
        },
    };

    let admitted = admission
        .await
        .context("admission task failed")?
        .is_allow();
    if cancel.is_cancelled() {
        return Ok(HandshakeResult::ConnectionClosed);
    }

    let mut handshake = ServerHandshake::new(state.server_info());
    if let Some(id) = state.daemon_id() {
        handshake = handshake.with_daemon_id(id);
    }
    let response = if state.is_shutdown_requested() {
        HelloNack::shutting_down().into()
    } else {
        match parse_hello(&frame) {
            Ok(hello) => handshake
                .process_hello(&hello, admitted)
                .context("failed to process Hello")?,
            Err(e) if admitted => {
                warn!("Invalid Hello message: {e}");
                HelloNack::rejected(format!("invalid Hello: {e}")).into()
            },
            Err(_) => HelloNack::not_authorized().into(),
        }
    };

    let bytes =
        serialize_handshake_message(&response).context("failed to serialize handshake response")?;
    writer.send(bytes).await?;

    Ok(if handshake.is_completed() {
        HandshakeResult::Success
    } else {
        HandshakeResult::Failed
    })
}

async fn serve_requests<V>(
    inbox: &mut Inbox,
    writer: &mut Writer,
    state: &SharedState<V>,
    auth: &Arc<ConnectionAuth>,
    cancel: &Cancellation,
) -> Result<()>
where
    V: IdentityVerifier + 'static,
{
    while let Some(frame) = inbox.recv().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if e.is_protocol_violation() => {
                warn!(error = %e, "Dropping peer after framing violation");
                return Ok(());
            },
            Err(e) => return Err(e).context("failed to read request frame"),
        };
        if state.is_shutdown_requested() {
            debug!("Closing connection for shutdown");
            return Ok(());
        }

        let (command, response) = match parse_request(&frame) {
            Ok(request) => {
                let id = request.id;
                let command = request.command.name();
                let job = {
                    let state = Arc::clone(state);
                    let auth = Arc::clone(auth);
                    let cancel = cancel.clone();
                    task::spawn_blocking(move || dispatch(&state, &auth, &cancel, request))
                };
                let response = match job.await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(command, error = %e, "Dispatch did not complete");
                        Response::status(id, Status::CommFailed)
                    },
                };
                if cancel.is_cancelled() {
                    debug!(command, "Peer closed before reply; dropping result");
                    return Ok(());
                }
                (command, response)
            },
            Err(e) => {
                debug!(error = %e, "Malformed request");
                ("malformed", Response::malformed())
            },
        };

        if let Some(metrics) = state.metrics() {
            metrics
                .daemon_metrics()
                .ipc_request_completed(command, response.status.as_str());
        }
        writer.send(serialize_response(&response)?).await?;
    }
    Ok(())
}

/// Forwards frames to the connection task and cancels the connection when
/// the peer hangs up.
///
/// The frame after the Hello is decoded only once the admission verdict is
/// in, under the limit that verdict allows.
async fn read_frames(
    mut reader: Reader,
    inbox: mpsc::Sender<ProtocolResult<Bytes>>,
    mut upgrade: oneshot::Receiver<()>,
    cancel: Cancellation,
) {
    if forward_frame(&mut reader, &inbox).await && await_upgrade(&mut reader, &mut upgrade).await {
        reader.decoder_mut().upgrade();
        while forward_frame(&mut reader, &inbox).await {}
    }
    cancel.cancel();
}

/// Forwards one frame. Returns `false` once nothing more can be read.
async fn forward_frame(reader: &mut Reader, inbox: &mpsc::Sender<ProtocolResult<Bytes>>) -> bool {
    let Some(frame) = reader.next().await else {
        return false;
    };
    let failed = frame.is_err();
    inbox.send(frame).await.is_ok() && !failed
}

/// Waits for the upgrade signal without decoding. Returns `false` if the
/// handshake failed or the peer hung up meanwhile.
///
/// Pipelined bytes are moved into the read buffer, up to the handshake
/// limit, so a hangup is still noticed.
async fn await_upgrade(reader: &mut Reader, upgrade: &mut oneshot::Receiver<()>) -> bool {
    let mut chunk = [0u8; PENDING_CHUNK];
    loop {
        let watching = reader.read_buffer().len() < MAX_HANDSHAKE_FRAME_SIZE;
        tokio::select! {
            signal = &mut *upgrade => return signal.is_ok(),
            ready = reader.get_ref().readable(), if watching => {
                if ready.is_err() {
                    return false;
                }
                match reader.get_ref().try_read(&mut chunk) {
                    Ok(0) => return false,
                    Ok(n) => reader.read_buffer_mut().extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
                    Err(_) => return false,
                }
            }
        }
    }
}
