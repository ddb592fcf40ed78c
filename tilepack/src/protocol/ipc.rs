//! Out-of-process transport binding.
//!
//! The worker runs as a child process; envelopes and replies travel over
//! its stdin/stdout as length-delimited `bincode` frames. Protocol
//! semantics (envelope shape, correlation, dispatch) are identical to the
//! in-process binding — only the transport primitive differs.
//!
//! Frame layout is a 4-byte big-endian length prefix followed by the
//! encoded message, via [`LengthDelimitedCodec`]. A frame that fails to
//! decode is a transport-level fault: it is logged and skipped, since
//! there is no request to reference in an error reply.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, warn};

use super::message::{Envelope, Reply};
use super::transport::{ControllerEndpoint, TransportError, WorkerEndpoint};

/// Default upper bound on a single frame. Open-by-bytes requests carry
/// whole package files, so this is far larger than the 1 MiB chunk bound.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

fn codec(max_frame: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame)
        .new_codec()
}

fn encode<T: serde::Serialize>(value: &T) -> Result<bytes::Bytes, TransportError> {
    bincode::serialize(value)
        .map(bytes::Bytes::from)
        .map_err(|e| TransportError::Frame(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(frame: &[u8]) -> Result<T, TransportError> {
    bincode::deserialize(frame).map_err(|e| TransportError::Frame(e.to_string()))
}

/// Wires a controller endpoint over raw byte streams.
///
/// Spawns a writer task (requests → frames) and a reader task
/// (frames → replies). Both tasks end when their stream or channel
/// closes.
pub fn wire_controller<R, W>(reader: R, writer: W, max_frame: usize) -> ControllerEndpoint
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Envelope>();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Reply>();

    let mut framed_write = FramedWrite::new(writer, codec(max_frame));
    tokio::spawn(async move {
        while let Some(request) = request_rx.recv().await {
            let frame = match encode(&request) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(error = %e, "Failed to encode request frame");
                    continue;
                }
            };
            if let Err(e) = framed_write.send(frame).await {
                warn!(error = %e, "Worker stdin closed; stopping request writer");
                break;
            }
        }
    });

    let mut framed_read = FramedRead::new(reader, codec(max_frame));
    tokio::spawn(async move {
        while let Some(frame) = framed_read.next().await {
            match frame {
                Ok(frame) => match decode::<Reply>(&frame) {
                    Ok(reply) => {
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "Skipping undecodable reply frame"),
                },
                Err(e) => {
                    warn!(error = %e, "Worker stdout closed; stopping reply reader");
                    break;
                }
            }
        }
    });

    ControllerEndpoint::new(request_tx, reply_rx)
}

/// Wires a worker endpoint over raw byte streams (the child side of
/// [`wire_controller`]).
pub fn wire_worker<R, W>(reader: R, writer: W, max_frame: usize) -> WorkerEndpoint
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (request_tx, request_rx) = mpsc::unbounded_channel::<Envelope>();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();

    let mut framed_read = FramedRead::new(reader, codec(max_frame));
    tokio::spawn(async move {
        while let Some(frame) = framed_read.next().await {
            match frame {
                Ok(frame) => match decode::<Envelope>(&frame) {
                    Ok(request) => {
                        if request_tx.send(request).is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "Skipping undecodable request frame"),
                },
                Err(e) => {
                    debug!(error = %e, "Controller side closed; stopping request reader");
                    break;
                }
            }
        }
    });

    let mut framed_write = FramedWrite::new(writer, codec(max_frame));
    tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            let frame = match encode(&reply) {
                Ok(frame) => frame,
                Err(e) => {
                    error!(error = %e, "Failed to encode reply frame");
                    continue;
                }
            };
            if let Err(e) = framed_write.send(frame).await {
                debug!(error = %e, "Controller side closed; stopping reply writer");
                break;
            }
        }
    });

    WorkerEndpoint::new(request_rx, reply_tx)
}

/// Spawns the worker as a child process and wires a controller endpoint
/// over its stdio.
///
/// `program` is typically the current executable with a hidden worker
/// subcommand in `args`. The child's stderr is inherited so its log output
/// stays visible.
pub fn spawn_worker_process(
    program: &Path,
    args: &[&OsStr],
    max_frame: usize,
) -> Result<(ControllerEndpoint, Child), TransportError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take().ok_or_else(|| {
        TransportError::Frame("worker child has no stdin handle".to_string())
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        TransportError::Frame("worker child has no stdout handle".to_string())
    })?;

    Ok((wire_controller(stdout, stdin, max_frame), child))
}

/// Wires a worker endpoint over this process's own stdin/stdout: the child
/// side of [`spawn_worker_process`].
pub fn stdio_worker_endpoint(max_frame: usize) -> WorkerEndpoint {
    wire_worker(tokio::io::stdin(), tokio::io::stdout(), max_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{MessageKind, Payload, ReplyData};
    use bytes::Bytes;
    use std::time::Duration;

    /// Connects a controller and worker endpoint over an in-memory byte
    /// pipe, exercising the full framing path.
    fn framed_pair() -> (ControllerEndpoint, WorkerEndpoint) {
        // Two independent pipes, mirroring the child's separate stdin/stdout.
        // Splitting a single duplex would couple both directions into one
        // stream, so dropping one endpoint's writer would not surface EOF to
        // the peer's reader.
        let (controller_write, worker_read) = tokio::io::duplex(1024 * 1024);
        let (worker_write, controller_read) = tokio::io::duplex(1024 * 1024);

        (
            wire_controller(controller_read, controller_write, DEFAULT_MAX_FRAME_BYTES),
            wire_worker(worker_read, worker_write, DEFAULT_MAX_FRAME_BYTES),
        )
    }

    #[tokio::test]
    async fn test_request_roundtrip_over_frames() {
        let (controller, mut worker) = framed_pair();

        let request = Envelope::with_payload(
            "pkg-9",
            MessageKind::GetTile,
            Payload {
                table_name: Some("imagery".to_string()),
                zoom: Some(7),
                extent: Some([-1.0, -2.0, 3.0, 4.0]),
                width: Some(256),
                height: Some(256),
                ..Default::default()
            },
        );
        controller.send(request.clone()).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), worker.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_reply_roundtrip_over_frames() {
        let (mut controller, worker) = framed_pair();

        let request = Envelope::new("pkg-9", MessageKind::ListTables);
        worker
            .reply(Reply::success(
                request,
                Some(ReplyData::Chunk(Bytes::from_static(b"chunk-bytes"))),
            ))
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), controller.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.answers("pkg-9", MessageKind::ListTables));
        assert_eq!(
            reply.result,
            Some(ReplyData::Chunk(Bytes::from_static(b"chunk-bytes")))
        );
    }

    #[tokio::test]
    async fn test_binary_payload_survives_framing() {
        let (controller, mut worker) = framed_pair();

        let blob: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let request = Envelope::with_payload(
            "pkg-2",
            MessageKind::Open,
            Payload {
                data: Some(Bytes::from(blob.clone())),
                ..Default::default()
            },
        );
        controller.send(request).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), worker.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload.data.as_deref(), Some(blob.as_slice()));
    }

    #[tokio::test]
    async fn test_worker_recv_ends_when_controller_drops() {
        let (controller, mut worker) = framed_pair();
        drop(controller);

        let received = tokio::time::timeout(Duration::from_secs(1), worker.recv())
            .await
            .unwrap();
        assert!(received.is_none());
    }
}
