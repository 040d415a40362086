//! TCP plumbing: the connect-then-read task and the buffered writer task.
//!
//! One connect attempt is one task and one epoch. The task resolves the
//! host, connects, enables TCP_NODELAY, spawns the writer, reports
//! `Connected`, then turns into the read loop. Aborting the task therefore
//! cancels whichever async op is in flight: the resolve, the connect, or
//! the armed read.

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::mpsc,
};
use tracing::{debug, trace, warn};

use padlink_proto::{constants::MAX_FRAME_LEN, Packet};

use crate::error::ClientError;

/// Why a connection stopped.
#[derive(Debug)]
pub(crate) enum CloseReason {
    /// Clean EOF from the peer.
    Eof,
    /// Read failure or malformed framing.
    Error(String),
}

/// Events the socket tasks report back to the reactor. Every event carries
/// the epoch of the connect attempt that produced it; the session drops
/// events from superseded epochs.
#[derive(Debug)]
pub(crate) enum NetEvent {
    Connected {
        epoch: u64,
        tx: mpsc::UnboundedSender<Bytes>,
    },
    ConnectFailed {
        epoch: u64,
        error: ClientError,
    },
    Packet {
        epoch: u64,
        packet: Packet,
    },
    Closed {
        epoch: u64,
        reason: CloseReason,
    },
}

/// Resolve, connect, and run the read loop, reporting through `net_tx`.
pub(crate) async fn connect_and_read(
    host: String,
    port: u16,
    epoch: u64,
    net_tx: mpsc::UnboundedSender<NetEvent>,
) {
    let stream = match establish(&host, port).await {
        Ok(stream) => stream,
        Err(error) => {
            let _ = net_tx.send(NetEvent::ConnectFailed { epoch, error });
            return;
        }
    };

    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(writer_loop(write, rx));

    if net_tx.send(NetEvent::Connected { epoch, tx }).is_err() {
        return;
    }

    let reason = read_loop(read, epoch, &net_tx).await;
    let _ = net_tx.send(NetEvent::Closed { epoch, reason });
}

async fn establish(host: &str, port: u16) -> Result<TcpStream, ClientError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ClientError::ConnectionFailed(format!("{host}:{port}: {e}")))?;
    let addr = addrs
        .next()
        .ok_or_else(|| ClientError::ConnectionFailed(format!("{host}:{port}: no addresses")))?;

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ClientError::ConnectionFailed(format!("{addr}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

    debug!(%addr, "connected");
    Ok(stream)
}

async fn read_loop(
    mut read: OwnedReadHalf,
    epoch: u64,
    net_tx: &mpsc::UnboundedSender<NetEvent>,
) -> CloseReason {
    loop {
        match read_frame(&mut read).await {
            Ok(Some(packet)) => {
                trace!(len = packet.len(), "frame received");
                if net_tx.send(NetEvent::Packet { epoch, packet }).is_err() {
                    // Reactor is gone; nothing left to report to.
                    return CloseReason::Eof;
                }
            }
            Ok(None) => return CloseReason::Eof,
            Err(e) => return CloseReason::Error(e.to_string()),
        }
    }
}

/// Read one length-prefixed frame. `Ok(None)` is a clean EOF on the frame
/// boundary.
pub(crate) async fn read_frame(
    read: &mut (impl AsyncRead + Unpin),
) -> Result<Option<Packet>, ClientError> {
    let mut len_buf = [0u8; 4];
    match read.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(padlink_proto::ProtoError::FrameTooLarge(len).into());
    }

    let mut payload = vec![0u8; len];
    read.read_exact(&mut payload).await?;
    Ok(Some(Packet::from_payload(payload)))
}

/// Drain framed bytes onto the socket.
///
/// Writes go through a `BufWriter` flushed when the channel goes idle:
/// back-to-back sends from a single frame tick (INPUT_DATA then FRAME)
/// leave as one segment.
pub(crate) async fn writer_loop(write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    let mut write = BufWriter::new(write);
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write.write_all(&frame).await {
            warn!(error = %e, "socket write failed");
            break;
        }
        if rx.is_empty() {
            if let Err(e) = write.flush().await {
                warn!(error = %e, "socket flush failed");
                break;
            }
        }
    }
    let _ = write.shutdown().await;
}
