//! Endpoint side of a relayed circuit
//!
//! After `Connected` / `Accepted` the relay connection carries
//! [`CircuitFrame`]s. [`bridge`] turns that into a plain byte pipe so the
//! handshake and the chat protocol run over a circuit exactly as they run
//! over TCP.

use relaychat_core::{BoxedIo, Connection, FaultSlot};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::debug;

use crate::protocol::{CircuitFrame, CloseReason};

/// In-memory buffer between the circuit pump and the local reader
pub const BRIDGE_BUFFER: usize = 64 * 1024;

/// Largest payload put into one outbound data frame
const CHUNK_SIZE: usize = 16 * 1024;

/// Turn a spliced relay connection into a raw byte stream
///
/// The returned [`FaultSlot`] records the relay's close reason when it ends
/// the circuit for quota or expiry.
#[must_use]
pub fn bridge(conn: Connection) -> (BoxedIo, FaultSlot) {
    let fault = FaultSlot::default();
    let (local, remote) = tokio::io::duplex(BRIDGE_BUFFER);
    tokio::spawn(pump(conn, remote, fault.clone()));
    (Box::new(local), fault)
}

async fn pump(conn: Connection, pipe: DuplexStream, fault: FaultSlot) {
    let peer = conn.remote_peer();
    let (mut relay_rd, mut relay_wr) = conn.split();
    let (mut pipe_rd, mut pipe_wr) = tokio::io::split(pipe);

    let outbound = async {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match pipe_rd.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = relay_wr.send(&CircuitFrame::Close(CloseReason::Normal)).await;
                    relay_wr.shutdown().await;
                    return;
                }
                Ok(n) => {
                    if relay_wr.send(&CircuitFrame::Data(buf[..n].to_vec())).await.is_err() {
                        // The inbound half still reports why the relay went away
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    };

    let inbound = async {
        loop {
            match relay_rd.recv::<CircuitFrame>().await {
                Ok(CircuitFrame::Data(bytes)) => {
                    if pipe_wr.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Ok(CircuitFrame::Close(reason)) => {
                    debug!(relay = %peer.short(), ?reason, "circuit closed by relay");
                    if let Some(error) = reason.into_error() {
                        fault.record(error);
                    }
                    break;
                }
                Err(e) => {
                    debug!(relay = %peer.short(), error = %e, "circuit connection lost");
                    break;
                }
            }
        }
        let _ = pipe_wr.shutdown().await;
    };

    tokio::select! {
        () = outbound => {}
        () = inbound => {}
    }
}
