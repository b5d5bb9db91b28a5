//! Line-oriented duplex stream
//!
//! A [`Stream`] is a cheap-to-clone handle over one negotiated
//! [`Connection`]. The read half and the write half sit behind separate
//! async mutexes so one task can block on a read while another writes.
//! Closing is idempotent and wakes every pending read and write.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::codec::MAX_FRAME_SIZE;
use crate::error::{Error, Result};
use crate::host::{BoxedIo, Connection, FaultSlot};
use crate::identity::PeerId;

/// Longest line, terminator included, either side will carry
pub const MAX_LINE_LEN: usize = MAX_FRAME_SIZE;

/// Shared handle to an open stream
#[derive(Clone)]
pub struct Stream {
    shared: Arc<Shared>,
}

struct Shared {
    remote: PeerId,
    protocol: String,
    reader: Mutex<BufReader<ReadHalf<BoxedIo>>>,
    writer: Mutex<WriteHalf<BoxedIo>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    fault: FaultSlot,
}

impl Stream {
    /// Wrap a negotiated connection
    #[must_use]
    pub fn new(conn: Connection) -> Self {
        let (io, remote, protocol, fault) = conn.into_parts();
        let (reader, writer) = tokio::io::split(io);
        let (close_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                remote,
                protocol,
                reader: Mutex::new(BufReader::new(reader)),
                writer: Mutex::new(writer),
                closed: AtomicBool::new(false),
                close_tx,
                fault,
            }),
        }
    }

    /// Remote peer identity
    #[must_use]
    pub fn remote_peer(&self) -> PeerId {
        self.shared.remote
    }

    /// Negotiated protocol
    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.shared.protocol
    }

    /// Read one line
    ///
    /// The returned string keeps its trailing `\n`. A final line without a
    /// terminator is returned as-is; the read after it reports the close.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClosedStream`] once the stream is closed or the remote
    /// closed its side, or the teardown reason the relay reported (for example
    /// [`Error::QuotaExceeded`]). A line longer than [`MAX_LINE_LEN`] or not
    /// valid UTF-8 is an [`Error::Protocol`].
    pub async fn read_line(&self) -> Result<String> {
        if self.is_closed() {
            return Err(self.close_error());
        }

        let mut reader = tokio::select! {
            guard = self.shared.reader.lock() => guard,
            () = self.closed() => return Err(self.close_error()),
        };

        let mut buf = Vec::new();
        let mut limited = (&mut *reader).take(MAX_LINE_LEN as u64);
        tokio::select! {
            result = limited.read_until(b'\n', &mut buf) => match result {
                Ok(0) => Err(self.close_error()),
                Ok(n) if n == MAX_LINE_LEN && buf.last() != Some(&b'\n') => {
                    Err(Error::protocol("line exceeds maximum length"))
                }
                Ok(_) => String::from_utf8(buf)
                    .map_err(|_| Error::protocol("line is not valid UTF-8")),
                Err(e) => Err(self.shared.fault.get().unwrap_or_else(|| e.into())),
            },
            () = self.closed() => Err(self.close_error()),
        }
    }

    /// Write one line, appending `\n` if missing
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `line` contains a newline anywhere but
    /// at the end or is longer than [`MAX_LINE_LEN`], [`Error::ClosedStream`]
    /// (or the recorded teardown reason) if the stream is closed, or an I/O
    /// error.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let body = line.strip_suffix('\n').unwrap_or(line);
        if body.contains('\n') {
            return Err(Error::protocol("line contains an embedded newline"));
        }
        if body.len() >= MAX_LINE_LEN {
            return Err(Error::protocol("line exceeds maximum length"));
        }
        if self.is_closed() {
            return Err(self.close_error());
        }

        let mut writer = tokio::select! {
            guard = self.shared.writer.lock() => guard,
            () = self.closed() => return Err(self.close_error()),
        };

        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.extend_from_slice(body.as_bytes());
        bytes.push(b'\n');

        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };

        tokio::select! {
            result = write => result.map_err(|e| self.shared.fault.get().unwrap_or_else(|| e.into())),
            () = self.closed() => Err(self.close_error()),
        }
    }

    /// Close the stream
    ///
    /// Safe to call any number of times from any number of tasks; only the
    /// first call shuts the connection down.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.close_tx.send_replace(true);

        let mut writer = self.shared.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(remote = %self.shared.remote.short(), error = %e, "stream shutdown failed");
        }
        debug!(remote = %self.shared.remote.short(), "stream closed");
    }

    /// True once [`Stream::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Resolves when the stream is closed
    pub async fn closed(&self) {
        let mut rx = self.shared.close_tx.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn close_error(&self) -> Error {
        self.shared.fault.get().unwrap_or(Error::ClosedStream)
    }
}

impl From<Connection> for Stream {
    fn from(conn: Connection) -> Self {
        Self::new(conn)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("remote", &self.shared.remote)
            .field("protocol", &self.shared.protocol)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::identity::Identity;
    use std::time::Duration;

    /// Two connected streams over an in-memory pipe
    async fn stream_pair() -> (Stream, Stream) {
        stream_pair_with_fault(FaultSlot::default()).await
    }

    async fn stream_pair_with_fault(fault: FaultSlot) -> (Stream, Stream) {
        let (conn, remote) = connected(fault).await;
        (Stream::new(conn), remote)
    }

    /// Raw client connection and the server's stream
    async fn connected(fault: FaultSlot) -> (Connection, Stream) {
        let server = Host::new(Identity::generate());
        let client = Host::new(Identity::generate());

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
        server.set_stream_handler("/line/1", move |conn: Connection| {
            let tx = Arc::clone(&tx);
            async move {
                let stream = Stream::new(conn);
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(stream.clone());
                }
                stream.closed().await;
            }
        });

        let (a, b) = tokio::io::duplex(4096);
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move { server.accept_inbound(Box::new(b), FaultSlot::default()).await })
        };
        let conn = client
            .upgrade_outbound(Box::new(a), Some(server.peer_id()), "/line/1", fault)
            .await
            .unwrap();
        let remote = rx.await.unwrap();
        drop(server_task);

        (conn, remote)
    }

    #[tokio::test]
    async fn test_line_exchange() {
        let (a, b) = stream_pair().await;

        a.write_line("hello").await.unwrap();
        b.write_line("hi there\n").await.unwrap();

        assert_eq!(b.read_line().await.unwrap(), "hello\n");
        assert_eq!(a.read_line().await.unwrap(), "hi there\n");
    }

    #[tokio::test]
    async fn test_embedded_newline_rejected() {
        let (a, _b) = stream_pair().await;
        assert!(matches!(a.write_line("two\nlines").await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (a, _b) = stream_pair().await;

        let reader = a.clone();
        let pending = tokio::spawn(async move { reader.read_line().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        a.close().await;
        assert_eq!(pending.await.unwrap(), Err(Error::ClosedStream));
        assert_eq!(a.write_line("late").await, Err(Error::ClosedStream));
    }

    #[tokio::test]
    async fn test_remote_close_is_eof() {
        let (a, b) = stream_pair().await;
        b.write_line("last words").await.unwrap();
        b.close().await;

        assert_eq!(a.read_line().await.unwrap(), "last words\n");
        assert_eq!(a.read_line().await, Err(Error::ClosedStream));
    }

    #[tokio::test]
    async fn test_concurrent_double_close() {
        let (a, b) = stream_pair().await;

        let first = a.clone();
        let second = a.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { first.close().await }),
            tokio::spawn(async move { second.close().await }),
        );
        r1.unwrap();
        r2.unwrap();

        assert!(a.is_closed());
        a.close().await;
        assert_eq!(b.read_line().await, Err(Error::ClosedStream));
    }

    #[tokio::test]
    async fn test_recorded_fault_reported() {
        let fault = FaultSlot::default();
        let (a, _b) = stream_pair_with_fault(fault.clone()).await;

        fault.record(Error::QuotaExceeded);
        a.close().await;
        assert_eq!(a.read_line().await, Err(Error::QuotaExceeded));
    }

    #[tokio::test]
    async fn test_overlong_line_rejected() {
        let (conn, b) = connected(FaultSlot::default()).await;
        let (mut io, ..) = conn.into_parts();

        let writer = tokio::spawn(async move {
            let _ = io.write_all(&vec![b'a'; MAX_LINE_LEN + 16]).await;
            io
        });
        assert!(matches!(b.read_line().await, Err(Error::Protocol(_))));
        drop(writer);

        let (a, _b) = stream_pair().await;
        let long = "a".repeat(MAX_LINE_LEN);
        assert!(matches!(a.write_line(&long).await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_invalid_utf8_rejected() {
        let (conn, b) = connected(FaultSlot::default()).await;
        let (mut io, ..) = conn.into_parts();

        io.write_all(b"\xff\xfeoops\n").await.unwrap();
        io.write_all(b"fine\n").await.unwrap();
        assert!(matches!(b.read_line().await, Err(Error::Protocol(_))));
        assert_eq!(b.read_line().await.unwrap(), "fine\n");
    }
}
