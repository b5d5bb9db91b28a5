//! Process stdin shared by chat sessions
//!
//! One plain thread reads stdin lines into a channel. Each session reads
//! through its own [`SharedStdin::input`]; whichever session is waiting
//! receives the next line. A session that ends while waiting gives the
//! channel back untouched, so no typed line is lost and nothing blocks the
//! runtime from shutting down.

use std::future::Future;
use std::io::BufRead;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use relaychat_chat::SessionInput;
use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tokio::sync::{Mutex, mpsc};

/// Lines read ahead of the sessions consuming them
const LINE_QUEUE: usize = 64;

type Lines = Arc<Mutex<mpsc::Receiver<Vec<u8>>>>;
type NextLine = Pin<Box<dyn Future<Output = Option<Vec<u8>>> + Send>>;

/// Handle to the stdin line channel
#[derive(Debug, Clone)]
pub struct SharedStdin {
    lines: Lines,
}

impl SharedStdin {
    /// Start reading the process's stdin on a background thread
    #[must_use]
    pub fn spawn() -> Self {
        Self::from_reader(std::io::BufReader::new(std::io::stdin()))
    }

    /// Start reading `reader` on a background thread
    #[must_use]
    pub fn from_reader<R: BufRead + Send + 'static>(mut reader: R) -> Self {
        let (tx, rx) = mpsc::channel(LINE_QUEUE);
        let spawned = std::thread::Builder::new()
            .name("relaychat-stdin".to_string())
            .spawn(move || {
                loop {
                    let mut line = Vec::new();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) => break,
                        Ok(_) => {
                            if tx.blocking_send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "stdin read failed");
                            break;
                        }
                    }
                }
            });
        // No reader thread means the sessions see end of input at once
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to start stdin reader");
        }
        Self::from_channel(rx)
    }

    /// Serve lines arriving on `rx`
    #[must_use]
    pub fn from_channel(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            lines: Arc::new(Mutex::new(rx)),
        }
    }

    /// A session's view of stdin; end of input once stdin closes
    #[must_use]
    pub fn input(&self) -> SessionInput {
        Box::new(BufReader::new(StdinReader {
            lines: Arc::clone(&self.lines),
            next: None,
            pending: Vec::new(),
            offset: 0,
        }))
    }
}

struct StdinReader {
    lines: Lines,
    next: Option<NextLine>,
    pending: Vec<u8>,
    offset: usize,
}

impl AsyncRead for StdinReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset == self.pending.len() {
            let lines = Arc::clone(&self.lines);
            let next = self
                .next
                .get_or_insert_with(|| Box::pin(async move { lines.lock().await.recv().await }));
            let line = ready!(next.as_mut().poll(cx));
            self.next = None;

            match line {
                Some(line) => {
                    self.pending = line;
                    self.offset = 0;
                }
                // End of input
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(self.pending.len() - self.offset);
        let end = self.offset + n;
        buf.put_slice(&self.pending[self.offset..end]);
        self.offset = end;
        Poll::Ready(Ok(()))
    }
}
