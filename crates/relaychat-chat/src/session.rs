//! Duplex chat session
//!
//! Two loops share one [`Stream`]:
//!
//! - **inbound**: stream line -> highlighted local output
//! - **outbound**: local input line -> stream
//!
//! Whichever loop ends first closes the stream, which ends the other one on
//! its pending operation.

use console::Style;
use relaychat_core::{Error, Stream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

/// Local line source (stdin in the CLI)
pub type SessionInput = Box<dyn AsyncBufRead + Send + Unpin>;

/// Local line sink (stdout in the CLI)
pub type SessionOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// Why one loop of a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The remote peer closed its side
    RemoteClosed,
    /// Local input reached end of file
    LocalInputClosed,
    /// The other loop closed the stream first
    StreamClosed,
    /// Read, write or relay failure
    Failed(Error),
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
    /// Inbound loop outcome
    pub inbound: EndReason,
    /// Outbound loop outcome
    pub outbound: EndReason,
}

impl SessionEnd {
    /// The outcome of the loop that ended the session
    #[must_use]
    pub fn cause(&self) -> &EndReason {
        if self.inbound == EndReason::StreamClosed {
            &self.outbound
        } else {
            &self.inbound
        }
    }
}

/// One chat over one stream
pub struct ChatSession {
    stream: Stream,
    input: SessionInput,
    output: SessionOutput,
    color: bool,
}

impl ChatSession {
    /// Session over `stream` with the given local input and output
    ///
    /// Incoming lines are highlighted green unless disabled with
    /// [`ChatSession::with_color`].
    #[must_use]
    pub fn new(stream: Stream, input: SessionInput, output: SessionOutput) -> Self {
        Self {
            stream,
            input,
            output,
            color: true,
        }
    }

    /// Enable or disable highlighting of incoming lines
    #[must_use]
    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    /// Run both loops to completion
    pub async fn run(self) -> SessionEnd {
        let remote = self.stream.remote_peer();
        debug!(remote = %remote.short(), "chat session started");

        let style = Style::new().green().force_styling(self.color);
        let inbound = tokio::spawn(inbound_loop(self.stream.clone(), self.output, style));
        let outbound = tokio::spawn(outbound_loop(self.stream, self.input));

        let end = SessionEnd {
            inbound: joined(inbound).await,
            outbound: joined(outbound).await,
        };
        debug!(remote = %remote.short(), cause = ?end.cause(), "chat session ended");
        end
    }
}

async fn joined(handle: JoinHandle<EndReason>) -> EndReason {
    handle
        .await
        .unwrap_or_else(|e| EndReason::Failed(Error::Io(format!("session task failed: {e}"))))
}

async fn inbound_loop(stream: Stream, mut output: SessionOutput, style: Style) -> EndReason {
    loop {
        let line = match stream.read_line().await {
            Ok(line) => line,
            Err(Error::ClosedStream) => {
                let local = stream.is_closed();
                stream.close().await;
                return if local {
                    EndReason::StreamClosed
                } else {
                    EndReason::RemoteClosed
                };
            }
            Err(e) => {
                stream.close().await;
                return EndReason::Failed(e);
            }
        };

        let text = line.strip_suffix('\n').unwrap_or(&line);
        let rendered = format!("{}\n", style.apply_to(text));
        let written = async {
            output.write_all(rendered.as_bytes()).await?;
            output.flush().await
        };
        if let Err(e) = written.await {
            stream.close().await;
            return EndReason::Failed(e.into());
        }
    }
}

async fn outbound_loop(stream: Stream, mut input: SessionInput) -> EndReason {
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            read = input.read_line(&mut line) => read,
            () = stream.closed() => return EndReason::StreamClosed,
        };

        match read {
            Ok(0) => {
                stream.close().await;
                return EndReason::LocalInputClosed;
            }
            Ok(_) => {
                if let Err(e) = stream.write_line(&line).await {
                    let local = stream.is_closed();
                    stream.close().await;
                    return match e {
                        Error::ClosedStream if local => EndReason::StreamClosed,
                        other => EndReason::Failed(other),
                    };
                }
            }
            Err(e) => {
                stream.close().await;
                return EndReason::Failed(e.into());
            }
        }
    }
}
