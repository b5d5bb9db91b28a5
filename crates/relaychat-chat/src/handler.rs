//! Inbound chat streams

use std::sync::Arc;

use relaychat_core::{Connection, Host, PeerId, Stream};
use tracing::{info, warn};

use crate::session::{ChatSession, EndReason, SessionInput, SessionOutput};

/// Protocol identifier negotiated for chat streams
pub const CHAT_PROTOCOL: &str = "/chat/1.0.0";

/// Serves inbound chat streams on a host
pub struct StreamHandler;

impl StreamHandler {
    /// Start a [`ChatSession`] for every inbound [`CHAT_PROTOCOL`] stream
    ///
    /// `io` is called once per stream with the remote peer and supplies that
    /// session's local input and output.
    pub fn register<F>(host: &Host, color: bool, io: F)
    where
        F: Fn(&PeerId) -> (SessionInput, SessionOutput) + Send + Sync + 'static,
    {
        let io = Arc::new(io);
        host.set_stream_handler(CHAT_PROTOCOL, move |conn: Connection| {
            let io = Arc::clone(&io);
            async move {
                let remote = conn.remote_peer();
                info!(remote = %remote.short(), "new chat stream");

                let (input, output) = io(&remote);
                let end = ChatSession::new(Stream::new(conn), input, output)
                    .with_color(color)
                    .run()
                    .await;

                match end.cause() {
                    EndReason::Failed(e) => {
                        warn!(remote = %remote.short(), error = %e, "chat stream failed");
                    }
                    cause => info!(remote = %remote.short(), ?cause, "chat stream ended"),
                }
            }
        });
    }

    /// Stop accepting chat streams on `host`
    pub fn unregister(host: &Host) {
        host.remove_stream_handler(CHAT_PROTOCOL);
    }
}
