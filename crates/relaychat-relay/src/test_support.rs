//! Shared fixtures for unit tests

use std::sync::{Arc, Mutex};

use relaychat_core::{Connection, FaultSlot, Host, Identity};

const TEST_PROTOCOL: &str = "/relaychat/test/1";

/// Authenticated connection pair over an in-memory pipe
pub(crate) async fn conn_pair() -> (Connection, Connection) {
    let server = Host::new(Identity::generate());
    let client = Host::new(Identity::generate());

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    server.set_stream_handler(TEST_PROTOCOL, move |conn: Connection| {
        let tx = Arc::clone(&tx);
        async move {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(conn);
            }
        }
    });

    let (a, b) = tokio::io::duplex(64 * 1024);
    let accept = {
        let server = server.clone();
        tokio::spawn(async move { server.accept_inbound(Box::new(b), FaultSlot::default()).await })
    };
    let client_end = client
        .upgrade_outbound(Box::new(a), Some(server.peer_id()), TEST_PROTOCOL, FaultSlot::default())
        .await
        .unwrap();
    accept.await.unwrap().unwrap();
    (client_end, rx.await.unwrap())
}
