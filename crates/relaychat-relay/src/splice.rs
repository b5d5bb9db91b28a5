//! Relay-side circuit forwarding
//!
//! Copies [`CircuitFrame::Data`] between the dialer and the destination
//! without looking at payload content, charging every byte to the
//! destination reservation's [`Quota`].

use std::sync::Arc;
use std::time::Duration;

use relaychat_core::{Connection, ConnectionReader, ConnectionWriter};
use tokio::sync::watch;
use tracing::trace;

use crate::protocol::{CircuitFrame, CloseReason};
use crate::state::Quota;

/// How long a closed circuit waits for both endpoints to hang up
const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// First reason recorded wins; both directions stop on it
type StopSignal = watch::Sender<Option<CloseReason>>;

/// Forward frames between `src` and `dst` until one side closes, the quota
/// runs out, or `teardown` fires
///
/// Both endpoints receive a [`CircuitFrame::Close`] carrying the returned
/// reason before their connections are shut down. A direction only stops
/// between frames, so the close frame never follows half a data frame.
pub async fn splice(
    src: Connection,
    dst: Connection,
    quota: Arc<Quota>,
    mut teardown: watch::Receiver<Option<CloseReason>>,
) -> CloseReason {
    let (mut src_rd, mut src_wr) = src.split();
    let (mut dst_rd, mut dst_wr) = dst.split();
    let (stop, _) = watch::channel(None);

    tokio::join!(
        forward(&mut src_rd, &mut dst_wr, &quota, &stop),
        forward(&mut dst_rd, &mut src_wr, &quota, &stop),
        async {
            let mut stopped = stop.subscribe();
            tokio::select! {
                reason = wait_reason(&mut teardown) => record(&stop, reason),
                _ = wait_reason(&mut stopped) => {}
            }
        },
    );
    let reason = stop.borrow().unwrap_or(CloseReason::Normal);

    for writer in [&mut src_wr, &mut dst_wr] {
        let _ = writer.send(&CircuitFrame::Close(reason)).await;
        writer.shutdown().await;
    }

    // Dropping a socket with unread input resets it, which can discard the
    // close frame before the endpoint reads it
    let _ = tokio::time::timeout(CLOSE_LINGER, async {
        tokio::join!(drain(&mut src_rd), drain(&mut dst_rd))
    })
    .await;

    reason
}

fn record(stop: &StopSignal, reason: CloseReason) {
    stop.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    });
}

async fn drain(from: &mut ConnectionReader) {
    while from.recv::<CircuitFrame>().await.is_ok() {}
}

async fn forward(
    from: &mut ConnectionReader,
    to: &mut ConnectionWriter,
    quota: &Quota,
    stop: &StopSignal,
) {
    let mut stopped = stop.subscribe();
    let reason = loop {
        // Only the read is abandoned on stop; a started write always finishes
        let frame = tokio::select! {
            biased;
            _ = wait_reason(&mut stopped) => return,
            frame = from.recv::<CircuitFrame>() => frame,
        };
        let bytes = match frame {
            Ok(CircuitFrame::Data(bytes)) => bytes,
            Ok(CircuitFrame::Close(_)) | Err(_) => break CloseReason::Normal,
        };
        if bytes.is_empty() {
            continue;
        }

        let wanted = bytes.len();
        let granted = quota.consume(wanted as u64) as usize;
        if granted > 0 {
            let chunk = if granted == wanted {
                bytes
            } else {
                bytes[..granted].to_vec()
            };
            trace!(from = %from.remote_peer().short(), len = granted, "forward");
            if to.send(&CircuitFrame::Data(chunk)).await.is_err() {
                break CloseReason::Normal;
            }
        }
        if granted < wanted {
            break CloseReason::QuotaExceeded;
        }
    };
    record(stop, reason);
}

async fn wait_reason(rx: &mut watch::Receiver<Option<CloseReason>>) -> CloseReason {
    loop {
        let current = *rx.borrow_and_update();
        if let Some(reason) = current {
            return reason;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::conn_pair;

    async fn recv_frame(conn: &mut Connection) -> CircuitFrame {
        tokio::time::timeout(Duration::from_secs(5), conn.recv::<CircuitFrame>())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_forwards_both_directions() {
        let (mut dialer, relay_src) = conn_pair().await;
        let (relay_dst, mut listener) = conn_pair().await;
        let (_teardown, rx) = watch::channel(None);
        let quota = Arc::new(Quota::new(1024));

        let relay = tokio::spawn(splice(relay_src, relay_dst, Arc::clone(&quota), rx));

        dialer.send(&CircuitFrame::Data(b"hello\n".to_vec())).await.unwrap();
        assert_eq!(recv_frame(&mut listener).await, CircuitFrame::Data(b"hello\n".to_vec()));

        listener.send(&CircuitFrame::Data(b"hi there\n".to_vec())).await.unwrap();
        assert_eq!(recv_frame(&mut dialer).await, CircuitFrame::Data(b"hi there\n".to_vec()));

        dialer.send(&CircuitFrame::Close(CloseReason::Normal)).await.unwrap();
        assert_eq!(recv_frame(&mut listener).await, CircuitFrame::Close(CloseReason::Normal));
        drop((dialer, listener));
        assert_eq!(relay.await.unwrap(), CloseReason::Normal);
        assert_eq!(quota.remaining(), 1024 - 6 - 9);
    }

    #[tokio::test]
    async fn test_quota_truncates_and_closes() {
        let (mut dialer, relay_src) = conn_pair().await;
        let (relay_dst, mut listener) = conn_pair().await;
        let (_teardown, rx) = watch::channel(None);

        let relay = tokio::spawn(splice(relay_src, relay_dst, Arc::new(Quota::new(10)), rx));

        dialer.send(&CircuitFrame::Data(vec![1; 8])).await.unwrap();
        dialer.send(&CircuitFrame::Data(vec![2; 8])).await.unwrap();

        assert_eq!(recv_frame(&mut listener).await, CircuitFrame::Data(vec![1; 8]));
        assert_eq!(recv_frame(&mut listener).await, CircuitFrame::Data(vec![2; 2]));
        assert_eq!(
            recv_frame(&mut listener).await,
            CircuitFrame::Close(CloseReason::QuotaExceeded)
        );
        assert_eq!(
            recv_frame(&mut dialer).await,
            CircuitFrame::Close(CloseReason::QuotaExceeded)
        );
        drop((dialer, listener));
        assert_eq!(relay.await.unwrap(), CloseReason::QuotaExceeded);
    }

    #[tokio::test]
    async fn test_exhausted_quota_closes_on_first_byte() {
        let (mut dialer, relay_src) = conn_pair().await;
        let (relay_dst, mut listener) = conn_pair().await;
        let (_teardown, rx) = watch::channel(None);

        let relay = tokio::spawn(splice(relay_src, relay_dst, Arc::new(Quota::new(0)), rx));

        dialer.send(&CircuitFrame::Data(vec![7])).await.unwrap();
        assert_eq!(
            recv_frame(&mut listener).await,
            CircuitFrame::Close(CloseReason::QuotaExceeded)
        );
        drop((dialer, listener));
        assert_eq!(relay.await.unwrap(), CloseReason::QuotaExceeded);
    }

    #[tokio::test]
    async fn test_teardown_closes_both_ends() {
        let (mut dialer, relay_src) = conn_pair().await;
        let (relay_dst, mut listener) = conn_pair().await;
        let (teardown, rx) = watch::channel(None);

        let relay = tokio::spawn(splice(relay_src, relay_dst, Arc::new(Quota::new(1024)), rx));
        teardown.send_replace(Some(CloseReason::ReservationExpired));

        assert_eq!(
            recv_frame(&mut dialer).await,
            CircuitFrame::Close(CloseReason::ReservationExpired)
        );
        assert_eq!(
            recv_frame(&mut listener).await,
            CircuitFrame::Close(CloseReason::ReservationExpired)
        );
        drop((dialer, listener));
        assert_eq!(relay.await.unwrap(), CloseReason::ReservationExpired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_is_bounded() {
        let (_dialer, relay_src) = conn_pair().await;
        let (relay_dst, _listener) = conn_pair().await;
        let (teardown, rx) = watch::channel(None);

        let relay = tokio::spawn(splice(relay_src, relay_dst, Arc::new(Quota::new(1024)), rx));
        teardown.send_replace(Some(CloseReason::Normal));

        // Neither endpoint hangs up; the relay gives up on them anyway
        assert_eq!(relay.await.unwrap(), CloseReason::Normal);
    }

    #[tokio::test]
    async fn test_teardown_waits_for_frame_in_flight() {
        let (mut dialer, relay_src) = conn_pair().await;
        let (relay_dst, mut listener) = conn_pair().await;
        let (teardown, rx) = watch::channel(None);

        let relay = tokio::spawn(splice(relay_src, relay_dst, Arc::new(Quota::new(1 << 20)), rx));

        // Larger than the pipe, so the relay is mid-write when teardown fires
        let payload = vec![9u8; 256 * 1024];
        let sent = payload.clone();
        let sender = tokio::spawn(async move {
            dialer.send(&CircuitFrame::Data(sent)).await.unwrap();
            dialer
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        teardown.send_replace(Some(CloseReason::ReservationExpired));

        loop {
            match recv_frame(&mut listener).await {
                CircuitFrame::Data(bytes) => assert_eq!(bytes, payload),
                CircuitFrame::Close(reason) => {
                    assert_eq!(reason, CloseReason::ReservationExpired);
                    break;
                }
            }
        }
        drop((sender.await.unwrap(), listener));
        assert_eq!(relay.await.unwrap(), CloseReason::ReservationExpired);
    }
}
