//! End-to-end tests: relay, listener and dialer on loopback

use std::time::Duration;

use relaychat_chat::{CHAT_PROTOCOL, EndReason};
use relaychat_core::{Error, Identity, Multiaddr, RejectReason};
use relaychat_integration_tests::fixtures::{
    ChatListener, RelayNode, dial, open_limits, terminal_session,
};
use relaychat_relay::RelayLimits;

const GREEN: &str = "\u{1b}[32m";
const RESET: &str = "\u{1b}[0m";

fn green(line: &str) -> String {
    format!("{GREEN}{line}{RESET}\n")
}

// ============================================================================
// Chat
// ============================================================================

#[tokio::test]
async fn test_chat_through_relay() {
    let relay = RelayNode::start(open_limits()).await;
    let mut listener = ChatListener::start(&relay).await.unwrap();

    let prefix = relay.descriptor.circuit_addr().to_string();
    assert!(listener.address().starts_with(&prefix));
    assert!(
        listener
            .address()
            .ends_with(&format!("/p2p/{}", listener.host.peer_id()))
    );

    let stream = dial(&relay, &listener.address(), CHAT_PROTOCOL)
        .await
        .unwrap();
    assert_eq!(stream.remote_peer(), listener.host.peer_id());

    let (session, mut dialer) = terminal_session(stream, true);
    let dialer_run = tokio::spawn(session.run());
    let mut inbound = listener.next_terminal().await;
    assert_ne!(inbound.remote, listener.host.peer_id());

    dialer.type_line("hello\n").await;
    let expected = green("hello");
    assert_eq!(inbound.read_screen(expected.len()).await, expected);

    inbound.type_line("hi there\n").await;
    let expected = green("hi there");
    assert_eq!(dialer.read_screen(expected.len()).await, expected);

    // Dialer's stdin closes: both sessions wind down
    drop(dialer.keyboard);
    let end = dialer_run.await.unwrap();
    assert_eq!(end.cause(), &EndReason::LocalInputClosed);
    assert_eq!(inbound.read_screen_to_end().await, "");
}

#[tokio::test]
async fn test_listener_serves_concurrent_chats() {
    let relay = RelayNode::start(open_limits()).await;
    let mut listener = ChatListener::start(&relay).await.unwrap();

    let first = dial(&relay, &listener.address(), CHAT_PROTOCOL)
        .await
        .unwrap();
    let mut first_inbound = listener.next_terminal().await;
    let second = dial(&relay, &listener.address(), CHAT_PROTOCOL)
        .await
        .unwrap();
    let mut second_inbound = listener.next_terminal().await;

    assert_ne!(first_inbound.remote, second_inbound.remote);

    second.write_line("from second").await.unwrap();
    first.write_line("from first").await.unwrap();

    let expected = green("from first");
    assert_eq!(first_inbound.read_screen(expected.len()).await, expected);
    let expected = green("from second");
    assert_eq!(second_inbound.read_screen(expected.len()).await, expected);

    assert_eq!(relay.service.circuit_count().await, 2);
    first.close().await;
    second.close().await;
    assert_eq!(first_inbound.read_screen_to_end().await, "");
    assert_eq!(second_inbound.read_screen_to_end().await, "");
}

#[tokio::test]
async fn test_quota_ends_circuit() {
    let relay = RelayNode::start(RelayLimits {
        max_data_per_reservation: 2048,
        ..open_limits()
    })
    .await;
    let mut listener = ChatListener::start(&relay).await.unwrap();
    assert_eq!(listener.reservation.data_limit(), 2048);

    let stream = dial(&relay, &listener.address(), CHAT_PROTOCOL)
        .await
        .unwrap();
    let mut inbound = listener.next_terminal().await;

    let line = "x".repeat(99);
    for _ in 0..64 {
        if let Err(e) = stream.write_line(&line).await {
            assert_eq!(e, Error::QuotaExceeded);
            break;
        }
    }

    let err = tokio::time::timeout(Duration::from_secs(10), stream.read_line())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err, Error::QuotaExceeded);

    // Handshake bytes count too, so strictly fewer line bytes arrive
    let screen = inbound.read_screen_to_end().await;
    let delivered = screen.matches('x').count();
    assert!(delivered > 0);
    assert!(delivered < 2048, "{delivered} bytes passed a 2048 byte quota");

    // The exhausted reservation refuses new circuits' traffic as well
    let retry = dial(&relay, &listener.address(), CHAT_PROTOCOL).await;
    assert!(retry.is_err());
}

// ============================================================================
// Circuit refusal
// ============================================================================

#[tokio::test]
async fn test_zero_circuits_rejects_dialer() {
    let relay = RelayNode::start(RelayLimits {
        max_circuits: 0,
        ..open_limits()
    })
    .await;
    let listener = ChatListener::start(&relay).await.unwrap();

    let err = dial(&relay, &listener.address(), CHAT_PROTOCOL)
        .await
        .unwrap_err();
    assert_eq!(err, Error::CircuitRejected(RejectReason::AtCapacity));
}

#[tokio::test]
async fn test_dial_peer_without_reservation() {
    let relay = RelayNode::start(open_limits()).await;
    let stranger = Identity::generate().peer_id();
    let destination = format!("{}/p2p/{stranger}", relay.descriptor.circuit_addr());

    let err = dial(&relay, &destination, CHAT_PROTOCOL)
        .await
        .unwrap_err();
    assert_eq!(err, Error::CircuitRejected(RejectReason::NoSuchReservation));
}

#[tokio::test]
async fn test_dial_malformed_destination() {
    let relay = RelayNode::start(open_limits()).await;
    let listener = ChatListener::start(&relay).await.unwrap();
    let other_relay = Identity::generate().peer_id();

    let wrong_relay = format!(
        "/ip4/127.0.0.1/tcp/4001/p2p/{other_relay}/p2p-circuit/p2p/{}",
        listener.host.peer_id()
    );
    for destination in ["not an address".to_string(), wrong_relay] {
        let err = dial(&relay, &destination, CHAT_PROTOCOL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDestination(_)), "{err:?}");
    }
}

#[tokio::test]
async fn test_unsupported_protocol() {
    let relay = RelayNode::start(open_limits()).await;
    let listener = ChatListener::start(&relay).await.unwrap();

    let err = dial(&relay, &listener.address(), "/file-transfer/1.0.0")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::StreamOpenFailed(_)), "{err:?}");
}

// ============================================================================
// Reservations
// ============================================================================

#[tokio::test]
async fn test_reservation_capacity() {
    let relay = RelayNode::start(RelayLimits {
        max_reservations: 1,
        ..open_limits()
    })
    .await;

    let first = ChatListener::start(&relay).await.unwrap();
    let err = ChatListener::start(&relay).await.err().unwrap();
    assert_eq!(err, Error::ReservationDenied(RejectReason::AtCapacity));

    // The slot frees once the holder disconnects
    drop(first);
    for _ in 0..100 {
        match ChatListener::start(&relay).await {
            Ok(_) => return,
            Err(Error::ReservationDenied(RejectReason::AtCapacity)) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    panic!("reservation slot never freed");
}

#[tokio::test]
async fn test_reservation_expiry() {
    let relay = RelayNode::start(RelayLimits {
        reservation_duration: Duration::from_secs(1),
        ..open_limits()
    })
    .await;
    let listener = ChatListener::start_with_renewal(&relay, false).await.unwrap();
    let address = listener.address();

    tokio::time::timeout(Duration::from_secs(10), listener.reservation.closed())
        .await
        .unwrap();
    assert!(!listener.host.addrs().iter().any(Multiaddr::is_circuit));
    assert_eq!(relay.service.reservation_count().await, 0);

    let err = dial(&relay, &address, CHAT_PROTOCOL).await.unwrap_err();
    assert_eq!(err, Error::CircuitRejected(RejectReason::NoSuchReservation));
}

#[tokio::test]
async fn test_renewed_reservation_stays_dialable() {
    let relay = RelayNode::start(RelayLimits {
        reservation_duration: Duration::from_secs(1),
        ..open_limits()
    })
    .await;
    let mut listener = ChatListener::start(&relay).await.unwrap();

    // Several lease lengths later the published address still works
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(!listener.reservation.is_closed());
    assert_eq!(relay.service.reservation_count().await, 1);

    let stream = dial(&relay, &listener.address(), CHAT_PROTOCOL)
        .await
        .unwrap();
    let mut inbound = listener.next_terminal().await;
    stream.write_line("still here").await.unwrap();
    let expected = green("still here");
    assert_eq!(inbound.read_screen(expected.len()).await, expected);
}
