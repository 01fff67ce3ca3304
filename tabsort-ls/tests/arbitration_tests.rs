//! Integration tests for handshake validation, primary election and restart

mod helpers;

use futures::{SinkExt, StreamExt};
use helpers::*;
use std::time::Duration;
use tabsort_common::events::TabsortEvent;

#[tokio::test]
async fn test_valid_handshake_becomes_primary_and_closes_other_ports() {
    let mut service = TestService::start(3, FakeSource::new()).await;
    let primary = service.ports[1];

    let (_client, notice) = handshake(primary).await;
    assert_eq!(notice, established(primary));

    let event = service
        .wait_for(|e| matches!(e, TabsortEvent::PrimaryEstablished { .. }))
        .await;
    assert!(matches!(event, TabsortEvent::PrimaryEstablished { port, .. } if port == primary));

    // Non-primary listeners are gone before the primary is told it may stream
    for &port in service.ports.iter().filter(|&&p| p != primary) {
        let result =
            tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}", port)).await;
        assert!(result.is_err(), "port {} should be closed", port);
    }

    service.stop().await;
}

#[tokio::test]
async fn test_invalid_code_is_rejected_without_election() {
    let service = TestService::start(2, FakeSource::new()).await;
    let port = service.ports[0];

    let mut client = connect(port).await;
    send_text(&mut client, "NOT_THE_TOKEN").await;
    assert_eq!(
        recv_notice(&mut client).await.as_deref(),
        Some("Invalid code, closing connection.")
    );
    assert_eq!(recv_text(&mut client).await, None);

    // Election state untouched: a valid client can still become primary
    let (_client, notice) = handshake(port).await;
    assert_eq!(notice, established(port));

    service.stop().await;
}

#[tokio::test]
async fn test_silent_client_gets_handshake_timeout() {
    let service = TestService::start_with(
        1,
        FakeSource::new(),
        |config| config.handshake_timeout = Duration::from_millis(300),
        |_| {},
    )
    .await;

    let mut client = connect(service.ports[0]).await;
    assert_eq!(
        recv_notice(&mut client).await.as_deref(),
        Some("Handshake timeout.")
    );
    assert_eq!(recv_text(&mut client).await, None);

    service.stop().await;
}

#[tokio::test]
async fn test_handshake_timeout_counts_from_tcp_connect() {
    let service = TestService::start_with(
        1,
        FakeSource::new(),
        |config| config.handshake_timeout = Duration::from_millis(1000),
        |_| {},
    )
    .await;
    let port = service.ports[0];

    // Spend most of the allowance before the WebSocket upgrade
    let started = std::time::Instant::now();
    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    let (mut client, _) =
        tokio_tungstenite::client_async(format!("ws://127.0.0.1:{}", port), stream)
            .await
            .unwrap();

    let frame = tokio::time::timeout(WAIT, client.next())
        .await
        .expect("no reply from server");
    let elapsed = started.elapsed();
    match frame {
        Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["message"], "Handshake timeout.");
        }
        other => panic!("unexpected frame: {:?}", other),
    }
    assert!(
        elapsed < Duration::from_millis(1500),
        "timeout fired {:?} after connect",
        elapsed
    );

    service.stop().await;
}

#[tokio::test]
async fn test_concurrent_handshakes_elect_exactly_one_primary() {
    let service = TestService::start(2, FakeSource::new()).await;
    let (port_a, port_b) = (service.ports[0], service.ports[1]);

    let mut client_a = connect(port_a).await;
    let mut client_b = connect(port_b).await;

    let token = tabsort_common::config::DEFAULT_TOKEN;
    let (sent_a, sent_b) = tokio::join!(
        client_a.send(tokio_tungstenite::tungstenite::Message::Text(token.into())),
        client_b.send(tokio_tungstenite::tungstenite::Message::Text(token.into())),
    );
    sent_a.unwrap();
    sent_b.unwrap();

    let (reply_a, reply_b) = tokio::join!(recv_notice(&mut client_a), recv_notice(&mut client_b));
    let (reply_a, reply_b) = (reply_a.unwrap(), reply_b.unwrap());

    let (winner, loser_reply) = if reply_a == established(port_a) {
        (port_a, reply_b)
    } else {
        assert_eq!(reply_b, established(port_b), "no primary elected");
        (port_b, reply_a)
    };

    assert!(
        loser_reply.contains(&format!("primary port {}", winner)),
        "rejection should name the primary port: {}",
        loser_reply
    );

    service.stop().await;
}

#[tokio::test]
async fn test_second_client_on_primary_port_is_rejected() {
    let service = TestService::start(1, FakeSource::new()).await;
    let port = service.ports[0];

    let (_primary, notice) = handshake(port).await;
    assert_eq!(notice, established(port));

    let (mut second, notice) = handshake(port).await;
    assert_eq!(
        notice,
        format!(
            "Another client is already connected on primary port {}. Closing this connection.",
            port
        )
    );
    assert_eq!(recv_text(&mut second).await, None);

    service.stop().await;
}

#[tokio::test]
async fn test_primary_disconnect_restarts_listeners() {
    let mut service = TestService::start(2, FakeSource::new()).await;
    let first = service.ports[0];

    let (mut client, notice) = handshake(first).await;
    assert_eq!(notice, established(first));
    client.close(None).await.unwrap();
    drop(client);

    let event = service
        .wait_for(|e| matches!(e, TabsortEvent::PrimaryDisconnected { .. }))
        .await;
    assert!(matches!(event, TabsortEvent::PrimaryDisconnected { port, .. } if port == first));

    let event = service
        .wait_for(|e| matches!(e, TabsortEvent::PoolStarted { .. }))
        .await;
    match event {
        TabsortEvent::PoolStarted { cycle, ports, .. } => {
            assert_eq!(cycle, 2);
            assert_eq!(ports.len(), 2);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // Every port is open again, and a new client can become primary anywhere
    let second = service.ports[1];
    let (_client, notice) = handshake(second).await;
    assert_eq!(notice, established(second));

    service.stop().await;
}

#[tokio::test]
async fn test_busy_port_is_skipped() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken_port = taken.local_addr().unwrap().port();

    let mut service = TestService::start_with(
        1,
        FakeSource::new(),
        |config| config.ports.insert(0, taken_port),
        |_| {},
    )
    .await;
    let free = service.ports[0];
    assert_ne!(free, taken_port);

    let (_client, notice) = handshake(free).await;
    assert_eq!(notice, established(free));
    service
        .wait_for(|e| matches!(e, TabsortEvent::PrimaryEstablished { .. }))
        .await;

    service.stop().await;
    drop(taken);
}

#[tokio::test]
async fn test_pool_retries_until_a_port_frees_up() {
    let blockers: Vec<std::net::TcpListener> = (0..2)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let mut blocked: Vec<u16> = blockers
        .iter()
        .map(|l| l.local_addr().unwrap().port())
        .collect();
    blocked.sort_unstable();

    let mut service = {
        let blocked = blocked.clone();
        TestService::launch(
            0,
            FakeSource::new(),
            move |config| config.ports = blocked,
            |_| {},
        )
    };

    let event = service
        .wait_for(|e| matches!(e, TabsortEvent::PoolStartFailed { .. }))
        .await;
    assert!(matches!(event, TabsortEvent::PoolStartFailed { cycle: 1, .. }));

    drop(blockers);

    match service
        .wait_for(|e| matches!(e, TabsortEvent::PoolStarted { .. }))
        .await
    {
        TabsortEvent::PoolStarted { cycle, ports, .. } => {
            assert!(cycle >= 2);
            assert_eq!(ports, blocked);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let (_client, notice) = handshake(blocked[0]).await;
    assert_eq!(notice, established(blocked[0]));

    service.stop().await;
}
