//! Reconnect Backoff Integration Tests
//!
//! Drives the connection manager against a scripted transport under paused
//! time and checks the retry schedule.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use market_data_hub::{
    ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState,
    Credentials, FeedSettings, MockTransport, OpenOutcome,
};
use tokio::sync::broadcast;

const AUTH_REJECTED: &str = r#"{"type":"error","data":{"message":"invalid key","code":401}}"#;

fn manager(transport: &Arc<MockTransport>, max_attempts: u32) -> ConnectionManager {
    let mut settings = FeedSettings::new("mock://feed");
    settings.max_reconnect_attempts = max_attempts;
    build(transport, &settings)
}

fn authenticated_manager(transport: &Arc<MockTransport>, max_attempts: u32) -> ConnectionManager {
    let mut settings = FeedSettings::new("mock://feed");
    settings.max_reconnect_attempts = max_attempts;
    settings.credentials = Some(Credentials::new("key", "secret").unwrap());
    build(transport, &settings)
}

fn build(transport: &Arc<MockTransport>, settings: &FeedSettings) -> ConnectionManager {
    ConnectionManager::new(
        transport.clone(),
        ConnectionConfig::from_feed_settings(settings),
    )
    .unwrap()
}

/// Next lifecycle event, skipping `Error` notifications.
async fn next_lifecycle(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    loop {
        match events.recv().await.unwrap() {
            ConnectionEvent::Error(_) => {}
            event => return event,
        }
    }
}

fn assert_close(actual: Duration, expected: Duration) {
    let diff = actual.abs_diff(expected);
    assert!(
        diff <= Duration::from_millis(5),
        "expected {expected:?}, got {actual:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn exhausts_attempts_with_doubling_delays() {
    let transport = Arc::new(MockTransport::new("mock://feed"));
    transport.fail_by_default(true);
    let manager = manager(&transport, 5);
    let mut events = manager.subscribe_events();

    assert!(manager.connect().await.is_err());

    let mut scheduled = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            ConnectionEvent::Reconnecting { attempt, delay } => scheduled.push((attempt, delay)),
            ConnectionEvent::MaxReconnectAttemptsReached { attempts } => {
                assert_eq!(attempts, 5);
                break;
            }
            _ => {}
        }
    }

    let expected: Vec<_> = [1, 2, 4, 8, 16]
        .into_iter()
        .map(Duration::from_secs)
        .collect();
    assert_eq!(
        scheduled,
        (1..=5).zip(expected.iter().copied()).collect::<Vec<_>>()
    );

    // Initial attempt plus five retries.
    let opens = transport.open_instants();
    assert_eq!(opens.len(), 6);
    for (pair, want) in opens.windows(2).zip(&expected) {
        assert_close(pair[1] - pair[0], *want);
    }

    assert_eq!(manager.state(), ConnectionState::Terminated);
    assert!(manager.snapshot().last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn recovers_before_exhaustion() {
    let transport = Arc::new(MockTransport::new("mock://feed"));
    transport.script([
        OpenOutcome::Fail("refused".to_string()),
        OpenOutcome::Fail("refused".to_string()),
        OpenOutcome::Accept,
    ]);
    let manager = manager(&transport, 5);
    let mut events = manager.subscribe_events();

    assert!(manager.connect().await.is_err());

    loop {
        if events.recv().await.unwrap() == ConnectionEvent::Connected {
            break;
        }
    }

    assert!(manager.is_connected());
    assert_eq!(transport.open_count(), 3);
    assert_eq!(manager.snapshot().reconnect_attempts, 0);
    manager.disconnect();
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_retry() {
    let transport = Arc::new(MockTransport::new("mock://feed"));
    transport.fail_by_default(true);
    let manager = manager(&transport, 0);

    assert!(manager.connect().await.is_err());
    manager.disconnect();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.open_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn lost_session_reconnects_and_restores_subscriptions() {
    let transport = Arc::new(MockTransport::new("mock://feed"));
    let manager = manager(&transport, 5);
    let mut events = manager.subscribe_events();

    manager.connect().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
    let mut server = transport.server().await.unwrap();
    manager.subscribe(&market_data_hub::SubscriptionKey::price("EURUSD"));
    let subscribe = server.next_control().await.unwrap();
    assert_eq!(subscribe["type"], "subscribe");

    server.close();

    let mut saw_disconnect = false;
    loop {
        match events.recv().await.unwrap() {
            ConnectionEvent::Disconnected { .. } => saw_disconnect = true,
            ConnectionEvent::Connected => break,
            _ => {}
        }
    }
    assert!(saw_disconnect);

    let mut server = transport.server().await.unwrap();
    let restored = server.next_control().await.unwrap();
    assert_eq!(restored["type"], "subscribe");
    assert_eq!(restored["data"]["symbols"], serde_json::json!(["EURUSD"]));
    assert_eq!(restored["data"]["eventTypes"], serde_json::json!(["price"]));
    manager.disconnect();
}

#[tokio::test(start_paused = true)]
async fn heartbeat_timeout_triggers_backoff_reconnect() {
    let transport = Arc::new(MockTransport::new("mock://feed"));
    let manager = manager(&transport, 5);
    let mut events = manager.subscribe_events();

    manager.connect().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
    // Keep the link open but never answer.
    let _silent = transport.server().await.unwrap();
    let connected_at = tokio::time::Instant::now();

    match next_lifecycle(&mut events).await {
        ConnectionEvent::Disconnected { reason } => {
            assert!(reason.contains("heartbeat timeout"), "reason: {reason}");
        }
        other => panic!("Expected Disconnected, got {other:?}"),
    }
    assert!(connected_at.elapsed() >= Duration::from_secs(30));

    assert_eq!(
        next_lifecycle(&mut events).await,
        ConnectionEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(1),
        }
    );
    assert_eq!(next_lifecycle(&mut events).await, ConnectionEvent::Connected);
    assert_eq!(transport.open_count(), 2);
    manager.disconnect();
}

#[tokio::test(start_paused = true)]
async fn rejected_auth_counts_as_failed_attempt() {
    let transport = Arc::new(MockTransport::new("mock://feed"));
    let manager = authenticated_manager(&transport, 5);
    let mut events = manager.subscribe_events();

    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect().await })
    };
    transport.server().await.unwrap().push_text(AUTH_REJECTED);
    assert!(matches!(
        connecting.await.unwrap(),
        Err(ConnectionError::Auth(_))
    ));

    assert_eq!(
        next_lifecycle(&mut events).await,
        ConnectionEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_secs(1),
        }
    );
    transport.server().await.unwrap().push_text(AUTH_REJECTED);

    assert_eq!(
        next_lifecycle(&mut events).await,
        ConnectionEvent::Reconnecting {
            attempt: 2,
            delay: Duration::from_secs(2),
        }
    );
    transport.acknowledge_auth(true);

    assert_eq!(next_lifecycle(&mut events).await, ConnectionEvent::Connected);
    assert_eq!(transport.open_count(), 3);
    assert!(manager.is_connected());
    manager.disconnect();
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_auth_cancels_connect() {
    let transport = Arc::new(MockTransport::new("mock://feed"));
    let manager = authenticated_manager(&transport, 5);

    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect().await })
    };
    let mut server = transport.server().await.unwrap();
    manager.disconnect();
    server.push_text(r#"{"type":"connection_status","data":{"status":"authenticated"}}"#);

    assert!(matches!(
        connecting.await.unwrap(),
        Err(ConnectionError::Cancelled)
    ));
    assert_eq!(manager.state(), ConnectionState::Terminated);

    // The auth request, then the link is dropped unused.
    assert_eq!(server.next_sent().await.unwrap()["type"], "auth");
    assert!(server.next_sent().await.is_none());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.open_count(), 1);
}
