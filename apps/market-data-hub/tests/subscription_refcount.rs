//! Subscription Reference Counting Integration Tests
//!
//! Local interest against a live (scripted) upstream: the upstream sees one
//! subscribe per key no matter how many handlers share it, and one
//! unsubscribe when the last handler goes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use market_data_hub::{
    ConnectionConfig, ConnectionManager, DataKind, MockServer, MockTransport,
    SubscriptionKey, SubscriptionMultiplexer, Timeframe,
};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn connected() -> (ConnectionManager, SubscriptionMultiplexer, MockServer) {
    let transport = Arc::new(MockTransport::new("mock://feed"));
    let manager = ConnectionManager::new(transport.clone(), ConnectionConfig::default()).unwrap();
    manager.connect().await.unwrap();
    let server = transport.server().await.unwrap();
    let mux = SubscriptionMultiplexer::new(
        Arc::new(manager.clone()),
        vec![Timeframe::M1, Timeframe::H1],
    );
    (manager, mux, server)
}

async fn next_control(server: &mut MockServer) -> Value {
    timeout(Duration::from_secs(2), server.next_control())
        .await
        .expect("control frame")
        .expect("link open")
}

fn controls(server: &mut MockServer) -> Vec<Value> {
    server
        .drain_sent()
        .into_iter()
        .filter(|frame| frame["type"] != "ping")
        .collect()
}

#[tokio::test]
async fn shared_key_subscribes_once_and_unsubscribes_with_last_handler() {
    let (manager, mux, mut server) = connected().await;

    let first = mux.add_interest("eurusd", DataKind::Price, |_| Ok(()));
    let second = mux.add_interest("EURUSD", DataKind::Price, |_| Ok(()));

    let subscribe = next_control(&mut server).await;
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(subscribe["data"]["symbols"], json!(["EURUSD"]));
    assert_eq!(subscribe["data"]["eventTypes"], json!(["price"]));
    assert!(controls(&mut server).is_empty());

    let key = SubscriptionKey::price("EURUSD");
    assert_eq!(mux.interest_count(&key), 2);

    first.cancel();
    assert!(controls(&mut server).is_empty());
    assert_eq!(mux.interest_count(&key), 1);

    second.cancel();
    let unsubscribe = next_control(&mut server).await;
    assert_eq!(unsubscribe["type"], "unsubscribe");
    assert_eq!(unsubscribe["data"]["symbols"], json!(["EURUSD"]));
    assert!(manager.snapshot().active_subscriptions.is_empty());

    manager.disconnect();
}

#[tokio::test]
async fn ohlc_interest_fans_out_to_configured_timeframes() {
    let (manager, mux, mut server) = connected().await;

    let handle = mux.add_ohlc_interest("BTCUSD", |_| Ok(()));
    assert_eq!(handle.key_count(), 2);

    let mut event_types = Vec::new();
    for _ in 0..2 {
        let frame = next_control(&mut server).await;
        assert_eq!(frame["type"], "subscribe");
        event_types.push(frame["data"]["eventTypes"][0].as_str().unwrap().to_string());
    }
    event_types.sort();
    assert_eq!(event_types, vec!["ohlc_1h", "ohlc_1m"]);

    handle.cancel();
    for _ in 0..2 {
        assert_eq!(next_control(&mut server).await["type"], "unsubscribe");
    }

    manager.disconnect();
}

#[tokio::test]
async fn frames_reach_only_matching_handlers() {
    let (manager, mux, server) = connected().await;
    let cancel = CancellationToken::new();
    let dispatch = tokio::spawn({
        let mux = mux.clone();
        let events = manager.subscribe_events();
        let cancel = cancel.clone();
        async move { mux.run(events, cancel).await }
    });

    let eurusd = Arc::new(AtomicUsize::new(0));
    let gbpusd = Arc::new(AtomicUsize::new(0));
    let _eur = mux.add_interest("EURUSD", DataKind::Price, {
        let count = Arc::clone(&eurusd);
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let _gbp = mux.add_interest("GBPUSD", DataKind::Price, {
        let count = Arc::clone(&gbpusd);
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    // A failing handler must not stop delivery to the others.
    let _failing = mux.add_interest("EURUSD", DataKind::Price, |_| {
        Err(anyhow::anyhow!("handler failure"))
    });

    server.push_json(&json!({
        "type": "price_update",
        "data": { "symbol": "EURUSD", "bid": 1.1052, "ask": 1.1054 },
        "timestamp": 1_718_000_000_000_u64
    }));

    timeout(Duration::from_secs(2), async {
        while eurusd.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(gbpusd.load(Ordering::SeqCst), 0);

    cancel.cancel();
    dispatch.await.unwrap();
    manager.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_add_and_cancel_keep_upstream_balanced() {
    let (manager, mux, mut server) = connected().await;
    let key = SubscriptionKey::price("EURUSD");

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let mux = mux.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let handle = mux.add_interest("EURUSD", DataKind::Price, |_| Ok(()));
                    tokio::task::yield_now().await;
                    handle.cancel();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(mux.interest_count(&key), 0);
    assert!(manager.snapshot().active_subscriptions.is_empty());

    let kinds: Vec<String> = controls(&mut server)
        .iter()
        .map(|frame| frame["type"].as_str().unwrap().to_string())
        .collect();
    assert!(!kinds.is_empty());
    assert_eq!(kinds.len() % 2, 0);
    for (i, kind) in kinds.iter().enumerate() {
        let expected = if i % 2 == 0 { "subscribe" } else { "unsubscribe" };
        assert_eq!(kind, expected, "frame {i} out of order: {kinds:?}");
    }

    manager.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscribe_racing_connect_is_sent_once() {
    let transport = Arc::new(MockTransport::new("mock://feed"));
    let manager = ConnectionManager::new(transport.clone(), ConnectionConfig::default()).unwrap();
    let keys: Vec<SubscriptionKey> = (0..200)
        .map(|i| SubscriptionKey::price(format!("SYM{i}")))
        .collect();

    let subscriber = {
        let manager = manager.clone();
        let keys = keys.clone();
        tokio::spawn(async move {
            for key in &keys {
                manager.subscribe(key);
                tokio::task::yield_now().await;
            }
        })
    };
    manager.connect().await.unwrap();
    subscriber.await.unwrap();

    let mut server = transport.server().await.unwrap();
    let mut sent: Vec<String> = controls(&mut server)
        .iter()
        .filter(|frame| frame["type"] == "subscribe")
        .flat_map(|frame| {
            frame["data"]["symbols"]
                .as_array()
                .unwrap()
                .iter()
                .map(|s| s.as_str().unwrap().to_string())
                .collect::<Vec<_>>()
        })
        .collect();
    sent.sort();

    let mut expected: Vec<String> = keys.iter().map(|k| k.symbol().to_string()).collect();
    expected.sort();
    assert_eq!(sent, expected);

    manager.disconnect();
}
