//! Session Recovery Tests
//!
//! Tests for the ensure-usable probe and connection loss:
//! - Transparent recovery vs. reported failure
//! - Feeds on a lost connection end with one ConnectionError
//! - Late traffic never reaches feeds of an old connection
//! - Caller-level subscribe retry

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use aerodb_changefeed::{
    ChangefeedConfig, FeedError, FeedState, Listener, MemoryServer, Session, SubscriptionRequest,
    Usable,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config() -> ChangefeedConfig {
    ChangefeedConfig {
        probe_timeout_ms: 50,
        connect_timeout_ms: 200,
        request_timeout_ms: 500,
        max_subscribe_retries: 5,
        retry_backoff_ms: 20,
        ..Default::default()
    }
}

async fn setup() -> (MemoryServer, Session) {
    let server = MemoryServer::new();
    let session = Session::connect(test_config(), Arc::new(server.clone()))
        .await
        .unwrap();
    session.table_create("posts").await.unwrap();
    (server, session)
}

/// Kill the connection and give the transport loop time to notice
async fn lose_connection(server: &MemoryServer) {
    server.drop_connections();
    tokio::time::sleep(Duration::from_millis(20)).await;
}

// =============================================================================
// ensure_usable
// =============================================================================

/// A healthy connection is reported as such and not replaced.
#[tokio::test]
async fn test_healthy_connection_not_replaced() {
    let (server, session) = setup().await;

    for _ in 0..3 {
        assert_eq!(session.ensure_usable().await.unwrap(), Usable::Healthy);
    }
    assert_eq!(server.connection_count(), 1);
}

/// A lost connection is re-established transparently.
#[tokio::test]
async fn test_lost_connection_recovered() {
    let (server, session) = setup().await;
    lose_connection(&server).await;

    assert_eq!(session.ensure_usable().await.unwrap(), Usable::Recovered);
    assert_eq!(server.connection_count(), 1);

    // Tables live on the server, not the connection
    assert_eq!(session.table_list().await.unwrap(), vec!["posts".to_string()]);
}

/// Ordinary queries recover without surfacing the loss.
#[tokio::test]
async fn test_query_after_loss_succeeds() {
    let (server, session) = setup().await;
    lose_connection(&server).await;

    let result = session.table("posts").insert(json!({ "id": 1 })).await.unwrap();
    assert_eq!(result.inserted, 1);
    assert_eq!(session.metrics().snapshot().reconnects, 1);
}

/// A failed re-establishment is reported, and the next call tries again.
#[tokio::test]
async fn test_failed_reconnect_reported_then_retried() {
    let (server, session) = setup().await;
    server.set_accepting(false);
    lose_connection(&server).await;

    let err = session.ensure_usable().await.unwrap_err();
    assert!(matches!(err, FeedError::ConnectionError(_)));
    assert!(err.is_retryable());

    server.set_accepting(true);
    assert_eq!(session.ensure_usable().await.unwrap(), Usable::Recovered);
}

/// An unresponsive connection fails its probe and is replaced.
#[tokio::test]
async fn test_stalled_connection_replaced() {
    let (server, session) = setup().await;
    server.stall_connections();

    assert_eq!(session.ensure_usable().await.unwrap(), Usable::Recovered);
    let snapshot = session.metrics().snapshot();
    assert_eq!(snapshot.probe_failures, 1);
    assert_eq!(snapshot.reconnects, 1);
}

// =============================================================================
// Feeds Across Connection Loss
// =============================================================================

/// A pending pull resolves with ConnectionError when the connection dies.
#[tokio::test]
async fn test_pending_pull_fails_on_connection_loss() {
    let (server, session) = setup().await;
    let feed = session.table("posts").changes().await.unwrap();

    let puller = feed.clone();
    let pending = tokio::spawn(async move { puller.pull().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.drop_connections();
    let result = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(FeedError::ConnectionError(_))));
    assert_eq!(feed.pull().await, Err(FeedError::FeedClosed));
    assert_eq!(feed.state(), FeedState::Errored);
}

/// Push feeds get one error event on connection loss.
#[tokio::test]
async fn test_push_feed_single_error_on_loss() {
    let (server, session) = setup().await;
    let feed = session.table("posts").changes().await.unwrap();

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    feed.on(Listener::error(move |err| {
        assert!(matches!(err, FeedError::ConnectionError(_)));
        counter.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap();

    lose_connection(&server).await;
    session.ensure_usable().await.unwrap();
    lose_connection(&server).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

/// Feeds opened after recovery get new ids and only new traffic.
#[tokio::test]
async fn test_resubscribe_after_recovery() {
    let (server, session) = setup().await;
    let table = session.table("posts");
    let old = table.changes().await.unwrap();

    lose_connection(&server).await;
    let new = table.changes().await.unwrap();
    assert_ne!(old.id(), new.id());
    assert_eq!(session.registry_len(), 1);

    table.insert(json!({ "id": 1 })).await.unwrap();
    assert_eq!(new.pull().await.unwrap().new_val().unwrap()["id"], 1);

    assert!(matches!(old.pull().await, Err(FeedError::ConnectionError(_))));
    assert_eq!(old.buffered(), 0);
}

/// Closing a feed of a dead connection is a quiet no-op.
#[tokio::test]
async fn test_close_after_loss() {
    let (server, session) = setup().await;
    let feed = session.table("posts").changes().await.unwrap();
    lose_connection(&server).await;

    assert!(feed.close().await.is_ok());
    assert_eq!(feed.state(), FeedState::Errored);
}

/// Closing the session ends every feed and refuses further work.
#[tokio::test]
async fn test_session_close() {
    let (_server, session) = setup().await;
    let first = session.table("posts").changes().await.unwrap();
    let second = session.table("posts").changes().await.unwrap();

    session.close().await.unwrap();

    assert_eq!(session.registry_len(), 0);
    for feed in [first, second] {
        assert!(matches!(feed.pull().await, Err(FeedError::ConnectionError(_))));
    }
    assert!(session.table("posts").changes().await.is_err());
}

// =============================================================================
// Retry
// =============================================================================

/// subscribe_with_retry rides out a short outage.
#[tokio::test]
async fn test_subscribe_with_retry_rides_out_outage() {
    let (server, session) = setup().await;
    server.set_accepting(false);
    lose_connection(&server).await;

    let reopen = server.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        reopen.set_accepting(true);
    });

    let feed = session
        .subscribe_with_retry(&SubscriptionRequest::new("posts"))
        .await
        .unwrap();
    assert_eq!(feed.state(), FeedState::Open);
}

/// subscribe_with_retry gives up after the configured attempts.
#[tokio::test]
async fn test_subscribe_with_retry_gives_up() {
    let (server, session) = setup().await;
    server.set_accepting(false);
    lose_connection(&server).await;

    let err = session
        .subscribe_with_retry(&SubscriptionRequest::new("posts"))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::ConnectionError(_)));
}

/// Non-transport failures are not retried.
#[tokio::test]
async fn test_subscribe_with_retry_does_not_retry_query_errors() {
    let (_server, session) = setup().await;

    let err = session
        .subscribe_with_retry(&SubscriptionRequest::new("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Query(_)));
    assert_eq!(session.metrics().snapshot().reconnects, 0);
}
