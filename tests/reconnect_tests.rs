// ABOUTME: Integration tests for connection loss and automatic reconnection

#[path = "helpers/mock_server.rs"]
mod mock_server;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use middleware_client::{CallContext, Client, ClientConfig, ClientError};
use mock_server::{wait_until, MockServer, Reply};
use serde_json::{json, Value};

fn handler(method: &str, params: &[Value]) -> Reply {
    match method {
        "system.version" => Reply::ok(json!("25.04")),
        "core.subscribe" => Reply::ok(json!(format!(
            "sub-{}",
            params.first().and_then(Value::as_str).unwrap_or_default()
        ))),
        "test.never" => Reply::Silent,
        "test.slow" => Reply::after(Duration::from_millis(300), Reply::ok(json!("done"))),
        _ => Reply::Error(-32601, "unknown".to_string()),
    }
}

fn fast_reconnect(server: &MockServer) -> ClientConfig {
    let mut config = ClientConfig::new(server.url.clone());
    config.reconnect_backoff_base = Duration::from_millis(20);
    config.reconnect_backoff_max = Duration::from_millis(200);
    config
}

async fn connect(server: &MockServer) -> Client {
    Client::connect(fast_reconnect(server)).await.unwrap()
}

/// Call system.version with short timeouts until it succeeds.
async fn call_until_ok(client: &Client, within: Duration) -> Result<String, ClientError> {
    let deadline = Instant::now() + within;
    loop {
        let ctx = CallContext::with_timeout(Duration::from_millis(300));
        match client.call::<String>(&ctx, "system.version", vec![]).await {
            Ok(version) => return Ok(version),
            Err(e) if Instant::now() >= deadline => return Err(e),
            Err(e) if e.is_retryable() => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(e) => return Err(e),
        }
    }
}

#[tokio::test]
async fn test_call_succeeds_after_connection_drop() {
    let server = MockServer::start(handler).await;
    let client = connect(&server).await;
    let first_session = client.session().await;

    server.drop_connections();

    let version = call_until_ok(&client, Duration::from_secs(5)).await.unwrap();
    assert_eq!(version, "25.04");

    assert!(wait_until(Duration::from_secs(2), || client.metrics().reconnects >= 1).await);
    assert!(server.connection_count() >= 2);
    assert!(client.is_connected());
    assert_ne!(client.session().await, first_session);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_keeps_retrying_while_server_refuses() {
    let server = MockServer::start(handler).await;
    let client = connect(&server).await;

    server.set_accepting(false);
    server.drop_connections();

    assert!(wait_until(Duration::from_secs(2), || !client.is_connected()).await);
    // Several refused attempts
    tokio::time::sleep(Duration::from_millis(400)).await;
    let connections_while_down = server.connection_count();
    assert_eq!(connections_while_down, 1);

    server.set_accepting(true);
    let version = call_until_ok(&client, Duration::from_secs(5)).await.unwrap();
    assert_eq!(version, "25.04");
    assert_eq!(client.metrics().reconnects, 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_call_waits_for_next_connection() {
    let server = MockServer::start(handler).await;
    let client = connect(&server).await;

    server.set_accepting(false);
    server.drop_connections();
    assert!(wait_until(Duration::from_secs(2), || !client.is_connected()).await);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call::<String>(
                    &CallContext::with_timeout(Duration::from_secs(5)),
                    "system.version",
                    vec![],
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    server.set_accepting(true);

    assert_eq!(pending.await.unwrap().unwrap(), "25.04");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_call_without_connection_fails_at_deadline() {
    let server = MockServer::start(handler).await;
    let client = connect(&server).await;

    server.set_accepting(false);
    server.drop_connections();
    assert!(wait_until(Duration::from_secs(2), || !client.is_connected()).await);

    let err = client
        .call_raw(
            &CallContext::with_timeout(Duration::from_millis(150)),
            "system.version",
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NotConnected), "got {err:?}");

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_subscriptions_are_restored_after_reconnect() {
    let server = MockServer::start(handler).await;
    let client = connect(&server).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client
        .subscribe(&CallContext::new(), "alert.list", move |update| {
            sink.lock().unwrap().push(update.id);
            Ok(())
        })
        .await
        .unwrap();

    server.drop_connections();
    assert!(
        wait_until(Duration::from_secs(5), || server.calls_to("core.subscribe").len() == 2).await
    );
    // Give the resubscribe reply time to land
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.push_changed("alert.list", 42, json!({"level": "CRITICAL"}));
    assert!(wait_until(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await);
    assert_eq!(*seen.lock().unwrap(), vec![Some(json!(42))]);
    assert_eq!(client.subscriptions(), vec!["alert.list".to_string()]);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_close_during_reconnect_is_prompt() {
    let server = MockServer::start(handler).await;
    let client = connect(&server).await;

    server.set_accepting(false);
    server.drop_connections();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    client.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));

    let err = client
        .call_raw(&CallContext::new(), "system.version", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ClientClosed));
}

#[tokio::test]
async fn test_close_wakes_call_waiting_for_connection() {
    let server = MockServer::start(handler).await;
    let client = connect(&server).await;

    server.set_accepting(false);
    server.drop_connections();
    assert!(wait_until(Duration::from_secs(2), || !client.is_connected()).await);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call_raw(&CallContext::new(), "system.version", vec![]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close().await.unwrap();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::ClientClosed), "got {err:?}");
}

#[tokio::test]
async fn test_in_flight_call_fails_when_its_connection_is_lost() {
    let server = MockServer::start(handler).await;
    let client = connect(&server).await;

    let started = Instant::now();
    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call_raw(&CallContext::with_timeout(Duration::from_secs(4)), "test.slow", vec![])
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.drop_connections();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::ConnectionLost), "got {err:?}");
    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert_eq!(client.pending_calls(), 0);

    let version = call_until_ok(&client, Duration::from_secs(5)).await.unwrap();
    assert_eq!(version, "25.04");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_drop_during_resubscribe_does_not_stall_reconnect() {
    // Only the first subscribe is answered; every resubscribe hangs
    let subscribes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&subscribes);
    let server = MockServer::start(move |method, params| match method {
        "core.subscribe" if counter.fetch_add(1, Ordering::SeqCst) > 0 => Reply::Silent,
        _ => handler(method, params),
    })
    .await;

    let mut config = fast_reconnect(&server);
    config.reconnect_backoff_max = Duration::from_millis(100);
    config.call_timeout = Duration::from_secs(5);
    let client = Client::connect(config).await.unwrap();
    client
        .subscribe(&CallContext::new(), "alert.list", |_| Ok(()))
        .await
        .unwrap();

    server.drop_connections();
    assert!(
        wait_until(Duration::from_secs(5), || server.calls_to("core.subscribe").len() == 2).await
    );

    // The resubscribe is now waiting on a reply that never comes
    let started = Instant::now();
    server.drop_connections();

    let version = call_until_ok(&client, Duration::from_secs(4)).await.unwrap();
    assert_eq!(version, "25.04");
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(wait_until(Duration::from_secs(2), || client.metrics().reconnects >= 2).await);

    let started = Instant::now();
    client.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
}
