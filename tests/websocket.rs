use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_server::relay::{RelayConfig, RelayEngine};
use relay_server::transport::Listener;
use relay_server::WsListener;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

const POLL_TIMEOUT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_message(client: &mut Client) -> Message {
    loop {
        let message = timeout(POLL_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("websocket error");
        if !message.is_ping() && !message.is_pong() {
            return message;
        }
    }
}

async fn next_json(client: &mut Client) -> Value {
    match next_message(client).await {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text message, got {:?}", other),
    }
}

async fn connect(url: &Url) -> Client {
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();
    let welcome = next_json(&mut client).await;
    assert_eq!(welcome["type"], "welcome");
    client
}

#[test_log::test(tokio::test)]
async fn relay_over_websocket() {
    let listener = WsListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}", listener.local_addr())).unwrap();

    let engine = Arc::new(RelayEngine::new(RelayConfig::default()));
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(engine.clone().run(listener, async move {
        let _ = stopped.await;
    }));

    let mut c1 = connect(&url).await;
    let mut c2 = connect(&url).await;

    c1.send(Message::Text(r#"{"a":1}"#.to_string())).await.unwrap();
    let echo = next_json(&mut c1).await;
    assert_eq!(echo["type"], "echo");
    assert_eq!(echo["original"], json!({"a": 1}));
    let broadcast = next_json(&mut c2).await;
    assert_eq!(broadcast["type"], "broadcast");
    assert_eq!(broadcast["message"], json!({"a": 1}));

    c2.send(Message::Text("not-json".to_string())).await.unwrap();
    let error = next_json(&mut c2).await;
    assert_eq!(error, json!({"type": "error", "message": "Invalid JSON format"}));

    assert_eq!(engine.connection_count().await, 2);

    stop.send(()).unwrap();
    for client in [&mut c1, &mut c2] {
        match next_message(client).await {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Away);
                assert_eq!(frame.reason, "server shutting down");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    timeout(POLL_TIMEOUT, server).await.unwrap().unwrap();
    assert_eq!(engine.connection_count().await, 0);
}

#[test_log::test(tokio::test)]
async fn websocket_close_unregisters_peer() {
    let listener = WsListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}", listener.local_addr())).unwrap();

    let engine = Arc::new(RelayEngine::new(RelayConfig::default()));
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(engine.clone().run(listener, async move {
        let _ = stopped.await;
    }));

    let mut client = connect(&url).await;
    assert_eq!(engine.connection_count().await, 1);

    client.close(None).await.unwrap();
    for _ in 0..100 {
        if engine.connection_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(engine.connection_count().await, 0);
    assert_eq!(engine.stats().connections_closed, 1);

    stop.send(()).unwrap();
    timeout(POLL_TIMEOUT, server).await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn websocket_liveness_probe_is_answered() {
    let listener = WsListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}", listener.local_addr())).unwrap();

    let engine = Arc::new(RelayEngine::new(RelayConfig {
        liveness_interval: Duration::from_millis(50),
        max_missed_probes: 2,
    }));
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(engine.clone().run(listener, async move {
        let _ = stopped.await;
    }));

    let mut client = connect(&url).await;

    // Reading keeps tungstenite answering pings, so the peer is never evicted.
    let reader = tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(400);
        while tokio::time::Instant::now() < deadline {
            let _ = timeout(Duration::from_millis(50), client.next()).await;
        }
        client
    });
    let _client = reader.await.unwrap();

    assert!(engine.stats().probes_sent >= 3);
    assert_eq!(engine.stats().evictions, 0);
    assert_eq!(engine.connection_count().await, 1);

    stop.send(()).unwrap();
    timeout(POLL_TIMEOUT, server).await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn connection_after_stop_accepting_is_never_upgraded() {
    let mut listener = WsListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}", listener.local_addr())).unwrap();

    listener.stop_accepting();

    let attempt = timeout(Duration::from_millis(500), connect_async(url.as_str())).await;
    assert!(
        !matches!(attempt, Ok(Ok(_))),
        "connection was upgraded after the listener stopped accepting"
    );
    assert!(listener.accept().await.is_none());
}

#[test_log::test(tokio::test)]
async fn stalled_handshake_is_dropped() {
    let listener = WsListener::bind_with_timeout("127.0.0.1:0", Duration::from_millis(100))
        .await
        .unwrap();
    let mut raw = TcpStream::connect(listener.local_addr()).await.unwrap();

    // Never send the upgrade request; the server must hang up on its own.
    let mut buf = [0u8; 64];
    let read = timeout(POLL_TIMEOUT, raw.read(&mut buf))
        .await
        .expect("server kept the stalled connection open");
    assert!(matches!(read, Ok(0) | Err(_)), "unexpected bytes: {:?}", read);
}
