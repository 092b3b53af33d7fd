//! Client and server talking over loopback TCP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use svcwire_client::{Client, ClientError, ConnectionConfig, TransferDirection};
use svcwire_protocol::codec::{self, Decoder, Inbound, SplitConfig};
use svcwire_protocol::message::{EventAdd, Hello, Message};
use svcwire_protocol::{ErrorCode, Value, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use svcwire_server::{
    builtin, LocalFileStorage, MemoryDriver, Server, ServerConfig, ServiceRegistry,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut services = ServiceRegistry::new();
    builtin::register(&mut services, config.resource_driver.is_some());
    let server = Arc::new(Server::new(config, services));

    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.run_on(listener).await;
    });
    (server, addr)
}

fn server_config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_resource_driver(Arc::new(MemoryDriver::new()))
}

async fn connect(addr: SocketAddr, client_id: &str) -> Client {
    let client = Client::new(
        ConnectionConfig::new(addr)
            .with_client_id(client_id)
            .with_client_name("tests"),
    );
    client.connect().await.unwrap();
    client
}

/// Polls `check` until it holds or a second has passed.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_call_and_unknown_service() {
    let (server, addr) = start(server_config()).await;
    let client = connect(addr, "c1").await;

    let body = client.call("Echo.echo", vec!["hi".into()]).await.unwrap();
    assert_eq!(body, Value::from("hi"));

    let err = client.call("Missing.x", vec![]).await.unwrap_err();
    assert!(matches!(err, ClientError::Remote { .. }));
    assert_eq!(err.code(), Some(ErrorCode::NotFound));

    client.ping().await.unwrap();
    client.close().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_concurrent_calls_resolve_independently() {
    let (server, addr) = start(server_config()).await;
    let client = Arc::new(connect(addr, "c2").await);

    let mut tasks = Vec::new();
    for i in 0..16i64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let delay = Value::from(((16 - i) * 2) as u64);
            client.call("Echo.sleep", vec![delay]).await.unwrap();
            client
                .call("Echo.add", vec![i.into(), 100.into()])
                .await
                .unwrap()
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), Value::from(i as i64 + 100));
    }
    server.shutdown();
}

#[tokio::test]
async fn test_server_emit_reaches_matching_listener() {
    let (server, addr) = start(server_config()).await;
    let client = connect(addr, "c3").await;

    let mut dev = client
        .add_listener("UserChanged", Value::object([("dept", "dev")]))
        .await
        .unwrap();
    let mut ops = client
        .add_listener("UserChanged", Value::object([("dept", "ops")]))
        .await
        .unwrap();

    let data = Value::object([("dept", "dev"), ("user", "ann")]);
    let report = server.emit("UserChanged", &data, |info, data| {
        info.get("dept") == data.get("dept")
    });
    assert_eq!(report.matched, 1);

    let received = tokio::time::timeout(Duration::from_secs(2), dev.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, data);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ops.try_recv().is_none());
    server.shutdown();
}

#[tokio::test]
async fn test_client_emit_between_connections() {
    let (server, addr) = start(server_config()).await;
    let listener = connect(addr, "c4").await;
    let emitter = connect(addr, "c5").await;

    let mut sub = listener
        .add_listener("Deployed", Value::object([("env", "prod")]))
        .await
        .unwrap();

    let data = Value::object([("env", "prod")]);
    let count = emitter
        .emit("Deployed", data.clone(), |info, data| {
            info.get("env") == data.get("env")
        })
        .await
        .unwrap();
    assert_eq!(count, 1);

    let received = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, data);
    server.shutdown();
}

#[tokio::test]
async fn test_remote_resource_transaction() {
    let (server, addr) = start(server_config()).await;
    let client = connect(addr, "c6").await;

    let db = client
        .open_resource(Value::object([("database", "e2e")]))
        .await
        .unwrap();
    db.begin().await.unwrap();
    db.execute(Value::object([
        ("op", Value::from("set")),
        ("key", Value::from("a")),
        ("value", Value::from(7)),
    ]))
    .await
    .unwrap();
    db.rollback().await.unwrap();

    let rows = db
        .execute(Value::object([("op", "get"), ("key", "a")]))
        .await
        .unwrap();
    assert_eq!(rows.as_array().map(Vec::len), Some(0));

    let id = db.id();
    db.close().await.unwrap();
    let err = client
        .call("DbProxy.begin", vec![Value::from(id)])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::ResourceNotFound));
    server.shutdown();
}

#[tokio::test]
async fn test_close_releases_listeners_and_resources() {
    let (server, addr) = start(server_config()).await;
    let client = connect(addr, "c7").await;

    let _sub = client
        .add_listener("UserChanged", Value::Null)
        .await
        .unwrap();
    let _db = client.open_resource(Value::Null).await.unwrap();
    assert_eq!(server.events().len(), 1);
    assert_eq!(server.resources().len(), 1);

    client.close().await.unwrap();

    assert!(eventually(|| server.connection_count() == 0).await);
    assert!(eventually(|| server.events().is_empty()).await);
    assert!(eventually(|| server.resources().is_empty()).await);
    server.shutdown();
}

#[tokio::test]
async fn test_upload_file_in_fragments() {
    let root = tempfile::tempdir().unwrap();
    let config = server_config()
        .with_upload_storage(Arc::new(LocalFileStorage::new(root.path())));
    let (server, addr) = start(config).await;
    let client = connect(addr, "c8").await;

    let source = tempfile::NamedTempFile::new().unwrap();
    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(source.path(), &content).unwrap();

    let mut progress = client.subscribe_progress();
    let body = client
        .upload_file_chunked(source.path(), "incoming/data.bin", 1024)
        .await
        .unwrap();
    assert_eq!(body.get("size").and_then(Value::as_u64), Some(10_000));

    let written = std::fs::read(root.path().join("incoming/data.bin")).unwrap();
    assert_eq!(written, content);

    let mut last = 0;
    while let Ok(p) = progress.try_recv() {
        last = p.completed_size;
    }
    assert_eq!(last, 10_000);
    server.shutdown();
}

#[tokio::test]
async fn test_upload_rejected_without_storage() {
    let (server, addr) = start(server_config()).await;
    let client = Client::new(ConnectionConfig::new(addr).with_upload_retries(0));
    client.connect().await.unwrap();

    let source = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(source.path(), b"payload").unwrap();

    let err = client
        .upload_file(source.path(), "data.bin")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::UploadFailed));
    server.shutdown();
}

/// Reads until a whole message arrives; `None` once the server hangs up.
async fn read_message(stream: &mut TcpStream, decoder: &mut Decoder) -> Option<Message> {
    let mut buf = vec![0u8; 4096];
    loop {
        while let Some(item) = decoder.next_inbound().unwrap() {
            if let Inbound::Message(message) = item {
                return Some(message);
            }
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => decoder.extend(&buf[..n]),
        }
    }
}

#[tokio::test]
async fn test_silent_client_dropped_by_heartbeat() {
    let config = server_config()
        .with_heartbeat(Some(Duration::from_millis(1)), Duration::from_millis(1));
    let (server, addr) = start(config).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut decoder = Decoder::new(MAX_MESSAGE_SIZE, Duration::from_secs(5));
    let hello = Message::Hello(Hello {
        protocol_version: PROTOCOL_VERSION,
        client_id: "silent".into(),
        client_name: None,
        token: None,
    });
    stream
        .write_all(&codec::encode_frame(&hello).unwrap())
        .await
        .unwrap();
    assert!(matches!(
        read_message(&mut stream, &mut decoder).await,
        Some(Message::Welcome(_))
    ));

    let add = Message::EventAdd(EventAdd {
        id: 1,
        key: "k1".into(),
        name: "news".into(),
        info: Value::Null,
    });
    stream
        .write_all(&codec::encode_frame(&add).unwrap())
        .await
        .unwrap();
    assert!(eventually(|| server.events().len() == 1).await);

    // Never answer a ping.
    let mut pings = 0;
    let closed = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(message) = read_message(&mut stream, &mut decoder).await {
            if matches!(message, Message::Ping { .. }) {
                pings += 1;
            }
        }
    })
    .await;

    assert!(closed.is_ok(), "server kept the silent connection open");
    assert!(pings >= 1);
    assert!(eventually(|| server.events().is_empty() && server.connection_count() == 0).await);
    server.shutdown();
}

#[tokio::test]
async fn test_split_call_reports_progress() {
    let split = SplitConfig {
        threshold: 256,
        chunk_size: 128,
        max_message_size: MAX_MESSAGE_SIZE,
    };
    let (server, addr) = start(server_config().with_split(split)).await;
    let client = Client::new(
        ConnectionConfig::new(addr)
            .with_client_id("splitter")
            .with_split(256, 128),
    );
    client.connect().await.unwrap();
    let mut progress = client.subscribe_progress();

    let payload = "s".repeat(5000);
    let body = client
        .call("Echo.echo", vec![payload.clone().into()])
        .await
        .unwrap();
    assert_eq!(body, Value::from(payload));

    let mut outbound = Vec::new();
    let mut inbound = Vec::new();
    while let Ok(p) = progress.try_recv() {
        match p.direction {
            TransferDirection::Outbound => outbound.push(p),
            TransferDirection::Inbound => inbound.push(p),
        }
    }
    assert!(!outbound.is_empty());
    assert!(outbound.iter().all(|p| p.request_id.is_some()));
    assert!(outbound
        .windows(2)
        .all(|w| w[0].completed_size < w[1].completed_size));
    assert!(!inbound.is_empty());
    let last = inbound.last().unwrap();
    assert_eq!(last.completed_size, last.total_size);

    client.close().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_oversized_split_request_fails_by_transfer() {
    let split = SplitConfig {
        threshold: 256,
        chunk_size: 128,
        max_message_size: 4096,
    };
    let (server, addr) = start(server_config().with_split(split)).await;
    let client = Client::new(
        ConnectionConfig::new(addr)
            .with_client_id("too-big")
            .with_split(256, 128),
    );
    client.connect().await.unwrap();

    let err = client
        .call("Echo.echo", vec!["b".repeat(10_000).into()])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::SplitFailed));
    assert_eq!(client.connection().pending_count(), 0);

    // The rest of the failed transfer is dropped quietly.
    let body = client.call("Echo.echo", vec!["small".into()]).await.unwrap();
    assert_eq!(body, Value::from("small"));
    assert!(client.is_connected());

    client.close().await.unwrap();
    server.shutdown();
}
