use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rstest::{fixture, rstest};
use vecwire::envelope::Envelope;
use vecwire::network::Connection;
use vecwire::routing::{Router, Verb};
use vecwire::transfer::{
    keys, remote_error, BatchHandler, BatchHeader, SyncBatchHandler, TransferClient,
    TransferService,
};
use vecwire::{setup_local_tracing, AppError, AppResult, Server, ServerConfig};

#[fixture]
#[once]
fn tracing() {
    setup_local_tracing().unwrap();
}

fn config(compressed: bool) -> Arc<ServerConfig> {
    let mut config = ServerConfig::default();
    config.network.port = 0;
    config.compression.enabled = compressed;
    Arc::new(config)
}

/// Every batch a recording handler saw, in arrival order.
type Seen = Arc<Mutex<Vec<(BatchHeader, Envelope)>>>;

#[derive(Clone)]
struct Recorder {
    seen: Seen,
}

impl BatchHandler for Recorder {
    fn handle<'a>(
        &'a self,
        batch: &'a mut Envelope,
        header: &'a BatchHeader,
    ) -> Pin<Box<dyn Future<Output = AppResult<Option<Envelope>>> + Send + 'a>> {
        self.seen.lock().push((header.clone(), batch.clone()));
        Box::pin(async { Ok(None) })
    }
}

fn recording(seen: &Seen) -> Recorder {
    Recorder { seen: seen.clone() }
}

async fn start(
    config: Arc<ServerConfig>,
    path: &str,
    handler: impl BatchHandler + 'static,
) -> (Server, SocketAddr) {
    let (server, addr, _) = start_service(config, path, handler).await;
    (server, addr)
}

async fn start_service(
    config: Arc<ServerConfig>,
    path: &str,
    handler: impl BatchHandler + 'static,
) -> (Server, SocketAddr, TransferService) {
    let mut router = Router::new();
    let service = TransferService::new(config.transfer_options());
    service
        .register(&mut router, path, Verb::CREATE, handler)
        .unwrap();
    let mut server = Server::builder(config).router(router).build();
    let addr = server.start().await.unwrap();
    (server, addr, service)
}

/// Polls until the service holds no open session, or gives up after two seconds.
async fn sessions_drained(service: &TransferService) -> bool {
    for _ in 0..100 {
        if service.sessions().is_empty() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn batch(values: &[f32], note: &str) -> Envelope {
    let mut envelope = Envelope::new();
    envelope.set_property("Note", note);
    envelope.add_vector(values.to_vec());
    envelope
}

#[rstest]
#[tokio::test]
async fn batches_share_one_connection_until_the_last(#[from(tracing)] _tracing: ()) {
    let seen = Seen::default();
    let config = config(false);
    let (mut server, addr) = start(config.clone(), "/ingest", recording(&seen)).await;

    let mut client = TransferClient::connect(&addr.to_string(), config.transfer_options())
        .await
        .unwrap();
    let session_id = {
        let mut session = client.session("/ingest", Verb::CREATE);
        for (i, keep_alive) in [true, true, false].into_iter().enumerate() {
            let reply = session
                .send_batch(batch(&[i as f32, 0.5], "part"), keep_alive)
                .await
                .unwrap();
            assert!(reply.is_none());
        }
        assert!(session.is_finished());
        let err = session.send_batch(batch(&[9.0], "late"), false).await;
        assert!(matches!(err, Err(AppError::IllegalStateError(_))));
        session.id().to_string()
    };

    {
        let seen = seen.lock();
        let numbers: Vec<u64> = seen.iter().map(|(header, _)| header.batch).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
        assert!(seen.iter().all(|(header, _)| header.id == session_id));
        assert_eq!(seen[2].1.vectors(), &[vec![2.0, 0.5]]);
    }

    // the terminal batch ended the connection on the server side
    let again = client.exchange(&batch(&[1.0], "after")).await;
    assert!(again.is_err());

    server.stop(Some(Duration::from_secs(2))).await.unwrap();
}

#[rstest]
#[tokio::test]
async fn send_response_echoes_the_batch(#[from(tracing)] _tracing: ()) {
    let config = config(false);
    let handler = SyncBatchHandler::new(|batch: &mut Envelope, _: &BatchHeader| {
        batch.set_property("Seen", "yes");
        Ok(None)
    });
    let (mut server, addr) = start(config.clone(), "/echo", handler).await;

    let mut client = TransferClient::connect(&addr.to_string(), config.transfer_options())
        .await
        .unwrap();
    let mut session = client
        .session("/echo", Verb::CREATE)
        .with_send_response(true);
    let reply = session
        .send_batch(batch(&[1.0, 2.0, 3.0], "ping"), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.property("Note"), Some("ping"));
    assert_eq!(reply.property("Seen"), Some("yes"));
    assert_eq!(reply.vectors(), &[vec![1.0, 2.0, 3.0]]);

    server.stop(Some(Duration::from_secs(2))).await.unwrap();
}

#[rstest]
#[tokio::test]
async fn terminal_batch_is_forwarded(#[from(tracing)] _tracing: ()) {
    let config = config(false);
    let sink_seen = Seen::default();
    let (mut sink, sink_addr) = start(config.clone(), "/sink", recording(&sink_seen)).await;
    let relay_seen = Seen::default();
    let (mut relay, relay_addr) = start(config.clone(), "/relay", recording(&relay_seen)).await;

    let mut client = TransferClient::connect(&relay_addr.to_string(), config.transfer_options())
        .await
        .unwrap();
    let mut session = client
        .session("/relay", Verb::CREATE)
        .with_forward_to(format!("tcp://{}/sink", sink_addr));
    session.send_batch(batch(&[1.0], "first"), true).await.unwrap();
    session.send_batch(batch(&[2.0], "last"), false).await.unwrap();
    let session_id = session.id().to_string();

    assert_eq!(relay_seen.lock().len(), 2);
    // only the first batch went out without a forward target
    assert!(relay_seen.lock()[0].0.forward_to.is_none());
    assert!(relay_seen.lock()[1].0.forward_to.is_some());

    let sink_seen = sink_seen.lock();
    assert_eq!(sink_seen.len(), 1);
    let (header, forwarded) = &sink_seen[0];
    assert_eq!(header.id, session_id);
    assert_eq!(header.batch, 0);
    assert!(header.is_terminal());
    assert!(header.forward_to.is_none());
    assert!(forwarded.property(keys::FORWARD_TO).is_none());
    assert_eq!(forwarded.property("Note"), Some("last"));
    drop(sink_seen);

    relay.stop(Some(Duration::from_secs(2))).await.unwrap();
    sink.stop(Some(Duration::from_secs(2))).await.unwrap();
}

#[rstest]
#[tokio::test]
async fn failed_forward_fails_the_terminal_batch(#[from(tracing)] _tracing: ()) {
    let config = config(false);
    let seen = Seen::default();
    let (mut relay, relay_addr) = start(config.clone(), "/relay", recording(&seen)).await;

    // a port nobody listens on any more
    let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_addr = closed.local_addr().unwrap();
    drop(closed);

    let mut client = TransferClient::connect(&relay_addr.to_string(), config.transfer_options())
        .await
        .unwrap();
    let mut session = client
        .session("/relay", Verb::CREATE)
        .with_forward_to(format!("tcp://{}/sink", closed_addr));
    let result = session.send_batch(batch(&[1.0], "last"), false).await;
    match result {
        Err(AppError::Remote { status, .. }) => assert!(status >= 500, "{}", status),
        other => panic!("expected the forward failure, got {:?}", other),
    }
    // the relay's own handler still ran before the forward
    assert_eq!(seen.lock().len(), 1);

    relay.stop(Some(Duration::from_secs(2))).await.unwrap();
}

#[rstest]
#[tokio::test]
async fn abandoned_sessions_end_with_their_connection(#[from(tracing)] _tracing: ()) {
    let config = config(false);
    let (mut server, addr, service) =
        start_service(config.clone(), "/ingest", recording(&Seen::default())).await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut client = TransferClient::connect(&addr.to_string(), config.transfer_options())
            .await
            .unwrap();
        client
            .session("/ingest", Verb::CREATE)
            .send_batch(batch(&[1.0], "first"), true)
            .await
            .unwrap();
        clients.push(client);
    }
    assert_eq!(service.sessions().len(), 5);

    drop(clients);
    assert!(sessions_drained(&service).await);

    // a session whose connection is closed over a sequencing error goes too
    let mut client = TransferClient::connect(&addr.to_string(), config.transfer_options())
        .await
        .unwrap();
    let mut envelope = batch(&[1.0], "start");
    let mut header = BatchHeader {
        id: "skipping".to_string(),
        client_id: "tester".to_string(),
        op_type: Verb::CREATE,
        batch: 0,
        keep_alive: true,
        send_response: false,
        forward_to: None,
        path: "/ingest".to_string(),
    };
    header.write_to(&mut envelope);
    client.exchange(&envelope).await.unwrap();
    assert_eq!(service.sessions().len(), 1);

    header.batch = 2;
    let mut skipped = batch(&[2.0], "skipped");
    header.write_to(&mut skipped);
    let result = client.exchange(&skipped).await;
    assert!(matches!(result, Err(AppError::Remote { status: 400, .. })));
    assert!(sessions_drained(&service).await);

    server.stop(Some(Duration::from_secs(2))).await.unwrap();
}

/// Holds every batch long enough for a second one to collide with it.
struct SlowHandler;

impl BatchHandler for SlowHandler {
    fn handle<'a>(
        &'a self,
        _batch: &'a mut Envelope,
        _header: &'a BatchHeader,
    ) -> Pin<Box<dyn Future<Output = AppResult<Option<Envelope>>> + Send + 'a>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(None)
        })
    }
}

#[rstest]
#[tokio::test]
async fn concurrent_batches_of_one_session_conflict(#[from(tracing)] _tracing: ()) {
    let config = config(false);
    let (mut server, addr) = start(config.clone(), "/slow", SlowHandler).await;

    let options = config.transfer_options();
    let target = addr.to_string();
    let first = tokio::spawn({
        let options = options.clone();
        let target = target.clone();
        async move {
            let mut client = TransferClient::connect(&target, options).await.unwrap();
            let mut session = client.session("/slow", Verb::CREATE).with_id("shared");
            session.send_batch(batch(&[1.0], "a"), false).await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TransferClient::connect(&target, options).await.unwrap();
    let mut session = client.session("/slow", Verb::CREATE).with_id("shared");
    let second = session.send_batch(batch(&[2.0], "b"), false).await;
    match second {
        Err(AppError::Remote { status, message }) => {
            assert_eq!(status, 409);
            assert!(message.contains("cannot acquire lock shared"), "{}", message);
        }
        other => panic!("expected a lock conflict, got {:?}", other),
    }

    assert!(first.await.unwrap().is_ok());
    server.stop(Some(Duration::from_secs(2))).await.unwrap();
}

#[rstest]
#[tokio::test]
async fn out_of_order_batch_is_rejected(#[from(tracing)] _tracing: ()) {
    let config = config(false);
    let seen = Seen::default();
    let (mut server, addr) = start(config.clone(), "/ingest", recording(&seen)).await;

    let mut client = TransferClient::connect(&addr.to_string(), config.transfer_options())
        .await
        .unwrap();
    let mut envelope = batch(&[1.0], "orphan");
    BatchHeader {
        id: "never-started".to_string(),
        client_id: "tester".to_string(),
        op_type: Verb::CREATE,
        batch: 3,
        keep_alive: true,
        send_response: false,
        forward_to: None,
        path: "/ingest".to_string(),
    }
    .write_to(&mut envelope);

    let result = client.exchange(&envelope).await;
    assert!(matches!(result, Err(AppError::Remote { status: 400, .. })));
    assert!(seen.lock().is_empty());

    server.stop(Some(Duration::from_secs(2))).await.unwrap();
}

#[rstest]
#[tokio::test]
async fn corrupted_envelope_gets_an_integrity_error(#[from(tracing)] _tracing: ()) {
    let config = config(false);
    let seen = Seen::default();
    let (mut server, addr) = start(config.clone(), "/ingest", recording(&seen)).await;

    let mut envelope = batch(&[1.0], "hello");
    envelope.set_property(keys::ID, "tampered");
    envelope.set_property(keys::PATH, "/ingest");
    let mut bytes = envelope.to_bytes().to_vec();
    let at = bytes
        .windows(5)
        .position(|window| window == b"hello")
        .unwrap();
    bytes[at] = b'j';

    let options = config.transfer_options();
    let mut connection = Connection::connect(
        &addr.to_string(),
        options.transport.clone(),
        options.connect_timeout,
    )
    .await
    .unwrap();
    connection.write_frame(&bytes).await.unwrap();
    let reply = connection.read_frame().await.unwrap().unwrap();
    let reply = Envelope::from_bytes(&reply, true).unwrap();
    match remote_error(&reply) {
        Some(AppError::Remote { status, .. }) => assert_eq!(status, 422),
        other => panic!("expected an integrity error, got {:?}", other),
    }
    assert!(seen.lock().is_empty());

    // the server hangs up after a rejected frame
    assert!(matches!(connection.read_frame().await, Ok(None) | Err(_)));
    server.stop(Some(Duration::from_secs(2))).await.unwrap();
}

#[rstest]
#[tokio::test]
async fn unknown_path_is_a_remote_not_found(#[from(tracing)] _tracing: ()) {
    let config = config(false);
    let (mut server, addr) = start(config.clone(), "/ingest", recording(&Seen::default())).await;

    let mut client = TransferClient::connect(&addr.to_string(), config.transfer_options())
        .await
        .unwrap();
    let mut session = client.session("/elsewhere", Verb::CREATE);
    let result = session.send_batch(batch(&[1.0], "lost"), false).await;
    assert!(matches!(result, Err(AppError::Remote { status: 404, .. })));
    assert!(session.is_finished());

    server.stop(Some(Duration::from_secs(2))).await.unwrap();
}

#[rstest]
#[tokio::test]
async fn compressed_bodies_round_trip(#[from(tracing)] _tracing: ()) {
    let config = config(true);
    let seen = Seen::default();
    let (mut server, addr) = start(config.clone(), "/ingest", recording(&seen)).await;

    let options = config.transfer_options();
    assert!(options.compression.is_some());
    let mut client = TransferClient::connect(&addr.to_string(), options)
        .await
        .unwrap();
    let values: Vec<f32> = (0..1024).map(|i| (i % 7) as f32).collect();
    let mut session = client
        .session("/ingest", Verb::CREATE)
        .with_send_response(true);
    let reply = session
        .send_batch(batch(&values, "bulk"), false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.vectors(), &[values.clone()]);
    assert_eq!(seen.lock()[0].1.vectors(), &[values]);

    server.stop(Some(Duration::from_secs(2))).await.unwrap();
}
