//! End-to-end test over a Unix socket: framed connect handshake followed
//! by observation frames, with a stub ingestion endpoint issuing the run
//! token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use teld_core::identity::AppIdentity;
use teld_core::reservoir::SlowSample;
use teld_core::Config;
use teld_daemon::apps::AppTable;
use teld_daemon::collector::CollectorClient;
use teld_daemon::listener::{self, ListenAddr, Listener};
use teld_daemon::protocol::messages::{ClientMessage, ServerMessage};
use teld_daemon::protocol::FrameCodec;
use teld_daemon::state::DaemonState;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

#[derive(Clone, Default)]
struct Stub {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

async fn invoke(
    State(stub): State<Stub>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let method = params.get("method").cloned().unwrap_or_default();
    *stub.counts.lock().unwrap().entry(method).or_default() += 1;
    (
        StatusCode::OK,
        r#"{"return_value":{"run_token":"rt-e2e"}}"#.to_string(),
    )
}

async fn start_stub() -> String {
    let app = Router::new()
        .route("/invoke", post(invoke))
        .with_state(Stub::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn identity() -> AppIdentity {
    AppIdentity {
        license: "e2e-license".into(),
        app_names: vec!["storefront".into()],
        high_security: false,
        language: "php".into(),
        agent_version: "9.0.0".into(),
    }
}

fn slow_sample(id: u32, max_micros: u64) -> ClientMessage {
    ClientMessage::SlowSample(SlowSample {
        id,
        count: 1,
        total_micros: max_micros,
        min_micros: max_micros,
        max_micros,
        metric_name: format!("Datastore/statement/{id}"),
        query: format!("SELECT {id}"),
        txn_name: "WebTransaction/Action/index".into(),
        txn_url: "/index".into(),
        params: serde_json::json!({}),
    })
}

struct Harness {
    table: Arc<AppTable>,
    state: Arc<DaemonState>,
    socket: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn start_daemon() -> Harness {
    let collector_url = start_stub().await;
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("teld.sock");

    let cfg = Config {
        collector: collector_url,
        bind_addr: socket.display().to_string(),
        ..Config::default()
    };
    let collector = Arc::new(CollectorClient::new(&cfg).unwrap());
    let state = Arc::new(DaemonState::new());
    let table = Arc::new(AppTable::new(&cfg, collector, Arc::clone(&state)));

    let addr = ListenAddr::parse(&cfg.bind_addr);
    let bound = Listener::bind(&addr).await.unwrap();
    tokio::spawn(listener::run(bound, Arc::clone(&table)));

    Harness {
        table,
        state,
        socket,
        _dir: dir,
    }
}

async fn connect_client(
    harness: &Harness,
) -> Framed<UnixStream, FrameCodec> {
    let stream = UnixStream::connect(&harness.socket).await.unwrap();
    Framed::new(stream, FrameCodec::new())
}

async fn handshake(framed: &mut Framed<UnixStream, FrameCodec>) -> ServerMessage {
    framed
        .send(ClientMessage::Connect(identity()).encode().unwrap())
        .await
        .unwrap();
    let reply = framed.next().await.unwrap().unwrap();
    ServerMessage::decode(&reply).unwrap()
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn connect_then_observe_over_unix_socket() {
    let harness = start_daemon().await;

    let mut framed = connect_client(&harness).await;
    let reply = handshake(&mut framed).await;
    assert_eq!(
        reply,
        ServerMessage::ConnectAccepted {
            run_token: "rt-e2e".into()
        }
    );

    for (id, max) in [(1, 10_000), (2, 20_000), (3, 30_000)] {
        framed.send(slow_sample(id, max).encode().unwrap()).await.unwrap();
    }
    framed
        .send(
            ClientMessage::Metric {
                name: "WebTransaction".into(),
                value: 0.25,
            }
            .encode()
            .unwrap(),
        )
        .await
        .unwrap();

    let table = Arc::clone(&harness.table);
    wait_for("observations to land", move || {
        table
            .lookup(&identity())
            .is_some_and(|entry| entry.stats().observations == 4)
    })
    .await;

    harness.state.request_shutdown();
}

#[tokio::test]
async fn malformed_frame_closes_only_its_connection() {
    let harness = start_daemon().await;

    let mut bad = connect_client(&harness).await;
    assert!(matches!(
        handshake(&mut bad).await,
        ServerMessage::ConnectAccepted { .. }
    ));
    bad.send(Bytes::from_static(b"not json at all")).await.unwrap();
    // The daemon drops the offending connection; the read sees EOF.
    assert!(bad.next().await.is_none());

    // A fresh connection still works: the daemon survived.
    let mut good = connect_client(&harness).await;
    assert!(matches!(
        handshake(&mut good).await,
        ServerMessage::ConnectAccepted { .. }
    ));

    harness.state.request_shutdown();
}

#[tokio::test]
async fn observation_before_connect_is_rejected() {
    let harness = start_daemon().await;

    let mut framed = connect_client(&harness).await;
    framed
        .send(
            ClientMessage::Metric {
                name: "too-early".into(),
                value: 1.0,
            }
            .encode()
            .unwrap(),
        )
        .await
        .unwrap();

    // No reply; the connection is closed without an entry being created.
    assert!(framed.next().await.is_none());
    assert!(harness.table.is_empty());

    harness.state.request_shutdown();
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let harness = start_daemon().await;

    // Established before shutdown: handshake works.
    let mut framed = connect_client(&harness).await;
    assert!(matches!(
        handshake(&mut framed).await,
        ServerMessage::ConnectAccepted { .. }
    ));

    harness.state.request_shutdown();
    // The socket file disappears once the listener cleans up.
    let socket = harness.socket.clone();
    wait_for("socket cleanup", move || !socket.exists()).await;
}
