//! Harvest cycle tests against a stub ingestion endpoint.
//!
//! The stub accepts the connect handshake and answers submissions with a
//! configurable status, so the discard-on-failure folding is observable
//! from the outside: a failed harvest must not be retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use teld_core::identity::AppIdentity;
use teld_core::Config;
use teld_daemon::apps::{AppTable, ObserveError};
use teld_daemon::collector::CollectorClient;
use teld_daemon::protocol::messages::{ClientMessage, ServerMessage};
use teld_daemon::scheduler;
use teld_daemon::state::DaemonState;

#[derive(Clone)]
struct Stub {
    submit_status: Arc<Mutex<u16>>,
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl Stub {
    fn new() -> Self {
        Self {
            submit_status: Arc::new(Mutex::new(200)),
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn set_submit_status(&self, status: u16) {
        *self.submit_status.lock().unwrap() = status;
    }

    fn count(&self, method: &str) -> usize {
        self.counts.lock().unwrap().get(method).copied().unwrap_or(0)
    }
}

async fn invoke(
    State(stub): State<Stub>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let method = params.get("method").cloned().unwrap_or_default();
    *stub.counts.lock().unwrap().entry(method.clone()).or_default() += 1;

    if method == "connect" {
        return (
            StatusCode::OK,
            r#"{"return_value":{"run_token":"rt-test-1"}}"#.to_string(),
        );
    }
    let status = *stub.submit_status.lock().unwrap();
    (
        StatusCode::from_u16(status).expect("valid status"),
        "{}".to_string(),
    )
}

async fn start_stub() -> (Stub, String) {
    let stub = Stub::new();
    let app = Router::new()
        .route("/invoke", post(invoke))
        .with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (stub, format!("http://{addr}"))
}

fn identity() -> AppIdentity {
    AppIdentity {
        license: "test-license".into(),
        app_names: vec!["checkout".into()],
        high_security: false,
        language: "php".into(),
        agent_version: "9.0.0".into(),
    }
}

async fn table_for(collector_url: &str) -> (Arc<AppTable>, Arc<CollectorClient>) {
    let cfg = Config {
        collector: collector_url.into(),
        ..Config::default()
    };
    let collector = Arc::new(CollectorClient::new(&cfg).unwrap());
    let state = Arc::new(DaemonState::new());
    let table = Arc::new(AppTable::new(&cfg, Arc::clone(&collector), state));
    (table, collector)
}

fn metric(name: &str, value: f64) -> ClientMessage {
    ClientMessage::Metric {
        name: name.into(),
        value,
    }
}

#[tokio::test]
async fn failed_harvest_is_lost_not_retried() {
    let (stub, url) = start_stub().await;
    stub.set_submit_status(500);
    let (table, collector) = table_for(&url).await;

    let (entry, reply) = table.connect(identity()).await;
    assert!(matches!(reply, ServerMessage::ConnectAccepted { .. }));
    let entry = entry.unwrap();

    for i in 0..10 {
        entry.observe(metric(&format!("Custom/m{i}"), 1.0)).unwrap();
    }

    // First harvest: the upload is attempted and rejected with a 500.
    scheduler::harvest_once(&entry, &collector).await;
    assert_eq!(stub.count("metric_data"), 1);

    // Second harvest immediately after: the previous batch was discarded,
    // not buffered, so there is nothing to upload.
    scheduler::harvest_once(&entry, &collector).await;
    assert_eq!(stub.count("metric_data"), 1);

    // The entry itself survives a transient failure.
    assert!(entry.run_token().is_some());
}

#[tokio::test]
async fn accepted_harvest_uploads_once_per_payload_kind() {
    let (stub, url) = start_stub().await;
    let (table, collector) = table_for(&url).await;

    let (entry, _) = table.connect(identity()).await;
    let entry = entry.unwrap();

    entry.observe(metric("Custom/a", 2.0)).unwrap();
    entry
        .observe(ClientMessage::Event {
            data: serde_json::json!({ "type": "Transaction" }),
        })
        .unwrap();

    scheduler::harvest_once(&entry, &collector).await;
    assert_eq!(stub.count("metric_data"), 1);
    assert_eq!(stub.count("analytic_event_data"), 1);
    // Nothing was observed for the other kinds; empty payloads are skipped.
    assert_eq!(stub.count("error_data"), 0);
    assert_eq!(stub.count("custom_event_data"), 0);
    assert_eq!(stub.count("slow_sample_data"), 0);
}

#[tokio::test]
async fn permanent_rejection_disconnects_the_entry() {
    let (stub, url) = start_stub().await;
    let (table, collector) = table_for(&url).await;

    let (entry, _) = table.connect(identity()).await;
    let entry = entry.unwrap();

    entry.observe(metric("Custom/a", 1.0)).unwrap();
    stub.set_submit_status(401);
    scheduler::harvest_once(&entry, &collector).await;

    // The run token is gone; the next observation is refused, which makes
    // the connection close and the library re-run the connect handshake.
    assert!(entry.run_token().is_none());
    assert!(matches!(
        entry.observe(metric("Custom/b", 1.0)),
        Err(ObserveError::Disconnected)
    ));

    // A fresh connect restores the entry.
    let (reconnected, reply) = table.connect(identity()).await;
    assert!(matches!(reply, ServerMessage::ConnectAccepted { .. }));
    let reconnected = reconnected.unwrap();
    assert!(Arc::ptr_eq(&entry, &reconnected));
    reconnected.observe(metric("Custom/b", 1.0)).unwrap();
}

#[tokio::test]
async fn idle_entry_is_evicted_after_a_final_harvest() {
    let (stub, url) = start_stub().await;
    let cfg = Config {
        collector: url,
        app_timeout: teld_core::config::Timeout(std::time::Duration::from_millis(20)),
        harvest_period: teld_core::config::Timeout(std::time::Duration::from_millis(50)),
        ..Config::default()
    };
    let collector = Arc::new(CollectorClient::new(&cfg).unwrap());
    let state = Arc::new(DaemonState::new());
    let table = Arc::new(AppTable::new(&cfg, collector, state));

    let (entry, _) = table.connect(identity()).await;
    entry.unwrap().observe(metric("Custom/a", 1.0)).unwrap();
    assert_eq!(table.len(), 1);

    // The entry goes idle; its harvest task takes a final harvest and
    // destroys it.
    for _ in 0..100 {
        if table.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(table.is_empty());
    // The final harvest carried the observed metric out.
    assert_eq!(stub.count("metric_data"), 1);
}

#[tokio::test]
async fn second_connect_reuses_the_run_token_without_handshake() {
    let (stub, url) = start_stub().await;
    let (table, _) = table_for(&url).await;

    let (first, _) = table.connect(identity()).await;
    let (second, reply) = table.connect(identity()).await;

    assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    assert!(matches!(reply, ServerMessage::ConnectAccepted { .. }));
    // One handshake served both connections.
    assert_eq!(stub.count("connect"), 1);
    assert_eq!(table.len(), 1);
}
