//! Reaper dead-man's switch over real loopback TCP.
//!
//! The server prunes through `FakeEngine`, so what it removed (or left alone)
//! is directly observable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use dockyard::builder::ContainerBuilder;
use dockyard::cancel::{CancelSource, CancelToken};
use dockyard::config::DockyardConfig;
use dockyard::engine::{ContainerEngine, ContainerSpec, VolumeSpec};
use dockyard::orchestrator::{Orchestrator, ReaperStatus};
use dockyard::reaper::{
    ExitReason, Filter, ReaperServer, ReaperServerConfig, ReaperSession, ServerOutcome, SessionState,
};
use dockyard::session::Session;
use dockyard::testing::FakeEngine;

const GRACE: Duration = Duration::from_millis(200);

async fn spawn_server(engine: &Arc<FakeEngine>) -> (String, JoinHandle<ServerOutcome>) {
    spawn_server_with_cancel(engine, CancelToken::never()).await
}

async fn spawn_server_with_cancel(
    engine: &Arc<FakeEngine>,
    cancel: CancelToken,
) -> (String, JoinHandle<ServerOutcome>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = ReaperServer::new(
        engine.clone(),
        ReaperServerConfig {
            grace_period: GRACE,
            connect_timeout: Duration::from_secs(5),
        },
    );
    (addr, tokio::spawn(server.run(listener, cancel)))
}

async fn labelled_container(engine: &FakeEngine, session: &str) -> String {
    engine
        .create_container(&ContainerSpec {
            image: "alpine:3".to_string(),
            labels: BTreeMap::from([("session".to_string(), session.to_string())]),
            ..Default::default()
        })
        .await
        .unwrap()
}

async fn connect(addr: &str, session: &str) -> ReaperSession {
    ReaperSession::connect(addr, &[Filter::new("session", session)], Duration::from_secs(2))
        .await
        .unwrap()
}

// ── Dead-man's switch ───────────────────────────────────────────────────────

#[tokio::test]
async fn lost_client_triggers_prune_after_grace() {
    let engine = Arc::new(FakeEngine::new().with_image("alpine:3"));
    let mine = labelled_container(&engine, "x").await;
    let other = labelled_container(&engine, "y").await;
    engine
        .create_volume(&VolumeSpec {
            name: "x-data".to_string(),
            labels: BTreeMap::from([("session".to_string(), "x".to_string())]),
            ..Default::default()
        })
        .await
        .unwrap();

    let (addr, server) = spawn_server(&engine).await;
    let session = connect(&addr, "x").await;
    assert_eq!(session.state(), SessionState::Alive);

    // Simulate a crash: the socket closes without "shutdown".
    drop(session);

    let outcome = server.await.unwrap();
    assert_eq!(outcome.reason, ExitReason::Idle);
    assert_eq!(outcome.pruned.containers, vec![mine.clone()]);
    assert_eq!(outcome.pruned.volumes, vec!["x-data".to_string()]);
    assert!(!engine.has_container(&mine));
    assert!(engine.has_container(&other));
}

#[tokio::test]
async fn graceful_shutdown_prunes_nothing() {
    let engine = Arc::new(FakeEngine::new().with_image("alpine:3"));
    let mine = labelled_container(&engine, "x").await;

    let (addr, server) = spawn_server(&engine).await;
    let session = connect(&addr, "x").await;
    session.shutdown().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);

    let outcome = server.await.unwrap();
    assert_eq!(outcome.reason, ExitReason::Idle);
    assert_eq!(outcome.pruned.total(), 0);
    assert!(engine.has_container(&mine));
}

#[tokio::test]
async fn re_registration_within_grace_suppresses_prune() {
    let engine = Arc::new(FakeEngine::new().with_image("alpine:3"));
    let mine = labelled_container(&engine, "x").await;

    let (addr, server) = spawn_server(&engine).await;
    let first = connect(&addr, "x").await;
    drop(first);

    let second = connect(&addr, "x").await;
    tokio::time::sleep(GRACE * 3).await;
    assert!(engine.has_container(&mine), "pruned while still held");

    second.shutdown().await.unwrap();
    let outcome = server.await.unwrap();
    assert_eq!(outcome.pruned.total(), 0);
    assert!(engine.has_container(&mine));
}

#[tokio::test]
async fn two_clients_prune_only_the_lost_one() {
    let engine = Arc::new(FakeEngine::new().with_image("alpine:3"));
    let a = labelled_container(&engine, "a").await;
    let b = labelled_container(&engine, "b").await;

    let (addr, server) = spawn_server(&engine).await;
    let lost = connect(&addr, "a").await;
    let kept = connect(&addr, "b").await;
    drop(lost);

    tokio::time::sleep(GRACE * 3).await;
    assert!(!engine.has_container(&a));
    assert!(engine.has_container(&b));

    kept.shutdown().await.unwrap();
    let outcome = server.await.unwrap();
    assert_eq!(outcome.pruned.containers, vec![a]);
}

#[tokio::test]
async fn cancelled_server_stops_without_pruning() {
    let engine = Arc::new(FakeEngine::new().with_image("alpine:3"));
    let mine = labelled_container(&engine, "x").await;
    let source = CancelSource::new();

    let (addr, server) = spawn_server_with_cancel(&engine, source.token()).await;
    let _session = connect(&addr, "x").await;
    source.cancel();

    let outcome = server.await.unwrap();
    assert_eq!(outcome.reason, ExitReason::Cancelled);
    assert!(engine.has_container(&mine));
}

// ── Wire protocol ───────────────────────────────────────────────────────────

#[tokio::test]
async fn raw_protocol_replies_ack_and_err() {
    let engine = Arc::new(FakeEngine::new());
    let (addr, server) = spawn_server(&engine).await;

    let stream = TcpStream::connect(&addr).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"hello there\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert!(reply.starts_with("ERR "), "got {reply}");

    writer.write_all(b"filter team=storage\n").await.unwrap();
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "ACK");

    writer.write_all(b"shutdown\n").await.unwrap();
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "ACK");
    assert!(lines.next_line().await.unwrap().is_none());

    let outcome = server.await.unwrap();
    assert_eq!(outcome.pruned.total(), 0);
}

#[tokio::test]
async fn client_reports_unreachable_reaper() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = ReaperSession::connect(&addr, &[], Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(err.to_string().contains(&addr));
}

// ── Orchestrator integration ────────────────────────────────────────────────

#[tokio::test]
async fn orchestrator_session_is_covered_and_closes_gracefully() {
    let engine = Arc::new(FakeEngine::new().with_image("alpine:3"));
    let (addr, server) = spawn_server(&engine).await;

    let mut config = DockyardConfig::default();
    config.reaper.addr = Some(addr);
    let orchestrator = Orchestrator::with_session(engine.clone(), config, Session::new());

    let handle = ContainerBuilder::new()
        .with_image("alpine:3")
        .start(&orchestrator)
        .await
        .unwrap();
    assert_eq!(handle.reaper_status(), &ReaperStatus::Covered);

    handle.dispose().await;
    orchestrator.close().await.unwrap();

    let outcome = server.await.unwrap();
    assert_eq!(outcome.reason, ExitReason::Idle);
    assert_eq!(outcome.pruned.total(), 0);
}

#[tokio::test]
async fn crashed_orchestrator_session_is_reaped() {
    let engine = Arc::new(FakeEngine::new().with_image("alpine:3"));
    let (addr, server) = spawn_server(&engine).await;

    let mut config = DockyardConfig::default();
    config.reaper.addr = Some(addr);
    let orchestrator = Orchestrator::with_session(engine.clone(), config, Session::new());
    let handle = ContainerBuilder::new()
        .with_image("alpine:3")
        .start(&orchestrator)
        .await
        .unwrap();
    let id = handle.id().to_string();

    // Neither dispose nor close: the handle is leaked and the session socket
    // closes when the orchestrator goes away.
    std::mem::forget(handle);
    drop(orchestrator);

    let outcome = server.await.unwrap();
    assert_eq!(outcome.pruned.containers, vec![id.clone()]);
    assert!(!engine.has_container(&id));
}

#[tokio::test]
async fn orchestrators_of_one_session_share_the_reaper_link() {
    let engine = Arc::new(FakeEngine::new().with_image("alpine:3"));
    let (addr, server) = spawn_server(&engine).await;
    let session = Session::new();

    let mut config = DockyardConfig::default();
    config.reaper.addr = Some(addr);
    let first = Orchestrator::with_session(engine.clone(), config, session);

    // The second orchestrator could never connect on its own.
    let mut unreachable = DockyardConfig::default();
    unreachable.reaper.addr = Some("127.0.0.1:1".to_string());
    unreachable.reaper.connect_timeout = Duration::from_millis(300);
    let second = Orchestrator::with_session(engine.clone(), unreachable, session);

    let a = ContainerBuilder::new()
        .with_image("alpine:3")
        .start(&first)
        .await
        .unwrap();
    let b = ContainerBuilder::new()
        .with_image("alpine:3")
        .start(&second)
        .await
        .unwrap();
    assert_eq!(a.reaper_status(), &ReaperStatus::Covered);
    assert_eq!(b.reaper_status(), &ReaperStatus::Covered);

    // Dropping one orchestrator keeps the link open for the other.
    a.dispose().await;
    drop(first);
    tokio::time::sleep(GRACE * 3).await;
    assert!(engine.has_container(b.id()), "pruned while still held");

    b.dispose().await;
    second.close().await.unwrap();

    let outcome = server.await.unwrap();
    assert_eq!(outcome.reason, ExitReason::Idle);
    assert_eq!(outcome.pruned.total(), 0);
}

#[tokio::test]
async fn graceful_close_leaves_undisposed_containers_alone() {
    let engine = Arc::new(FakeEngine::new().with_image("alpine:3"));
    let (addr, server) = spawn_server(&engine).await;

    let mut config = DockyardConfig::default();
    config.reaper.addr = Some(addr);
    let orchestrator = Orchestrator::with_session(engine.clone(), config, Session::new());
    let handle = ContainerBuilder::new()
        .with_image("alpine:3")
        .start(&orchestrator)
        .await
        .unwrap();
    let id = handle.id().to_string();

    orchestrator.close().await.unwrap();
    let outcome = server.await.unwrap();
    assert_eq!(outcome.pruned.total(), 0);
    assert!(engine.has_container(&id));

    handle.dispose().await;
}
