//! Wait-strategy timing against a local target.
//!
//! Timing tests run on a paused clock, so "second 4" means four seconds of
//! virtual time, not wall time.

use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::time::Instant;

use dockyard::cancel::CancelToken;
use dockyard::engine::ExecResult;
use dockyard::error::Error;
use dockyard::wait::{
    PollPolicy, ProbeError, WaitOutcome, WaitStrategy, WaitTarget, poll_until_ready, wait_for_all,
};

/// A service on the host that "opens" at a fixed instant.
struct Service {
    port: u16,
    opens_at: Option<Instant>,
}

#[async_trait]
impl WaitTarget for Service {
    fn name(&self) -> &str {
        "service"
    }

    fn host(&self) -> &str {
        "127.0.0.1"
    }

    async fn mapped_port(&self, _container_port: &str) -> Result<u16, ProbeError> {
        Ok(self.port)
    }

    async fn exec(&self, _command: &[String]) -> Result<ExecResult, ProbeError> {
        Err(ProbeError::new("exec not supported"))
    }

    fn output(&self) -> String {
        String::new()
    }
}

/// Refused until `opens_at`, like a TCP connect to a booting service.
fn accepts_connections(opens_at: Option<Instant>) -> WaitStrategy {
    WaitStrategy::custom("connect", move |target| {
        async move {
            target.mapped_port("5432/tcp").await?;
            if opens_at.is_some_and(|at| Instant::now() >= at) {
                Ok(true)
            } else {
                Err(ProbeError::new("connection refused"))
            }
        }
        .boxed()
    })
    .with_timeout(Duration::from_secs(30))
    .with_interval(Duration::from_secs(1))
}

fn service(opens_after: Option<Duration>) -> Service {
    Service {
        port: 5432,
        opens_at: opens_after.map(|d| Instant::now() + d),
    }
}

// ── Scenario: service accepts connections at second 4 ───────────────────────

#[tokio::test(start_paused = true)]
async fn ready_at_second_four_returns_before_second_five() {
    let target = service(Some(Duration::from_secs(4)));
    let start = Instant::now();

    let outcome = poll_until_ready(
        &accepts_connections(target.opens_at),
        &PollPolicy::default(),
        &target,
        &CancelToken::never(),
    )
    .await;

    let elapsed = start.elapsed();
    assert!(matches!(outcome, WaitOutcome::Satisfied { polls: 5, .. }), "got {outcome:?}");
    assert!(elapsed >= Duration::from_secs(4), "ready too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "ready too late: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn never_ready_times_out_at_thirty_seconds() {
    let target = service(None);
    let start = Instant::now();

    let err = wait_for_all(
        &[accepts_connections(target.opens_at)],
        &PollPolicy::default(),
        &target,
        &CancelToken::never(),
    )
    .await
    .unwrap_err();

    assert!(start.elapsed() >= Duration::from_secs(30));
    match err {
        Error::WaitStrategyTimeout {
            timeout,
            last_failure,
            ..
        } => {
            assert_eq!(timeout, Duration::from_secs(30));
            assert_eq!(last_failure, "connection refused");
        }
        other => panic!("expected timeout, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn strategies_without_policy_use_defaults() {
    let target = service(None);
    let defaults = PollPolicy {
        interval: Duration::from_millis(250),
        timeout: Duration::from_secs(2),
        max_consecutive_failures: None,
    };
    let start = Instant::now();

    let outcome = poll_until_ready(
        &WaitStrategy::log("never"),
        &defaults,
        &target,
        &CancelToken::never(),
    )
    .await;

    assert!(matches!(outcome, WaitOutcome::TimedOut { .. }));
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(start.elapsed() < Duration::from_secs(3));
}

// ── Real sockets ────────────────────────────────────────────────────────────

#[tokio::test]
async fn tcp_strategy_waits_for_listener() {
    let probe_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let opener = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let listener = TcpListener::bind(("127.0.0.1", probe_port)).await.unwrap();
        // Keep accepting so connects succeed.
        loop {
            let _ = listener.accept().await;
        }
    });

    let target = Service {
        port: probe_port,
        opens_at: None,
    };
    let strategy = WaitStrategy::tcp(5432)
        .with_interval(Duration::from_millis(100))
        .with_timeout(Duration::from_secs(5));
    let start = std::time::Instant::now();

    let outcome = poll_until_ready(&strategy, &PollPolicy::default(), &target, &CancelToken::never()).await;

    assert!(matches!(outcome, WaitOutcome::Satisfied { .. }), "got {outcome:?}");
    assert!(start.elapsed() >= Duration::from_millis(300));
    opener.abort();
}
