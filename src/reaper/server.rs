//! Reaper server: a dead-man's switch over TCP.
//!
//! Each connection registers label filters. An open connection is the
//! heartbeat. When a connection drops without a `shutdown` command, its
//! filters are pruned after the grace period unless another live connection
//! holds them again by then. The server exits once it has been idle for a
//! grace period, or if no client connects within the connect timeout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::engine::ContainerEngine;
use crate::reaper::protocol::{Filter, Reply, Request};
use crate::reaper::prune::{PruneReport, prune};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperServerConfig {
    pub grace_period: Duration,
    pub connect_timeout: Duration,
}

impl Default for ReaperServerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(60),
        }
    }
}

/// Why the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Nobody connected within the connect timeout.
    ConnectTimeout,
    /// Every client left and the grace period passed.
    Idle,
    /// Stopped from outside.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerOutcome {
    pub reason: ExitReason,
    pub pruned: PruneReport,
}

/// Filters currently held by live connections, with a count per filter.
#[derive(Debug, Default)]
struct Registry {
    held: HashMap<Filter, usize>,
}

impl Registry {
    fn hold(&mut self, filter: &Filter) {
        *self.held.entry(filter.clone()).or_default() += 1;
    }

    fn release(&mut self, filters: &[Filter]) {
        for filter in filters {
            if let Some(count) = self.held.get_mut(filter) {
                *count -= 1;
                if *count == 0 {
                    self.held.remove(filter);
                }
            }
        }
    }

    fn is_held(&self, filter: &Filter) -> bool {
        self.held.contains_key(filter)
    }
}

enum Event {
    /// Client said `shutdown` before closing.
    Closed,
    /// Connection dropped; these filters are candidates for pruning.
    Lost(Vec<Filter>),
    GraceElapsed(Vec<Filter>),
}

pub struct ReaperServer {
    engine: Arc<dyn ContainerEngine>,
    config: ReaperServerConfig,
}

impl ReaperServer {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: ReaperServerConfig) -> Self {
        Self { engine, config }
    }

    /// Serve connections on `listener` until idle, timed out, or cancelled.
    pub async fn run(self, listener: TcpListener, cancel: CancelToken) -> ServerOutcome {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();

        let connect_deadline = Instant::now() + self.config.connect_timeout;
        let mut ever_connected = false;
        let mut live = 0usize;
        let mut pending_prunes = 0usize;
        let mut idle_since: Option<Instant> = None;
        let mut pruned = PruneReport::default();

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                "Reaper listening on {} (grace {:?}, connect timeout {:?})",
                addr,
                self.config.grace_period,
                self.config.connect_timeout
            );
        }

        let reason = loop {
            let idle_deadline = idle_since.map(|since| since + self.config.grace_period);

            tokio::select! {
                _ = cancel.cancelled() => break ExitReason::Cancelled,

                _ = tokio::time::sleep_until(connect_deadline), if !ever_connected => {
                    tracing::warn!("No client connected within {:?}", self.config.connect_timeout);
                    break ExitReason::ConnectTimeout;
                }

                _ = sleep_until_opt(idle_deadline), if idle_deadline.is_some() => {
                    tracing::info!("Reaper idle for {:?}, exiting", self.config.grace_period);
                    break ExitReason::Idle;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("Reaper client connected: {}", peer);
                        ever_connected = true;
                        live += 1;
                        idle_since = None;
                        tokio::spawn(serve_connection(stream, registry.clone(), events_tx.clone()));
                    }
                    Err(e) => tracing::error!("Reaper accept error: {}", e),
                },

                Some(event) = events_rx.recv() => {
                    match event {
                        Event::Closed => {
                            live -= 1;
                        }
                        Event::Lost(filters) => {
                            live -= 1;
                            if !filters.is_empty() {
                                pending_prunes += 1;
                                let tx = events_tx.clone();
                                let grace = self.config.grace_period;
                                tracing::warn!(
                                    "Reaper client lost, pruning {} filter(s) in {:?} unless re-registered",
                                    filters.len(),
                                    grace
                                );
                                tokio::spawn(async move {
                                    tokio::time::sleep(grace).await;
                                    let _ = tx.send(Event::GraceElapsed(filters));
                                });
                            }
                        }
                        Event::GraceElapsed(filters) => {
                            pending_prunes -= 1;
                            let orphaned: Vec<Filter> = {
                                let registry = registry.lock().unwrap_or_else(|e| e.into_inner());
                                filters.into_iter().filter(|f| !registry.is_held(f)).collect()
                            };
                            if !orphaned.is_empty() {
                                pruned.merge(prune(self.engine.as_ref(), &orphaned).await);
                            }
                        }
                    }
                    if live == 0 && pending_prunes == 0 {
                        idle_since = Some(Instant::now());
                    }
                }
            }
        };

        ServerOutcome { reason, pruned }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle one client until it says `shutdown` or disappears.
async fn serve_connection(
    stream: TcpStream,
    registry: Arc<Mutex<Registry>>,
    events: mpsc::UnboundedSender<Event>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut held: Vec<Filter> = Vec::new();

    let graceful = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break false,
            Err(e) => {
                tracing::debug!("Reaper connection error: {}", e);
                break false;
            }
        };

        let (reply, shutdown) = match Request::parse(&line) {
            Ok(Request::Filter(filter)) => {
                tracing::info!("Watching {}", filter);
                registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .hold(&filter);
                held.push(filter);
                (Reply::Ack, false)
            }
            Ok(Request::Shutdown) => (Reply::Ack, true),
            Err(e) => {
                tracing::debug!("Rejected reaper line: {}", e);
                (Reply::Err(e.to_string()), false)
            }
        };

        if writer.write_all(reply.encode().as_bytes()).await.is_err() {
            break false;
        }
        if shutdown {
            let _ = writer.shutdown().await;
            break true;
        }
    };

    registry
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .release(&held);

    let event = if graceful {
        tracing::debug!("Reaper client closed gracefully");
        Event::Closed
    } else {
        Event::Lost(held)
    };
    let _ = events.send(event);
}
