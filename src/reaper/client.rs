//! Client side of the reaper protocol.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::ReaperError;
use crate::reaper::protocol::{Filter, Reply, Request};

const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Lifecycle of a reaper connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    /// At least one filter acknowledged.
    Registered,
    /// Every initial filter acknowledged; the open connection is the heartbeat.
    Alive,
    /// Shut down on purpose.
    Closed,
    /// The connection broke.
    Lost,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// A live connection to the reaper.
///
/// Writes are serialized: only one request is in flight at a time.
/// Dropping the session without [`ReaperSession::shutdown`] closes the
/// socket, which the reaper treats as a lost client.
pub struct ReaperSession {
    addr: String,
    connection: Mutex<Option<Connection>>,
    state: StdMutex<SessionState>,
    filters: StdMutex<Vec<Filter>>,
}

impl std::fmt::Debug for ReaperSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaperSession")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl ReaperSession {
    /// Connect, retrying until `timeout`, and register `filters`.
    pub async fn connect(
        addr: &str,
        filters: &[Filter],
        timeout: Duration,
    ) -> Result<Self, ReaperError> {
        let deadline = Instant::now() + timeout;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(e) if Instant::now() + RETRY_INTERVAL < deadline => {
                    tracing::debug!("Reaper at {} not reachable yet: {}", addr, e);
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(ReaperError::Unreachable {
                        addr: addr.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        };
        let (reader, writer) = stream.into_split();

        let session = Self {
            addr: addr.to_string(),
            connection: Mutex::new(Some(Connection {
                reader: BufReader::new(reader),
                writer,
            })),
            state: StdMutex::new(SessionState::Connecting),
            filters: StdMutex::new(Vec::new()),
        };

        for filter in filters {
            session.register(filter).await?;
        }
        session.set_state(SessionState::Alive);
        tracing::info!("Reaper session alive at {} ({} filter(s))", addr, filters.len());
        Ok(session)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Filters acknowledged so far.
    pub fn filters(&self) -> Vec<Filter> {
        self.filters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Register one more filter. Waits for the `ACK`.
    pub async fn register(&self, filter: &Filter) -> Result<(), ReaperError> {
        let reply = self.request(&Request::Filter(filter.clone())).await?;
        match reply {
            Reply::Ack => {
                self.filters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(filter.clone());
                if self.state() == SessionState::Connecting {
                    self.set_state(SessionState::Registered);
                }
                Ok(())
            }
            Reply::Err(reason) => Err(ReaperError::Refused {
                filter: filter.to_string(),
                reply: reason,
            }),
        }
    }

    /// Tell the reaper this session ended on purpose, then close.
    pub async fn shutdown(&self) -> Result<(), ReaperError> {
        if matches!(self.state(), SessionState::Closed | SessionState::Lost) {
            return Ok(());
        }
        let reply = self.request(&Request::Shutdown).await;
        self.connection.lock().await.take();
        match reply {
            Ok(Reply::Ack) => {
                self.set_state(SessionState::Closed);
                tracing::debug!("Reaper session at {} closed", self.addr);
                Ok(())
            }
            Ok(Reply::Err(reason)) => {
                self.set_state(SessionState::Closed);
                Err(ReaperError::Refused {
                    filter: "shutdown".to_string(),
                    reply: reason,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn request(&self, request: &Request) -> Result<Reply, ReaperError> {
        let mut guard = self.connection.lock().await;
        let Some(connection) = guard.as_mut() else {
            return Err(ReaperError::ConnectionLost {
                reason: "session is closed".to_string(),
            });
        };

        let result = exchange(connection, request).await;
        if let Err(e) = &result {
            tracing::warn!("Reaper session at {} lost: {}", self.addr, e);
            guard.take();
            self.set_state(SessionState::Lost);
        }
        result
    }
}

async fn exchange(connection: &mut Connection, request: &Request) -> Result<Reply, ReaperError> {
    let lost = |e: std::io::Error| ReaperError::ConnectionLost {
        reason: e.to_string(),
    };

    connection
        .writer
        .write_all(request.encode().as_bytes())
        .await
        .map_err(lost)?;
    connection.writer.flush().await.map_err(lost)?;

    let mut line = String::new();
    let read = connection.reader.read_line(&mut line).await.map_err(lost)?;
    if read == 0 {
        return Err(ReaperError::ConnectionLost {
            reason: "reaper closed the connection".to_string(),
        });
    }
    Reply::parse(&line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Answers each line with a fixed reply.
    async fn scripted_server(reply: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                if writer.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_registers_filters_and_becomes_alive() {
        let addr = scripted_server("ACK\n").await;
        let session = ReaperSession::connect(&addr, &[Filter::new("a", "1")], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Alive);
        assert_eq!(session.filters(), vec![Filter::new("a", "1")]);

        session.register(&Filter::new("b", "2")).await.unwrap();
        assert_eq!(session.filters().len(), 2);

        session.shutdown().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.register(&Filter::new("c", "3")).await.is_err());
    }

    #[tokio::test]
    async fn test_refused_filter() {
        let addr = scripted_server("ERR nope\n").await;
        let err = ReaperSession::connect(&addr, &[Filter::new("a", "1")], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaperError::Refused { ref reply, .. } if reply == "nope"));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = ReaperSession::connect(&addr, &[], Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaperError::Unreachable { .. }));
    }
}
