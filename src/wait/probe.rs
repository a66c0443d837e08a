//! Readiness probes.
//!
//! A probe answers one question per poll: is the target usable yet? Both
//! `Ok(false)` and `Err(_)` mean "not yet"; the polling loop decides when to
//! give up.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use regex::Regex;
use reqwest::Method;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::configuration::container::normalize_port;
use crate::error::EngineError;
use crate::wait::WaitTarget;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a single poll did not succeed.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ProbeError(pub String);

impl ProbeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<EngineError> for ProbeError {
    fn from(e: EngineError) -> Self {
        Self(e.to_string())
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(e: reqwest::Error) -> Self {
        Self(e.to_string())
    }
}

/// A single readiness check evaluated on every poll tick.
#[async_trait]
pub trait ReadinessProbe: Send + Sync + fmt::Debug {
    /// Human-readable description used in logs and errors.
    fn describe(&self) -> String;

    /// Problems detectable before the first poll.
    fn violations(&self) -> Vec<String> {
        Vec::new()
    }

    /// Evaluate once against the target.
    async fn check(&self, target: &dyn WaitTarget) -> Result<bool, ProbeError>;
}

/// TCP connect to the host side of a mapped port.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub port: String,
}

impl TcpProbe {
    pub fn new(port: u16) -> Self {
        Self {
            port: normalize_port(&port.to_string()),
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    fn describe(&self) -> String {
        format!("tcp {}", self.port)
    }

    async fn check(&self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        let host_port = target.mapped_port(&self.port).await?;
        let addr = format!("{}:{}", target.host(), host_port);
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(ProbeError(format!("connect {}: {}", addr, e))),
            Err(_) => Err(ProbeError(format!("connect {}: timed out", addr))),
        }
    }
}

/// Decides whether an HTTP response means ready.
pub type ResponseMatcher = dyn Fn(u16, &str) -> bool + Send + Sync;

/// HTTP request against a mapped port and path.
#[derive(Clone)]
pub struct HttpProbe {
    port: String,
    path: String,
    method: Method,
    tls: bool,
    headers: BTreeMap<String, String>,
    body: Option<String>,
    matcher: Arc<ResponseMatcher>,
    client: reqwest::Client,
}

impl HttpProbe {
    /// `GET path` on the container port, ready on any 2xx.
    pub fn get(port: u16, path: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self {
            port: normalize_port(&port.to_string()),
            path: path.into(),
            method: Method::GET,
            tls: false,
            headers: BTreeMap::new(),
            body: None,
            matcher: Arc::new(|status, _| (200..300).contains(&status)),
            client,
        }
    }

    /// `POST path` with a body.
    pub fn post(port: u16, path: impl Into<String>, body: impl Into<String>) -> Self {
        let mut probe = Self::get(port, path);
        probe.method = Method::POST;
        probe.body = Some(body.into());
        probe
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Ready only on this exact status.
    pub fn with_status(self, expected: u16) -> Self {
        self.matching(move |status, _| status == expected)
    }

    /// Caller-supplied status/body matcher.
    pub fn matching<F>(mut self, matcher: F) -> Self
    where
        F: Fn(u16, &str) -> bool + Send + Sync + 'static,
    {
        self.matcher = Arc::new(matcher);
        self
    }

    fn url(&self, host: &str, port: u16) -> Result<url::Url, ProbeError> {
        let scheme = if self.tls { "https" } else { "http" };
        let base = url::Url::parse(&format!("{}://{}:{}/", scheme, host, port))
            .map_err(|e| ProbeError(format!("invalid url: {}", e)))?;
        base.join(self.path.trim_start_matches('/'))
            .map_err(|e| ProbeError(format!("invalid path '{}': {}", self.path, e)))
    }
}

impl fmt::Debug for HttpProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProbe")
            .field("port", &self.port)
            .field("path", &self.path)
            .field("method", &self.method)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ReadinessProbe for HttpProbe {
    fn describe(&self) -> String {
        format!("http {} {} on {}", self.method, self.path, self.port)
    }

    fn violations(&self) -> Vec<String> {
        if self.path.contains(char::is_whitespace) {
            vec![format!("http probe path '{}' must not contain whitespace", self.path)]
        } else {
            Vec::new()
        }
    }

    async fn check(&self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        let host_port = target.mapped_port(&self.port).await?;
        let url = self.url(target.host(), host_port)?;

        let mut request = self.client.request(self.method.clone(), url.as_str());
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if (self.matcher)(status, &body) {
            Ok(true)
        } else {
            Err(ProbeError(format!("{} answered {}", url, status)))
        }
    }
}

/// One-shot command inside the container, compared against an exit code.
#[derive(Debug, Clone)]
pub struct ExecProbe {
    pub command: Vec<String>,
    pub expected_exit_code: i64,
}

impl ExecProbe {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            expected_exit_code: 0,
        }
    }

    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.expected_exit_code = code;
        self
    }
}

#[async_trait]
impl ReadinessProbe for ExecProbe {
    fn describe(&self) -> String {
        format!("exec '{}'", self.command.join(" "))
    }

    fn violations(&self) -> Vec<String> {
        if self.command.is_empty() {
            vec!["exec probe command must not be empty".to_string()]
        } else {
            Vec::new()
        }
    }

    async fn check(&self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        let result = target.exec(&self.command).await?;
        if result.exit_code == self.expected_exit_code {
            Ok(true)
        } else {
            Err(ProbeError(format!(
                "exit code {} (expected {}): {}",
                result.exit_code,
                self.expected_exit_code,
                result.stderr.trim()
            )))
        }
    }
}

/// Regex match against the combined output seen so far.
#[derive(Debug, Clone)]
pub struct LogProbe {
    source: String,
    pattern: Result<Regex, String>,
    occurrences: usize,
}

impl LogProbe {
    /// An invalid pattern surfaces as a build-time violation.
    pub fn new(pattern: &str) -> Self {
        Self {
            source: pattern.to_string(),
            pattern: Regex::new(pattern).map_err(|e| e.to_string()),
            occurrences: 1,
        }
    }

    /// Require the pattern to appear at least `times` times.
    pub fn times(mut self, times: usize) -> Self {
        self.occurrences = times;
        self
    }
}

#[async_trait]
impl ReadinessProbe for LogProbe {
    fn describe(&self) -> String {
        if self.occurrences == 1 {
            format!("log /{}/", self.source)
        } else {
            format!("log /{}/ x{}", self.source, self.occurrences)
        }
    }

    fn violations(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if let Err(e) = &self.pattern {
            violations.push(format!("invalid log pattern '{}': {}", self.source, e));
        }
        if self.occurrences == 0 {
            violations.push("log probe occurrences must be at least 1".to_string());
        }
        violations
    }

    async fn check(&self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        let pattern = self.pattern.as_ref().map_err(|e| ProbeError(e.clone()))?;
        let output = target.output();
        let seen = pattern.find_iter(&output).count();
        if seen >= self.occurrences {
            Ok(true)
        } else {
            Err(ProbeError(format!(
                "pattern /{}/ seen {} of {} times",
                self.source, seen, self.occurrences
            )))
        }
    }
}

/// Existence of a path on the host filesystem.
#[derive(Debug, Clone)]
pub struct FileProbe {
    pub path: PathBuf,
}

#[async_trait]
impl ReadinessProbe for FileProbe {
    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn check(&self, _target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        if tokio::fs::try_exists(&self.path).await? {
            Ok(true)
        } else {
            Err(ProbeError(format!("{} does not exist", self.path.display())))
        }
    }
}

/// Caller-supplied async predicate.
pub type ProbeFn =
    dyn for<'a> Fn(&'a dyn WaitTarget) -> BoxFuture<'a, Result<bool, ProbeError>> + Send + Sync;

#[derive(Clone)]
pub struct CustomProbe {
    pub name: String,
    predicate: Arc<ProbeFn>,
}

impl CustomProbe {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: for<'a> Fn(&'a dyn WaitTarget) -> BoxFuture<'a, Result<bool, ProbeError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

impl fmt::Debug for CustomProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CustomProbe({})", self.name)
    }
}

#[async_trait]
impl ReadinessProbe for CustomProbe {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn check(&self, target: &dyn WaitTarget) -> Result<bool, ProbeError> {
        (self.predicate)(target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExecResult;
    use crate::wait::tests::StubTarget;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = StubTarget::default().with_port("6379/tcp", port);

        assert!(TcpProbe::new(6379).check(&target).await.unwrap());
    }

    #[tokio::test]
    async fn test_tcp_probe_unmapped_port_is_an_error() {
        let target = StubTarget::default();
        assert!(TcpProbe::new(6379).check(&target).await.is_err());
    }

    #[tokio::test]
    async fn test_log_probe_counts_occurrences() {
        let target = StubTarget::default().with_output("ready\nstarting\nready\n");
        assert!(LogProbe::new("ready").times(2).check(&target).await.unwrap());

        let err = LogProbe::new("ready").times(3).check(&target).await.unwrap_err();
        assert!(err.0.contains("2 of 3"));
    }

    #[test]
    fn test_log_probe_invalid_pattern_is_a_violation() {
        let probe = LogProbe::new("(unclosed");
        assert_eq!(probe.violations().len(), 1);
        assert!(LogProbe::new("ok").times(0).violations()[0].contains("at least 1"));
    }

    #[tokio::test]
    async fn test_exec_probe_compares_exit_code() {
        let target = StubTarget::default().with_exec(ExecResult {
            exit_code: 3,
            stdout: String::new(),
            stderr: "not yet".to_string(),
        });
        assert!(ExecProbe::new(["pg_isready"]).with_exit_code(3).check(&target).await.unwrap());
        let err = ExecProbe::new(["pg_isready"]).check(&target).await.unwrap_err();
        assert!(err.0.contains("not yet"));
    }

    #[tokio::test]
    async fn test_file_probe_sees_host_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready.flag");
        let probe = FileProbe { path: path.clone() };
        let target = StubTarget::default();

        assert!(probe.check(&target).await.is_err());
        std::fs::write(&path, b"1").unwrap();
        assert!(probe.check(&target).await.unwrap());
    }

    #[test]
    fn test_http_probe_url_joins_path() {
        let probe = HttpProbe::get(8080, "/health/live");
        let url = probe.url("127.0.0.1", 32768).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:32768/health/live");
        assert_eq!(probe.describe(), "http GET /health/live on 8080/tcp");
    }

    #[tokio::test]
    async fn test_http_probe_uses_matcher() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 7\r\nconnection: close\r\n\r\nwarming")
                    .await;
            }
        });
        let target = StubTarget::default().with_port("80/tcp", port);

        assert!(HttpProbe::get(80, "/").check(&target).await.is_err());
        let probe = HttpProbe::get(80, "/").matching(|status, body| status == 503 && body == "warming");
        assert!(probe.check(&target).await.unwrap());
    }
}
