//! Readiness waiting.
//!
//! A [`WaitStrategy`] pairs a [`ReadinessProbe`] with a [`PollPolicy`]. The
//! polling loop in [`poll`] drives one strategy to a [`WaitOutcome`];
//! [`wait_for_all`] runs a container's strategies in order.

mod poll;
pub mod probe;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

pub use poll::{WaitOutcome, poll_until_ready, wait_for_all};
pub use probe::{
    CustomProbe, ExecProbe, FileProbe, HttpProbe, LogProbe, ProbeError, ReadinessProbe, TcpProbe,
};

use crate::engine::ExecResult;

/// What a probe can observe about the resource it is waiting on.
#[async_trait]
pub trait WaitTarget: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Host on which mapped ports are reachable.
    fn host(&self) -> &str;

    /// Host port bound to a normalized container port (`"5432/tcp"`).
    async fn mapped_port(&self, container_port: &str) -> Result<u16, ProbeError>;

    /// Run a one-shot command inside the resource.
    async fn exec(&self, command: &[String]) -> Result<ExecResult, ProbeError>;

    /// Combined stdout/stderr seen so far.
    fn output(&self) -> String;
}

/// Polling interval, deadline, and fault tolerance of one strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    /// Give up early after this many failed checks in a row, negative or
    /// erroring alike. `None` only stops at the deadline.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
            max_consecutive_failures: None,
        }
    }
}

impl PollPolicy {
    pub fn violations(&self, strategy: &str) -> Vec<String> {
        let mut violations = Vec::new();
        if self.interval.is_zero() {
            violations.push(format!("{}: poll interval must be positive", strategy));
        }
        if self.timeout.is_zero() {
            violations.push(format!("{}: timeout must be positive", strategy));
        }
        if self.max_consecutive_failures == Some(0) {
            violations.push(format!("{}: max failures must be at least 1", strategy));
        }
        violations
    }
}

/// A readiness probe plus its polling policy.
///
/// Unset policy fields fall back to the defaults passed to
/// [`WaitStrategy::policy_with`].
#[derive(Debug, Clone)]
pub struct WaitStrategy {
    probe: Arc<dyn ReadinessProbe>,
    timeout: Option<Duration>,
    interval: Option<Duration>,
    max_failures: Option<u32>,
}

impl WaitStrategy {
    pub fn new(probe: impl ReadinessProbe + 'static) -> Self {
        Self {
            probe: Arc::new(probe),
            timeout: None,
            interval: None,
            max_failures: None,
        }
    }

    /// TCP connect to the mapped host port.
    pub fn tcp(port: u16) -> Self {
        Self::new(TcpProbe::new(port))
    }

    /// HTTP request, see [`HttpProbe`].
    pub fn http(probe: HttpProbe) -> Self {
        Self::new(probe)
    }

    /// Command inside the container exiting with 0.
    pub fn exec<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(ExecProbe::new(command))
    }

    /// Regex over the container output, matched once.
    pub fn log(pattern: &str) -> Self {
        Self::new(LogProbe::new(pattern))
    }

    /// Regex over the container output, matched `times` times.
    pub fn log_times(pattern: &str, times: usize) -> Self {
        Self::new(LogProbe::new(pattern).times(times))
    }

    /// Path existing on the host filesystem.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(FileProbe { path: path.into() })
    }

    /// Caller-supplied async predicate.
    pub fn custom<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: for<'a> Fn(&'a dyn WaitTarget) -> BoxFuture<'a, Result<bool, ProbeError>>
            + Send
            + Sync
            + 'static,
    {
        Self::new(CustomProbe::new(name, predicate))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_max_failures(mut self, failures: u32) -> Self {
        self.max_failures = Some(failures);
        self
    }

    pub fn probe(&self) -> &dyn ReadinessProbe {
        self.probe.as_ref()
    }

    pub fn describe(&self) -> String {
        self.probe.describe()
    }

    /// Policy with built-in defaults for unset fields.
    pub fn policy(&self) -> PollPolicy {
        self.policy_with(&PollPolicy::default())
    }

    /// Policy with `defaults` for unset fields.
    pub fn policy_with(&self, defaults: &PollPolicy) -> PollPolicy {
        PollPolicy {
            interval: self.interval.unwrap_or(defaults.interval),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            max_consecutive_failures: self.max_failures.or(defaults.max_consecutive_failures),
        }
    }

    /// Every policy and probe violation.
    pub fn violations(&self) -> Vec<String> {
        let description = self.describe();
        let mut violations = self.policy().violations(&description);
        violations.extend(self.probe.violations());
        violations
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Target with canned ports, output, and exec results.
    #[derive(Default)]
    pub(crate) struct StubTarget {
        ports: BTreeMap<String, u16>,
        output: Mutex<String>,
        exec: Option<ExecResult>,
    }

    impl StubTarget {
        pub(crate) fn with_port(mut self, container_port: &str, host_port: u16) -> Self {
            self.ports.insert(container_port.to_string(), host_port);
            self
        }

        pub(crate) fn with_output(self, output: &str) -> Self {
            *self.output.lock().unwrap() = output.to_string();
            self
        }

        pub(crate) fn with_exec(mut self, result: ExecResult) -> Self {
            self.exec = Some(result);
            self
        }
    }

    #[async_trait]
    impl WaitTarget for StubTarget {
        fn name(&self) -> &str {
            "stub"
        }

        fn host(&self) -> &str {
            "127.0.0.1"
        }

        async fn mapped_port(&self, container_port: &str) -> Result<u16, ProbeError> {
            self.ports
                .get(container_port)
                .copied()
                .ok_or_else(|| ProbeError(format!("{} is not mapped", container_port)))
        }

        async fn exec(&self, _command: &[String]) -> Result<ExecResult, ProbeError> {
            self.exec
                .clone()
                .ok_or_else(|| ProbeError::new("exec unsupported"))
        }

        fn output(&self) -> String {
            self.output.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_policy_falls_back_to_defaults() {
        let defaults = PollPolicy {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
            max_consecutive_failures: Some(3),
        };
        let policy = WaitStrategy::tcp(80)
            .with_timeout(Duration::from_secs(1))
            .policy_with(&defaults);
        assert_eq!(policy.timeout, Duration::from_secs(1));
        assert_eq!(policy.interval, Duration::from_millis(100));
        assert_eq!(policy.max_consecutive_failures, Some(3));
    }

    #[test]
    fn test_zero_interval_is_a_violation() {
        let strategy = WaitStrategy::tcp(80).with_interval(Duration::ZERO);
        let violations = strategy.violations();
        assert_eq!(violations, vec!["tcp 80/tcp: poll interval must be positive".to_string()]);
    }

    #[test]
    fn test_describe_names_the_probe() {
        assert_eq!(WaitStrategy::log("ready").describe(), "log /ready/");
        assert_eq!(WaitStrategy::exec(["true"]).describe(), "exec 'true'");
        assert_eq!(
            WaitStrategy::custom("always", |_| Box::pin(async { Ok(true) })).describe(),
            "always"
        );
    }
}
