//! Line protocol between a session and the reaper.
//!
//! ```text
//! client -> server: "filter <key>=<value>\n"  -> "ACK\n"
//! client -> server: "shutdown\n"              -> "ACK\n", then close
//! anything else                               -> "ERR <reason>\n"
//! ```

use std::fmt;

use crate::error::ReaperError;

/// Label filter watched by the reaper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Filter {
    pub key: String,
    pub value: String,
}

impl Filter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse `key=value`.
    pub fn parse(text: &str) -> Result<Self, ReaperError> {
        let malformed = |reason: &str| ReaperError::Malformed {
            line: text.to_string(),
            reason: reason.to_string(),
        };
        let (key, value) = text.split_once('=').ok_or_else(|| malformed("expected key=value"))?;
        if key.is_empty() {
            return Err(malformed("empty label key"));
        }
        if key.contains(char::is_whitespace) {
            return Err(malformed("label key contains whitespace"));
        }
        Ok(Self::new(key, value))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Client to server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Filter(Filter),
    Shutdown,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, ReaperError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "shutdown" {
            return Ok(Request::Shutdown);
        }
        match line.split_once(' ') {
            Some(("filter", filter)) => Ok(Request::Filter(Filter::parse(filter)?)),
            _ => Err(ReaperError::Malformed {
                line: line.to_string(),
                reason: "unknown command".to_string(),
            }),
        }
    }

    /// Wire form, newline-terminated.
    pub fn encode(&self) -> String {
        match self {
            Request::Filter(filter) => format!("filter {}\n", filter),
            Request::Shutdown => "shutdown\n".to_string(),
        }
    }
}

/// Server to client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Err(String),
}

impl Reply {
    pub fn parse(line: &str) -> Result<Self, ReaperError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "ACK" {
            return Ok(Reply::Ack);
        }
        match line.strip_prefix("ERR") {
            Some(reason) => Ok(Reply::Err(reason.trim_start().to_string())),
            None => Err(ReaperError::Malformed {
                line: line.to_string(),
                reason: "expected ACK or ERR".to_string(),
            }),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Reply::Ack => "ACK\n".to_string(),
            Reply::Err(reason) => format!("ERR {}\n", reason.replace('\n', " ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter_request() {
        let request = Request::parse("filter dockyard.session-id=abc-123\n").unwrap();
        assert_eq!(
            request,
            Request::Filter(Filter::new("dockyard.session-id", "abc-123"))
        );
        assert_eq!(request.encode(), "filter dockyard.session-id=abc-123\n");
    }

    #[test]
    fn test_value_may_contain_equals() {
        let filter = Filter::parse("k=a=b").unwrap();
        assert_eq!(filter.value, "a=b");
    }

    #[test]
    fn test_malformed_requests() {
        for line in ["", "filter", "filter novalue", "filter =x", "stop", "FILTER a=b"] {
            assert!(Request::parse(line).is_err(), "{line:?} should be rejected");
        }
        assert_eq!(Request::parse("shutdown\r\n").unwrap(), Request::Shutdown);
    }

    #[test]
    fn test_replies() {
        assert_eq!(Reply::parse("ACK\n").unwrap(), Reply::Ack);
        assert_eq!(
            Reply::parse("ERR unknown command").unwrap(),
            Reply::Err("unknown command".to_string())
        );
        assert!(Reply::parse("OK").is_err());
        assert_eq!(Reply::Err("a\nb".to_string()).encode(), "ERR a b\n");
    }
}
