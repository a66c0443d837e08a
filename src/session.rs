//! Per-run session identity.
//!
//! Every resource created through an orchestrator carries the session
//! label; the reaper watches that label and prunes whatever is left behind.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use uuid::Uuid;

use crate::reaper::Filter;

/// Label carrying the session id.
pub const SESSION_LABEL: &str = "dockyard.session-id";
/// Label marking objects created by dockyard.
pub const MANAGED_LABEL: &str = "dockyard.managed";
/// Label carried by reaper sidecars, which are never pruned by the session filter.
pub const REAPER_LABEL: &str = "dockyard.reaper";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session {
    id: Uuid,
}

impl Session {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    pub fn from_id(id: Uuid) -> Self {
        Self { id }
    }

    /// The process-wide session.
    pub fn current() -> Self {
        static CURRENT: OnceLock<Session> = OnceLock::new();
        *CURRENT.get_or_init(Session::new)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Labels attached to every resource of this session.
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (SESSION_LABEL.to_string(), self.id.to_string()),
            (MANAGED_LABEL.to_string(), "true".to_string()),
        ])
    }

    /// Reaper filter matching this session's resources.
    pub fn filter(&self) -> Filter {
        Filter::new(SESSION_LABEL, self.id.to_string())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
