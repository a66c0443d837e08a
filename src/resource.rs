//! Resource state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of engine object managed by dockyard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Container,
    Network,
    Volume,
    Image,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Container => "container",
            Self::Network => "network",
            Self::Volume => "volume",
            Self::Image => "image",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Described but not yet created on the engine.
    Unrealized,
    /// Created on the engine.
    Created,
    /// Start requested and accepted by the engine.
    Started,
    /// Every wait strategy reported ready.
    Ready,
    /// Stopped by the caller or by disposal.
    Stopped,
    /// Removed from the engine.
    Removed,
    /// A transition failed. Absorbing.
    Error,
}

impl ResourceState {
    /// Check if this state allows transitioning to another state.
    ///
    /// Transitions only move forward; `Ready` is only reachable from `Started`.
    pub fn can_transition_to(&self, target: ResourceState) -> bool {
        use ResourceState::*;

        if *self == Error {
            return false;
        }

        matches!(
            (self, target),
            (_, Error) |
            (Unrealized, Created) | (Unrealized, Removed) |
            (Created, Started) | (Created, Stopped) | (Created, Removed) |
            (Started, Ready) | (Started, Stopped) | (Started, Removed) |
            (Ready, Stopped) | (Ready, Removed) |
            (Stopped, Removed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed | Self::Error)
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unrealized => "unrealized",
            Self::Created => "created",
            Self::Started => "started",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ResourceState,
    pub to: ResourceState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Runtime counterpart of a configuration.
///
/// Owned by the orchestrator; callers only see it through handles.
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    /// Kind of engine object.
    pub kind: ResourceKind,
    /// Name requested by the configuration (or the image reference).
    pub name: String,
    /// Engine-assigned identifier, absent until created.
    pub id: Option<String>,
    /// Labels applied at creation (always includes the session label).
    pub labels: BTreeMap<String, String>,
    /// Current state.
    pub state: ResourceState,
    /// State transition history.
    pub transitions: Vec<StateTransition>,
}

impl Resource {
    /// A resource that has not been created yet.
    pub fn unrealized(
        kind: ResourceKind,
        name: impl Into<String>,
        labels: BTreeMap<String, String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            id: None,
            labels,
            state: ResourceState::Unrealized,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: ResourceState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition {} '{}' from {} to {}",
                self.kind, self.name, self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;
        Ok(())
    }

    /// Record the engine id and move to `Created`.
    pub fn mark_created(&mut self, id: impl Into<String>) -> Result<(), String> {
        self.transition_to(ResourceState::Created, None)?;
        self.id = Some(id.into());
        Ok(())
    }

    /// Move to `Error`, keeping the failure reason in the history.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        let _ = self.transition_to(ResourceState::Error, Some(reason.into()));
    }

    /// Identifier to address the engine with: id if known, otherwise the name.
    pub fn engine_ref(&self) -> Option<&str> {
        self.id.as_deref()
    }
}
