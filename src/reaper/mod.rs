//! Dead-man's-switch cleanup.
//!
//! A session opens one long-lived connection to the reaper and registers its
//! label filter. If the process dies, the connection drops and the reaper
//! prunes every object carrying the label after a grace period.

mod client;
pub mod protocol;
mod prune;
mod server;
pub mod sidecar;

pub use client::{ReaperSession, SessionState};
pub use protocol::{Filter, Reply, Request};
pub use prune::{PruneReport, prune};
pub use server::{ExitReason, ReaperServer, ReaperServerConfig, ServerOutcome};
