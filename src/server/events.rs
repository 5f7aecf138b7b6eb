//! Events reported to the owner of a [`Server`](super::Server).

use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, ErrorCategory};

use super::stats::ConnectionStats;

/// Listener-level failure as seen by the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub message: String,
}

impl From<&Error> for ErrorReport {
    fn from(err: &Error) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
        }
    }
}

/// Everything the engine tells its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Listener started or stopped
    StateChanged { running: bool },
    /// Listener failure (invalid port, bind, accept)
    Error(ErrorReport),
    /// A connection changed; a `Closed` snapshot is the last one for its id
    ConnectionUpdated(ConnectionStats),
}

/// Receiver of [`ServerEvent`]s.
///
/// Called from connection tasks, so implementations must not block.
pub trait EventSink: Send + Sync + 'static {
    /// Deliver one event.
    fn send_event(&self, event: ServerEvent);
}

impl EventSink for mpsc::UnboundedSender<ServerEvent> {
    fn send_event(&self, event: ServerEvent) {
        // Owner went away; nothing left to report to
        let _ = self.send(event);
    }
}

/// Adapts a closure into an [`EventSink`].
pub struct CallbackSink<F>(pub F);

impl<F> EventSink for CallbackSink<F>
where
    F: Fn(ServerEvent) + Send + Sync + 'static,
{
    fn send_event(&self, event: ServerEvent) {
        (self.0)(event)
    }
}
