mod static_dir;

pub use static_dir::StaticDirectory;

use crate::udp::SessionId;
use async_trait::async_trait;
use std::net::SocketAddr;

/// Source of truth for where each voice session is currently connected.
///
/// The relay consults it only when the first datagram of a session arrives.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Backend the session is connected to, or `None` if the session is
    /// unknown or not attached to any backend right now
    async fn resolve_backend(&self, session: SessionId) -> Option<SocketAddr>;
}

/// Session lifecycle changes that invalidate an established bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session moved to a different backend
    SwitchedBackend(SessionId),
    /// The session left the host entirely
    Disconnected(SessionId),
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::SwitchedBackend(session) | SessionEvent::Disconnected(session) => {
                *session
            }
        }
    }
}
