use super::{SessionDirectory, SessionEvent};
use crate::config::Config;
use crate::udp::SessionId;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

type SessionTable = HashMap<SessionId, SocketAddr>;

/// Session directory backed by the `sessions` table of the config file.
///
/// The table can be swapped at runtime; [`StaticDirectory::reload`] reports
/// which sessions were moved or dropped so their bridges can be torn down.
pub struct StaticDirectory {
    sessions: ArcSwap<SessionTable>,
}

impl StaticDirectory {
    pub fn new(sessions: SessionTable) -> Self {
        Self {
            sessions: ArcSwap::from_pointee(sessions),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.session_table())
    }

    /// Replace the table, returning the events implied by the change
    pub fn reload(&self, sessions: SessionTable) -> Vec<SessionEvent> {
        let previous = self.sessions.swap(Arc::new(sessions));
        let current = self.sessions.load();

        let mut events: Vec<SessionEvent> = previous
            .iter()
            .filter_map(|(session, backend)| match current.get(session) {
                None => Some(SessionEvent::Disconnected(*session)),
                Some(next) if next != backend => {
                    debug!("Session {} moved from {} to {}", session, backend, next);
                    Some(SessionEvent::SwitchedBackend(*session))
                }
                Some(_) => None,
            })
            .collect();
        events.sort_by_key(|event| event.session());

        info!(
            "Session directory reloaded: {} sessions, {} changed",
            current.len(),
            events.len()
        );

        events
    }

    pub fn len(&self) -> usize {
        self.sessions.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.load().is_empty()
    }
}

#[async_trait]
impl SessionDirectory for StaticDirectory {
    async fn resolve_backend(&self, session: SessionId) -> Option<SocketAddr> {
        self.sessions.load().get(&session).copied()
    }
}
