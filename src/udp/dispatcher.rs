use crate::directory::SessionDirectory;
use crate::udp::bridge::Bridge;
use crate::udp::packet::{self, Datagram, SessionId};
use crate::udp::registry::BridgeRegistry;
use crate::udp::stats::RelayCounters;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Why a session could not get a bridge
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("session is not connected to any backend")]
    Unroutable,

    #[error("failed to open backend socket: {0}")]
    Socket(#[source] io::Error),
}

/// Single consumer of the ingress queue.
///
/// Classifies every datagram, finds or opens the bridge of its session and
/// hands the datagram over unchanged. Being the only consumer keeps the
/// per-session order of the public socket.
pub struct Dispatcher {
    public: Arc<UdpSocket>,
    registry: Arc<BridgeRegistry>,
    directory: Arc<dyn SessionDirectory>,
    counters: Arc<RelayCounters>,
    cancel: CancellationToken,
    max_bridges: Option<usize>,
}

impl Dispatcher {
    pub fn new(
        public: Arc<UdpSocket>,
        registry: Arc<BridgeRegistry>,
        directory: Arc<dyn SessionDirectory>,
        counters: Arc<RelayCounters>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            public,
            registry,
            directory,
            counters,
            cancel,
            max_bridges: None,
        }
    }

    /// Refuse new sessions once this many bridges are established
    pub fn with_max_bridges(mut self, max_bridges: Option<usize>) -> Self {
        self.max_bridges = max_bridges;
        self
    }

    /// Drain the queue until cancelled or the listener goes away
    pub async fn run(self, mut queue: mpsc::UnboundedReceiver<Datagram>) {
        debug!("Voice dispatcher started");

        loop {
            let datagram = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(datagram) => datagram,
                    None => break,
                },
            };

            // A slow directory lookup must not hold up shutdown
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.dispatch(datagram) => {}
            }
        }

        debug!("Voice dispatcher stopped");
    }

    async fn dispatch(&self, datagram: Datagram) {
        let session = match packet::parse_header(&datagram.data) {
            Ok(session) => session,
            Err(e) => {
                trace!("Discarding datagram from {}: {}", datagram.source, e);
                self.counters.record_discarded(e.reason());
                return;
            }
        };

        let Some(bridge) = self.bridge_for(session, datagram.source).await else {
            return;
        };

        if let Err(e) = bridge.relay(&datagram.data).await {
            warn!(
                "Failed to relay datagram for session {} to {}: {}",
                session,
                bridge.backend(),
                e
            );
        }
    }

    async fn bridge_for(&self, session: SessionId, source: SocketAddr) -> Option<Arc<Bridge>> {
        if let Some(bridge) = self.registry.get(&session) {
            if bridge.is_active() {
                return Some(bridge);
            }
            debug!("Replacing stopped bridge for session {}", session);
            self.registry.evict(&session, &bridge);
        } else if let Some(max) = self.max_bridges {
            if self.registry.len() >= max {
                warn!(
                    "Bridge limit of {} reached, dropping datagram for session {}",
                    max, session
                );
                self.counters.record_discarded("capacity");
                return None;
            }
        }

        match self
            .registry
            .get_or_create(session, || self.open_bridge(session, source))
            .await
        {
            Ok(bridge) => bridge,
            Err(RouteError::Unroutable) => {
                trace!("No route for session {} from {}", session, source);
                self.counters.record_discarded("unroutable");
                None
            }
            Err(e) => {
                warn!("Failed to open bridge for session {}: {}", session, e);
                self.counters.record_discarded("bridge_error");
                None
            }
        }
    }

    async fn open_bridge(
        &self,
        session: SessionId,
        peer: SocketAddr,
    ) -> Result<Arc<Bridge>, RouteError> {
        let backend = self
            .directory
            .resolve_backend(session)
            .await
            .ok_or(RouteError::Unroutable)?;

        let bridge = Bridge::spawn(
            session,
            peer,
            backend,
            Arc::clone(&self.public),
            self.cancel.child_token(),
            Arc::clone(&self.counters),
        )
        .await
        .map_err(RouteError::Socket)?;

        info!(
            "Established voice bridge for session {} ({} -> {})",
            session, peer, backend
        );

        Ok(bridge)
    }
}
