use crate::metrics::Direction;
use crate::udp::packet::{MAX_DATAGRAM_SIZE, SessionId};
use crate::udp::stats::RelayCounters;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Lifecycle of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BridgeState {
    Created = 0,
    Running = 1,
    Interrupted = 2,
    Closed = 3,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BridgeState::Created,
            1 => BridgeState::Running,
            2 => BridgeState::Interrupted,
            _ => BridgeState::Closed,
        }
    }
}

/// Relay between one public peer and the backend its session is assigned to.
///
/// Client datagrams go out through a dedicated socket on an ephemeral port, so
/// the backend sees one distinct source per session. Replies arriving on that
/// socket are written back to the peer through the shared public socket.
pub struct Bridge {
    session: SessionId,
    peer: SocketAddr,
    backend: SocketAddr,
    /// Backend socket, cleared once the receive loop exits
    socket: ArcSwapOption<UdpSocket>,
    state: AtomicU8,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<RelayCounters>,
}

impl Bridge {
    /// Open the backend socket and start the receive loop.
    ///
    /// `cancel` should be a child of the service token so a service shutdown
    /// stops the bridge even if nobody interrupts it explicitly.
    pub async fn spawn(
        session: SessionId,
        peer: SocketAddr,
        backend: SocketAddr,
        public: Arc<UdpSocket>,
        cancel: CancellationToken,
        counters: Arc<RelayCounters>,
    ) -> io::Result<Arc<Self>> {
        let bind_addr: SocketAddr = if backend.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

        let bridge = Arc::new(Self {
            session,
            peer,
            backend,
            socket: ArcSwapOption::from(Some(Arc::clone(&socket))),
            state: AtomicU8::new(BridgeState::Created as u8),
            cancel,
            task: Mutex::new(None),
            counters,
        });

        bridge.counters.record_bridge_opened();
        let handle = tokio::spawn(Arc::clone(&bridge).receive_loop(socket, public));
        *bridge.task.lock() = Some(handle);

        // Only advance if nothing interrupted or closed us in the meantime
        let _ = bridge.state.compare_exchange(
            BridgeState::Created as u8,
            BridgeState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        debug!(
            "Bridge for session {} opened ({} <-> {})",
            session, peer, backend
        );

        Ok(bridge)
    }

    /// Send a client datagram to the backend, unchanged
    pub async fn relay(&self, data: &[u8]) -> io::Result<usize> {
        if !self.is_active() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "bridge is closed"));
        }

        let socket = self
            .socket
            .load_full()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "bridge is closed"))?;

        let sent = socket.send_to(data, self.backend).await?;
        self.counters.record_relayed(Direction::ToBackend, sent);

        trace!(
            "Relayed {} bytes for session {} to {}",
            sent, self.session, self.backend
        );

        Ok(sent)
    }

    /// Request teardown. Returns false if the bridge was already interrupted or closed.
    pub fn interrupt(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if BridgeState::from_u8(current) >= BridgeState::Interrupted {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                BridgeState::Interrupted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.cancel.cancel();
        debug!("Bridge for session {} interrupted", self.session);
        true
    }

    /// Wait for the receive loop to finish
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Bridge task for session {} failed: {}", self.session, e);
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>, public: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, from) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(
                            "Backend socket for session {} failed, closing bridge: {}",
                            self.session, e
                        );
                        break;
                    }
                },
            };

            // Multi-homed backends may answer from another address than the one dialed
            if from != self.backend {
                trace!(
                    "Reply for session {} came from {} instead of {}",
                    self.session, from, self.backend
                );
            }

            match public.send_to(&buf[..len], self.peer).await {
                Ok(sent) => self.counters.record_relayed(Direction::ToClient, sent),
                Err(e) => {
                    debug!(
                        "Failed to forward backend reply to {} for session {}: {}",
                        self.peer, self.session, e
                    );
                }
            }
        }

        self.state.store(BridgeState::Closed as u8, Ordering::Release);
        self.socket.store(None);
        drop(socket);
        drop(public);
        self.counters.record_bridge_closed();

        debug!("Bridge for session {} closed", self.session);
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn backend(&self) -> SocketAddr {
        self.backend
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Still accepting datagrams, neither interrupted nor closed
    pub fn is_active(&self) -> bool {
        self.state() < BridgeState::Interrupted
    }

    pub fn is_closed(&self) -> bool {
        self.state() == BridgeState::Closed
    }

    /// Local address of the backend socket while it is open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.load_full().and_then(|s| s.local_addr().ok())
    }
}
