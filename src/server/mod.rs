mod udp_listener;

pub use udp_listener::{IngressListener, MAX_CONSECUTIVE_RECV_ERRORS};

use crate::directory::{SessionDirectory, SessionEvent};
use crate::udp::{Bridge, BridgeRegistry, Dispatcher, RelayCounters, RelayStats, SessionId};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Voice relay lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to bind voice relay to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),

    #[error("voice relay is already running")]
    AlreadyStarted,

    #[error("voice relay has been shut down")]
    Stopped,

    #[error("public socket keeps failing: {0}")]
    Receive(#[source] io::Error),
}

/// Tasks owned by a started relay
struct RunningRelay {
    local_addr: SocketAddr,
    ingress: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Multiplexes one public UDP port across the backends of many sessions.
///
/// A service runs once: after [`RelayService::shutdown`] it cannot be started
/// again.
pub struct RelayService {
    bind_address: SocketAddr,
    max_bridges: Option<usize>,
    directory: Arc<dyn SessionDirectory>,
    registry: Arc<BridgeRegistry>,
    counters: Arc<RelayCounters>,
    cancel: CancellationToken,
    started: AtomicBool,
    running: Mutex<Option<RunningRelay>>,
    #[cfg(test)]
    ingress_faults: Mutex<Option<mpsc::UnboundedReceiver<io::Error>>>,
}

impl RelayService {
    pub fn new(bind_address: SocketAddr, directory: Arc<dyn SessionDirectory>) -> Self {
        Self {
            bind_address,
            max_bridges: None,
            directory,
            registry: Arc::new(BridgeRegistry::new()),
            counters: Arc::new(RelayCounters::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            running: Mutex::new(None),
            #[cfg(test)]
            ingress_faults: Mutex::new(None),
        }
    }

    /// Cap the number of concurrently established bridges
    pub fn with_max_bridges(mut self, max_bridges: usize) -> Self {
        self.max_bridges = Some(max_bridges);
        self
    }

    /// Bind the public socket, then start the dispatcher and the ingress listener.
    ///
    /// Returns the address actually bound.
    pub async fn start(&self) -> Result<SocketAddr, RelayError> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::Stopped);
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RelayError::AlreadyStarted);
        }

        let (socket, local_addr) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let socket = Arc::new(socket);

        let (tx, rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher::new(
            Arc::clone(&socket),
            Arc::clone(&self.registry),
            Arc::clone(&self.directory),
            Arc::clone(&self.counters),
            self.cancel.clone(),
        )
        .with_max_bridges(self.max_bridges);
        let dispatcher = tokio::spawn(dispatcher.run(rx));

        let listener = IngressListener::new(
            socket,
            tx,
            self.cancel.clone(),
            Arc::clone(&self.counters),
        );
        #[cfg(test)]
        let listener = match self.ingress_faults.lock().take() {
            Some(faults) => listener.with_faults(faults),
            None => listener,
        };
        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.clone();
        let ingress = tokio::spawn(async move {
            if let Err(e) = listener.serve().await {
                error!("Voice relay encountered a fatal error and is shutting down: {}", e);
            }
            // Whatever stopped the listener stops everything downstream
            cancel.cancel();
            let bridges = registry.remove_all();
            for bridge in &bridges {
                bridge.interrupt();
            }
            for bridge in &bridges {
                bridge.join().await;
            }
            debug!("Closed {} voice bridges", bridges.len());
        });

        *self.running.lock() = Some(RunningRelay {
            local_addr,
            ingress,
            dispatcher,
        });

        info!("Voice relay started on {}", local_addr);
        Ok(local_addr)
    }

    async fn bind(&self) -> Result<(UdpSocket, SocketAddr), RelayError> {
        let socket = UdpSocket::bind(self.bind_address)
            .await
            .map_err(|source| RelayError::Bind {
                address: self.bind_address,
                source,
            })?;
        let local_addr = socket.local_addr().map_err(RelayError::LocalAddr)?;
        Ok((socket, local_addr))
    }

    /// Feed receive errors to the ingress listener of the next `start`
    #[cfg(test)]
    fn inject_ingress_faults(&self) -> mpsc::UnboundedSender<io::Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.ingress_faults.lock() = Some(rx);
        tx
    }

    /// Tear down the bridge of a session, if it has one.
    ///
    /// Returns whether a bridge was ended. Calling it again is a no-op.
    pub fn end_session(&self, session: SessionId) -> bool {
        match self.registry.remove(&session) {
            Some(bridge) => {
                bridge.interrupt();
                info!("Disconnected voice bridge for session {}", session);
                true
            }
            None => false,
        }
    }

    /// React to a session lifecycle event from the host
    pub fn handle_event(&self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::SwitchedBackend(session) => {
                debug!("Session {} is switching backends, ending its bridge", session);
            }
            SessionEvent::Disconnected(session) => {
                debug!("Session {} has disconnected, ending its bridge", session);
            }
        }
        self.end_session(event.session())
    }

    /// Stop accepting datagrams, close the public socket and every bridge
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let running = self.running.lock().take();
        if let Some(running) = running {
            let tasks = [("ingress", running.ingress), ("dispatcher", running.dispatcher)];
            for (name, handle) in tasks {
                if let Err(e) = handle.await {
                    warn!("Voice relay {} task failed: {}", name, e);
                }
            }
        }

        // Bridges opened while the dispatcher was winding down
        let bridges = self.registry.remove_all();
        for bridge in &bridges {
            bridge.interrupt();
        }
        for bridge in &bridges {
            bridge.join().await;
        }

        info!("Voice relay stopped");
    }

    /// Resolves once the relay has been shut down or failed fatally
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.local_addr)
    }

    /// The established bridge of a session
    pub fn bridge(&self, session: &SessionId) -> Option<Arc<Bridge>> {
        self.registry.get(session)
    }

    pub fn active_bridges(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::udp::BridgeState;
    use crate::udp::packet::frame;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(2);

    fn session(n: u64) -> SessionId {
        SessionId::from_u64_pair(0, n)
    }

    async fn loopback() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn started(
        table: HashMap<SessionId, SocketAddr>,
    ) -> (Arc<RelayService>, Arc<StaticDirectory>, SocketAddr) {
        let directory = Arc::new(StaticDirectory::new(table));
        let service = Arc::new(RelayService::new(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&directory) as Arc<dyn SessionDirectory>,
        ));
        let addr = service.start().await.unwrap();
        (service, directory, addr)
    }

    async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 256];
        let (len, from) = timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        (buf[..len].to_vec(), from)
    }

    async fn assert_silent(socket: &UdpSocket) {
        let mut buf = [0u8; 256];
        assert!(
            timeout(Duration::from_millis(200), socket.recv_from(&mut buf))
                .await
                .is_err()
        );
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_end_to_end_relay() {
        let backend = loopback().await;
        let backend_addr = backend.local_addr().unwrap();
        let (service, _, relay_addr) = started(HashMap::from([(session(1), backend_addr)])).await;
        let client = loopback().await;

        client
            .send_to(&frame(session(1), b"abc"), relay_addr)
            .await
            .unwrap();

        let (data, bridge_addr) = recv(&backend).await;
        let mut expected = vec![0xFF];
        expected.extend_from_slice(&[0u8; 15]);
        expected.push(0x01);
        expected.extend_from_slice(b"abc");
        assert_eq!(data, expected);

        backend.send_to(b"xyz", bridge_addr).await.unwrap();

        let (reply, from) = recv(&client).await;
        assert_eq!(reply, b"xyz");
        assert_eq!(from, relay_addr);

        let bridge = service.bridge(&session(1)).unwrap();
        assert_eq!(bridge.peer(), client.local_addr().unwrap());
        assert_eq!(bridge.backend(), backend_addr);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_unrecognized_datagrams_are_dropped() {
        let backend = loopback().await;
        let (service, _, relay_addr) =
            started(HashMap::from([(session(1), backend.local_addr().unwrap())])).await;
        let client = loopback().await;

        let mut wrong_magic = frame(session(1), b"abc").to_vec();
        wrong_magic[0] = 0x00;
        client.send_to(&wrong_magic, relay_addr).await.unwrap();
        client.send_to(&[0xFF, 0x00, 0x01], relay_addr).await.unwrap();

        wait_until(|| service.stats().discarded == 2).await;
        assert_silent(&backend).await;
        assert_eq!(service.active_bridges(), 0);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_unroutable_session_is_dropped() {
        let backend = loopback().await;
        let (service, _, relay_addr) =
            started(HashMap::from([(session(1), backend.local_addr().unwrap())])).await;
        let client = loopback().await;

        client
            .send_to(&frame(session(2), b"abc"), relay_addr)
            .await
            .unwrap();

        wait_until(|| service.stats().discarded == 1).await;
        assert_silent(&backend).await;
        assert_eq!(service.active_bridges(), 0);
        assert_eq!(service.stats().bridges_opened, 0);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_preserves_order_per_session() {
        let backend = loopback().await;
        let (service, _, relay_addr) =
            started(HashMap::from([(session(1), backend.local_addr().unwrap())])).await;
        let client = loopback().await;

        for i in 0u8..20 {
            client
                .send_to(&frame(session(1), &[i]), relay_addr)
                .await
                .unwrap();
        }

        for i in 0u8..20 {
            let (data, _) = recv(&backend).await;
            assert_eq!(data, frame(session(1), &[i]).to_vec());
        }
        assert_eq!(service.stats().bridges_opened, 1);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_interleaved_sessions_get_their_own_bridges() {
        let backend_a = loopback().await;
        let backend_b = loopback().await;
        let (service, _, relay_addr) = started(HashMap::from([
            (session(1), backend_a.local_addr().unwrap()),
            (session(2), backend_b.local_addr().unwrap()),
        ]))
        .await;
        let client_a = loopback().await;
        let client_b = loopback().await;

        client_a.send_to(&frame(session(1), b"a1"), relay_addr).await.unwrap();
        client_b.send_to(&frame(session(2), b"b1"), relay_addr).await.unwrap();
        client_a.send_to(&frame(session(1), b"a2"), relay_addr).await.unwrap();
        client_b.send_to(&frame(session(2), b"b2"), relay_addr).await.unwrap();

        let (a1, bridge_a) = recv(&backend_a).await;
        let (a2, _) = recv(&backend_a).await;
        let (b1, bridge_b) = recv(&backend_b).await;
        let (b2, _) = recv(&backend_b).await;
        assert_eq!(a1, frame(session(1), b"a1").to_vec());
        assert_eq!(a2, frame(session(1), b"a2").to_vec());
        assert_eq!(b1, frame(session(2), b"b1").to_vec());
        assert_eq!(b2, frame(session(2), b"b2").to_vec());
        assert_ne!(bridge_a.port(), bridge_b.port());
        assert_eq!(service.active_bridges(), 2);

        backend_a.send_to(b"to-a", bridge_a).await.unwrap();
        backend_b.send_to(b"to-b", bridge_b).await.unwrap();
        assert_eq!(recv(&client_a).await.0, b"to-a");
        assert_eq!(recv(&client_b).await.0, b"to-b");

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        let backend = loopback().await;
        let (service, _, relay_addr) =
            started(HashMap::from([(session(1), backend.local_addr().unwrap())])).await;
        let client = loopback().await;

        assert!(!service.end_session(session(1)));

        client
            .send_to(&frame(session(1), b"abc"), relay_addr)
            .await
            .unwrap();
        recv(&backend).await;
        let bridge = service.bridge(&session(1)).unwrap();

        assert!(service.end_session(session(1)));
        assert!(!service.end_session(session(1)));
        assert!(service.bridge(&session(1)).is_none());

        timeout(WAIT, bridge.join()).await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Closed);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_switched_backend_gets_new_bridge() {
        let old_backend = loopback().await;
        let new_backend = loopback().await;
        let (service, directory, relay_addr) =
            started(HashMap::from([(session(1), old_backend.local_addr().unwrap())])).await;
        let client = loopback().await;

        client.send_to(&frame(session(1), b"one"), relay_addr).await.unwrap();
        recv(&old_backend).await;

        let events =
            directory.reload(HashMap::from([(session(1), new_backend.local_addr().unwrap())]));
        assert_eq!(events, vec![SessionEvent::SwitchedBackend(session(1))]);
        for event in events {
            assert!(service.handle_event(event));
        }

        client.send_to(&frame(session(1), b"two"), relay_addr).await.unwrap();
        let (data, _) = recv(&new_backend).await;
        assert_eq!(data, frame(session(1), b"two").to_vec());
        assert_silent(&old_backend).await;
        assert_eq!(service.stats().bridges_opened, 2);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let backend = loopback().await;
        let backend_addr = backend.local_addr().unwrap();
        let table = (1..=3).map(|n| (session(n), backend_addr)).collect();
        let (service, _, relay_addr) = started(table).await;
        let client = loopback().await;

        for n in 1..=3 {
            client
                .send_to(&frame(session(n), b"hi"), relay_addr)
                .await
                .unwrap();
            recv(&backend).await;
        }
        let bridges: Vec<_> = (1..=3)
            .map(|n| service.bridge(&session(n)).unwrap())
            .collect();
        assert_eq!(service.active_bridges(), 3);

        timeout(WAIT, service.shutdown()).await.unwrap();
        timeout(WAIT, service.stopped()).await.unwrap();

        assert_eq!(service.active_bridges(), 0);
        assert!(service.local_addr().is_none());
        for bridge in &bridges {
            assert!(bridge.is_closed());
            assert!(bridge.local_addr().is_none());
        }
        assert_eq!(service.stats().active_bridges(), 0);

        // The public port is free again once its socket is closed
        UdpSocket::bind(relay_addr).await.unwrap();

        assert!(matches!(service.start().await, Err(RelayError::Stopped)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (service, _, _) = started(HashMap::new()).await;
        assert!(matches!(service.start().await, Err(RelayError::AlreadyStarted)));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = loopback().await;
        let service = RelayService::new(
            taken.local_addr().unwrap(),
            Arc::new(StaticDirectory::new(HashMap::new())),
        );

        match service.start().await {
            Err(RelayError::Bind { address, .. }) => {
                assert_eq!(address, taken.local_addr().unwrap())
            }
            other => panic!("expected bind error, got {:?}", other),
        }

        // A failed start leaves the service startable
        let address = taken.local_addr().unwrap();
        drop(taken);
        assert_eq!(service.start().await.unwrap(), address);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_fatal_ingress_error_tears_down_relay() {
        let backend = loopback().await;
        let backend_addr = backend.local_addr().unwrap();
        let directory = Arc::new(StaticDirectory::new(
            (1..=2).map(|n| (session(n), backend_addr)).collect(),
        ));
        let service = Arc::new(RelayService::new(
            "127.0.0.1:0".parse().unwrap(),
            directory as Arc<dyn SessionDirectory>,
        ));
        let faults = service.inject_ingress_faults();
        let relay_addr = service.start().await.unwrap();
        let client = loopback().await;

        for n in 1..=2 {
            client
                .send_to(&frame(session(n), b"hi"), relay_addr)
                .await
                .unwrap();
            recv(&backend).await;
        }
        let bridges: Vec<_> = (1..=2)
            .map(|n| service.bridge(&session(n)).unwrap())
            .collect();

        for _ in 0..MAX_CONSECUTIVE_RECV_ERRORS {
            faults.send(io::Error::other("socket is gone")).unwrap();
        }

        timeout(WAIT, service.stopped()).await.unwrap();
        wait_until(|| bridges.iter().all(|bridge| bridge.is_closed())).await;
        assert_eq!(service.active_bridges(), 0);
        assert_eq!(service.stats().active_bridges(), 0);

        // Nothing is relayed any more
        client
            .send_to(&frame(session(1), b"late"), relay_addr)
            .await
            .unwrap();
        assert_silent(&backend).await;

        timeout(WAIT, service.shutdown()).await.unwrap();
        assert!(matches!(service.start().await, Err(RelayError::Stopped)));
    }
}
