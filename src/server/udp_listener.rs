use super::RelayError;
use crate::udp::packet::{Datagram, MAX_DATAGRAM_SIZE};
use crate::udp::RelayCounters;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Consecutive receive failures after which the public socket is considered dead
pub const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 32;

/// Whether a receive error concerns a single datagram or peer rather than the socket.
///
/// ICMP unreachable replies to earlier sends surface as `ConnectionReset` or
/// `ConnectionRefused` on some platforms.
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

/// The public socket as seen by the ingress loop
struct PublicSocket {
    socket: Arc<UdpSocket>,
    #[cfg(test)]
    faults: Option<mpsc::UnboundedReceiver<io::Error>>,
}

impl PublicSocket {
    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        #[cfg(test)]
        if let Some(faults) = self.faults.as_mut() {
            return tokio::select! {
                Some(e) = faults.recv() => Err(e),
                result = self.socket.recv_from(buf) => result,
            };
        }
        self.socket.recv_from(buf).await
    }
}

/// Reads the public socket and queues every datagram for the dispatcher.
///
/// The loop never waits on processing; the queue is unbounded.
pub struct IngressListener {
    socket: PublicSocket,
    queue: mpsc::UnboundedSender<Datagram>,
    cancel: CancellationToken,
    counters: Arc<RelayCounters>,
}

impl IngressListener {
    pub fn new(
        socket: Arc<UdpSocket>,
        queue: mpsc::UnboundedSender<Datagram>,
        cancel: CancellationToken,
        counters: Arc<RelayCounters>,
    ) -> Self {
        Self {
            socket: PublicSocket {
                socket,
                #[cfg(test)]
                faults: None,
            },
            queue,
            cancel,
            counters,
        }
    }

    /// Receive errors sent here are reported as if the socket had returned them
    #[cfg(test)]
    pub(crate) fn with_faults(mut self, faults: mpsc::UnboundedReceiver<io::Error>) -> Self {
        self.socket.faults = Some(faults);
        self
    }

    /// Serve until cancelled, or until the socket keeps failing
    pub async fn serve(mut self) -> Result<(), RelayError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut consecutive_errors = 0u32;

        if let Ok(addr) = self.socket.socket.local_addr() {
            info!("Voice relay listening on {}", addr);
        }

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => result,
            };

            match result {
                Ok((len, source)) => {
                    consecutive_errors = 0;
                    self.counters.record_received(len);

                    let datagram = Datagram {
                        data: Bytes::copy_from_slice(&buf[..len]),
                        source,
                    };
                    if self.queue.send(datagram).is_err() {
                        debug!("Dispatcher is gone, stopping ingress");
                        break;
                    }
                }
                Err(e) if is_transient(&e) => {
                    trace!("Ignoring transient receive error: {}", e);
                }
                Err(e) => {
                    consecutive_errors += 1;
                    debug!(
                        "Error receiving datagram ({} in a row): {}",
                        consecutive_errors, e
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                        return Err(RelayError::Receive(e));
                    }
                }
            }
        }

        debug!("Voice ingress stopped");
        Ok(())
    }
}
