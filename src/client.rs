//! Load generating client.
//!
//! A worker owns one connected UDP socket and bounces a single frozen
//! datagram off the server, one round trip at a time.

use crate::config::Timing;
use crate::error::PhantomError;
use crate::metrics::{ActiveClient, Metrics};
use crate::packet;
use crate::shutdown::{ExitReason, Shutdown};
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace, warn};

/// Immutable per-worker input
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub target: SocketAddr,
    /// `None` keeps sending until shutdown
    pub packets: Option<u64>,
    pub packet_size: usize,
    pub key: i64,
}

/// One logical client connection
pub struct ClientWorker {
    id: usize,
    spec: ClientSpec,
    receive_deadline: Duration,
    send_backoff: Duration,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
}

impl ClientWorker {
    pub fn new(
        id: usize,
        spec: ClientSpec,
        timing: &Timing,
        metrics: Arc<Metrics>,
        shutdown: Shutdown,
    ) -> Self {
        ClientWorker {
            id,
            spec,
            receive_deadline: timing.receive_deadline,
            send_backoff: timing.send_backoff,
            metrics,
            shutdown,
        }
    }

    /// Run the send/receive loop until the budget is spent or the run stops.
    ///
    /// `active` is released when this returns, on every path.
    pub async fn run(self, active: ActiveClient) {
        let _active = active;

        let socket = match self.connect().await {
            Ok(socket) => socket,
            Err(e) => {
                error!(client = self.id, error = %e, "Client socket failed");
                self.shutdown
                    .trigger(ExitReason::failed(&e), self.metrics.active_clients());
                return;
            }
        };

        let datagram = packet::build(self.spec.packet_size, self.spec.key);
        let completed = self.bounce_loop(&socket, &datagram).await;
        debug!(client = self.id, completed, "Client finished");
    }

    async fn connect(&self) -> Result<UdpSocket, PhantomError> {
        let local = match self.spec.target {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| PhantomError::Connect(self.spec.target, e))?;
        socket
            .connect(self.spec.target)
            .await
            .map_err(|e| PhantomError::Connect(self.spec.target, e))?;
        Ok(socket)
    }

    /// Returns the number of attempts that resolved to a receive or a drop.
    async fn bounce_loop<T: Transport>(&self, transport: &T, datagram: &Bytes) -> u64 {
        let mut buf = vec![0u8; datagram.len()];
        let mut completed = 0u64;

        while self.spec.packets.map_or(true, |budget| completed < budget) {
            let sent = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = transport.send(datagram) => result,
            };

            // A failed write is retried without using up the budget.
            if let Err(e) = sent {
                warn!(client = self.id, error = %e, "Write failed");
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.send_backoff) => continue,
                }
            }
            self.metrics.record_sent();

            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    // The echo can no longer be waited for.
                    self.metrics.record_drop();
                    completed += 1;
                    break;
                }
                result = tokio::time::timeout(self.receive_deadline, transport.recv(&mut buf)) => result,
            };

            match received {
                Ok(Ok(_)) => self.metrics.record_received(),
                Ok(Err(e)) => {
                    debug!(client = self.id, error = %e, "Read failed");
                    self.metrics.record_drop();
                }
                Err(_) => {
                    trace!(client = self.id, "Read timed out");
                    self.metrics.record_drop();
                }
            }
            completed += 1;
        }

        completed
    }
}

/// Connected datagram channel a worker bounces packets over
pub trait Transport: Send + Sync {
    fn send(&self, datagram: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

impl Transport for UdpSocket {
    fn send(&self, datagram: &[u8]) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::send(self, datagram)
    }

    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::recv(self, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerSettings;
    use crate::server::EchoServer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` writes, then echoes every read at once
    struct FlakyTransport {
        failures: usize,
        attempts: AtomicUsize,
    }

    impl Transport for FlakyTransport {
        fn send(&self, datagram: &[u8]) -> impl Future<Output = io::Result<usize>> + Send {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let result = if attempt < self.failures {
                Err(io::Error::new(io::ErrorKind::Other, "no buffer space available"))
            } else {
                Ok(datagram.len())
            };
            std::future::ready(result)
        }

        fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
            std::future::ready(Ok(buf.len()))
        }
    }

    fn timing(receive_deadline_ms: u64) -> Timing {
        Timing {
            receive_deadline: Duration::from_millis(receive_deadline_ms),
            ..Timing::default()
        }
    }

    async fn start_server(key: i64) -> (SocketAddr, Arc<Metrics>, Shutdown) {
        let metrics = Metrics::new();
        let settings = ServerSettings {
            listen: "127.0.0.1:0".parse().unwrap(),
            key,
            recv_buffer: None,
        };
        let server = EchoServer::bind(&settings, Arc::clone(&metrics)).unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move { server.run(&server_shutdown).await });
        (addr, metrics, shutdown)
    }

    async fn run_client(spec: ClientSpec, timing: Timing) -> (Arc<Metrics>, Shutdown) {
        let metrics = Metrics::new();
        let shutdown = Shutdown::new();
        let worker = ClientWorker::new(0, spec, &timing, Arc::clone(&metrics), shutdown.clone());
        let active = metrics.client_started();
        worker.run(active).await;
        (metrics, shutdown)
    }

    #[tokio::test]
    async fn test_single_round_trip() {
        let (addr, _server_metrics, server_shutdown) = start_server(1969).await;

        let spec = ClientSpec {
            target: addr,
            packets: Some(1),
            packet_size: 36,
            key: 1969,
        };
        let (metrics, _) = run_client(spec, timing(1000)).await;

        assert_eq!(metrics.sent(), 1);
        assert_eq!(metrics.received(), 1);
        assert_eq!(metrics.drops(), 0);
        assert_eq!(metrics.active_clients(), 0);
        server_shutdown.cancel();
    }

    #[tokio::test]
    async fn test_wrong_key_times_out() {
        let (addr, server_metrics, server_shutdown) = start_server(2).await;

        let spec = ClientSpec {
            target: addr,
            packets: Some(1),
            packet_size: 36,
            key: 1,
        };
        let (metrics, _) = run_client(spec, timing(200)).await;

        assert_eq!(metrics.sent(), 1);
        assert_eq!(metrics.received(), 0);
        assert_eq!(metrics.drops(), 1);
        assert_eq!(server_metrics.drops(), 1);
        assert_eq!(server_metrics.sent(), 0);
        server_shutdown.cancel();
    }

    #[tokio::test]
    async fn test_budget_resolves_every_attempt() {
        let (addr, _server_metrics, server_shutdown) = start_server(77).await;

        let spec = ClientSpec {
            target: addr,
            packets: Some(50),
            packet_size: 256,
            key: 77,
        };
        let (metrics, _) = run_client(spec, timing(1000)).await;

        assert_eq!(metrics.sent(), 50);
        assert_eq!(metrics.received() + metrics.drops(), 50);
        server_shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unbounded_client_stops_on_shutdown() {
        let (addr, _server_metrics, server_shutdown) = start_server(5).await;

        let metrics = Metrics::new();
        let shutdown = Shutdown::new();
        let spec = ClientSpec {
            target: addr,
            packets: None,
            packet_size: 64,
            key: 5,
        };
        let worker = ClientWorker::new(0, spec, &timing(200), Arc::clone(&metrics), shutdown.clone());
        let handle = tokio::spawn(worker.run(metrics.client_started()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.trigger(ExitReason::Interrupted, metrics.active_clients());

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("client ignored shutdown")
            .unwrap();

        let totals = metrics.totals();
        assert!(totals.sent > 0);
        assert_eq!(totals.sent, totals.received + totals.drops);
        assert_eq!(totals.active_clients, 0);
        server_shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failed_writes_are_retried_outside_budget() {
        let metrics = Metrics::new();
        let spec = ClientSpec {
            target: "127.0.0.1:9".parse().unwrap(),
            packets: Some(4),
            packet_size: 36,
            key: 11,
        };
        let timing = Timing {
            send_backoff: Duration::from_millis(1),
            ..timing(1000)
        };
        let worker = ClientWorker::new(0, spec, &timing, Arc::clone(&metrics), Shutdown::new());
        let transport = FlakyTransport {
            failures: 3,
            attempts: AtomicUsize::new(0),
        };

        let completed = worker
            .bounce_loop(&transport, &packet::build(36, 11))
            .await;

        assert_eq!(completed, 4);
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 7);
        assert_eq!(metrics.sent(), 4);
        assert_eq!(metrics.received(), 4);
        assert_eq!(metrics.drops(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_pending_receive() {
        let (addr, _server_metrics, server_shutdown) = start_server(2).await;

        let metrics = Metrics::new();
        let shutdown = Shutdown::new();
        let spec = ClientSpec {
            target: addr,
            packets: Some(1),
            packet_size: 36,
            key: 1,
        };
        let worker = ClientWorker::new(0, spec, &timing(5000), Arc::clone(&metrics), shutdown.clone());
        let handle = tokio::spawn(worker.run(metrics.client_started()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("receive outlived shutdown")
            .unwrap();

        let totals = metrics.totals();
        assert_eq!(totals.sent, 1);
        assert_eq!(totals.received, 0);
        assert_eq!(totals.drops, 1);
        assert_eq!(totals.active_clients, 0);
        server_shutdown.cancel();
    }
}
