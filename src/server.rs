//! UDP bouncer.
//!
//! Reads datagrams, checks the key header and sends authorized datagrams
//! straight back to their sender. Nothing is kept between datagrams.

use crate::config::ServerSettings;
use crate::error::PhantomError;
use crate::metrics::Metrics;
use crate::packet::{self, MAX_DATAGRAM_LEN};
use crate::shutdown::Shutdown;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace};

/// What happened to one inbound datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Echoed,
    Rejected,
    EchoFailed,
}

/// Echo server instance
pub struct EchoServer {
    socket: UdpSocket,
    key: i64,
    metrics: Arc<Metrics>,
}

impl EchoServer {
    /// Bind the listening socket
    pub fn bind(settings: &ServerSettings, metrics: Arc<Metrics>) -> Result<Self, PhantomError> {
        let socket = create_socket(settings.listen, settings.recv_buffer)
            .map_err(|e| PhantomError::Bind(settings.listen, e))?;
        let socket = UdpSocket::from_std(socket).map_err(|e| PhantomError::Bind(settings.listen, e))?;

        Ok(EchoServer {
            socket,
            key: settings.key,
            metrics,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until shutdown or a receive error.
    ///
    /// A receive error is fatal. Echo failures are counted as drops.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<(), PhantomError> {
        info!(
            address = %self.local_addr()?,
            key = self.key,
            "Bouncer listening"
        );

        let mut buffer = vec![0u8; MAX_DATAGRAM_LEN];

        loop {
            let (len, peer) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Bouncer stopping");
                    return Ok(());
                }
                result = self.socket.recv_from(&mut buffer) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        error!(error = %e, "Receive failed");
                        return Err(PhantomError::Receive(e));
                    }
                },
            };

            let verdict = self.bounce(&buffer[..len], peer).await;
            trace!(peer = %peer, len, ?verdict, "Datagram handled");
        }
    }

    /// Count, validate and echo a single datagram
    async fn bounce(&self, datagram: &[u8], peer: SocketAddr) -> Verdict {
        self.metrics.record_received();

        if !packet::validate(datagram, self.key) {
            self.metrics.record_drop();
            return Verdict::Rejected;
        }

        match self.socket.send_to(datagram, peer).await {
            Ok(_) => {
                self.metrics.record_sent();
                Verdict::Echoed
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Echo failed");
                self.metrics.record_drop();
                Verdict::EchoFailed
            }
        }
    }
}

fn create_socket(addr: SocketAddr, recv_buffer: Option<usize>) -> io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    if let Some(size) = recv_buffer {
        socket.set_recv_buffer_size(size)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}
