//! SIP transport layer
//!
//! The stack only needs a send primitive plus a channel of parsed incoming
//! messages. UDP is provided; other transports plug in behind the trait.

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp | TransportProtocol::Tcp => 5060,
            TransportProtocol::Tls => 5061,
        }
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// Transport layer trait
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Local address advertised in Via and Contact
    fn local_addr(&self) -> SocketAddr;

    /// Protocol name advertised in Via
    fn protocol(&self) -> TransportProtocol;
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind the socket and start the receive loop.
    ///
    /// Parsed messages are delivered on the returned receiver; datagrams that
    /// fail to parse are logged and dropped.
    pub async fn bind(
        bind_addr: SocketAddr,
    ) -> Result<(Arc<Self>, mpsc::Receiver<IncomingMessage>), SipError> {
        info!("Starting UDP transport on {}", bind_addr);

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| SipError::TransportError(format!("No local address: {}", e)))?;

        info!("UDP transport listening on {}", local_addr);

        let socket = Arc::new(socket);
        let (tx, rx) = mpsc::channel(1000);
        let task = tokio::spawn(Self::receive_loop(socket.clone(), tx));

        let transport = Arc::new(Self {
            socket,
            local_addr,
            receive_task: Mutex::new(Some(task)),
        });
        Ok((transport, rx))
    }

    /// Stop the receive loop; the incoming channel closes afterwards
    pub async fn stop(&self) {
        if let Some(task) = self.receive_task.lock().await.take() {
            info!("Stopping UDP transport on {}", self.local_addr);
            task.abort();
            let _ = task.await;
        }
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    // Keep-alive CRLF pings carry no message
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            if let Err(e) = tx.send(IncomingMessage { message, source }).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        self.socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }
}

/// In-process transport: every outgoing message is pushed on a channel.
///
/// Used to embed the stack behind another socket owner, and to drive the
/// managers against a scripted peer.
pub struct ChannelTransport {
    local_addr: SocketAddr,
    tx: mpsc::UnboundedSender<OutgoingMessage>,
}

impl ChannelTransport {
    pub fn new(local_addr: SocketAddr) -> (Arc<Self>, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { local_addr, tx }), rx)
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        self.tx
            .send(message)
            .map_err(|_| SipError::TransportError("Channel transport closed".to_string()))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }
}
