//! SIP Transaction Layer
//!
//! Client-side request/response correlation. A request is written once to the
//! transport, the caller is suspended on a oneshot until the final response
//! with the same Via branch arrives or the wait bound expires. Provisional
//! responses are logged and otherwise ignored; retransmission is left to the
//! reliable transport or to the outbound proxy.

use super::message::{SipError, SipHeaders, SipMethod, SipRequest, SipResponse};
use super::transport::{OutgoingMessage, Transport, TransportProtocol};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Default bound on waiting for a final response
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound for INVITE, which includes ringing time
pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(120);

/// Transaction ID - the branch parameter of the top Via header
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn from_request(request: &SipRequest) -> Option<Self> {
        request.via_branch().map(Self)
    }

    pub fn from_response(response: &SipResponse) -> Option<Self> {
        response.via_branch().map(Self)
    }
}

/// How a client transaction ended
#[derive(Debug, Clone)]
pub enum TransactionOutcome {
    Response(SipResponse),
    Timeout,
}

/// One resolved request
#[derive(Debug, Clone)]
pub struct TransactionContext {
    pub request: SipRequest,
    pub outcome: TransactionOutcome,
}

impl TransactionContext {
    pub fn response(&self) -> Option<&SipResponse> {
        match &self.outcome {
            TransactionOutcome::Response(resp) => Some(resp),
            TransactionOutcome::Timeout => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.response().map(|r| r.status_code())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.outcome, TransactionOutcome::Timeout)
    }
}

type PendingMap = Arc<Mutex<HashMap<TransactionId, oneshot::Sender<SipResponse>>>>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<TransactionId, oneshot::Sender<SipResponse>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outstanding client transaction.
///
/// Dropping the handle before `wait` resolves unregisters the pending slot.
pub struct TransactionHandle {
    id: TransactionId,
    request: SipRequest,
    rx: Option<oneshot::Receiver<SipResponse>>,
    timeout: Duration,
    pending: PendingMap,
}

impl TransactionHandle {
    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn request(&self) -> &SipRequest {
        &self.request
    }

    /// Wait for the final response or the wait bound
    pub async fn wait(mut self) -> Result<TransactionContext, SipError> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| SipError::TransactionError("transaction already awaited".to_string()))?;

        let outcome = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => TransactionOutcome::Response(response),
            Ok(Err(_)) => {
                return Err(SipError::TransactionError(
                    "transaction layer closed".to_string(),
                ))
            }
            Err(_) => {
                warn!(
                    "Transaction {} ({}) timed out after {:?}",
                    self.id.0,
                    self.request.method(),
                    self.timeout
                );
                TransactionOutcome::Timeout
            }
        };

        Ok(TransactionContext {
            request: self.request.clone(),
            outcome,
        })
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

/// Transaction Layer - correlates requests with their final responses
pub struct TransactionLayer {
    transport: Arc<dyn Transport>,
    outbound_proxy: SocketAddr,
    timeout: Duration,
    invite_timeout: Duration,
    pending: PendingMap,
}

impl TransactionLayer {
    pub fn new(
        transport: Arc<dyn Transport>,
        outbound_proxy: SocketAddr,
        timeout: Duration,
        invite_timeout: Duration,
    ) -> Arc<Self> {
        info!(
            "Transaction layer using outbound proxy {} (timeout {:?})",
            outbound_proxy, timeout
        );
        Arc::new(Self {
            transport,
            outbound_proxy,
            timeout,
            invite_timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Address placed in Via and Contact
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.transport.protocol()
    }

    pub fn outbound_proxy(&self) -> SocketAddr {
        self.outbound_proxy
    }

    /// Send a request and register its pending slot
    pub async fn send_request(&self, request: SipRequest) -> Result<TransactionHandle, SipError> {
        let timeout = if request.method() == SipMethod::Invite {
            self.invite_timeout
        } else {
            self.timeout
        };
        self.send_request_with_timeout(request, timeout).await
    }

    pub async fn send_request_with_timeout(
        &self,
        request: SipRequest,
        timeout: Duration,
    ) -> Result<TransactionHandle, SipError> {
        let id = TransactionId::from_request(&request).ok_or_else(|| {
            SipError::InvalidMessage("request without Via branch".to_string())
        })?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);

        // The handle owns the slot from here, so a send failure unregisters it
        let handle = TransactionHandle {
            id,
            request,
            rx: Some(rx),
            timeout,
            pending: self.pending.clone(),
        };

        debug!(
            "Sending {} (branch {}) to {}",
            handle.request.method(),
            handle.id.0,
            self.outbound_proxy
        );
        self.transport
            .send(OutgoingMessage {
                data: handle.request.to_bytes(),
                destination: self.outbound_proxy,
            })
            .await?;

        Ok(handle)
    }

    /// Send a request and wait for the matching final response
    pub async fn send_and_wait(&self, request: SipRequest) -> Result<TransactionContext, SipError> {
        self.send_request(request).await?.wait().await
    }

    pub async fn send_and_wait_with_timeout(
        &self,
        request: SipRequest,
        timeout: Duration,
    ) -> Result<TransactionContext, SipError> {
        self.send_request_with_timeout(request, timeout)
            .await?
            .wait()
            .await
    }

    /// Send without expecting a response (ACK)
    pub async fn send_stateless(&self, request: SipRequest) -> Result<(), SipError> {
        debug!("Sending stateless {} to {}", request.method(), self.outbound_proxy);
        self.transport
            .send(OutgoingMessage {
                data: request.to_bytes(),
                destination: self.outbound_proxy,
            })
            .await
    }

    /// Answer an inbound request
    pub async fn send_response(
        &self,
        response: SipResponse,
        destination: SocketAddr,
    ) -> Result<(), SipError> {
        debug!(
            "Sending {} response to {}",
            response.status_code(),
            destination
        );
        self.transport
            .send(OutgoingMessage {
                data: response.to_bytes(),
                destination,
            })
            .await
    }

    /// Deliver a received response.
    ///
    /// Returns true when it belonged to an outstanding transaction.
    pub fn on_response(&self, response: SipResponse) -> bool {
        let Some(id) = TransactionId::from_response(&response) else {
            warn!("Dropping response without Via branch");
            return false;
        };

        if response.is_provisional() {
            let known = lock(&self.pending).contains_key(&id);
            debug!(
                "Provisional {} for transaction {} ignored",
                response.status_code(),
                id.0
            );
            return known;
        }

        match lock(&self.pending).remove(&id) {
            Some(tx) => {
                debug!(
                    "Final response {} for transaction {}",
                    response.status_code(),
                    id.0
                );
                // Receiver gone means the caller gave up already
                let _ = tx.send(response);
                true
            }
            None => {
                debug!("No pending transaction for branch {}", id.0);
                false
            }
        }
    }

    /// Number of transactions awaiting a final response
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::transport::MockTransport;
    use super::*;

    fn options_request(branch: &str) -> SipRequest {
        let data = format!(
            "OPTIONS sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch={}\r\n\
             From: <sip:alice@example.com>;tag=1\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: tx-test\r\n\
             CSeq: 1 OPTIONS\r\n\
             Content-Length: 0\r\n\r\n",
            branch
        );
        SipRequest::parse(data.as_bytes()).unwrap()
    }

    fn response(branch: &str, status: u16) -> SipResponse {
        let data = format!(
            "SIP/2.0 {} Whatever\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch={}\r\n\
             From: <sip:alice@example.com>;tag=1\r\n\
             To: <sip:bob@example.com>;tag=2\r\n\
             Call-ID: tx-test\r\n\
             CSeq: 1 OPTIONS\r\n\
             Content-Length: 0\r\n\r\n",
            status, branch
        );
        SipResponse::parse(data.as_bytes()).unwrap()
    }

    fn mock_transport(expected_sends: usize) -> Arc<dyn Transport> {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(expected_sends)
            .returning(|_| Ok(()));
        transport
            .expect_local_addr()
            .returning(|| "10.0.0.1:5060".parse().unwrap());
        transport
            .expect_protocol()
            .returning(|| TransportProtocol::Udp);
        Arc::new(transport)
    }

    fn layer(transport: Arc<dyn Transport>) -> Arc<TransactionLayer> {
        TransactionLayer::new(
            transport,
            "10.0.0.254:5060".parse().unwrap(),
            Duration::from_secs(30),
            DEFAULT_INVITE_TIMEOUT,
        )
    }

    #[tokio::test]
    async fn test_final_response_resolves_transaction() {
        let layer = layer(mock_transport(1));
        let handle = layer.send_request(options_request("z9hG4bKaaa")).await.unwrap();
        assert_eq!(layer.pending_count(), 1);

        assert!(layer.on_response(response("z9hG4bKaaa", 180)));
        assert_eq!(layer.pending_count(), 1);
        assert!(layer.on_response(response("z9hG4bKaaa", 200)));
        // A retransmitted final response finds no slot
        assert!(!layer.on_response(response("z9hG4bKaaa", 200)));

        let ctx = handle.wait().await.unwrap();
        assert_eq!(ctx.status_code(), Some(200));
        assert_eq!(layer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_outcome() {
        let layer = layer(mock_transport(1));
        let ctx = layer
            .send_and_wait(options_request("z9hG4bKbbb"))
            .await
            .unwrap();
        assert!(ctx.is_timeout());
        assert!(ctx.response().is_none());
        assert_eq!(layer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_timeout() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Err(SipError::TransportError("unreachable".to_string())));
        let layer = layer(Arc::new(transport));

        let result = layer.send_and_wait(options_request("z9hG4bKccc")).await;
        assert!(matches!(result, Err(SipError::TransportError(_))));
        assert_eq!(layer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_handle_unregisters() {
        let layer = layer(mock_transport(1));
        let handle = layer.send_request(options_request("z9hG4bKddd")).await.unwrap();
        assert_eq!(layer.pending_count(), 1);
        drop(handle);
        assert_eq!(layer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_without_branch_rejected() {
        let layer = layer(mock_transport(0));
        let data = b"OPTIONS sip:bob@example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
                     From: <sip:alice@example.com>;tag=1\r\n\
                     To: <sip:bob@example.com>\r\n\
                     Call-ID: tx-test\r\n\
                     CSeq: 1 OPTIONS\r\n\
                     Content-Length: 0\r\n\r\n";
        let request = SipRequest::parse(data).unwrap();
        assert!(matches!(
            layer.send_request(request).await,
            Err(SipError::InvalidMessage(_))
        ));
    }
}
