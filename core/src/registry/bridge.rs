//! Request/Response Bridge.
//!
//! Lets an outside caller (the REST API) ask a connected client for a report.
//! The request is encrypted and queued for the client's next GREQ; the
//! client answers with SRSP, which completes a one-shot channel keyed by
//! (identity, sequence number).

use super::manager::LifecycleManager;
use super::QueuedRequest;
use crate::crypto::CodecError;
use crate::session::ConnectionSession;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("Client {0} is not connected")]
    ClientNotFound(String),
    #[error("Client {0} is busy")]
    ClientBusy(String),
    #[error("Request timed out after {0:?}")]
    RequestTimedOut(Duration),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Clears the session's busy flag however the request ends
struct BusyGuard<'a>(&'a ConnectionSession);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.end_request();
    }
}

impl LifecycleManager {
    /// Send `payload` to the client holding `identity` and wait up to
    /// `timeout` for its reply.
    ///
    /// The reply is returned exactly as the client sent it in SRSP.
    pub async fn send_request(
        &self,
        identity: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<String, BridgeError> {
        let session = self
            .registry()
            .active(identity)
            .ok_or_else(|| BridgeError::ClientNotFound(identity.to_string()))?;

        let seq = session
            .begin_request()
            .ok_or_else(|| BridgeError::ClientBusy(identity.to_string()))?;
        let _busy = BusyGuard(session.as_ref());

        let data = session.encrypt(payload)?;
        let (tx, rx) = oneshot::channel();
        self.registry()
            .enqueue_request(identity, session.id(), QueuedRequest { seq, data }, tx)?;
        debug!("Request {} queued for {}", seq, identity);

        tokio::select! {
            biased;

            reply = rx => reply.map_err(|_| BridgeError::ClientNotFound(identity.to_string())),
            _ = session.closed() => {
                debug!("Client {} disconnected while request {} was pending", identity, seq);
                Err(BridgeError::ClientNotFound(identity.to_string()))
            }
            _ = tokio::time::sleep(timeout) => {
                self.registry().cancel_request(identity, session.id(), seq);
                warn!("Request {} to {} timed out after {:?}", seq, identity, timeout);
                session.set_last_error(format!("Request {} timed out", seq));
                Err(BridgeError::RequestTimedOut(timeout))
            }
        }
    }
}
