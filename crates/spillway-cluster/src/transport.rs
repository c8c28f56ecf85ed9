//! Point-to-point delivery of replica acknowledgements
//!
//! Sends are fire-and-forget: the transport takes ownership of the encoded
//! message and returns without waiting for the peer. Delivery to an unknown
//! host is reported so the caller can log it; it is never retried.

use crate::error::{ClusterError, Result};
use crate::node::HostId;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// Inbound message handler: `(sender, message)`
pub type AckHandler = Arc<dyn Fn(HostId, Bytes) + Send + Sync>;

/// Outbound side of the ack channel for one host
pub trait AckTransport: Send + Sync {
    fn local_host(&self) -> HostId;

    fn send(&self, to: HostId, message: Bytes) -> Result<()>;
}

/// In-process router connecting every registered host
#[derive(Clone, Default)]
pub struct LocalAckRouter {
    handlers: Arc<DashMap<HostId, AckHandler>>,
}

impl std::fmt::Debug for LocalAckRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAckRouter")
            .field("hosts", &self.handlers.len())
            .finish()
    }
}

impl LocalAckRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages addressed to `host` into `handler`
    pub fn register(&self, host: HostId, handler: AckHandler) {
        self.handlers.insert(host, handler);
    }

    pub fn unregister(&self, host: HostId) {
        self.handlers.remove(&host);
    }

    /// Sending endpoint for `host`
    pub fn endpoint(&self, host: HostId) -> Arc<dyn AckTransport> {
        Arc::new(LocalAckEndpoint {
            host,
            handlers: self.handlers.clone(),
        })
    }
}

struct LocalAckEndpoint {
    host: HostId,
    handlers: Arc<DashMap<HostId, AckHandler>>,
}

impl AckTransport for LocalAckEndpoint {
    fn local_host(&self) -> HostId {
        self.host
    }

    fn send(&self, to: HostId, message: Bytes) -> Result<()> {
        // Release the map guard before running the handler
        let handler = self
            .handlers
            .get(&to)
            .map(|h| h.value().clone())
            .ok_or(ClusterError::UnknownReplica(to))?;
        trace!(from = self.host, to, bytes = message.len(), "Delivering ack");
        handler(self.host, message);
        Ok(())
    }
}
