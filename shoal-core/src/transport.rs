//! Abstract source transport.
//!
//! The engine does not speak the network protocol itself. A transport opens
//! connections to sources and turns one request/response exchange into a
//! small set of outcomes the worker state machine branches on.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use crate::hash_tree::HashTree;
use crate::range::{Range, RangeSet};
use crate::source::SourceDescriptor;

/// Where to open a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// Outgoing connection to the source.
    Direct(SocketAddr),
    /// Ask the proxies to have the source connect back to us.
    Push {
        client_id: Uuid,
        proxies: Vec<SocketAddr>,
    },
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectTarget::Direct(addr) => write!(f, "direct {addr}"),
            ConnectTarget::Push { client_id, .. } => write!(f, "push {client_id}"),
        }
    }
}

/// Transport failures. The worker turns these into source outcomes and
/// never lets them reach the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {target} failed: {reason}")]
    ConnectFailed { target: String, reason: String },

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("Connection closed by remote")]
    Closed,
}

/// Result of asking a source for a byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    /// The source will stream `range`, possibly narrower than requested.
    Connected { range: Range },
    /// Remotely queued at `position`; poll again after `poll_interval`.
    Queued {
        position: u32,
        poll_interval: Duration,
    },
    /// Try again later.
    Busy { retry_after: Option<Duration> },
    /// File exists but the requested bytes are not available.
    RangeUnavailable { available: Option<RangeSet> },
    NotFound,
    NotSharing,
    /// The source serves a different file than the one requested.
    ContentMismatch,
    /// Every upload slot is taken and the source does not queue.
    NoMoreDownloaders,
    UnknownCode { code: u16 },
    ProtocolError { reason: String },
}

/// Opens connections to sources.
#[async_trait]
pub trait SourceTransport: Send + Sync {
    /// Connects to `target`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// - `TransportError::ConnectFailed` - If the source refused or could not be reached
    /// - `TransportError::Timeout` - If `timeout` elapsed
    async fn connect(
        &self,
        source: &SourceDescriptor,
        target: &ConnectTarget,
        timeout: Duration,
    ) -> Result<Box<dyn SourceConnection>, TransportError>;
}

/// One open connection carrying successive request/response exchanges.
#[async_trait]
pub trait SourceConnection: Send {
    /// Asks the source for its hash tree.
    ///
    /// Returns false if the source declined.
    ///
    /// # Errors
    ///
    /// - `TransportError::Io` - If the exchange failed
    async fn request_hash_tree(&mut self) -> Result<bool, TransportError>;

    /// Reads the hash tree body after an accepted request.
    ///
    /// # Errors
    ///
    /// - `TransportError::Io` - If the body could not be read or parsed
    async fn read_hash_tree(&mut self) -> Result<Arc<dyn HashTree>, TransportError>;

    /// Discards any unread response body of the previous exchange.
    ///
    /// # Errors
    ///
    /// - `TransportError::Io` - If draining the body failed
    async fn consume_body(&mut self) -> Result<(), TransportError>;

    /// Requests `range` and reports how the source answered.
    ///
    /// # Errors
    ///
    /// - `TransportError::Io` - If the exchange failed before an answer was parsed
    async fn negotiate_range(
        &mut self,
        range: Range,
        supports_queueing: bool,
    ) -> Result<NegotiationOutcome, TransportError>;

    /// Next chunk of the negotiated body; None once the body is complete.
    ///
    /// # Errors
    ///
    /// - `TransportError::Io` - If the stream broke
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Ranges the source advertised, for partial sources.
    fn available_ranges(&self) -> Option<RangeSet> {
        None
    }

    /// Alternate locations advertised in the last response.
    fn alt_locations(&self) -> Vec<SourceDescriptor> {
        Vec::new()
    }

    /// Whether another exchange may follow on this connection.
    fn is_keep_alive(&self) -> bool;
}
