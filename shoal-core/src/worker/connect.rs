//! Connect strategy per source address kind.

use std::time::Duration;

use crate::config::WorkerConfig;
use crate::source::{SourceAddress, SourceDescriptor};
use crate::transport::{ConnectTarget, SourceConnection, SourceTransport, TransportError};

/// One connection attempt in a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAttempt {
    pub target: ConnectTarget,
    pub timeout: Duration,
}

/// Ordered connection attempts for `source`.
///
/// Multicast replies come from hosts that may be firewalled, so a push is
/// tried first when proxies are known. Relay addresses can only be reached
/// by push. Direct addresses fall back to push when the descriptor lists
/// proxies.
pub fn connect_plan(source: &SourceDescriptor, config: &WorkerConfig) -> Vec<ConnectAttempt> {
    let push_timeout = if source.capabilities.from_alt_location {
        config.hinted_push_connect_timeout
    } else {
        config.push_connect_timeout
    };
    let fallback_push = source.fallback_push.as_ref().map(|push| ConnectAttempt {
        target: ConnectTarget::Push {
            client_id: push.client_id,
            proxies: push.proxies.clone(),
        },
        timeout: push_timeout,
    });
    let direct = |addr| ConnectAttempt {
        target: ConnectTarget::Direct(addr),
        timeout: config.direct_connect_timeout,
    };

    match &source.address {
        SourceAddress::MulticastHint(addr) => {
            let mut plan: Vec<_> = fallback_push.into_iter().collect();
            plan.push(direct(*addr));
            plan
        }
        SourceAddress::Relay { client_id, proxies } => vec![ConnectAttempt {
            target: ConnectTarget::Push {
                client_id: *client_id,
                proxies: proxies.clone(),
            },
            timeout: push_timeout,
        }],
        SourceAddress::Direct(addr) => {
            let mut plan = vec![direct(*addr)];
            plan.extend(fallback_push);
            plan
        }
    }
}

/// Runs the connect plan until one attempt succeeds.
///
/// # Errors
///
/// Returns the error of the last failed attempt.
pub async fn connect_source(
    transport: &dyn SourceTransport,
    source: &SourceDescriptor,
    config: &WorkerConfig,
) -> Result<Box<dyn SourceConnection>, TransportError> {
    let mut last_error = TransportError::ConnectFailed {
        target: source.address.to_string(),
        reason: "no connect strategy".to_string(),
    };

    for attempt in connect_plan(source, config) {
        let outcome = tokio::time::timeout(
            attempt.timeout,
            transport.connect(source, &attempt.target, attempt.timeout),
        )
        .await;
        match outcome {
            Ok(Ok(connection)) => {
                tracing::debug!("connect_source: connected to {} via {}", source.address, attempt.target);
                return Ok(connection);
            }
            Ok(Err(error)) => {
                tracing::debug!("connect_source: {} failed: {error}", attempt.target);
                last_error = error;
            }
            Err(_) => {
                tracing::debug!("connect_source: {} timed out", attempt.target);
                last_error = TransportError::Timeout {
                    operation: "connect",
                    elapsed: attempt.timeout,
                };
            }
        }
    }
    Err(last_error)
}
