//! Per-namespace shared Broker, created by exactly one replica at a time.

use lambda_core::LambdaError;
use lambda_kubehub::{ServingClient, SharedLock};
use tracing::{debug, warn};

pub const BROKER_NAME: &str = "lambda-broker";
pub const BROKER_LOCK: &str = "lambda-broker-lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Created,
    Existing,
    /// Another replica holds the lock; try again later.
    Contended,
}

/// Ensure the namespace Broker exists while holding the namespace Lease.
pub async fn ensure_shared_broker(
    leases: &dyn SharedLock,
    serving: &dyn ServingClient,
    namespace: &str,
    holder: &str,
    lease_secs: i32,
) -> Result<BrokerState, LambdaError> {
    if !leases.try_acquire(namespace, BROKER_LOCK, holder, lease_secs).await? {
        debug!(ns = %namespace, holder, "broker lock held by another replica");
        return Ok(BrokerState::Contended);
    }
    let ensured = serving.ensure_broker(namespace, BROKER_NAME).await;
    if let Err(e) = leases.release(namespace, BROKER_LOCK, holder).await {
        // The lease expires on its own.
        warn!(ns = %namespace, error = %e, "broker lock release failed");
    }
    match ensured? {
        true => Ok(BrokerState::Created),
        false => Ok(BrokerState::Existing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lambda_kubehub::mem::{MemoryLeases, MemoryServing};

    #[tokio::test]
    async fn broker_is_created_once_and_lock_released() {
        let leases = MemoryLeases::new();
        let serving = MemoryServing::new();
        let first = ensure_shared_broker(&leases, &serving, "fns", "replica-a", 15).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(first, BrokerState::Created);
        let second = ensure_shared_broker(&leases, &serving, "fns", "replica-b", 15).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(second, BrokerState::Existing);
        assert_eq!(leases.holder("fns", BROKER_LOCK), None);
    }

    #[tokio::test]
    async fn held_lock_defers_creation() {
        let leases = MemoryLeases::new();
        let serving = MemoryServing::new();
        assert!(leases.try_acquire("fns", BROKER_LOCK, "replica-a", 15).await.unwrap_or(false));
        let state = ensure_shared_broker(&leases, &serving, "fns", "replica-b", 15).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(state, BrokerState::Contended);
        assert_eq!(serving.broker_count("fns"), 0);
    }
}
