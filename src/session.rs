//! Registry of outstanding requests.
//!
//! The Valve query protocols carry no request id in their responses, so an
//! inbound packet can only be matched by where it came from and which
//! protocol family decoded it. A consequence the registry enforces: there
//! can be at most one live session per key - a second request of the same
//! family to the same endpoint is rejected with `DuplicateSession` until the
//! first one completes or expires.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::codec::ProtocolFamily;
use crate::error::QueryError;
use crate::request::RequestRecord;

/// Composite identifier correlating an inbound packet with an outstanding
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub remote: SocketAddr,
    pub family: ProtocolFamily,
    /// In-payload request id for protocols that have one. The UDP query
    /// families carry none; RCON keys its pending commands by the 32-bit
    /// id echoed in every frame.
    pub correlation: Option<i32>,
}

impl SessionKey {
    pub fn of(remote: SocketAddr, family: ProtocolFamily) -> SessionKey {
        SessionKey {
            remote,
            family,
            correlation: None,
        }
    }
}

/// One live session. Timers and completion paths refer to the slot by its
/// sequence index and never own it - removal from the maps is what decides
/// which path gets to resolve the completion handle, so it resolves exactly
/// once.
struct SessionSlot {
    key: SessionKey,
    record: RequestRecord,
    registered_at: Instant,
    timeout_task: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryInner {
    by_key: FxHashMap<SessionKey, u64>,
    slots: FxHashMap<u64, SessionSlot>,
}

/// Tracks outstanding requests and expires them. All operations are atomic
/// with respect to concurrent inbound packets.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new() -> SessionRegistry {
        SessionRegistry::default()
    }

    /// Inserts a session and starts its expiry timer; returns the record's
    /// sequence index.
    ///
    /// If a live session with the same key exists, the record's completion
    /// handle is resolved with `DuplicateSession` and the same error is
    /// returned; the existing session is unaffected.
    ///
    /// Must be called from within a tokio runtime (the timer is a spawned
    /// task holding the index, cancelled when the session is removed).
    pub fn register(
        &self,
        key: SessionKey,
        record: RequestRecord,
        timeout: Duration,
    ) -> Result<u64, QueryError> {
        let index = record.sequence_index;
        let mut inner = self.inner.lock().unwrap();

        if inner.by_key.contains_key(&key) {
            drop(inner);
            let message = format!("{:?}", key);
            record.complete(Err(QueryError::DuplicateSession(message.clone())));
            return Err(QueryError::DuplicateSession(message));
        }
        inner.by_key.insert(key, index);

        let registry = self.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.expire(index);
        });

        inner.slots.insert(
            index,
            SessionSlot {
                key,
                record,
                registered_at: Instant::now(),
                timeout_task,
            },
        );
        trace!("registered session #{} for {:?}", index, key);
        Ok(index)
    }

    /// Atomically removes and returns the session for `key`, cancelling its
    /// timer. Empty if there is none.
    pub fn take(&self, key: &SessionKey) -> Option<RequestRecord> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner.by_key.remove(key)?;
        let slot = inner.slots.remove(&index)?;
        slot.timeout_task.abort();
        trace!(
            "session #{} for {:?} taken after {:?}",
            index,
            key,
            slot.registered_at.elapsed()
        );
        Some(slot.record)
    }

    /// Timer path: if the session is still present, removes it and resolves
    /// its handle with `RequestTimedOut`.
    pub fn expire(&self, index: u64) {
        if let Some(slot) = self.remove_by_index(index) {
            debug!("session #{} for {:?} expired", index, slot.key);
            slot.record.complete(Err(QueryError::RequestTimedOut));
        }
    }

    /// User-initiated cancellation. A no-op if the session has already been
    /// completed, expired or cancelled.
    pub fn cancel(&self, index: u64) {
        if let Some(slot) = self.remove_by_index(index) {
            slot.timeout_task.abort();
            debug!("session #{} for {:?} cancelled", index, slot.key);
            slot.record.complete(Err(QueryError::Cancelled));
        }
    }

    /// Engine path for send failures: removes the session and resolves its
    /// handle with the given error.
    pub(crate) fn fail(&self, index: u64, error: QueryError) {
        if let Some(slot) = self.remove_by_index(index) {
            slot.timeout_task.abort();
            debug!("session #{} for {:?} failed: {}", index, slot.key, error);
            slot.record.complete(Err(error));
        }
    }

    fn remove_by_index(&self, index: u64) -> Option<SessionSlot> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.slots.remove(&index)?;
        // the key may already point to a successor session - only remove it
        // if it still refers to this slot
        if inner.by_key.get(&slot.key) == Some(&index) {
            inner.by_key.remove(&slot.key);
        }
        Some(slot)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;
    use crate::codec::a2s::A2sRequest;
    use crate::codec::{ProtocolFamily, Request};
    use crate::request::RequestPriority;

    fn server() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 27015))
    }

    fn info_record() -> (
        RequestRecord,
        oneshot::Receiver<Result<crate::codec::Response, QueryError>>,
    ) {
        RequestRecord::new(
            Request::SourceQuery(A2sRequest::Info { challenge: None }),
            server(),
            RequestPriority::Normal,
        )
    }

    fn key() -> SessionKey {
        SessionKey::of(server(), ProtocolFamily::SourceQuery)
    }

    #[tokio::test]
    async fn test_register_take_round_trip() {
        let registry = SessionRegistry::new();
        let (record, _rx) = info_record();
        let index = record.sequence_index;

        assert_eq!(
            registry
                .register(key(), record, Duration::from_secs(3))
                .unwrap(),
            index
        );
        assert_eq!(registry.len(), 1);

        let taken = registry.take(&key()).unwrap();
        assert_eq!(taken.sequence_index, index);
        assert!(registry.is_empty());

        // taking again is empty
        assert!(registry.take(&key()).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_session_is_rejected_and_first_unaffected() {
        let registry = SessionRegistry::new();
        let (first, mut first_rx) = info_record();
        registry
            .register(key(), first, Duration::from_secs(3))
            .unwrap();

        let (second, second_rx) = info_record();
        assert!(matches!(
            registry.register(key(), second, Duration::from_secs(3)),
            Err(QueryError::DuplicateSession(_))
        ));

        // the second handle resolved with the error, the first is untouched
        assert!(matches!(
            second_rx.await,
            Ok(Err(QueryError::DuplicateSession(_)))
        ));
        assert!(first_rx.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_same_endpoint_different_family_or_correlation_can_coexist() {
        let registry = SessionRegistry::new();

        let (a, _rx_a) = info_record();
        registry
            .register(key(), a, Duration::from_secs(3))
            .unwrap();

        let (b, _rx_b) = info_record();
        let master_key = SessionKey::of(server(), ProtocolFamily::MasterServer);
        registry
            .register(master_key, b, Duration::from_secs(3))
            .unwrap();

        let (c, _rx_c) = info_record();
        let correlated = SessionKey {
            correlation: Some(42),
            ..key()
        };
        registry
            .register(correlated, c, Duration::from_secs(3))
            .unwrap();

        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_key_is_reusable_after_completion() {
        let registry = SessionRegistry::new();

        let (first, _rx) = info_record();
        registry
            .register(key(), first, Duration::from_secs(3))
            .unwrap();
        registry.take(&key()).unwrap();

        let (second, _rx) = info_record();
        assert!(registry
            .register(key(), second, Duration::from_secs(3))
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_resolves_with_request_timed_out_within_deadline() {
        let registry = SessionRegistry::new();
        let (record, rx) = info_record();
        let started = Instant::now();
        registry
            .register(key(), record, Duration::from_millis(200))
            .unwrap();

        let result = rx.await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Ok(Err(QueryError::RequestTimedOut))));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed <= Duration::from_millis(250));
        // expire() removes the slot before resolving the handle
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_cancels_the_timer() {
        let registry = SessionRegistry::new();
        let (record, mut rx) = info_record();
        registry
            .register(key(), record, Duration::from_millis(50))
            .unwrap();

        let record = registry.take(&key()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // no timeout fired against the taken record
        assert!(rx.try_recv().is_err());
        drop(record);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resolves_with_cancelled_exactly_once() {
        let registry = SessionRegistry::new();
        let (record, rx) = info_record();
        let index = registry
            .register(key(), record, Duration::from_millis(50))
            .unwrap();

        registry.cancel(index);
        registry.cancel(index); // idempotent

        assert!(matches!(rx.await, Ok(Err(QueryError::Cancelled))));
        assert!(registry.is_empty());

        // the aborted timer must not resurrect anything
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_key_does_not_evict_a_successor_session() {
        let registry = SessionRegistry::new();

        let (first, first_rx) = info_record();
        let first_index = registry
            .register(key(), first, Duration::from_millis(50))
            .unwrap();

        // the first session times out, then a successor takes over the key
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            first_rx.await,
            Ok(Err(QueryError::RequestTimedOut))
        ));

        let (second, _rx) = info_record();
        registry
            .register(key(), second, Duration::from_secs(3))
            .unwrap();

        // stray operations against the first index are no-ops
        registry.cancel(first_index);
        registry.expire(first_index);
        assert_eq!(registry.len(), 1);
        assert!(registry.take(&key()).is_some());
    }
}
