use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::codec::{Request, Response};
use crate::error::QueryError;

static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns the next sequence index - strictly monotonic and unique for the
/// lifetime of the process. It orders requests within a priority level and
/// identifies session slots in the registry.
pub fn next_sequence_index() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Dispatch priority of a request. Within one priority, requests are sent in
/// submission order; across priorities, higher goes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestPriority {
    Low,
    Normal,
    High,
}

impl RequestPriority {
    /// One level up; `High` saturates.
    pub fn promoted(self) -> RequestPriority {
        match self {
            RequestPriority::Low => RequestPriority::Normal,
            RequestPriority::Normal | RequestPriority::High => RequestPriority::High,
        }
    }

    /// Dispatch rank - rank 0 is drawn first.
    pub(crate) fn rank(self) -> u8 {
        match self {
            RequestPriority::High => 0,
            RequestPriority::Normal => 1,
            RequestPriority::Low => 2,
        }
    }
}

/// Everything the engine needs to know about one submitted request.
///
/// The record owns the sending half of the completion handle. Completion
/// consumes the record, so a handle can never be resolved twice - whichever
/// path removes the record from queue or registry (response, timeout,
/// cancellation, failure) is the one that resolves it.
#[derive(Debug)]
pub struct RequestRecord {
    pub request: Request,
    pub destination: SocketAddr,
    pub priority: RequestPriority,
    pub sequence_index: u64,
    pub submitted_at: Instant,
    completion: oneshot::Sender<Result<Response, QueryError>>,
}

impl RequestRecord {
    pub fn new(
        request: Request,
        destination: SocketAddr,
        priority: RequestPriority,
    ) -> (
        RequestRecord,
        oneshot::Receiver<Result<Response, QueryError>>,
    ) {
        let (tx, rx) = oneshot::channel();
        let record = RequestRecord {
            request,
            destination,
            priority,
            sequence_index: next_sequence_index(),
            submitted_at: Instant::now(),
            completion: tx,
        };
        (record, rx)
    }

    /// Resolves the completion handle with a response or an error.
    pub fn complete(self, result: Result<Response, QueryError>) {
        if self.completion.send(result).is_err() {
            // the caller dropped its handle and is no longer interested
            trace!(
                "completion handle for request #{} was dropped before resolution",
                self.sequence_index
            );
        }
    }
}
