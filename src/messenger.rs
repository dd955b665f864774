//! The messenger owns everything between `submit` and a resolved completion
//! handle: the priority-ordered outbound queue, the dispatch loop that
//! drains it, per-destination pacing for rate-sensitive protocols, and the
//! correlation of inbound datagrams back to their sessions.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::codec::{Request, Response};
use crate::config::ClientConfig;
use crate::error::QueryError;
use crate::request::{RequestPriority, RequestRecord};
use crate::session::{SessionKey, SessionRegistry};
use crate::transport::udp::UdpTransport;
use crate::transport::{DatagramHandler, Transport};

/// Completion handle returned from [`Messenger::submit`]. Resolves exactly
/// once - with the typed response, or with an error.
pub struct ResponseHandle {
    sequence_index: u64,
    rx: oneshot::Receiver<Result<Response, QueryError>>,
    messenger: Messenger,
}

impl ResponseHandle {
    pub fn sequence_index(&self) -> u64 {
        self.sequence_index
    }

    /// Waits for the handle to resolve.
    pub async fn response(self) -> Result<Response, QueryError> {
        match self.rx.await {
            Ok(result) => result,
            // the record was dropped unresolved, i.e. the engine shut down
            Err(_) => Err(QueryError::Transport("engine shut down".to_string())),
        }
    }

    /// Cancels the request: it is removed from the queue or the session
    /// registry, its timeout is cancelled and the handle resolves with
    /// `Cancelled`. A no-op if a response has already been matched.
    pub fn cancel(&self) {
        self.messenger.cancel(self.sequence_index);
    }
}

struct QueuedEntry {
    record: RequestRecord,
    /// set on push and reset on every promotion, so each aging period moves
    /// the entry up by one level at most
    queued_at: Instant,
}

/// Highest priority first; within one priority, submission order (the
/// sequence index is unique and monotonic, so it breaks all ties).
#[derive(Default)]
struct DispatchQueue {
    entries: std::collections::BTreeMap<(u8, u64), QueuedEntry>,
}

impl DispatchQueue {
    fn push(&mut self, record: RequestRecord) {
        let rank = record.priority.rank();
        let index = record.sequence_index;
        self.entries.insert(
            (rank, index),
            QueuedEntry {
                record,
                queued_at: Instant::now(),
            },
        );
    }

    fn pop(&mut self) -> Option<RequestRecord> {
        self.entries.pop_first().map(|(_, entry)| entry.record)
    }

    fn remove(&mut self, sequence_index: u64) -> Option<RequestRecord> {
        let key = self
            .entries
            .keys()
            .find(|(_, index)| *index == sequence_index)
            .copied()?;
        self.entries.remove(&key).map(|entry| entry.record)
    }

    /// Aging: an entry that has waited longer than `aging` is promoted one
    /// priority level, so a steady stream of HIGH requests cannot starve
    /// the lower levels.
    fn promote_aged(&mut self, aging: Duration) {
        let now = Instant::now();
        let aged: Vec<(u8, u64)> = self
            .entries
            .iter()
            .filter(|((rank, _), entry)| {
                *rank > 0 && now.duration_since(entry.queued_at) >= aging
            })
            .map(|(&key, _)| key)
            .collect();

        for (rank, index) in aged {
            if let Some(mut entry) = self.entries.remove(&(rank, index)) {
                entry.record.priority = entry.record.priority.promoted();
                entry.queued_at = now;
                trace!(
                    "promoting request #{} to {:?}",
                    index,
                    entry.record.priority
                );
                self.entries
                    .insert((entry.record.priority.rank(), index), entry);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Last-send timestamps per destination, used to enforce the minimum
/// inter-send delay for rate-sensitive protocols. Bounded: when full, the
/// least recently used destination is evicted.
struct RateWindow {
    capacity: usize,
    last_send: FxHashMap<SocketAddr, Instant>,
}

impl RateWindow {
    fn new(capacity: usize) -> RateWindow {
        RateWindow {
            capacity,
            last_send: FxHashMap::default(),
        }
    }

    fn required_delay(&self, destination: SocketAddr, min_interval: Duration) -> Option<Duration> {
        let elapsed = self.last_send.get(&destination)?.elapsed();
        if elapsed >= min_interval {
            None
        } else {
            Some(min_interval - elapsed)
        }
    }

    fn mark_sent(&mut self, destination: SocketAddr) {
        if !self.last_send.contains_key(&destination) && self.last_send.len() >= self.capacity {
            if let Some((&oldest, _)) = self.last_send.iter().min_by_key(|(_, &at)| at) {
                self.last_send.remove(&oldest);
            }
        }
        self.last_send.insert(destination, Instant::now());
    }
}

struct MessengerShared {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    registry: SessionRegistry,
    queue: Mutex<DispatchQueue>,
    queue_notify: Notify,
}

/// The outbound half of the engine. Cheap to clone; all clones share one
/// queue, registry and transport.
#[derive(Clone)]
pub struct Messenger {
    shared: Arc<MessengerShared>,
}

impl Messenger {
    /// Binds a UDP transport on an ephemeral port and builds a messenger on
    /// top of it.
    pub async fn new(config: Arc<ClientConfig>) -> anyhow::Result<Messenger> {
        config.validate()?;
        let transport = Arc::new(UdpTransport::new("0.0.0.0:0", config.max_datagram_bytes).await?);
        Ok(Self::with_transport(config, transport))
    }

    /// Builds a messenger on an externally provided transport.
    pub fn with_transport(config: Arc<ClientConfig>, transport: Arc<dyn Transport>) -> Messenger {
        Messenger {
            shared: Arc::new(MessengerShared {
                config,
                transport,
                registry: SessionRegistry::new(),
                queue: Mutex::new(DispatchQueue::default()),
                queue_notify: Notify::new(),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.shared.registry
    }

    /// Places a request on the outbound queue and returns its completion
    /// handle. The request is dispatched by the run loop in priority order.
    pub fn submit(
        &self,
        request: Request,
        destination: SocketAddr,
        priority: RequestPriority,
    ) -> ResponseHandle {
        let (record, rx) = RequestRecord::new(request, destination, priority);
        let sequence_index = record.sequence_index;
        trace!(
            "submitting request #{} to {:?} at {:?}",
            sequence_index,
            destination,
            priority
        );

        self.shared.queue.lock().unwrap().push(record);
        self.shared.queue_notify.notify_one();

        ResponseHandle {
            sequence_index,
            rx,
            messenger: self.clone(),
        }
    }

    pub(crate) fn cancel(&self, sequence_index: u64) {
        // still queued: remove and resolve directly
        if let Some(record) = self.shared.queue.lock().unwrap().remove(sequence_index) {
            debug!("cancelling queued request #{}", sequence_index);
            record.complete(Err(QueryError::Cancelled));
            return;
        }
        // already dispatched (or long gone, then this is a no-op)
        self.shared.registry.cancel(sequence_index);
    }

    /// Runs the engine: the transport's receive loop plus the dispatch loop
    /// draining the outbound queue. Returns when the transport closes.
    pub async fn run(&self) -> anyhow::Result<()> {
        let handler: Arc<dyn DatagramHandler> = Arc::new(ResponseCorrelator {
            registry: self.shared.registry.clone(),
        });

        // biased: the receive loop installs the handler on its first poll,
        // before the first request can be dispatched
        tokio::select! {
            biased;
            result = self.shared.transport.recv_loop(handler) => result,
            _ = self.dispatch_loop() => Ok(()),
        }
    }

    async fn dispatch_loop(&self) {
        let mut rate_window = RateWindow::new(self.shared.config.rate_limit_window_capacity);

        loop {
            let next = {
                let mut queue = self.shared.queue.lock().unwrap();
                queue.promote_aged(self.shared.config.priority_aging);
                queue.pop()
            };

            let Some(record) = next else {
                // wake on submission, or periodically to re-check aging
                tokio::select! {
                    _ = self.shared.queue_notify.notified() => {}
                    _ = tokio::time::sleep(self.shared.config.priority_aging) => {}
                }
                continue;
            };

            if record.request.is_rate_limited() {
                if let Some(delay) = rate_window
                    .required_delay(record.destination, self.shared.config.master_pacing_delay)
                {
                    trace!(
                        "pacing: delaying dispatch to {:?} by {:?}",
                        record.destination,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                rate_window.mark_sent(record.destination);
            }

            // a single request's failure must never take down the loop -
            // every failure path resolves the record's own handle instead
            self.dispatch_one(record).await;
        }
    }

    async fn dispatch_one(&self, record: RequestRecord) {
        let mut buf = BytesMut::new();
        if let Err(e) = record.request.ser(&mut buf) {
            warn!(
                "failed to encode request #{} for {:?}: {}",
                record.sequence_index, record.destination, e
            );
            record.complete(Err(e));
            return;
        }

        let key = SessionKey::of(record.destination, record.request.family());
        let destination = record.destination;
        let index = match self
            .shared
            .registry
            .register(key, record, self.shared.config.request_timeout)
        {
            Ok(index) => index,
            Err(e) => {
                // the registry resolved the rejected record's handle
                debug!("dispatch of a conflicting request rejected: {}", e);
                return;
            }
        };

        if let Err(e) = self.shared.transport.send(destination, &buf).await {
            warn!("send to {:?} failed: {}", destination, e);
            self.shared.registry.fail(index, e);
        }
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }
}

/// Inbound side: decodes datagrams, derives the session key and resolves
/// the matching session. Messages nobody is waiting for are logged and
/// discarded - on a shared socket they are expected (late responses after a
/// timeout, stray traffic).
struct ResponseCorrelator {
    registry: SessionRegistry,
}

#[async_trait]
impl DatagramHandler for ResponseCorrelator {
    async fn handle_datagram(&self, buf: &[u8], source: SocketAddr) {
        let response = match codec::decode(buf) {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "received undecodable datagram from {:?} - discarding: {}",
                    source, e
                );
                return;
            }
        };

        let key = SessionKey::of(source, response.family());
        match self.registry.take(&key) {
            Some(record) => {
                trace!(
                    "completing request #{} with a {:?} response",
                    record.sequence_index,
                    key.family
                );
                record.complete(Ok(response));
            }
            None => {
                debug!(
                    "received {:?} response from {:?} with no matching session - discarding",
                    key.family, source
                );
            }
        }
    }
}
