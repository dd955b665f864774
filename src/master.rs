//! Iteration over the Valve master server's paginated server list.
//!
//! The protocol has no page tokens: each request carries a *seed* endpoint,
//! the last endpoint of the previous page, and the master echoes that seed
//! as the first entry of the next page. The reserved endpoint `0.0.0.0:0`
//! doubles as the seed of the first page and as the terminator entry that
//! ends the list - its meaning is positional, which is why the page codec
//! leaves it in `entries` and this loop interprets it.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::master::{self, MasterServerFilter, MasterServerRegion, MasterServerRequest};
use crate::codec::{Request, Response};
use crate::config::ClientConfig;
use crate::error::QueryError;
use crate::messenger::Messenger;
use crate::request::RequestPriority;

/// Invoked once per discovered server with `(entry, master_addr, None)`, and
/// once with `(None, master_addr, Some(error))` if the iteration ends on a
/// timeout. The terminator endpoint is never delivered here.
pub type MasterQueryCallback = dyn Fn(Option<SocketAddr>, SocketAddr, Option<&QueryError>) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterIterationState {
    Idle,
    Querying,
    AwaitingResponse,
    Emitting,
    Done,
    Failed,
}

/// One logical query against a master server. Callbacks are invoked
/// sequentially; concurrent iterations need separate instances.
pub struct MasterServerIteration {
    messenger: Messenger,
    config: Arc<ClientConfig>,
    master_addr: SocketAddr,
    state: MasterIterationState,
}

impl MasterServerIteration {
    pub fn new(
        messenger: Messenger,
        config: Arc<ClientConfig>,
        master_addr: SocketAddr,
    ) -> MasterServerIteration {
        MasterServerIteration {
            messenger,
            config,
            master_addr,
            state: MasterIterationState::Idle,
        }
    }

    pub fn state(&self) -> MasterIterationState {
        self.state
    }

    /// Runs the iteration to completion and returns the accumulated list.
    ///
    /// A page timeout is not an error: masters under load stop answering
    /// instead of sending the terminator, so the list gathered so far is
    /// returned and the callback is informed once through its error slot.
    /// All other failures transition to `Failed` and propagate.
    pub async fn run(
        &mut self,
        region: MasterServerRegion,
        filter: MasterServerFilter,
        callback: Option<&MasterQueryCallback>,
    ) -> Result<Vec<SocketAddr>, QueryError> {
        let mut seed = master::terminator();
        let mut accumulated: Vec<SocketAddr> = Vec::new();

        loop {
            self.state = MasterIterationState::Querying;
            debug!(
                "querying master server {:?} with seed {:?}",
                self.master_addr, seed
            );
            let handle = self.messenger.submit(
                Request::MasterServer(MasterServerRequest {
                    region,
                    filter: filter.clone(),
                    seed,
                }),
                self.master_addr,
                RequestPriority::High,
            );

            self.state = MasterIterationState::AwaitingResponse;
            let page = match handle.response().await {
                Ok(Response::MasterServer(page)) => page,
                Ok(other) => {
                    self.state = MasterIterationState::Failed;
                    return Err(QueryError::MalformedPayload(format!(
                        "master server answered with a {:?} response",
                        other.family()
                    )));
                }
                Err(QueryError::RequestTimedOut) => {
                    debug!(
                        "master server stopped answering - ending iteration with {} entries",
                        accumulated.len()
                    );
                    self.state = MasterIterationState::Done;
                    if let Some(callback) = callback {
                        callback(None, self.master_addr, Some(&QueryError::RequestTimedOut));
                    }
                    return Ok(accumulated);
                }
                Err(e) => {
                    self.state = MasterIterationState::Failed;
                    return Err(e);
                }
            };

            self.state = MasterIterationState::Emitting;
            let mut terminated = false;
            for (position, &entry) in page.entries.iter().enumerate() {
                if master::is_terminator(&entry) {
                    if position + 1 != page.entries.len() {
                        warn!("master server sent the terminator mid-page - treating the page as terminated");
                    }
                    terminated = true;
                    break;
                }
                if entry == seed {
                    // the seed is echoed as the first entry of its page
                    continue;
                }
                if let Some(callback) = callback {
                    callback(Some(entry), self.master_addr, None);
                }
                accumulated.push(entry);
                // pace the walk: the master drops rapid follow-up queries
                tokio::time::sleep(self.config.master_pacing_delay).await;
            }

            if terminated {
                debug!(
                    "received the full server list: {} entries",
                    accumulated.len()
                );
                self.state = MasterIterationState::Done;
                return Ok(accumulated);
            }

            match page.entries.last() {
                Some(&last) => seed = last,
                None => {
                    warn!("master server sent an empty page without a terminator - ending iteration");
                    self.state = MasterIterationState::Done;
                    return Ok(accumulated);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::BytesMut;
    use tokio::sync::Notify;

    use super::*;
    use crate::codec::master::MasterServerPage;
    use crate::transport::{DatagramHandler, Transport};

    fn addr(d: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, d], port))
    }

    fn master_addr() -> SocketAddr {
        SocketAddr::from(([208, 64, 200, 65], 27011))
    }

    /// Simulated master server: answers each page request with the scripted
    /// page for its seed; seeds without a script entry get no answer at all
    /// (the real master's behavior under load).
    struct ScriptedMaster {
        pages: Mutex<Vec<(SocketAddr, MasterServerPage)>>,
        requests_seen: Mutex<Vec<MasterServerRequest>>,
        handler: Mutex<Option<Arc<dyn DatagramHandler>>>,
        never: Notify,
    }

    impl ScriptedMaster {
        fn new(pages: Vec<(SocketAddr, Vec<SocketAddr>)>) -> ScriptedMaster {
            ScriptedMaster {
                pages: Mutex::new(
                    pages
                        .into_iter()
                        .map(|(seed, entries)| (seed, MasterServerPage { entries }))
                        .collect(),
                ),
                requests_seen: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
                never: Notify::new(),
            }
        }

        fn seen_seeds(&self) -> Vec<SocketAddr> {
            self.requests_seen
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.seed)
                .collect()
        }
    }

    #[async_trait]
    impl Transport for ScriptedMaster {
        async fn send(&self, to: SocketAddr, buf: &[u8]) -> Result<(), QueryError> {
            let request = MasterServerRequest::deser(&mut &buf[..]).unwrap();
            self.requests_seen.lock().unwrap().push(request.clone());

            let page = self
                .pages
                .lock()
                .unwrap()
                .iter()
                .find(|(seed, _)| *seed == request.seed)
                .map(|(_, page)| page.clone());

            let handler = self.handler.lock().unwrap().clone();
            if let (Some(handler), Some(page)) = (handler, page) {
                let mut response = BytesMut::new();
                page.ser(&mut response).unwrap();
                handler.handle_datagram(&response, to).await;
            }
            Ok(())
        }

        async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
            *self.handler.lock().unwrap() = Some(handler);
            self.never.notified().await;
            Ok(())
        }

        fn close(&self) {}
    }

    struct Harness {
        transport: Arc<ScriptedMaster>,
        messenger: Messenger,
        emitted: Arc<Mutex<Vec<(Option<SocketAddr>, SocketAddr, bool)>>>,
    }

    fn harness(pages: Vec<(SocketAddr, Vec<SocketAddr>)>) -> Harness {
        let transport = Arc::new(ScriptedMaster::new(pages));
        let messenger =
            Messenger::with_transport(Arc::new(ClientConfig::new()), transport.clone());
        let runner = messenger.clone();
        tokio::spawn(async move { runner.run().await });

        Harness {
            transport,
            messenger,
            emitted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    impl Harness {
        async fn run_iteration(&self) -> (MasterIterationState, Result<Vec<SocketAddr>, QueryError>) {
            let mut iteration = MasterServerIteration::new(
                self.messenger.clone(),
                Arc::new(ClientConfig::new()),
                master_addr(),
            );
            assert_eq!(iteration.state(), MasterIterationState::Idle);

            let emitted = self.emitted.clone();
            let callback = move |entry: Option<SocketAddr>,
                                 master: SocketAddr,
                                 error: Option<&QueryError>| {
                emitted.lock().unwrap().push((entry, master, error.is_some()));
            };
            let result = iteration
                .run(
                    MasterServerRegion::RestOfWorld,
                    MasterServerFilter::new().app_id(440),
                    Some(&callback),
                )
                .await;
            (iteration.state(), result)
        }
    }

    /// One page ending in the terminator; the terminator is neither
    /// delivered to the callback nor accumulated.
    #[tokio::test(start_paused = true)]
    async fn test_single_page_with_terminator() {
        let (a, b, c) = (addr(1, 1), addr(2, 2), addr(3, 3));
        let h = harness(vec![(
            master::terminator(),
            vec![a, b, c, master::terminator()],
        )]);

        let (state, result) = h.run_iteration().await;

        assert_eq!(state, MasterIterationState::Done);
        assert_eq!(result.unwrap(), vec![a, b, c]);
        assert_eq!(
            *h.emitted.lock().unwrap(),
            vec![
                (Some(a), master_addr(), false),
                (Some(b), master_addr(), false),
                (Some(c), master_addr(), false),
            ]
        );
    }

    /// Two pages; the last entry of page one seeds page two and its echo
    /// there is skipped, so every server is accumulated exactly once.
    #[tokio::test(start_paused = true)]
    async fn test_two_pages_deduplicate_the_echoed_seed() {
        let (a, b, c, d, e) = (addr(1, 1), addr(2, 2), addr(3, 3), addr(4, 4), addr(5, 5));
        let h = harness(vec![
            (master::terminator(), vec![a, b, c]),
            (c, vec![c, d, e, master::terminator()]),
        ]);

        let (state, result) = h.run_iteration().await;

        assert_eq!(state, MasterIterationState::Done);
        assert_eq!(result.unwrap(), vec![a, b, c, d, e]);
        assert_eq!(h.transport.seen_seeds(), vec![master::terminator(), c]);
    }

    /// A page timeout is a graceful end: the accumulated list is returned
    /// and the callback is informed exactly once via its error slot.
    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_graceful_end_of_iteration() {
        let (a, b) = (addr(1, 1), addr(2, 2));
        // page two (seed = b) is never answered
        let h = harness(vec![(master::terminator(), vec![a, b])]);

        let (state, result) = h.run_iteration().await;

        assert_eq!(state, MasterIterationState::Done);
        assert_eq!(result.unwrap(), vec![a, b]);

        let emitted = h.emitted.lock().unwrap();
        assert_eq!(
            *emitted,
            vec![
                (Some(a), master_addr(), false),
                (Some(b), master_addr(), false),
                (None, master_addr(), true),
            ]
        );
    }

    /// running the same iteration twice yields identical lists
    #[tokio::test(start_paused = true)]
    async fn test_iteration_is_idempotent() {
        let (a, b, c) = (addr(1, 1), addr(2, 2), addr(3, 3));
        let h = harness(vec![(
            master::terminator(),
            vec![a, b, c, master::terminator()],
        )]);

        let (_, first) = h.run_iteration().await;
        let (_, second) = h.run_iteration().await;

        assert_eq!(first.unwrap(), second.unwrap());
    }

    /// a mid-page terminator ends the page (logged, not an error)
    #[tokio::test(start_paused = true)]
    async fn test_mid_page_terminator_terminates_the_page() {
        let (a, b) = (addr(1, 1), addr(2, 2));
        let h = harness(vec![(
            master::terminator(),
            vec![a, master::terminator(), b],
        )]);

        let (state, result) = h.run_iteration().await;

        assert_eq!(state, MasterIterationState::Done);
        assert_eq!(result.unwrap(), vec![a]);
    }

    /// an empty page without terminator cannot seed a next page
    #[tokio::test(start_paused = true)]
    async fn test_empty_page_ends_the_iteration() {
        let h = harness(vec![(master::terminator(), vec![])]);

        let (state, result) = h.run_iteration().await;

        assert_eq!(state, MasterIterationState::Done);
        assert_eq!(result.unwrap(), vec![]);
    }
}
