//! Thin caller-facing facades over the engine. They own no protocol logic
//! beyond the request/response pairing and the challenge retry; everything
//! else lives in the messenger and the iteration loop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use tracing::debug;

use crate::codec::a2s::{A2sRequest, A2sResponse, PlayerInfo, ServerInfo, CHALLENGE_REQUEST};
use crate::codec::master::{MasterServerFilter, MasterServerRegion};
use crate::codec::{Request, Response};
use crate::config::ClientConfig;
use crate::error::QueryError;
use crate::master::{MasterQueryCallback, MasterServerIteration};
use crate::messenger::Messenger;
use crate::request::RequestPriority;

/// The well-known Source master server endpoint.
pub const SOURCE_MASTER_HOST: &str = "hl2master.steampowered.com:27011";

/// Queries individual game servers (info, players, rules). Servers may
/// demand a challenge handshake first; the facade handles the retry.
pub struct ServerQueryClient {
    messenger: Messenger,
}

impl ServerQueryClient {
    pub fn new(messenger: Messenger) -> ServerQueryClient {
        ServerQueryClient { messenger }
    }

    pub async fn get_server_info(&self, server: SocketAddr) -> Result<ServerInfo, QueryError> {
        match self.query(server, A2sRequest::Info { challenge: None }).await? {
            A2sResponse::Info(info) => Ok(info),
            A2sResponse::Challenge(challenge) => {
                debug!("server {:?} demands a challenge handshake", server);
                match self
                    .query(server, A2sRequest::Info { challenge: Some(challenge) })
                    .await?
                {
                    A2sResponse::Info(info) => Ok(info),
                    other => Err(unexpected(&other)),
                }
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_players(&self, server: SocketAddr) -> Result<Vec<PlayerInfo>, QueryError> {
        match self
            .query(server, A2sRequest::Players { challenge: CHALLENGE_REQUEST })
            .await?
        {
            A2sResponse::Players(players) => Ok(players),
            A2sResponse::Challenge(challenge) => {
                match self.query(server, A2sRequest::Players { challenge }).await? {
                    A2sResponse::Players(players) => Ok(players),
                    other => Err(unexpected(&other)),
                }
            }
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_rules(
        &self,
        server: SocketAddr,
    ) -> Result<Vec<(String, String)>, QueryError> {
        match self
            .query(server, A2sRequest::Rules { challenge: CHALLENGE_REQUEST })
            .await?
        {
            A2sResponse::Rules(rules) => Ok(rules),
            A2sResponse::Challenge(challenge) => {
                match self.query(server, A2sRequest::Rules { challenge }).await? {
                    A2sResponse::Rules(rules) => Ok(rules),
                    other => Err(unexpected(&other)),
                }
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn query(
        &self,
        server: SocketAddr,
        request: A2sRequest,
    ) -> Result<A2sResponse, QueryError> {
        let handle =
            self.messenger
                .submit(Request::SourceQuery(request), server, RequestPriority::Normal);
        match handle.response().await? {
            Response::SourceQuery(response) => Ok(response),
            other => Err(QueryError::MalformedPayload(format!(
                "response family {:?} does not match the request",
                other.family()
            ))),
        }
    }
}

fn unexpected(response: &A2sResponse) -> QueryError {
    let kind = match response {
        A2sResponse::Challenge(_) => "a second challenge",
        A2sResponse::Info(_) => "an info response",
        A2sResponse::Players(_) => "a player list",
        A2sResponse::Rules(_) => "a rules list",
    };
    QueryError::MalformedPayload(format!("server answered the query with {}", kind))
}

/// Fetches server lists from a master server.
pub struct MasterQueryClient {
    messenger: Messenger,
    config: Arc<ClientConfig>,
    master_addr: SocketAddr,
}

impl MasterQueryClient {
    pub fn new(
        messenger: Messenger,
        config: Arc<ClientConfig>,
        master_addr: SocketAddr,
    ) -> MasterQueryClient {
        MasterQueryClient {
            messenger,
            config,
            master_addr,
        }
    }

    /// Resolves [`SOURCE_MASTER_HOST`] and builds a client for it.
    pub async fn for_source_master(
        messenger: Messenger,
        config: Arc<ClientConfig>,
    ) -> anyhow::Result<MasterQueryClient> {
        let master_addr = tokio::net::lookup_host(SOURCE_MASTER_HOST)
            .await?
            .next()
            .ok_or_else(|| anyhow!("master host {} did not resolve", SOURCE_MASTER_HOST))?;
        Ok(MasterQueryClient::new(messenger, config, master_addr))
    }

    /// Retrieves the full server list for a region and filter. The optional
    /// callback sees every server as it is discovered.
    pub async fn get_server_list(
        &self,
        region: MasterServerRegion,
        filter: MasterServerFilter,
        callback: Option<&MasterQueryCallback>,
    ) -> Result<Vec<SocketAddr>, QueryError> {
        let mut iteration = MasterServerIteration::new(
            self.messenger.clone(),
            self.config.clone(),
            self.master_addr,
        );
        iteration.run(region, filter, callback).await
    }
}
