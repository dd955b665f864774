//! Asynchronous client library for querying game servers and Valve master
//! servers.
//!
//! The crate is built around a small request/response engine that is shared
//! by all UDP query protocols:
//!
//! * [`transport`] binds a single UDP socket and multiplexes all protocol
//!   families over it
//! * [`codec`] turns typed requests into wire bytes and inbound datagrams
//!   into typed responses
//! * [`session`] correlates inbound packets with outstanding requests - the
//!   Valve query protocols carry no request id, so correlation is by remote
//!   address and protocol family
//! * [`messenger`] owns outbound queueing (priority + aging), per-destination
//!   pacing and response correlation
//! * [`master`] drives the seeded pagination of the Valve master server
//!   protocol until the terminator endpoint is seen
//! * [`rcon`] implements the Source RCON authentication and multi-packet
//!   reassembly state machine over TCP
//!
//! [`client`] provides thin facades over the engine for the common cases
//! (server info / players / rules with automatic challenge handling, and
//! fetching the full server list from a master server).

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod master;
pub mod messenger;
pub mod rcon;
pub mod request;
pub mod session;
pub mod transport;
pub mod util;
