//! Encoders and decoders for the supported wire protocols.
//!
//! Each protocol family provides a pair of pure encode / total decode
//! functions. Decoding never panics: any malformed input yields a typed
//! error, and a structurally valid frame whose discriminator no family
//! claims is reported as `UnrecognizedMessage` together with the raw bytes.
//!
//! All multi-byte integers are little-endian on the wire, with one
//! exception: the entries of a master server response carry IP address and
//! port in network byte order.

pub mod a2s;
pub mod master;
pub mod rcon;

use bytes::{Buf, BytesMut};

use crate::error::QueryError;

/// Leading magic of every single-frame Valve query packet (`FF FF FF FF`).
pub const SINGLE_PACKET_MAGIC: i32 = -1;

/// The protocol family a message belongs to. Responses carry no request id,
/// so the family is part of the session key used for correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolFamily {
    SourceQuery,
    MasterServer,
}

/// A typed outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SourceQuery(a2s::A2sRequest),
    MasterServer(master::MasterServerRequest),
}

impl Request {
    pub fn family(&self) -> ProtocolFamily {
        match self {
            Request::SourceQuery(_) => ProtocolFamily::SourceQuery,
            Request::MasterServer(_) => ProtocolFamily::MasterServer,
        }
    }

    /// Rate-sensitive families get the per-destination pacing delay in the
    /// messenger; everything else is dispatched unthrottled.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Request::MasterServer(_))
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), QueryError> {
        match self {
            Request::SourceQuery(request) => {
                request.ser(buf);
                Ok(())
            }
            Request::MasterServer(request) => request.ser(buf),
        }
    }
}

/// A typed inbound response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    SourceQuery(a2s::A2sResponse),
    MasterServer(master::MasterServerPage),
}

impl Response {
    pub fn family(&self) -> ProtocolFamily {
        match self {
            Response::SourceQuery(_) => ProtocolFamily::SourceQuery,
            Response::MasterServer(_) => ProtocolFamily::MasterServer,
        }
    }

    /// Encodes the response the way a server would. The engine itself only
    /// decodes responses; this is the other half of the wire contract, used
    /// to verify that decoding a captured sample and re-encoding it
    /// reproduces the original bytes, and by simulated servers in tests.
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), QueryError> {
        match self {
            Response::SourceQuery(response) => {
                response.ser(buf);
                Ok(())
            }
            Response::MasterServer(page) => page.ser(buf),
        }
    }
}

/// Decodes one inbound datagram into a typed response.
///
/// The leading discriminator - the 4-byte magic plus a type byte - selects
/// the per-message parser. Split-packet responses (`FF FF FF FE`) are not
/// assembled by this engine and surface as `UnrecognizedMessage` like any
/// other unknown discriminator.
pub fn decode(raw: &[u8]) -> Result<Response, QueryError> {
    let buf = &mut &raw[..];
    let magic = buf.try_get_i32_le()?;
    if magic != SINGLE_PACKET_MAGIC {
        return Err(QueryError::UnrecognizedMessage { raw: raw.to_vec() });
    }

    let discriminator = buf.try_get_u8()?;
    match discriminator {
        a2s::HEADER_INFO_RESPONSE
        | a2s::HEADER_CHALLENGE
        | a2s::HEADER_PLAYER_RESPONSE
        | a2s::HEADER_RULES_RESPONSE => Ok(Response::SourceQuery(a2s::A2sResponse::deser(
            discriminator,
            buf,
        )?)),
        master::HEADER_MASTER_RESPONSE => {
            Ok(Response::MasterServer(master::MasterServerPage::deser(buf)?))
        }
        _ => Err(QueryError::UnrecognizedMessage { raw: raw.to_vec() }),
    }
}
