//! Codec for the Valve master server protocol: the seeded list request and
//! the response pages it is answered with.

use std::net::SocketAddr;

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::codec::SINGLE_PACKET_MAGIC;
use crate::error::QueryError;
use crate::util::buf::{put_cstring, try_get_cstring};

pub const HEADER_MASTER_REQUEST: u8 = 0x31;
pub const HEADER_MASTER_RESPONSE: u8 = 0x66;
const RESPONSE_HEADER_NEWLINE: u8 = 0x0a;

/// wire size of one response entry: 4 address octets + port
const ENTRY_LEN: usize = 6;

/// The reserved endpoint `0.0.0.0:0`. It is both the seed of the first page
/// request and the terminator entry that ends the server list.
pub fn terminator() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

pub fn is_terminator(addr: &SocketAddr) -> bool {
    *addr == terminator()
}

/// Region filter of a master server request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MasterServerRegion {
    UsEast = 0x00,
    UsWest = 0x01,
    SouthAmerica = 0x02,
    Europe = 0x03,
    Asia = 0x04,
    Australia = 0x05,
    MiddleEast = 0x06,
    Africa = 0x07,
    RestOfWorld = 0xff,
}

/// Builder for the `\key\value` filter string of a master server request.
///
/// Fragments are emitted in the order the builder methods were called.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MasterServerFilter {
    fragments: Vec<(String, String)>,
}

impl MasterServerFilter {
    pub fn new() -> MasterServerFilter {
        MasterServerFilter::default()
    }

    /// servers running the given application
    pub fn app_id(self, app_id: u32) -> Self {
        self.push("appid", app_id.to_string())
    }

    /// servers *not* running the given application
    pub fn napp(self, app_id: u32) -> Self {
        self.push("napp", app_id.to_string())
    }

    pub fn dedicated(self, value: bool) -> Self {
        self.push("dedicated", flag(value))
    }

    pub fn secure(self, value: bool) -> Self {
        self.push("secure", flag(value))
    }

    pub fn linux(self, value: bool) -> Self {
        self.push("linux", flag(value))
    }

    /// servers that are not empty
    pub fn not_empty(self, value: bool) -> Self {
        self.push("empty", flag(value))
    }

    /// servers that are not full
    pub fn not_full(self, value: bool) -> Self {
        self.push("full", flag(value))
    }

    pub fn no_players(self, value: bool) -> Self {
        self.push("noplayers", flag(value))
    }

    pub fn whitelisted(self, value: bool) -> Self {
        self.push("white", flag(value))
    }

    pub fn gamedir(self, dir: &str) -> Self {
        self.push("gamedir", dir.to_string())
    }

    pub fn map(self, map: &str) -> Self {
        self.push("map", map.to_string())
    }

    fn push(mut self, key: &str, value: String) -> Self {
        self.fragments.push((key.to_string(), value));
        self
    }

    /// The wire form: `\key\value` fragments, empty string for no filter.
    pub fn as_query(&self) -> String {
        self.fragments
            .iter()
            .map(|(key, value)| format!("\\{}\\{}", key, value))
            .collect()
    }

    fn parse(raw: &str) -> Result<MasterServerFilter, QueryError> {
        if raw.is_empty() {
            return Ok(MasterServerFilter::default());
        }
        let mut parts = raw.split('\\');
        if parts.next() != Some("") {
            return Err(QueryError::MalformedPayload(format!(
                "filter string does not start with a backslash: {:?}",
                raw
            )));
        }
        let mut fragments = Vec::new();
        loop {
            match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => {
                    fragments.push((key.to_string(), value.to_string()))
                }
                (None, _) => break,
                (Some(key), None) => {
                    return Err(QueryError::MalformedPayload(format!(
                        "filter key {:?} without a value",
                        key
                    )))
                }
            }
        }
        Ok(MasterServerFilter { fragments })
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

/// One page request. `seed` is the reserved endpoint for the first page and
/// the last endpoint of the previous page afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterServerRequest {
    pub region: MasterServerRegion,
    pub filter: MasterServerFilter,
    pub seed: SocketAddr,
}

impl MasterServerRequest {
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), QueryError> {
        if self.seed.is_ipv6() {
            return Err(QueryError::Encoding(
                "master server seeds must be IPv4 endpoints".to_string(),
            ));
        }
        buf.put_u8(HEADER_MASTER_REQUEST);
        buf.put_u8(self.region.into());
        put_cstring(buf, &self.seed.to_string());
        put_cstring(buf, &self.filter.as_query());
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> Result<MasterServerRequest, QueryError> {
        if buf.try_get_u8()? != HEADER_MASTER_REQUEST {
            return Err(QueryError::MalformedPayload(
                "not a master server request".to_string(),
            ));
        }
        let region = MasterServerRegion::try_from(buf.try_get_u8()?).map_err(|e| {
            QueryError::MalformedPayload(format!("unknown region code: {}", e))
        })?;
        let seed_raw = try_get_cstring(buf)?;
        let seed = seed_raw.parse().map_err(|_| {
            QueryError::MalformedPayload(format!("invalid seed endpoint {:?}", seed_raw))
        })?;
        let filter = MasterServerFilter::parse(&try_get_cstring(buf)?)?;
        Ok(MasterServerRequest {
            region,
            filter,
            seed,
        })
    }
}

/// One response page: an ordered sequence of endpoints. The terminator
/// entry, if present, is part of `entries` - interpreting it is the
/// iteration loop's job, because its meaning is positional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterServerPage {
    pub entries: Vec<SocketAddr>,
}

impl MasterServerPage {
    /// Parses the remainder of a response after magic and discriminator.
    pub(crate) fn deser(buf: &mut impl Buf) -> Result<MasterServerPage, QueryError> {
        if buf.try_get_u8()? != RESPONSE_HEADER_NEWLINE {
            return Err(QueryError::MalformedPayload(
                "master response header is missing its newline byte".to_string(),
            ));
        }
        let mut entries = Vec::with_capacity(buf.remaining() / ENTRY_LEN);
        while buf.has_remaining() {
            if buf.remaining() < ENTRY_LEN {
                return Err(QueryError::MalformedPayload(format!(
                    "truncated master response entry of {} bytes",
                    buf.remaining()
                )));
            }
            // network byte order, unlike the rest of the protocol
            let octets = [buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8()];
            let port = buf.get_u16();
            entries.push(SocketAddr::from((octets, port)));
        }
        Ok(MasterServerPage { entries })
    }

    /// Server-side encoding, the exact inverse of [`MasterServerPage::deser`].
    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), QueryError> {
        buf.put_i32_le(SINGLE_PACKET_MAGIC);
        buf.put_u8(HEADER_MASTER_RESPONSE);
        buf.put_u8(RESPONSE_HEADER_NEWLINE);
        for entry in &self.entries {
            match entry {
                SocketAddr::V4(v4) => {
                    buf.put_slice(&v4.ip().octets());
                    buf.put_u16(v4.port());
                }
                SocketAddr::V6(_) => {
                    return Err(QueryError::Encoding(
                        "master response entries must be IPv4 endpoints".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }
}
