//! Codec for the Source server query family (A2S_INFO, A2S_PLAYER,
//! A2S_RULES and the S2C_CHALLENGE handshake).

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::SINGLE_PACKET_MAGIC;
use crate::error::QueryError;
use crate::util::buf::{put_cstring, try_get_cstring};

pub const HEADER_INFO_REQUEST: u8 = 0x54;
pub const HEADER_CHALLENGE: u8 = 0x41;
pub const HEADER_INFO_RESPONSE: u8 = 0x49;
pub const HEADER_PLAYER_REQUEST: u8 = 0x55;
pub const HEADER_PLAYER_RESPONSE: u8 = 0x44;
pub const HEADER_RULES_REQUEST: u8 = 0x56;
pub const HEADER_RULES_RESPONSE: u8 = 0x45;

/// Fixed payload of an info request.
pub const INFO_PAYLOAD: &str = "Source Engine Query";

/// Player and rules queries must carry a challenge number; sending this
/// value asks the server to issue a fresh one via S2C_CHALLENGE.
pub const CHALLENGE_REQUEST: i32 = -1;

// extra-data-flag bits of an info response
const EDF_PORT: u8 = 0x80;
const EDF_STEAM_ID: u8 = 0x10;
const EDF_SOURCE_TV: u8 = 0x40;
const EDF_KEYWORDS: u8 = 0x20;
const EDF_GAME_ID: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A2sRequest {
    /// `challenge` is `None` for the initial query; if the server answers
    /// with S2C_CHALLENGE, the query is repeated with the challenge appended.
    Info { challenge: Option<i32> },
    Players { challenge: i32 },
    Rules { challenge: i32 },
}

impl A2sRequest {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32_le(SINGLE_PACKET_MAGIC);
        match self {
            A2sRequest::Info { challenge } => {
                buf.put_u8(HEADER_INFO_REQUEST);
                put_cstring(buf, INFO_PAYLOAD);
                if let Some(challenge) = challenge {
                    buf.put_i32_le(*challenge);
                }
            }
            A2sRequest::Players { challenge } => {
                buf.put_u8(HEADER_PLAYER_REQUEST);
                buf.put_i32_le(*challenge);
            }
            A2sRequest::Rules { challenge } => {
                buf.put_u8(HEADER_RULES_REQUEST);
                buf.put_i32_le(*challenge);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<A2sRequest, QueryError> {
        let magic = buf.try_get_i32_le()?;
        if magic != SINGLE_PACKET_MAGIC {
            return Err(QueryError::MalformedPayload(
                "missing single-packet magic".to_string(),
            ));
        }
        match buf.try_get_u8()? {
            HEADER_INFO_REQUEST => {
                let payload = try_get_cstring(buf)?;
                if payload != INFO_PAYLOAD {
                    return Err(QueryError::MalformedPayload(format!(
                        "unexpected info request payload {:?}",
                        payload
                    )));
                }
                let challenge = if buf.has_remaining() {
                    Some(buf.try_get_i32_le()?)
                } else {
                    None
                };
                Ok(A2sRequest::Info { challenge })
            }
            HEADER_PLAYER_REQUEST => Ok(A2sRequest::Players {
                challenge: buf.try_get_i32_le()?,
            }),
            HEADER_RULES_REQUEST => Ok(A2sRequest::Rules {
                challenge: buf.try_get_i32_le()?,
            }),
            other => Err(QueryError::MalformedPayload(format!(
                "unknown request discriminator 0x{:02x}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum A2sResponse {
    /// S2C_CHALLENGE - repeat the request with this number appended.
    Challenge(i32),
    Info(ServerInfo),
    Players(Vec<PlayerInfo>),
    /// name / value pairs in server order
    Rules(Vec<(String, String)>),
}

/// Response to an info query. Field order matches the wire layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub protocol: u8,
    pub name: String,
    pub map: String,
    pub folder: String,
    pub game: String,
    pub app_id: u16,
    pub players: u8,
    pub max_players: u8,
    pub bots: u8,
    /// `d` dedicated, `l` listen, `p` SourceTV relay
    pub server_type: u8,
    /// `l` Linux, `w` Windows, `m` / `o` macOS
    pub environment: u8,
    pub visibility: u8,
    pub vac: u8,
    pub version: String,
    pub extra: ExtraServerInfo,
}

/// Optional trailing fields of an info response, present per the
/// extra-data-flag byte.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtraServerInfo {
    pub port: Option<u16>,
    pub steam_id: Option<u64>,
    /// SourceTV port and spectator server name
    pub source_tv: Option<(u16, String)>,
    pub keywords: Option<String>,
    pub game_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInfo {
    pub index: u8,
    pub name: String,
    pub score: i32,
    /// seconds the player has been connected
    pub duration: f32,
}

impl A2sResponse {
    /// Parses the remainder of a packet after magic and discriminator.
    pub(crate) fn deser(discriminator: u8, buf: &mut impl Buf) -> Result<A2sResponse, QueryError> {
        match discriminator {
            HEADER_CHALLENGE => Ok(A2sResponse::Challenge(buf.try_get_i32_le()?)),
            HEADER_INFO_RESPONSE => Ok(A2sResponse::Info(Self::deser_info(buf)?)),
            HEADER_PLAYER_RESPONSE => {
                let count = buf.try_get_u8()?;
                let mut players = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    players.push(PlayerInfo {
                        index: buf.try_get_u8()?,
                        name: try_get_cstring(buf)?,
                        score: buf.try_get_i32_le()?,
                        duration: buf.try_get_f32_le()?,
                    });
                }
                Ok(A2sResponse::Players(players))
            }
            HEADER_RULES_RESPONSE => {
                let count = buf.try_get_u16_le()?;
                let mut rules = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let name = try_get_cstring(buf)?;
                    let value = try_get_cstring(buf)?;
                    rules.push((name, value));
                }
                Ok(A2sResponse::Rules(rules))
            }
            other => Err(QueryError::MalformedPayload(format!(
                "unknown source query discriminator 0x{:02x}",
                other
            ))),
        }
    }

    fn deser_info(buf: &mut impl Buf) -> Result<ServerInfo, QueryError> {
        let protocol = buf.try_get_u8()?;
        let name = try_get_cstring(buf)?;
        let map = try_get_cstring(buf)?;
        let folder = try_get_cstring(buf)?;
        let game = try_get_cstring(buf)?;
        let app_id = buf.try_get_u16_le()?;
        let players = buf.try_get_u8()?;
        let max_players = buf.try_get_u8()?;
        let bots = buf.try_get_u8()?;
        let server_type = buf.try_get_u8()?;
        let environment = buf.try_get_u8()?;
        let visibility = buf.try_get_u8()?;
        let vac = buf.try_get_u8()?;
        let version = try_get_cstring(buf)?;

        // pre-EDF servers end the packet here
        let mut extra = ExtraServerInfo::default();
        if buf.has_remaining() {
            let edf = buf.try_get_u8()?;
            if edf & EDF_PORT != 0 {
                extra.port = Some(buf.try_get_u16_le()?);
            }
            if edf & EDF_STEAM_ID != 0 {
                extra.steam_id = Some(buf.try_get_u64_le()?);
            }
            if edf & EDF_SOURCE_TV != 0 {
                let port = buf.try_get_u16_le()?;
                let name = try_get_cstring(buf)?;
                extra.source_tv = Some((port, name));
            }
            if edf & EDF_KEYWORDS != 0 {
                extra.keywords = Some(try_get_cstring(buf)?);
            }
            if edf & EDF_GAME_ID != 0 {
                extra.game_id = Some(buf.try_get_u64_le()?);
            }
        }

        Ok(ServerInfo {
            protocol,
            name,
            map,
            folder,
            game,
            app_id,
            players,
            max_players,
            bots,
            server_type,
            environment,
            visibility,
            vac,
            version,
            extra,
        })
    }

    /// Server-side encoding, the exact inverse of [`A2sResponse::deser`].
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32_le(SINGLE_PACKET_MAGIC);
        match self {
            A2sResponse::Challenge(challenge) => {
                buf.put_u8(HEADER_CHALLENGE);
                buf.put_i32_le(*challenge);
            }
            A2sResponse::Info(info) => {
                buf.put_u8(HEADER_INFO_RESPONSE);
                Self::ser_info(info, buf);
            }
            A2sResponse::Players(players) => {
                buf.put_u8(HEADER_PLAYER_RESPONSE);
                buf.put_u8(players.len() as u8);
                for player in players {
                    buf.put_u8(player.index);
                    put_cstring(buf, &player.name);
                    buf.put_i32_le(player.score);
                    buf.put_f32_le(player.duration);
                }
            }
            A2sResponse::Rules(rules) => {
                buf.put_u8(HEADER_RULES_RESPONSE);
                buf.put_u16_le(rules.len() as u16);
                for (name, value) in rules {
                    put_cstring(buf, name);
                    put_cstring(buf, value);
                }
            }
        }
    }

    fn ser_info(info: &ServerInfo, buf: &mut BytesMut) {
        buf.put_u8(info.protocol);
        put_cstring(buf, &info.name);
        put_cstring(buf, &info.map);
        put_cstring(buf, &info.folder);
        put_cstring(buf, &info.game);
        buf.put_u16_le(info.app_id);
        buf.put_u8(info.players);
        buf.put_u8(info.max_players);
        buf.put_u8(info.bots);
        buf.put_u8(info.server_type);
        buf.put_u8(info.environment);
        buf.put_u8(info.visibility);
        buf.put_u8(info.vac);
        put_cstring(buf, &info.version);

        let extra = &info.extra;
        let mut edf = 0u8;
        if extra.port.is_some() {
            edf |= EDF_PORT;
        }
        if extra.steam_id.is_some() {
            edf |= EDF_STEAM_ID;
        }
        if extra.source_tv.is_some() {
            edf |= EDF_SOURCE_TV;
        }
        if extra.keywords.is_some() {
            edf |= EDF_KEYWORDS;
        }
        if extra.game_id.is_some() {
            edf |= EDF_GAME_ID;
        }
        buf.put_u8(edf);
        if let Some(port) = extra.port {
            buf.put_u16_le(port);
        }
        if let Some(steam_id) = extra.steam_id {
            buf.put_u64_le(steam_id);
        }
        if let Some((port, name)) = &extra.source_tv {
            buf.put_u16_le(*port);
            put_cstring(buf, name);
        }
        if let Some(keywords) = &extra.keywords {
            put_cstring(buf, keywords);
        }
        if let Some(game_id) = extra.game_id {
            buf.put_u64_le(game_id);
        }
    }
}
