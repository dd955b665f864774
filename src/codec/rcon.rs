//! Frame codec for the Source RCON protocol (TCP).
//!
//! Wire layout, all integers little-endian:
//!
//! ```ascii
//! 0: size (i32) - number of bytes after this field
//! 4: request id (i32)
//! 8: type (i32) - 3 AUTH, 2 AUTH_RESPONSE / EXECCOMMAND, 0 RESPONSE_VALUE
//! 12: body (NUL-terminated UTF-8)
//! *: padding (one further NUL)
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::QueryError;

pub const SERVERDATA_RESPONSE_VALUE: i32 = 0;
pub const SERVERDATA_AUTH_RESPONSE: i32 = 2;
pub const SERVERDATA_EXECCOMMAND: i32 = 2;
pub const SERVERDATA_AUTH: i32 = 3;

/// The request id a server substitutes into its auth response when the
/// password was refused.
pub const AUTH_FAILURE_ID: i32 = -1;

/// id + type + body terminator + padding
pub const MIN_PAYLOAD_LEN: usize = 10;

/// Servers cap bodies at 4096 bytes; anything claiming more is not a valid
/// frame and treated as a protocol violation.
pub const MAX_BODY_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconFrame {
    pub id: i32,
    pub frame_type: i32,
    pub body: String,
}

impl RconFrame {
    pub fn new(id: i32, frame_type: i32, body: impl Into<String>) -> RconFrame {
        RconFrame {
            id,
            frame_type,
            body: body.into(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let size = self.body.len() + MIN_PAYLOAD_LEN;
        buf.put_i32_le(size as i32);
        buf.put_i32_le(self.id);
        buf.put_i32_le(self.frame_type);
        buf.put_slice(self.body.as_bytes());
        buf.put_u8(0);
        buf.put_u8(0);
    }

    /// Parses the sized remainder of a frame, i.e. everything after the size
    /// field (which the stream reader consumes to know how much to read).
    pub fn deser_payload(payload: &[u8]) -> Result<RconFrame, QueryError> {
        if payload.len() < MIN_PAYLOAD_LEN {
            return Err(QueryError::MalformedPayload(format!(
                "rcon frame payload of {} bytes is too short",
                payload.len()
            )));
        }
        let buf = &mut &payload[..];
        let id = buf.try_get_i32_le()?;
        let frame_type = buf.try_get_i32_le()?;

        let rest = buf.chunk();
        let (body, trailer) = rest.split_at(rest.len() - 2);
        if trailer != [0, 0] {
            return Err(QueryError::MalformedPayload(
                "rcon frame is missing its NUL trailer".to_string(),
            ));
        }
        // NB: bodies with interior NULs are accepted - some servers answer
        // the empty follow-up command with a `\x00\x01` marker body, and
        // rejecting that frame would tear down a healthy connection
        Ok(RconFrame {
            id,
            frame_type,
            body: String::from_utf8_lossy(body).into_owned(),
        })
    }
}
