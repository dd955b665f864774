use bytes::{Buf, BufMut, BytesMut};

use crate::error::QueryError;

/// Writes a NUL-terminated string the way all Valve wire formats expect it.
pub fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Reads a NUL-terminated string, consuming the terminator.
///
/// A string without a terminator inside the buffer is rejected - decoders
/// must be total, and an unterminated string means the packet is truncated
/// or not what it claims to be. Non-UTF8 bytes are replaced rather than
/// rejected: some game servers send names in legacy encodings.
pub fn try_get_cstring(buf: &mut impl Buf) -> Result<String, QueryError> {
    let mut raw = Vec::new();
    loop {
        if !buf.has_remaining() {
            return Err(QueryError::MalformedPayload(
                "string without NUL terminator".to_string(),
            ));
        }
        match buf.get_u8() {
            0 => break,
            b => raw.push(b),
        }
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::empty("")]
    #[case::simple("Source Engine Query")]
    #[case::umlaut("käse")]
    fn test_cstring_round_trip(#[case] s: &str) {
        let mut buf = BytesMut::new();
        put_cstring(&mut buf, s);
        assert_eq!(buf.last(), Some(&0u8));

        let mut b: &[u8] = &buf;
        let actual = try_get_cstring(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(actual, s);
    }

    #[rstest]
    #[case::terminated(b"abc\0def".as_slice(), Some("abc"), b"def".as_slice())]
    #[case::empty_string(b"\0xy".as_slice(), Some(""), b"xy".as_slice())]
    #[case::unterminated(b"abc".as_slice(), None, b"".as_slice())]
    #[case::empty_buffer(b"".as_slice(), None, b"".as_slice())]
    fn test_try_get_cstring(
        #[case] mut buf: &[u8],
        #[case] expected: Option<&str>,
        #[case] buf_after: &[u8],
    ) {
        match try_get_cstring(&mut buf) {
            Ok(actual) => {
                assert_eq!(actual, expected.unwrap());
                assert_eq!(buf, buf_after);
            }
            Err(e) => {
                assert!(expected.is_none());
                assert!(matches!(e, QueryError::MalformedPayload(_)));
            }
        }
    }
}
