//! Varint length-delimited framing.
//!
//! Every message on the wire is prefixed with its length in bytes as an
//! unsigned LEB128 varint: base-128 groups in little-endian order, the high
//! bit of each byte flagging a continuation. Framing preserves message
//! boundaries exactly; payloads are never coalesced or split.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{HostError, HostResult, ProtocolError};

/// Longest encoding this codec accepts: 9 * 7 bits covers any length that
/// fits in u63, far beyond any message the protocol can carry.
const MAX_VARINT_BYTES: u32 = 9;

/// Appends the LEB128 encoding of `value` to `out`.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes a LEB128 varint from the front of `input`, returning the value
/// and the number of bytes consumed. `None` if `input` ends mid-varint.
pub fn decode_varint(input: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in input.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Writes one length-prefixed frame and flushes the writer.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = Vec::with_capacity(MAX_VARINT_BYTES as usize);
    encode_varint(payload.len() as u64, &mut header);
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` on EOF at a frame boundary. EOF in the middle of a
/// length prefix or payload is a fatal PARSE error.
pub async fn read_frame<R>(reader: &mut R) -> HostResult<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut length = 0u64;
    let mut index = 0u32;
    loop {
        let mut byte = [0u8; 1];
        let read = reader.read(&mut byte).await?;
        if read == 0 {
            if index == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::parse("Truncated varint length prefix.").into());
        }
        if index >= MAX_VARINT_BYTES {
            return Err(ProtocolError::parse("Varint length prefix is too long.").into());
        }
        length |= u64::from(byte[0] & 0x7f) << (7 * index);
        index += 1;
        if byte[0] & 0x80 == 0 {
            break;
        }
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            HostError::from(ProtocolError::parse("Truncated message payload."))
        } else {
            HostError::from(err)
        }
    })?;
    Ok(Some(payload.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn encoded(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode_varint(value, &mut out);
        out
    }

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, 1 << 21, u64::from(u32::MAX)] {
            let bytes = encoded(value);
            let (decoded, used) = decode_varint(&bytes).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn varint_known_encodings() {
        assert_eq!(encoded(0), vec![0x00]);
        assert_eq!(encoded(127), vec![0x7f]);
        assert_eq!(encoded(128), vec![0x80, 0x01]);
        assert_eq!(encoded(300), vec![0xac, 0x02]);
    }

    #[test]
    fn varint_is_prefix_free() {
        // No complete encoding is a strict prefix of another.
        let values: Vec<u64> = vec![0, 1, 127, 128, 255, 300, 16_384];
        for &a in &values {
            for &b in &values {
                if a == b {
                    continue;
                }
                let (ea, eb) = (encoded(a), encoded(b));
                assert!(!(eb.len() > ea.len() && eb[..ea.len()] == ea[..]));
            }
        }
    }

    #[test]
    fn truncated_varint_is_incomplete() {
        assert_eq!(decode_varint(&[0x80]), None);
        assert_eq!(decode_varint(&[]), None);
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let payloads: Vec<Vec<u8>> = vec![vec![], vec![1], vec![0xff; 200], vec![7; 20_000]];
        let mut wire = Vec::new();
        for payload in &payloads {
            write_frame(&mut wire, payload).await.unwrap();
        }

        let mut reader = wire.as_slice();
        for payload in &payloads {
            let frame = read_frame(&mut reader).await.unwrap().unwrap();
            assert_eq!(&frame[..], &payload[..]);
        }
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_varint_is_parse_error() {
        let mut reader: &[u8] = &[0x80];
        match read_frame(&mut reader).await {
            Err(HostError::Protocol(err)) => assert_eq!(err.kind, ErrorKind::Parse),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_mid_payload_is_parse_error() {
        // Length says 100 bytes, only 3 follow.
        let mut reader: &[u8] = &[100, 1, 2, 3];
        match read_frame(&mut reader).await {
            Err(HostError::Protocol(err)) => {
                assert_eq!(err.kind, ErrorKind::Parse);
                assert_eq!(err.message, "Truncated message payload.");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_varint_is_parse_error() {
        let mut reader: &[u8] = &[0x80; 12];
        match read_frame(&mut reader).await {
            Err(HostError::Protocol(err)) => assert_eq!(err.kind, ErrorKind::Parse),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
