use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::types::Reply;

/// RESP2 codec. Decoding is incremental: a partial frame leaves the input
/// buffer untouched and yields `None`.
#[derive(Debug, Clone, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = Reply;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let mut pos = 0usize;
        match parse_value(&src[..], &mut pos)? {
            Some(frame) => {
                src.advance(pos);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Reply> for RespCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<()> {
        write_value(&item, dst);
        Ok(())
    }
}

fn parse_value(src: &[u8], pos: &mut usize) -> Result<Option<Reply>> {
    if *pos >= src.len() {
        return Ok(None);
    }
    let start = *pos;
    let prefix = src[*pos];
    *pos += 1;

    match prefix {
        b'+' => {
            let line = match read_line(src, pos) {
                Some(line) => line,
                None => {
                    *pos = start;
                    return Ok(None);
                }
            };
            Ok(Some(Reply::Status(Bytes::copy_from_slice(line))))
        }
        b'-' => {
            let line = match read_line(src, pos) {
                Some(line) => line,
                None => {
                    *pos = start;
                    return Ok(None);
                }
            };
            Ok(Some(Reply::Error(Bytes::copy_from_slice(line))))
        }
        b':' => {
            let line = match read_line(src, pos) {
                Some(line) => line,
                None => {
                    *pos = start;
                    return Ok(None);
                }
            };
            let text = std::str::from_utf8(line)?;
            let value = text
                .parse::<i64>()
                .map_err(|err| anyhow!("invalid integer reply: {err}"))?;
            Ok(Some(Reply::Integer(value)))
        }
        b'$' => parse_bulk(src, pos, start),
        b'*' => parse_array(src, pos, start),
        _ => Err(anyhow!("unsupported RESP prefix '{}'", prefix as char)),
    }
}

fn parse_bulk(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<Reply>> {
    let line = match read_line(src, pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "bulk string")?;
    if len < 0 {
        return Ok(Some(Reply::Null));
    }
    let len = len as usize;
    if *pos + len + 2 > src.len() {
        *pos = start;
        return Ok(None);
    }
    let data = &src[*pos..*pos + len];
    *pos += len + 2;
    Ok(Some(Reply::Bulk(Bytes::copy_from_slice(data))))
}

fn parse_array(src: &[u8], pos: &mut usize, start: usize) -> Result<Option<Reply>> {
    let mut local_pos = *pos;
    let line = match read_line(src, &mut local_pos) {
        Some(line) => line,
        None => {
            *pos = start;
            return Ok(None);
        }
    };
    let len = parse_length(line, "array")?;
    if len < 0 {
        *pos = local_pos;
        return Ok(Some(Reply::Null));
    }
    let mut values = Vec::with_capacity(len as usize);
    let mut element_pos = local_pos;
    for _ in 0..len {
        match parse_value(src, &mut element_pos)? {
            Some(value) => values.push(value),
            None => {
                *pos = start;
                return Ok(None);
            }
        }
    }
    *pos = element_pos;
    Ok(Some(Reply::Array(values)))
}

fn parse_length(bytes: &[u8], kind: &str) -> Result<isize> {
    let text = std::str::from_utf8(bytes)?;
    text.parse::<isize>()
        .map_err(|err| anyhow!("invalid {kind} length: {err}"))
}

fn read_line<'a>(src: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let mut idx = *pos;
    while idx + 1 < src.len() {
        if src[idx] == b'\r' && src[idx + 1] == b'\n' {
            let line = &src[*pos..idx];
            *pos = idx + 2;
            return Some(line);
        }
        idx += 1;
    }
    None
}

fn write_value(value: &Reply, dst: &mut BytesMut) {
    match value {
        Reply::Status(data) => {
            dst.extend_from_slice(b"+");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        Reply::Error(data) => {
            dst.extend_from_slice(b"-");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        Reply::Integer(value) => {
            dst.extend_from_slice(b":");
            dst.extend_from_slice(value.to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        Reply::Bulk(data) => {
            dst.extend_from_slice(b"$");
            dst.extend_from_slice(data.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            dst.extend_from_slice(data);
            dst.extend_from_slice(b"\r\n");
        }
        Reply::Null => dst.extend_from_slice(b"$-1\r\n"),
        Reply::Array(values) => {
            dst.extend_from_slice(b"*");
            dst.extend_from_slice(values.len().to_string().as_bytes());
            dst.extend_from_slice(b"\r\n");
            for value in values {
                write_value(value, dst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (Vec<Reply>, usize) {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        (frames, buf.len())
    }

    #[test]
    fn decodes_simple_replies() {
        let (frames, rest) = decode_all(b"+OK\r\n-ERR boom\r\n:42\r\n");
        assert_eq!(
            frames,
            vec![
                Reply::status("OK"),
                Reply::error("ERR boom"),
                Reply::Integer(42),
            ]
        );
        assert_eq!(rest, 0);
    }

    #[test]
    fn decodes_bulk_and_null() {
        let (frames, rest) = decode_all(b"$3\r\nbar\r\n$-1\r\n");
        assert_eq!(frames, vec![Reply::bulk("bar"), Reply::Null]);
        assert_eq!(rest, 0);
    }

    #[test]
    fn decodes_nested_array() {
        let (frames, _) = decode_all(b"*2\r\n$3\r\nfoo\r\n*1\r\n:7\r\n");
        assert_eq!(
            frames,
            vec![Reply::Array(vec![
                Reply::bulk("foo"),
                Reply::Array(vec![Reply::Integer(7)]),
            ])]
        );
    }

    #[test]
    fn partial_frame_leaves_buffer_untouched() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"$10\r\npart"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.as_ref(), b"$10\r\npart");

        buf.extend_from_slice(b"ialdata\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::bulk("partialdata"))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn encodes_command_shaped_array() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::new();
        let frame = Reply::Array(vec![Reply::bulk("GET"), Reply::bulk("ducati")]);
        codec.encode(frame, &mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"*2\r\n$3\r\nGET\r\n$6\r\nducati\r\n");
    }

    #[test]
    fn round_trips_each_reply_kind() {
        let samples = vec![
            Reply::Null,
            Reply::Integer(-3),
            Reply::bulk("value"),
            Reply::error("ERR nope"),
            Reply::Array(vec![Reply::Null, Reply::Integer(0)]),
        ];
        for sample in samples {
            let mut codec = RespCodec;
            let mut buf = BytesMut::new();
            codec.encode(sample.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap();
            assert_eq!(decoded, Some(sample));
            assert!(buf.is_empty());
        }
    }
}
