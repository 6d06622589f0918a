//! memcached ASCII protocol: request encoding and a streaming reply parser.

use crate::error::{CacheError, Result};
use bytes::{Buf, Bytes, BytesMut};

/// What kind of reply the last request expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `get` / `gets`: zero or more VALUE blocks terminated by END
    Retrieval,
    /// `set` / `add`: one status line
    Storage,
    /// `delete`: one status line
    Deletion,
    /// `flush_all`: OK
    Flush,
    /// `stats`: STAT lines terminated by END
    Stats,
}

/// One VALUE block of a retrieval reply
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub key: String,
    pub flags: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Values(Vec<Value>),
    Stats(Vec<(String, String)>),
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Ok,
    Error,
    ClientError(String),
    ServerError(String),
}

impl Reply {
    /// The server refused the item because of its size
    pub fn is_too_large(&self) -> bool {
        match self {
            Reply::ServerError(msg) => {
                msg.contains("object too large for cache")
                    || msg.contains("out of memory storing object")
            }
            _ => false,
        }
    }
}

/// Streaming reply parser
///
/// Status and stats replies are parsed once complete. Retrieval replies are
/// consumed one VALUE block at a time as blocks arrive, so a large multi-get
/// fed in many reads never re-parses or re-copies finished blocks.
pub struct ReplyParser {
    buffer: BytesMut,
    /// Finished VALUE blocks of a retrieval reply still arriving
    values: Vec<Value>,
}

impl ReplyParser {
    /// Create a new parser with a given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            values: Vec::new(),
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drop anything buffered, e.g. after a connection was reset
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.values.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to parse a complete reply from the buffer.
    ///
    /// Returns `Ok(None)` while the reply is incomplete. Only whole VALUE
    /// blocks are ever consumed before the reply is complete.
    pub fn parse(&mut self, kind: ReplyKind) -> Result<Option<Reply>> {
        let mut pos = 0;
        let reply = match kind {
            ReplyKind::Retrieval => return self.parse_values(),
            ReplyKind::Stats => self.parse_stats(&mut pos)?,
            status => self.parse_status(status, &mut pos)?,
        };
        if reply.is_some() {
            self.buffer.advance(pos);
        }
        Ok(reply)
    }

    fn parse_status(&self, kind: ReplyKind, pos: &mut usize) -> Result<Option<Reply>> {
        let Some(line) = self.read_line(pos)? else {
            return Ok(None);
        };
        if let Some(error) = parse_error_line(&line) {
            return Ok(Some(error));
        }

        let reply = match (kind, line.as_str()) {
            (ReplyKind::Storage, "STORED") => Reply::Stored,
            (ReplyKind::Storage, "NOT_STORED") => Reply::NotStored,
            (ReplyKind::Storage, "EXISTS") => Reply::Exists,
            (ReplyKind::Storage | ReplyKind::Deletion, "NOT_FOUND") => Reply::NotFound,
            (ReplyKind::Deletion, "DELETED") => Reply::Deleted,
            (ReplyKind::Flush, "OK") => Reply::Ok,
            (_, other) => return Err(unexpected(other)),
        };
        Ok(Some(reply))
    }

    fn parse_values(&mut self) -> Result<Option<Reply>> {
        loop {
            let mut pos = 0;
            let Some(line) = self.read_line(&mut pos)? else {
                return Ok(None);
            };
            if line == "END" {
                self.buffer.advance(pos);
                return Ok(Some(Reply::Values(std::mem::take(&mut self.values))));
            }
            if let Some(error) = parse_error_line(&line) {
                self.buffer.advance(pos);
                self.values.clear();
                return Ok(Some(error));
            }

            let (key, flags, len) = parse_value_header(&line)?;
            if self.buffer.len() < pos + len + 2 {
                return Ok(None);
            }
            if &self.buffer[pos + len..pos + len + 2] != b"\r\n" {
                return Err(CacheError::Protocol(format!(
                    "Data block for '{}' is not terminated by CRLF",
                    key
                )));
            }
            self.buffer.advance(pos);
            let data = self.buffer.split_to(len).freeze();
            self.buffer.advance(2);
            self.values.push(Value { key, flags, data });
        }
    }

    fn parse_stats(&self, pos: &mut usize) -> Result<Option<Reply>> {
        let mut stats = Vec::new();

        loop {
            let Some(line) = self.read_line(pos)? else {
                return Ok(None);
            };
            if line == "END" {
                return Ok(Some(Reply::Stats(stats)));
            }
            if let Some(error) = parse_error_line(&line) {
                return Ok(Some(error));
            }
            let body = line.strip_prefix("STAT ").ok_or_else(|| unexpected(&line))?;
            let (name, value) = body.split_once(' ').unwrap_or((body, ""));
            stats.push((name.to_string(), value.to_string()));
        }
    }

    /// Read a CRLF terminated line starting at `pos`, advancing past it
    fn read_line(&self, pos: &mut usize) -> Result<Option<String>> {
        let rest = &self.buffer[*pos..];
        let Some(end) = rest.windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&rest[..end])
            .map_err(|_| CacheError::Protocol("Invalid UTF-8 in reply line".to_string()))?
            .to_string();
        *pos += end + 2;
        Ok(Some(line))
    }
}

fn parse_error_line(line: &str) -> Option<Reply> {
    if line == "ERROR" {
        return Some(Reply::Error);
    }
    if let Some(msg) = line.strip_prefix("CLIENT_ERROR") {
        return Some(Reply::ClientError(msg.trim_start().to_string()));
    }
    if let Some(msg) = line.strip_prefix("SERVER_ERROR") {
        return Some(Reply::ServerError(msg.trim_start().to_string()));
    }
    None
}

/// `VALUE <key> <flags> <bytes>` header of a data block
fn parse_value_header(line: &str) -> Result<(String, u32, usize)> {
    let header = line.strip_prefix("VALUE ").ok_or_else(|| unexpected(line))?;
    let mut parts = header.split_whitespace();
    let key = parts.next().ok_or_else(|| unexpected(line))?.to_string();
    let flags = parts
        .next()
        .and_then(|f| f.parse::<u32>().ok())
        .ok_or_else(|| unexpected(line))?;
    let len = parts
        .next()
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| unexpected(line))?;
    Ok((key, flags, len))
}

fn unexpected(line: &str) -> CacheError {
    CacheError::Protocol(format!("Unexpected reply line: {}", line))
}

pub fn encode_get(keys: &[&str]) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 + keys.iter().map(|k| k.len() + 1).sum::<usize>());
    out.extend_from_slice(b"get");
    for key in keys {
        out.push(b' ');
        out.extend_from_slice(key.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// `set` / `add` request with its data block
pub fn encode_storage(command: &str, key: &str, flags: u32, exptime: u32, data: &[u8]) -> Vec<u8> {
    let header = format!("{} {} {} {} {}\r\n", command, key, flags, exptime, data.len());
    let mut out = Vec::with_capacity(header.len() + data.len() + 2);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn encode_delete(key: &str) -> Vec<u8> {
    format!("delete {}\r\n", key).into_bytes()
}

pub fn encode_flush_all() -> Vec<u8> {
    b"flush_all\r\n".to_vec()
}

pub fn encode_stats() -> Vec<u8> {
    b"stats\r\n".to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(input: &[u8], kind: ReplyKind) -> Option<Reply> {
        let mut parser = ReplyParser::new(64);
        parser.feed(input);
        parser.parse(kind).unwrap()
    }

    #[test]
    fn test_parse_values() {
        let reply = parse_all(
            b"VALUE a 0 3\r\nfoo\r\nVALUE b 5 0\r\n\r\nEND\r\n",
            ReplyKind::Retrieval,
        )
        .unwrap();
        assert_eq!(
            reply,
            Reply::Values(vec![
                Value {
                    key: "a".to_string(),
                    flags: 0,
                    data: Bytes::from("foo"),
                },
                Value {
                    key: "b".to_string(),
                    flags: 5,
                    data: Bytes::new(),
                },
            ])
        );
    }

    #[test]
    fn test_data_block_may_contain_crlf() {
        let reply = parse_all(b"VALUE k 0 4\r\n\r\n\r\n\r\nEND\r\n", ReplyKind::Retrieval).unwrap();
        match reply {
            Reply::Values(values) => assert_eq!(values[0].data, Bytes::from("\r\n\r\n")),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_parse_incomplete_data() {
        let mut parser = ReplyParser::new(64);
        parser.feed(b"VALUE a 0 10\r\nabc");
        assert_eq!(parser.parse(ReplyKind::Retrieval).unwrap(), None);
        assert_eq!(parser.buffered(), 17);

        parser.feed(b"defghij\r\nEND\r\n");
        assert!(matches!(
            parser.parse(ReplyKind::Retrieval).unwrap(),
            Some(Reply::Values(v)) if v.len() == 1
        ));
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_finished_blocks_are_consumed_early() {
        let mut parser = ReplyParser::new(64);
        parser.feed(b"VALUE a 0 3\r\nfoo\r\nVALUE b 0 10\r\nabc");
        assert_eq!(parser.parse(ReplyKind::Retrieval).unwrap(), None);
        // Only the unfinished second block is still buffered
        assert_eq!(parser.buffered(), b"VALUE b 0 10\r\nabc".len());

        parser.feed(b"defghij\r\nEND\r\n");
        match parser.parse(ReplyKind::Retrieval).unwrap() {
            Some(Reply::Values(values)) => {
                let keys: Vec<&str> = values.iter().map(|v| v.key.as_str()).collect();
                assert_eq!(keys, vec!["a", "b"]);
                assert_eq!(values[0].data, Bytes::from("foo"));
                assert_eq!(values[1].data, Bytes::from("abcdefghij"));
            }
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_large_reply_in_small_reads() {
        const BLOCKS: usize = 16;
        const BLOCK_LEN: usize = 256 * 1024;
        let mut reply = Vec::new();
        for i in 0..BLOCKS {
            reply.extend_from_slice(format!("VALUE k{} 0 {}\r\n", i, BLOCK_LEN).as_bytes());
            reply.extend(std::iter::repeat(i as u8).take(BLOCK_LEN));
            reply.extend_from_slice(b"\r\n");
        }
        reply.extend_from_slice(b"END\r\n");

        let mut parser = ReplyParser::new(16 * 1024);
        let mut parsed = None;
        for chunk in reply.chunks(16 * 1024) {
            parser.feed(chunk);
            // Never more than one block plus one read is left unconsumed
            assert!(parser.buffered() <= BLOCK_LEN + 16 * 1024 + 64);
            if let Some(reply) = parser.parse(ReplyKind::Retrieval).unwrap() {
                parsed = Some(reply);
            }
        }

        match parsed {
            Some(Reply::Values(values)) => {
                assert_eq!(values.len(), BLOCKS);
                for (i, value) in values.iter().enumerate() {
                    assert_eq!(value.key, format!("k{}", i));
                    assert_eq!(value.data.len(), BLOCK_LEN);
                    assert!(value.data.iter().all(|&b| b == i as u8));
                }
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_clear_drops_partial_values() {
        let mut parser = ReplyParser::new(64);
        parser.feed(b"VALUE a 0 1\r\nx\r\n");
        assert_eq!(parser.parse(ReplyKind::Retrieval).unwrap(), None);
        parser.clear();
        parser.feed(b"END\r\n");
        assert_eq!(
            parser.parse(ReplyKind::Retrieval).unwrap(),
            Some(Reply::Values(Vec::new()))
        );
    }

    #[test]
    fn test_parse_status_lines() {
        assert_eq!(parse_all(b"STORED\r\n", ReplyKind::Storage), Some(Reply::Stored));
        assert_eq!(
            parse_all(b"NOT_STORED\r\n", ReplyKind::Storage),
            Some(Reply::NotStored)
        );
        assert_eq!(parse_all(b"DELETED\r\n", ReplyKind::Deletion), Some(Reply::Deleted));
        assert_eq!(
            parse_all(b"NOT_FOUND\r\n", ReplyKind::Deletion),
            Some(Reply::NotFound)
        );
        assert_eq!(parse_all(b"OK\r\n", ReplyKind::Flush), Some(Reply::Ok));
    }

    #[test]
    fn test_parse_server_error_too_large() {
        let reply = parse_all(
            b"SERVER_ERROR object too large for cache\r\n",
            ReplyKind::Storage,
        )
        .unwrap();
        assert!(reply.is_too_large());

        let reply = parse_all(b"SERVER_ERROR out of memory storing object\r\n", ReplyKind::Storage)
            .unwrap();
        assert!(reply.is_too_large());

        let reply = parse_all(b"CLIENT_ERROR bad data chunk\r\n", ReplyKind::Storage).unwrap();
        assert_eq!(reply, Reply::ClientError("bad data chunk".to_string()));
        assert!(!reply.is_too_large());
    }

    #[test]
    fn test_parse_stats() {
        let reply = parse_all(
            b"STAT pid 42\r\nSTAT version 1.6.21\r\nEND\r\n",
            ReplyKind::Stats,
        )
        .unwrap();
        assert_eq!(
            reply,
            Reply::Stats(vec![
                ("pid".to_string(), "42".to_string()),
                ("version".to_string(), "1.6.21".to_string()),
            ])
        );
    }

    #[test]
    fn test_unexpected_line_is_protocol_error() {
        let mut parser = ReplyParser::new(16);
        parser.feed(b"HELLO\r\n");
        assert!(matches!(
            parser.parse(ReplyKind::Storage),
            Err(CacheError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_requests() {
        assert_eq!(encode_get(&["a", "b"]), b"get a b\r\n".to_vec());
        assert_eq!(
            encode_storage("set", "k", 0, 60, b"xy"),
            b"set k 0 60 2\r\nxy\r\n".to_vec()
        );
        assert_eq!(encode_delete("k"), b"delete k\r\n".to_vec());
        assert_eq!(encode_flush_all(), b"flush_all\r\n".to_vec());
    }
}
