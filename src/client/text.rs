//! Classic text protocol: ASCII command lines terminated by CRLF.
//!
//! `get` is the only pipelined command: the configured pipeline depth sends
//! the command that many times before a single flush, then consumes the
//! responses in order. Malformed-but-parsable responses inside `get` are
//! logged and skipped (soft validation); only framing or I/O failures are
//! fatal.

use tracing::warn;

use crate::error::{McError, Result};

use super::{parse_uint, Client, RespCode};

impl Client {
    /// `get <key>`, issued `pipelines` times before one flush.
    ///
    /// Returns the flags, value, and code of the last response consumed. A
    /// miss is the bare `END` line; a hit is a `VALUE <key> <flags> <bytes>`
    /// line, the payload plus CRLF, and a trailing `END`.
    pub async fn get(&mut self, key: &str) -> Result<(u64, Vec<u8>, RespCode)> {
        let pipelines = self.pipelines;
        // Expected key in the response, with the prefix optionally stripped
        // (some proxies rewrite keys on the way back).
        let resp_key = if self.strip_key_prefix {
            key.strip_prefix(self.key_prefix.as_str()).unwrap_or(key)
        } else {
            key
        }
        .to_string();

        let conn = self.ready(key).await?;

        for _ in 0..pipelines {
            conn.write_all(b"get ").await?;
            conn.write_all(key.as_bytes()).await?;
            conn.write_all(b"\r\n").await?;
        }
        conn.flush().await?;

        let mut flags = 0u64;
        let mut value = Vec::new();
        let mut code = RespCode::CheckError;
        let mut line = Vec::new();

        for _ in 0..pipelines {
            conn.read_line(&mut line).await?;
            if line == b"END\r\n" {
                code = RespCode::Miss;
                continue;
            }

            let body = &line[..line.len().saturating_sub(2)];
            let parts: Vec<&[u8]> = body.split(|&b| b == b' ').collect();
            if parts[0] != b"VALUE" {
                warn!(response = %String::from_utf8_lossy(&line), "unexpected response");
                continue;
            }
            if parts.len() != 4 {
                warn!(tokens = parts.len(), "unexpected response: VALUE line token count");
                continue;
            }
            if parts[1] != resp_key.as_bytes() {
                warn!(
                    received = %String::from_utf8_lossy(parts[1]),
                    expected = %resp_key,
                    "unmatched key in response"
                );
                continue;
            }
            let (resp_flags, _) = parse_uint(parts[2]);
            let (size, _) = parse_uint(parts[3]);

            let mut payload = vec![0u8; size as usize + 2];
            conn.read_exact(&mut payload).await?;
            if !payload.ends_with(b"\r\n") {
                warn!("value payload missing CRLF terminator");
                continue;
            }
            payload.truncate(size as usize);
            flags = resp_flags;
            value = payload;
            code = RespCode::Hit;

            conn.read_line(&mut line).await?;
            if line != b"END\r\n" {
                warn!(response = %String::from_utf8_lossy(&line), "expected END after value");
                continue;
            }
        }

        self.pending_writes = false;
        Ok((flags, value, code))
    }

    /// `set <key> <flags> <ttl> <len>` followed by the payload. Expects
    /// `STORED`; `SERVER_ERROR ...` (usually out-of-memory) is surfaced as
    /// [`McError::ServerError`].
    pub async fn set(
        &mut self,
        key: &str,
        flags: u32,
        expiration: u32,
        value: &[u8],
    ) -> Result<RespCode> {
        let conn = self.ready(key).await?;

        let header = format!("set {} {} {} {}\r\n", key, flags, expiration, value.len());
        conn.write_all(header.as_bytes()).await?;
        conn.write_all(value).await?;
        conn.write_all(b"\r\n").await?;
        conn.flush().await?;

        let mut line = Vec::new();
        conn.read_line(&mut line).await?;
        self.pending_writes = false;

        if line == b"STORED\r\n" {
            Ok(RespCode::Stored)
        } else if line.starts_with(b"SERVER_ERROR") {
            Err(McError::ServerError)
        } else {
            warn!(response = %String::from_utf8_lossy(&line), "got instead of STORED");
            Err(McError::UnexpectedResponse)
        }
    }

    /// `delete <key>`. `DELETED` and `NOT_FOUND` are both normal outcomes.
    pub async fn delete(&mut self, key: &str) -> Result<RespCode> {
        let conn = self.ready(key).await?;

        conn.write_all(b"delete ").await?;
        conn.write_all(key.as_bytes()).await?;
        conn.write_all(b"\r\n").await?;
        conn.flush().await?;

        let mut line = Vec::new();
        conn.read_line(&mut line).await?;
        self.pending_writes = false;

        if line == b"DELETED\r\n" {
            Ok(RespCode::Deleted)
        } else if line == b"NOT_FOUND\r\n" {
            Ok(RespCode::NotFound)
        } else {
            Err(McError::UnexpectedResponse)
        }
    }

    /// `incr <key> <delta>`: `NOT_FOUND` or the new value as a decimal line.
    pub async fn incr(&mut self, key: &str, delta: u64) -> Result<(u64, RespCode)> {
        self.arith("incr", key, delta).await
    }

    /// `decr <key> <delta>`: `NOT_FOUND` or the new value as a decimal line.
    pub async fn decr(&mut self, key: &str, delta: u64) -> Result<(u64, RespCode)> {
        self.arith("decr", key, delta).await
    }

    async fn arith(&mut self, verb: &str, key: &str, delta: u64) -> Result<(u64, RespCode)> {
        let conn = self.ready(key).await?;

        let cmd = format!("{verb} {key} {delta}\r\n");
        conn.write_all(cmd.as_bytes()).await?;
        conn.flush().await?;

        let mut line = Vec::new();
        conn.read_line(&mut line).await?;
        self.pending_writes = false;

        if line == b"NOT_FOUND\r\n" {
            return Ok((0, RespCode::NotFound));
        }
        let body = &line[..line.len().saturating_sub(2)];
        match std::str::from_utf8(body).ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(result) => Ok((result, RespCode::Ok)),
            None => Err(McError::UnexpectedResponse),
        }
    }
}
