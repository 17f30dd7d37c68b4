//! Meta text protocol: two-letter commands with space-delimited flag tokens.
//!
//! Commands only queue bytes onto the write buffer; [`Client::meta_receive`]
//! flushes anything pending and parses exactly one response. Queue N
//! requests, then call receive N times: responses arrive in issue order.
//! Callers must stop pulling once every queued request has been answered.

use tracing::warn;

use crate::error::{McError, Result};

use super::{parse_uint, Client, Connection, RespCode};

/// One parsed meta response.
#[derive(Debug, Clone, Default)]
pub struct MetaResponse {
    /// The response's flag tokens, verbatim (may be empty).
    pub flags: Vec<u8>,
    pub value: Vec<u8>,
    pub code: RespCode,
}

impl Client {
    /// Queue `mg <key> <flags>`.
    pub async fn meta_get(&mut self, key: &str, flags: &str) -> Result<()> {
        let conn = self.ready(key).await?;
        let cmd = format!("mg {key} {flags}\r\n");
        conn.write_all(cmd.as_bytes()).await?;
        self.pending_writes = true;
        Ok(())
    }

    /// Queue `ms <key> <len> <flags>` plus the payload.
    pub async fn meta_set(&mut self, key: &str, flags: &str, value: &[u8]) -> Result<()> {
        let conn = self.ready(key).await?;
        let cmd = format!("ms {key} {} {flags}\r\n", value.len());
        conn.write_all(cmd.as_bytes()).await?;
        conn.write_all(value).await?;
        conn.write_all(b"\r\n").await?;
        self.pending_writes = true;
        Ok(())
    }

    /// Queue `md <key> <flags>`.
    pub async fn meta_delete(&mut self, key: &str, flags: &str) -> Result<()> {
        let conn = self.ready(key).await?;
        let cmd = format!("md {key} {flags}\r\n");
        conn.write_all(cmd.as_bytes()).await?;
        self.pending_writes = true;
        Ok(())
    }

    /// Queue `mn`. The server answers `MN`, which makes it a useful flush
    /// marker at the end of a pipelined batch.
    pub async fn meta_noop(&mut self) -> Result<()> {
        let conn = self.ready("").await?;
        conn.write_all(b"mn\r\n").await?;
        self.pending_writes = true;
        Ok(())
    }

    /// Queue `me <key>` (debug dump of one item's internals).
    pub async fn meta_debug(&mut self, key: &str) -> Result<()> {
        let conn = self.ready(key).await?;
        let cmd = format!("me {key}\r\n");
        conn.write_all(cmd.as_bytes()).await?;
        self.pending_writes = true;
        Ok(())
    }

    /// Flush any queued requests without consuming responses.
    pub async fn meta_flush(&mut self) -> Result<()> {
        let conn = self.connected()?;
        conn.flush().await?;
        self.pending_writes = false;
        Ok(())
    }

    /// Flush pending requests if any, then parse exactly one response.
    pub async fn meta_receive(&mut self) -> Result<MetaResponse> {
        let flush = self.pending_writes;
        let conn = self.connected()?;
        if flush {
            conn.flush().await?;
        }
        let resp = parse_meta_response(conn).await;
        self.pending_writes = false;
        resp
    }
}

/// Parse one meta response line (and, for `VA`, its payload). Dispatch is on
/// the first two bytes of the line.
async fn parse_meta_response(conn: &mut Connection) -> Result<MetaResponse> {
    let mut line = Vec::new();
    conn.read_line(&mut line).await?;
    if line.len() < 2 {
        return Err(McError::UnknownStatus);
    }

    let mut resp = MetaResponse::default();
    match &line[0..2] {
        b"VA" => {
            // VA <size> <flags>*
            if line.len() < 4 {
                return Err(McError::CorruptValue);
            }
            let (size, offset) = parse_uint(&line[3..]);
            resp.flags = token_tail(&line, 4 + offset);
            let mut payload = vec![0u8; size as usize + 2];
            conn.read_exact(&mut payload).await?;
            if !payload.ends_with(b"\r\n") {
                return Err(McError::CorruptValue);
            }
            payload.truncate(size as usize);
            resp.value = payload;
            resp.code = RespCode::Va;
        }
        b"OK" => {
            resp.flags = token_tail(&line, 3);
            resp.code = RespCode::Ok;
        }
        b"EN" => {
            // Get miss.
            resp.code = RespCode::En;
        }
        b"ME" => {
            resp.value = token_tail(&line, 3);
            resp.code = RespCode::Me;
        }
        b"HD" => {
            // Stored / deleted.
            resp.code = RespCode::Hd;
        }
        b"NS" => {
            resp.flags = token_tail(&line, 3);
            resp.code = RespCode::Ns;
        }
        b"EX" => {
            resp.flags = token_tail(&line, 3);
            resp.code = RespCode::Ex;
        }
        b"NF" => {
            resp.flags = token_tail(&line, 3);
            resp.code = RespCode::Nf;
        }
        b"MN" => {
            resp.code = RespCode::Mn;
        }
        b"SE" => {
            // SERVER_ERROR
            resp.code = RespCode::Se;
        }
        b"ER" => {
            resp.code = RespCode::Er;
        }
        b"CL" => {
            // CLIENT_ERROR
            resp.code = RespCode::Cl;
        }
        other => {
            warn!(code = %String::from_utf8_lossy(other), "unknown meta response code");
            return Err(McError::UnknownStatus);
        }
    }
    Ok(resp)
}

/// Everything from `start` up to the CRLF, or empty when the line has no
/// token section.
fn token_tail(line: &[u8], start: usize) -> Vec<u8> {
    let end = line.len().saturating_sub(2);
    if start < end {
        line[start..end].to_vec()
    } else {
        Vec::new()
    }
}
