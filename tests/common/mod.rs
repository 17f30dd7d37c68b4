//! In-process stand-in for a memcached-compatible server, enough of the
//! text, meta, and binary protocols to exercise the client end to end.
//! Binary requests are detected by their magic byte; anything with an
//! unknown magic gets the connection dropped, like a server giving up on a
//! corrupt stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone, Default)]
struct Entry {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
}

type Store = Arc<Mutex<HashMap<String, Entry>>>;

/// Start a fake server on a loopback port and return its address. The
/// accept loop lives until the test's runtime shuts down.
pub async fn start() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let store: Store = Arc::default();
    let cas = Arc::new(AtomicU64::new(1));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let store = Arc::clone(&store);
            let cas = Arc::clone(&cas);
            tokio::spawn(async move {
                let _ = serve(stream, store, cas).await;
            });
        }
    });
    addr
}

async fn serve(stream: TcpStream, store: Store, cas: Arc<AtomicU64>) -> std::io::Result<()> {
    let mut io = BufStream::new(stream);
    loop {
        let first = match io.read_u8().await {
            Ok(b) => b,
            Err(_) => return Ok(()),
        };
        if first == 0x80 {
            if !serve_binary(&mut io, &store, &cas).await? {
                return Ok(());
            }
        } else if !first.is_ascii_alphabetic() {
            // Corrupt magic or garbage; hang up.
            return Ok(());
        } else {
            let mut rest = Vec::new();
            io.read_until(b'\n', &mut rest).await?;
            let mut line = vec![first];
            line.extend_from_slice(&rest);
            if !serve_line(&mut io, &line, &store, &cas).await? {
                return Ok(());
            }
        }
        io.flush().await?;
    }
}

fn chomp(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

async fn read_payload(
    io: &mut BufStream<TcpStream>,
    len: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len + 2];
    io.read_exact(&mut buf).await?;
    buf.truncate(len);
    Ok(buf)
}

async fn serve_line(
    io: &mut BufStream<TcpStream>,
    line: &[u8],
    store: &Store,
    cas: &AtomicU64,
) -> std::io::Result<bool> {
    let line = chomp(line);
    let text = String::from_utf8_lossy(line).into_owned();
    let parts: Vec<&str> = text.split(' ').filter(|t| !t.is_empty()).collect();
    if parts.is_empty() {
        return Ok(false);
    }

    match parts[0] {
        "get" if parts.len() == 2 => {
            let hit = store.lock().get(parts[1]).cloned();
            if let Some(entry) = hit {
                let header = format!(
                    "VALUE {} {} {}\r\n",
                    parts[1],
                    entry.flags,
                    entry.value.len()
                );
                io.write_all(header.as_bytes()).await?;
                io.write_all(&entry.value).await?;
                io.write_all(b"\r\n").await?;
            }
            io.write_all(b"END\r\n").await?;
        }
        "set" if parts.len() == 5 => {
            let len: usize = parts[4].parse().unwrap_or(0);
            let value = read_payload(io, len).await?;
            let flags: u32 = parts[2].parse().unwrap_or(0);
            store.lock().insert(
                parts[1].to_string(),
                Entry {
                    value,
                    flags,
                    cas: cas.fetch_add(1, Ordering::SeqCst),
                },
            );
            io.write_all(b"STORED\r\n").await?;
        }
        "delete" if parts.len() == 2 => {
            if store.lock().remove(parts[1]).is_some() {
                io.write_all(b"DELETED\r\n").await?;
            } else {
                io.write_all(b"NOT_FOUND\r\n").await?;
            }
        }
        "incr" | "decr" if parts.len() == 3 => {
            let delta: u64 = parts[2].parse().unwrap_or(0);
            let reply = {
                let mut guard = store.lock();
                match guard.get_mut(parts[1]) {
                    Some(entry) => {
                        let current: u64 = String::from_utf8_lossy(&entry.value)
                            .parse()
                            .unwrap_or(0);
                        let next = if parts[0] == "incr" {
                            current.wrapping_add(delta)
                        } else {
                            current.saturating_sub(delta)
                        };
                        entry.value = next.to_string().into_bytes();
                        format!("{next}\r\n")
                    }
                    None => "NOT_FOUND\r\n".to_string(),
                }
            };
            io.write_all(reply.as_bytes()).await?;
        }
        "mg" if parts.len() >= 2 => {
            let hit = store.lock().get(parts[1]).cloned();
            if let Some(entry) = hit {
                let header = format!("VA {} f{}\r\n", entry.value.len(), entry.flags);
                io.write_all(header.as_bytes()).await?;
                io.write_all(&entry.value).await?;
                io.write_all(b"\r\n").await?;
            } else {
                io.write_all(b"EN\r\n").await?;
            }
        }
        "ms" if parts.len() >= 3 => {
            let len: usize = parts[2].parse().unwrap_or(0);
            let value = read_payload(io, len).await?;
            store.lock().insert(
                parts[1].to_string(),
                Entry {
                    value,
                    flags: 0,
                    cas: cas.fetch_add(1, Ordering::SeqCst),
                },
            );
            io.write_all(b"HD\r\n").await?;
        }
        "md" if parts.len() >= 2 => {
            if store.lock().remove(parts[1]).is_some() {
                io.write_all(b"HD\r\n").await?;
            } else {
                io.write_all(b"NF\r\n").await?;
            }
        }
        "mn" => {
            io.write_all(b"MN\r\n").await?;
        }
        "me" if parts.len() >= 2 => {
            let size = store
                .lock()
                .get(parts[1])
                .map(|e| e.value.len())
                .unwrap_or(0);
            let reply = format!("ME {} exp=-1 la=0 cls=1 size={size}\r\n", parts[1]);
            io.write_all(reply.as_bytes()).await?;
        }
        _ => {
            io.write_all(b"ERROR\r\n").await?;
        }
    }
    Ok(true)
}

struct BinRequest {
    opcode: u8,
    key: String,
    value: Vec<u8>,
    extras: Vec<u8>,
    opaque: u32,
}

/// Handle one binary request whose magic byte is already consumed. Returns
/// false when the connection should close (quit opcodes).
async fn serve_binary(
    io: &mut BufStream<TcpStream>,
    store: &Store,
    cas: &AtomicU64,
) -> std::io::Result<bool> {
    let mut rest = [0u8; 23];
    io.read_exact(&mut rest).await?;
    let key_len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
    let extras_len = rest[3] as usize;
    let body_len = u32::from_be_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;
    let opaque = u32::from_be_bytes([rest[11], rest[12], rest[13], rest[14]]);

    let mut body = vec![0u8; body_len];
    io.read_exact(&mut body).await?;
    let req = BinRequest {
        opcode: rest[0],
        key: String::from_utf8_lossy(&body[extras_len..extras_len + key_len]).into_owned(),
        value: body[extras_len + key_len..].to_vec(),
        extras: body[..extras_len].to_vec(),
        opaque,
    };

    match req.opcode {
        // get / getk
        0x00 | 0x0c => {
            let hit = store.lock().get(&req.key).cloned();
            match hit {
                Some(entry) => {
                    let mut extras = Vec::new();
                    extras.extend_from_slice(&entry.flags.to_be_bytes());
                    let key_echo: &[u8] =
                        if req.opcode == 0x0c { req.key.as_bytes() } else { b"" };
                    write_response(io, &req, 0, entry.cas, &extras, key_echo, &entry.value)
                        .await?;
                }
                None => write_response(io, &req, 0x0001, 0, b"", b"", b"").await?,
            }
        }
        // set
        0x01 => {
            let flags = if req.extras.len() >= 4 {
                u32::from_be_bytes([req.extras[0], req.extras[1], req.extras[2], req.extras[3]])
            } else {
                0
            };
            let new_cas = cas.fetch_add(1, Ordering::SeqCst);
            store.lock().insert(
                req.key.clone(),
                Entry {
                    value: req.value.clone(),
                    flags,
                    cas: new_cas,
                },
            );
            write_response(io, &req, 0, new_cas, b"", b"", b"").await?;
        }
        // delete
        0x04 => {
            let status = if store.lock().remove(&req.key).is_some() {
                0
            } else {
                0x0001
            };
            write_response(io, &req, status, 0, b"", b"", b"").await?;
        }
        // quit / quitq
        0x07 => {
            write_response(io, &req, 0, 0, b"", b"", b"").await?;
            io.flush().await?;
            return Ok(false);
        }
        0x17 => {
            return Ok(false);
        }
        // noop
        0x0a => {
            write_response(io, &req, 0, 0, b"", b"", b"").await?;
        }
        // version
        0x0b => {
            write_response(io, &req, 0, 0, b"", b"", b"1.6.21").await?;
        }
        // touch
        0x1c => {
            let hit = store.lock().get(&req.key).cloned();
            match hit {
                Some(entry) => write_response(io, &req, 0, entry.cas, b"", b"", b"").await?,
                None => write_response(io, &req, 0x0001, 0, b"", b"", b"").await?,
            }
        }
        _ => {
            // unknown command
            write_response(io, &req, 0x0081, 0, b"", b"", b"").await?;
        }
    }
    Ok(true)
}

async fn write_response(
    io: &mut BufStream<TcpStream>,
    req: &BinRequest,
    status: u16,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> std::io::Result<()> {
    let body_len = (extras.len() + key.len() + value.len()) as u32;
    let mut buf = Vec::with_capacity(24 + body_len as usize);
    buf.push(0x81);
    buf.push(req.opcode);
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.push(extras.len() as u8);
    buf.push(0);
    buf.extend_from_slice(&status.to_be_bytes());
    buf.extend_from_slice(&body_len.to_be_bytes());
    buf.extend_from_slice(&req.opaque.to_be_bytes());
    buf.extend_from_slice(&cas.to_be_bytes());
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    io.write_all(&buf).await
}
