use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::error::{McInspectError, Result};
use crate::item::Value;
use crate::servers::ServerSpec;

/// Longest key memcached accepts.
pub const MAX_KEY_LENGTH: usize = 250;

/// Keys sent per `get` line; keeps request lines well below the server's limit.
pub const GET_BATCH_SIZE: usize = 100;

/// Largest data block accepted from a server (memcached caps items at 1 GiB).
const MAX_DATA_LENGTH: usize = 1 << 30;

/// Opens a [`CacheClient`] for exactly one server.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Client: CacheClient;

    async fn connect(&self, server: &ServerSpec) -> Result<Self::Client>;
}

/// Per-server protocol operations used by the command handlers.
#[allow(async_fn_in_trait)]
pub trait CacheClient {
    /// Returns the `(key, value)` pairs the server holds, in reply order.
    /// Missing keys are simply absent.
    async fn get_multi(&mut self, keys: &[String]) -> Result<Vec<(String, Value)>>;

    /// `true` when the server acknowledged the store.
    async fn set(&mut self, key: &str, value: &[u8]) -> Result<bool>;

    async fn incr(&mut self, key: &str, delta: u64) -> Result<DeltaReply>;

    async fn decr(&mut self, key: &str, delta: u64) -> Result<DeltaReply>;

    /// Deletes every key; `true` only if the whole batch was acknowledged.
    async fn delete_multi(&mut self, keys: &[String]) -> Result<bool>;

    async fn flush_all(&mut self) -> Result<bool>;

    async fn stats(&mut self) -> Result<ServerStats>;

    /// Releases the connection.
    async fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Server reply to `incr`/`decr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaReply {
    Applied(u64),
    NotFound,
    NotNumeric,
}

/// A value exactly as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawValue {
    pub key: String,
    pub flags: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    /// Free-form descriptor of the server, starting with its address.
    pub host: String,
    pub entries: Vec<(String, String)>,
}

/// Checks a key against the text protocol's rules: at most 250 bytes and no
/// whitespace or control characters.
pub fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(McInspectError::InvalidKey(key.to_string()));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(McInspectError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Connects over TCP using the memcached text protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Client = MemcacheConnection;

    async fn connect(&self, server: &ServerSpec) -> Result<MemcacheConnection> {
        MemcacheConnection::open(server).await
    }
}

/// One open text-protocol connection to one server.
#[derive(Debug)]
pub struct MemcacheConnection {
    server: String,
    peer: Option<SocketAddr>,
    stream: BufStream<TcpStream>,
}

impl MemcacheConnection {
    pub async fn open(server: &ServerSpec) -> Result<Self> {
        let addr = server.connect_addr();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| McInspectError::io(server.as_str(), e))?;
        let peer = stream.peer_addr().ok();
        tracing::debug!(server = %server, peer = ?peer, "Connected to memcached");
        Ok(Self {
            server: server.as_str().to_string(),
            peer,
            stream: BufStream::new(stream),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.stream
            .write_all(payload)
            .await
            .map_err(|e| McInspectError::io(&self.server, e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| McInspectError::io(&self.server, e))
    }

    /// Reads one reply line without its terminator.
    async fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let n = self
            .stream
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| McInspectError::io(&self.server, e))?;
        if n == 0 {
            return Err(McInspectError::io(
                &self.server,
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "connection closed"),
            ));
        }
        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Reads a data block of `len` bytes followed by `\r\n`.
    async fn read_data(&mut self, len: usize) -> Result<Vec<u8>> {
        let total = len
            .checked_add(2)
            .filter(|total| *total <= MAX_DATA_LENGTH + 2)
            .ok_or_else(|| {
                McInspectError::protocol(&self.server, format!("data block of {len} bytes"))
            })?;
        let mut data = vec![0u8; total];
        self.stream
            .read_exact(&mut data)
            .await
            .map_err(|e| McInspectError::io(&self.server, e))?;
        if !data.ends_with(b"\r\n") {
            return Err(McInspectError::protocol(&self.server, "data block not terminated by CRLF"));
        }
        data.truncate(len);
        Ok(data)
    }

    fn reject_error(&self, line: &str) -> Result<()> {
        if is_error_reply(line) {
            return Err(McInspectError::Server {
                server: self.server.clone(),
                reply: line.to_string(),
            });
        }
        Ok(())
    }

    /// Sends a command whose reply is a list of lines closed by `END`.
    ///
    /// `NOTSTARTED` (the crawler found nothing to walk) also closes the list.
    pub async fn request_lines(&mut self, command: &str) -> Result<Vec<String>> {
        self.send(format!("{command}\r\n").as_bytes()).await?;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "END" || line.starts_with("NOTSTARTED") {
                return Ok(lines);
            }
            self.reject_error(&line)?;
            lines.push(line);
        }
    }

    /// Like [`CacheClient::get_multi`], without interpreting the payloads.
    pub async fn get_raw(&mut self, keys: &[String]) -> Result<Vec<RawValue>> {
        let mut found = Vec::new();
        for batch in keys.chunks(GET_BATCH_SIZE) {
            self.get_batch(batch, &mut found).await?;
        }
        Ok(found)
    }

    async fn get_batch(&mut self, keys: &[String], out: &mut Vec<RawValue>) -> Result<()> {
        let mut request = String::from("get");
        for key in keys {
            check_key(key)?;
            request.push(' ');
            request.push_str(key);
        }
        request.push_str("\r\n");
        self.send(request.as_bytes()).await?;

        loop {
            let line = self.read_line().await?;
            if line == "END" {
                return Ok(());
            }
            self.reject_error(&line)?;
            let header = parse_value_header(&line)
                .ok_or_else(|| McInspectError::protocol(&self.server, line.clone()))?;
            let data = self.read_data(header.len).await?;
            out.push(RawValue {
                key: header.key,
                flags: header.flags,
                data,
            });
        }
    }

    async fn delta(&mut self, verb: &str, key: &str, delta: u64) -> Result<DeltaReply> {
        check_key(key)?;
        self.send(format!("{verb} {key} {delta}\r\n").as_bytes()).await?;
        let line = self.read_line().await?;
        parse_delta_reply(&line).ok_or_else(|| McInspectError::Server {
            server: self.server.clone(),
            reply: line,
        })
    }
}

impl CacheClient for MemcacheConnection {
    async fn get_multi(&mut self, keys: &[String]) -> Result<Vec<(String, Value)>> {
        let found = self.get_raw(keys).await?;
        Ok(found
            .into_iter()
            .map(|raw| (raw.key, Value::from_wire(raw.flags, raw.data)))
            .collect())
    }

    async fn set(&mut self, key: &str, value: &[u8]) -> Result<bool> {
        check_key(key)?;
        let mut request = format!("set {key} 0 0 {}\r\n", value.len()).into_bytes();
        request.extend_from_slice(value);
        request.extend_from_slice(b"\r\n");
        self.send(&request).await?;

        let line = self.read_line().await?;
        if line != "STORED" {
            tracing::debug!(server = %self.server, key, reply = %line, "Store not acknowledged");
        }
        Ok(line == "STORED")
    }

    async fn incr(&mut self, key: &str, delta: u64) -> Result<DeltaReply> {
        self.delta("incr", key, delta).await
    }

    async fn decr(&mut self, key: &str, delta: u64) -> Result<DeltaReply> {
        self.delta("decr", key, delta).await
    }

    async fn delete_multi(&mut self, keys: &[String]) -> Result<bool> {
        let mut request = String::new();
        for key in keys {
            check_key(key)?;
            request.push_str("delete ");
            request.push_str(key);
            request.push_str("\r\n");
        }
        self.send(request.as_bytes()).await?;

        // every reply must be drained even once the batch has failed
        let mut acknowledged = true;
        for key in keys {
            let line = self.read_line().await?;
            if line != "DELETED" && line != "NOT_FOUND" {
                tracing::debug!(server = %self.server, key = %key, reply = %line, "Delete not acknowledged");
                acknowledged = false;
            }
        }
        Ok(acknowledged)
    }

    async fn flush_all(&mut self) -> Result<bool> {
        self.send(b"flush_all\r\n").await?;
        let line = self.read_line().await?;
        Ok(line == "OK")
    }

    async fn stats(&mut self) -> Result<ServerStats> {
        let lines = self.request_lines("stats").await?;
        let entries = lines.iter().filter_map(|l| parse_stat_line(l)).collect();
        let host = match self.peer {
            Some(peer) => format!("{} ({})", self.server, peer),
            None => self.server.clone(),
        };
        Ok(ServerStats { host, entries })
    }

    async fn close(mut self) -> Result<()> {
        self.send(b"quit\r\n").await?;
        let _ = self.stream.get_mut().shutdown().await;
        tracing::debug!(server = %self.server, "Closed memcached connection");
        Ok(())
    }
}

/// Single-line replies that end a request with a failure.
fn is_error_reply(line: &str) -> bool {
    line.starts_with("ERROR")
        || line.starts_with("BADCLASS")
        || line.starts_with("CLIENT_ERROR")
        || line.starts_with("SERVER_ERROR")
        || line.starts_with("BUSY")
}

#[derive(Debug, PartialEq, Eq)]
struct ValueHeader {
    key: String,
    flags: u32,
    len: usize,
}

/// Parses `VALUE <key> <flags> <bytes> [<cas>]`.
fn parse_value_header(line: &str) -> Option<ValueHeader> {
    let mut parts = line.split(' ');
    if parts.next()? != "VALUE" {
        return None;
    }
    let key = parts.next()?.to_string();
    let flags = parts.next()?.parse().ok()?;
    let len = parts.next()?.parse().ok()?;
    Some(ValueHeader { key, flags, len })
}

/// Parses `STAT <name> <value>`; the value may contain spaces.
fn parse_stat_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("STAT ")?;
    let (name, value) = rest.split_once(' ').unwrap_or((rest, ""));
    Some((name.to_string(), value.to_string()))
}

fn parse_delta_reply(line: &str) -> Option<DeltaReply> {
    if line == "NOT_FOUND" {
        return Some(DeltaReply::NotFound);
    }
    if line.starts_with("CLIENT_ERROR") && line.contains("non-numeric") {
        return Some(DeltaReply::NotNumeric);
    }
    line.trim().parse().ok().map(DeltaReply::Applied)
}
