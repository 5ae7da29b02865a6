//! Attributes accepted connections to one of the inbound's configured users.
//!
//! vless carries the user uuid in bytes 1..17 of the request, trojan opens
//! with the hex SHA-224 of the password. Other protocols are only
//! attributable when the inbound has a single user.

use proxyfleet_common::InboundConfig;
use serde_json::Value;
use sha2::{Digest, Sha224};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use uuid::Uuid;

/// Upper bound on waiting for the request header of a new connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const VLESS_HEADER_LEN: usize = 17;
const TROJAN_HASH_LEN: usize = 56;

#[derive(Debug, Default)]
pub enum UserMatcher {
    #[default]
    Anonymous,
    Single(String),
    Vless(HashMap<[u8; 16], String>),
    Trojan(HashMap<Vec<u8>, String>),
}

fn user_entries(inbound: &InboundConfig) -> Vec<&serde_json::Map<String, Value>> {
    inbound
        .extra
        .get("users")
        .and_then(Value::as_array)
        .map(|users| users.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

fn entry_str<'a>(entry: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    entry.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn entry_name(entry: &serde_json::Map<String, Value>) -> Option<&str> {
    entry_str(entry, "name").or_else(|| entry_str(entry, "username"))
}

fn uuid_bytes(raw: &str) -> Option<[u8; 16]> {
    Uuid::parse_str(raw).ok().map(|id| *id.as_bytes())
}

impl UserMatcher {
    pub fn for_inbound(inbound: &InboundConfig) -> Self {
        let entries = user_entries(inbound);
        match inbound.kind.to_ascii_lowercase().as_str() {
            "vless" => UserMatcher::Vless(
                entries
                    .iter()
                    .filter_map(|e| Some((uuid_bytes(entry_str(e, "uuid")?)?, entry_name(e)?.to_string())))
                    .collect(),
            ),
            "trojan" => UserMatcher::Trojan(
                entries
                    .iter()
                    .filter_map(|e| {
                        let hash = hex::encode(Sha224::digest(entry_str(e, "password")?.as_bytes()));
                        Some((hash.into_bytes(), entry_name(e)?.to_string()))
                    })
                    .collect(),
            ),
            _ => match entries.as_slice() {
                [only] => entry_name(only)
                    .map(|name| UserMatcher::Single(name.to_string()))
                    .unwrap_or_default(),
                _ => UserMatcher::Anonymous,
            },
        }
    }

    /// Bytes of the request needed before [`UserMatcher::identify`] can decide.
    pub fn header_len(&self) -> usize {
        match self {
            UserMatcher::Vless(users) if !users.is_empty() => VLESS_HEADER_LEN,
            UserMatcher::Trojan(users) if !users.is_empty() => TROJAN_HASH_LEN,
            _ => 0,
        }
    }

    pub fn identify(&self, header: &[u8]) -> Option<&str> {
        match self {
            UserMatcher::Anonymous => None,
            UserMatcher::Single(name) => Some(name.as_str()),
            UserMatcher::Vless(users) => {
                let id: [u8; 16] = header.get(1..VLESS_HEADER_LEN)?.try_into().ok()?;
                users.get(&id).map(String::as_str)
            }
            UserMatcher::Trojan(users) => users
                .get(header.get(..TROJAN_HASH_LEN)?)
                .map(String::as_str),
        }
    }

    /// Owner of a shared datagram socket, when unambiguous.
    pub fn packet_user(&self) -> &str {
        match self {
            UserMatcher::Single(name) => name.as_str(),
            _ => "",
        }
    }
}

/// Reads up to `len` bytes of request header, stopping early on EOF, error
/// or timeout. Whatever was read is returned so it can be replayed.
pub async fn read_header<S: AsyncRead + Unpin>(stream: &mut S, len: usize) -> Vec<u8> {
    let mut header = vec![0u8; len];
    let mut filled = 0;
    let read = async {
        while filled < len {
            match stream.read(&mut header[filled..]).await {
                Ok(0) | Err(_) => break,
                Ok(n) => filled += n,
            }
        }
    };
    let _ = tokio::time::timeout(HANDSHAKE_TIMEOUT, read).await;
    header.truncate(filled);
    header
}

/// A stream that yields `prefix` before reading from `inner`.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self { prefix, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let n = buf.remaining().min(self.prefix.len() - self.pos);
            let start = self.pos;
            buf.put_slice(&self.prefix[start..start + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
