//! Protocol types and codec dispatch.
//!
//! One decoded client command is a [`Request`]; the three wire dialects each
//! contribute a variant. The codec capability set — decode-many,
//! encode-response, encode-request, decode-reply, split/merge, ping frames —
//! is dispatched through [`CacheType`], which a connection handler selects
//! once at construction.

pub mod batch;
pub mod memcache;
pub mod message;
pub mod redis;

use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::bufio::{Reader, Writer};
use crate::error::{Error, Result};
use crate::proto::memcache::binary;
pub use crate::proto::message::{Message, SubMessage};

/// Wire dialect of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    Memcache,
    MemcacheBinary,
    Redis,
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheType::Memcache => write!(f, "memcache"),
            CacheType::MemcacheBinary => write!(f, "memcache_binary"),
            CacheType::Redis => write!(f, "redis"),
        }
    }
}

/// Routing category of a decoded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Routed to a backend.
    Supported,
    /// Answered with a dialect error, never routed.
    Unsupported,
    /// Answered locally by the proxy, never routed.
    Control,
}

/// One decoded client command, immutable once decoded.
#[derive(Debug, Clone)]
pub enum Request {
    Memcache(memcache::McRequest),
    MemcacheBinary(binary::BinRequest),
    Redis(redis::RedisRequest),
}

impl Request {
    /// Routing key. Empty for keyless commands.
    pub fn key(&self) -> &[u8] {
        match self {
            Request::Memcache(r) => r.key(),
            Request::MemcacheBinary(r) => r.key(),
            Request::Redis(r) => r.key(),
        }
    }

    /// Command label for metrics and logs.
    pub fn command(&self) -> &str {
        match self {
            Request::Memcache(r) => r.command(),
            Request::MemcacheBinary(r) => r.command(),
            Request::Redis(r) => r.command(),
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Request::Memcache(r) => r.category(),
            Request::MemcacheBinary(r) => r.category(),
            Request::Redis(r) => r.category(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.category() == Category::Control
    }

    pub fn is_unsupported(&self) -> bool {
        self.category() == Category::Unsupported
    }

    /// True when no backend reply will arrive for this request
    /// (memcached `noreply`, binary quiet mutations).
    pub fn is_noreply(&self) -> bool {
        match self {
            Request::Memcache(r) => r.is_noreply(),
            Request::MemcacheBinary(r) => r.is_noreply(),
            Request::Redis(_) => false,
        }
    }

    /// After replying, the client connection is closed (`quit`).
    pub fn closes_connection(&self) -> bool {
        match self {
            Request::Memcache(r) => r.is_quit(),
            Request::MemcacheBinary(r) => r.is_quit(),
            Request::Redis(r) => r.is_quit(),
        }
    }
}

/// Split a multi-key request into independent single-key sub-requests.
/// `None` means the request is not batchable and routes as-is.
pub fn split(req: &Request) -> Option<Vec<Request>> {
    match req {
        Request::Memcache(r) => r
            .split()
            .map(|subs| subs.into_iter().map(Request::Memcache).collect()),
        Request::MemcacheBinary(r) => r
            .split()
            .map(|subs| subs.into_iter().map(Request::MemcacheBinary).collect()),
        Request::Redis(r) => r
            .split()
            .map(|subs| subs.into_iter().map(Request::Redis).collect()),
    }
}

impl CacheType {
    /// Pull as many complete requests as the buffer currently holds, up to
    /// `max` new messages. A partial frame leaves the reader position at the
    /// frame start. Returns without blocking; the caller awaits more bytes
    /// when nothing decoded.
    pub fn decode_requests<R: AsyncRead + Unpin>(
        &self,
        rd: &mut Reader<R>,
        out: &mut Vec<Message>,
        max: usize,
    ) -> Result<()> {
        match self {
            CacheType::Memcache => memcache::decode_requests(rd, out, max),
            CacheType::MemcacheBinary => binary::decode_requests(rd, out, max),
            CacheType::Redis => redis::decode_requests(rd, out, max),
        }
    }

    /// Encode one message's client-visible response, merging sub-responses
    /// and rendering per-message errors in the dialect's shape.
    pub fn encode_response<W: AsyncWrite + Unpin>(
        &self,
        msg: &Message,
        wr: &mut Writer<W>,
    ) -> Result<()> {
        match self {
            CacheType::Memcache => memcache::encode_response(msg, wr),
            CacheType::MemcacheBinary => binary::encode_response(msg, wr),
            CacheType::Redis => redis::encode_response(msg, wr),
        }
    }

    /// Queue one backend-bound request into the writer.
    pub fn encode_request<W: AsyncWrite + Unpin>(
        &self,
        req: &Request,
        wr: &mut Writer<W>,
    ) -> Result<()> {
        match (self, req) {
            (CacheType::Memcache, Request::Memcache(r)) => memcache::encode_request(r, wr),
            (CacheType::MemcacheBinary, Request::MemcacheBinary(_)) => {
                // binary requests are written batch-wise for opaque rewriting
                Err(Error::BadAssert)
            }
            (CacheType::Redis, Request::Redis(r)) => redis::encode_request(r, wr),
            _ => Err(Error::BadAssert),
        }
    }

    /// Wire bytes of the dialect's health probe.
    pub fn ping_request(&self) -> Bytes {
        match self {
            CacheType::Memcache => memcache::ping_request(),
            CacheType::MemcacheBinary => binary::ping_request(),
            CacheType::Redis => redis::ping_request(),
        }
    }

    /// Decode and verify the reply to [`ping_request`](CacheType::ping_request).
    pub fn check_ping_reply<R: AsyncRead + Unpin>(&self, rd: &mut Reader<R>) -> Result<()> {
        match self {
            CacheType::Memcache => memcache::check_ping_reply(rd),
            CacheType::MemcacheBinary => binary::check_ping_reply(rd),
            CacheType::Redis => redis::check_ping_reply(rd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_type_display() {
        assert_eq!(CacheType::Memcache.to_string(), "memcache");
        assert_eq!(CacheType::MemcacheBinary.to_string(), "memcache_binary");
        assert_eq!(CacheType::Redis.to_string(), "redis");
    }

    #[test]
    fn test_cache_type_deserialize() {
        #[derive(Deserialize)]
        struct Wrap {
            cache_type: CacheType,
        }
        let w: Wrap = toml::from_str("cache_type = \"memcache_binary\"").unwrap();
        assert_eq!(w.cache_type, CacheType::MemcacheBinary);
    }
}
