//! One proxied connection to one backend server.
//!
//! A `NodeConn` owns the socket, its buffered reader/writer pair and the
//! open→closed state. Batches are written request-by-request in order and the
//! replies are decoded in the same order; any I/O error is fatal to the
//! connection and the owning worker drops it. There is no retry here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::bufio::{Reader, Writer};
use crate::config::ConnTimeouts;
use crate::error::{Error, Result};
use crate::metrics::ProxyMetrics;
use crate::proto::batch::MsgBatch;
use crate::proto::memcache::binary;
use crate::proto::{memcache, redis, CacheType, Request};

pub struct NodeConn {
    cluster: String,
    addr: String,
    ctype: CacheType,
    rd: Reader<OwnedReadHalf>,
    wr: Writer<OwnedWriteHalf>,
    closed: AtomicBool,
    metrics: Arc<ProxyMetrics>,
}

impl NodeConn {
    /// Dial a backend and, for Redis clusters with `redis_auth` configured,
    /// pass the password through before any traffic.
    pub async fn connect(
        cluster: &str,
        addr: &str,
        ctype: CacheType,
        timeouts: &ConnTimeouts,
        redis_auth: &str,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<NodeConn> {
        let dial = async {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok::<_, std::io::Error>(stream)
        };
        let stream = match timeouts.dial {
            Some(t) => time::timeout(t, dial).await.map_err(|_| Error::Dial {
                addr: addr.to_owned(),
                source: std::io::ErrorKind::TimedOut.into(),
            })?,
            None => dial.await,
        }
        .map_err(|e| Error::Dial {
            addr: addr.to_owned(),
            source: e,
        })?;

        let (rd_half, wr_half) = stream.into_split();
        let mut nc = NodeConn {
            cluster: cluster.to_owned(),
            addr: addr.to_owned(),
            ctype,
            rd: Reader::new(rd_half, timeouts.read),
            wr: Writer::new(wr_half, timeouts.write),
            closed: AtomicBool::new(false),
            metrics,
        };
        if ctype == CacheType::Redis && !redis_auth.is_empty() {
            nc.authenticate(redis_auth).await?;
        }
        debug!(cluster = %nc.cluster, addr = %nc.addr, "backend connected");
        Ok(nc)
    }

    async fn authenticate(&mut self, password: &str) -> Result<()> {
        self.wr
            .write(redis::auth_request(password))
            .map_err(|e| self.io_err(e))?;
        self.wr.flush().await.map_err(|e| self.io_err(e))?;
        loop {
            let start = self.rd.mark();
            match self.rd.read_until(b'\n') {
                Ok(line) => {
                    let ok = self.rd.slice(line.clone()).starts_with(b"+");
                    self.rd.consume_to(line.end);
                    return if ok {
                        Ok(())
                    } else {
                        Err(Error::Protocol("backend rejected AUTH".into()))
                    };
                }
                Err(Error::BufferIncomplete) => {
                    self.rd.advance_to(start);
                    self.rd.fill().await.map_err(|e| self.io_err(e))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn io_err(&self, source: std::io::Error) -> Error {
        Error::BackendIo {
            addr: self.addr.clone(),
            source,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Encode every routable message of the batch in order and flush once.
    pub async fn write_batch(&mut self, batch: &mut MsgBatch) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        match self.ctype {
            CacheType::MemcacheBinary => self.write_binary_batch(batch)?,
            _ => {
                for entry in batch.entries_mut() {
                    if entry.skip_write() {
                        continue;
                    }
                    self.ctype.encode_request(&entry.req, &mut self.wr)?;
                    entry.written_at = Some(Instant::now());
                }
            }
        }
        self.wr.flush().await.map_err(|e| self.io_err(e))
    }

    /// Binary batches rewrite opaques to the entry index so quiet misses can
    /// be told apart, and make the final entry non-quiet so the reply stream
    /// terminates.
    fn write_binary_batch(&mut self, batch: &mut MsgBatch) -> Result<()> {
        let last = match batch.entries().iter().rposition(|e| !e.skip_write()) {
            Some(i) => i,
            None => return Ok(()),
        };
        for i in 0..batch.count() {
            let entry = &mut batch.entries_mut()[i];
            if entry.skip_write() {
                continue;
            }
            let req = match &entry.req {
                Request::MemcacheBinary(r) => r,
                _ => return Err(Error::BadAssert),
            };
            let opcode = if i == last {
                req.opcode().loud()
            } else {
                req.opcode()
            };
            let (hdr, body) = binary::patch_frame(req.packet(), opcode, i as u32);
            let addr = self.addr.clone();
            let map = move |e: std::io::Error| Error::BackendIo {
                addr,
                source: e,
            };
            self.wr.write(hdr).map_err(map.clone())?;
            self.wr.write(body).map_err(map)?;
            entry.written_at = Some(Instant::now());
        }
        Ok(())
    }

    /// Decode one reply per written message, attributing replies to messages
    /// in request order (by rewritten opaque for the binary dialect). A short
    /// read rewinds to the start of the current reply and refills.
    pub async fn read_batch(&mut self, batch: &mut MsgBatch) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        match self.ctype {
            CacheType::MemcacheBinary => self.read_binary_batch(batch).await,
            _ => self.read_ordered_batch(batch).await,
        }
    }

    async fn read_ordered_batch(&mut self, batch: &mut MsgBatch) -> Result<()> {
        for i in 0..batch.count() {
            if batch.entries()[i].skip_read() {
                continue;
            }
            let reply = loop {
                let start = self.rd.mark();
                let res = match (self.ctype, &batch.entries()[i].req) {
                    (CacheType::Memcache, Request::Memcache(req)) => {
                        memcache::decode_reply(req, &mut self.rd)
                    }
                    (CacheType::Redis, Request::Redis(req)) => {
                        redis::decode_reply(req, &mut self.rd)
                    }
                    _ => Err(Error::BadAssert),
                };
                match res {
                    Ok(reply) => break reply,
                    Err(Error::BufferIncomplete) => {
                        self.rd.advance_to(start);
                        self.rd.fill().await.map_err(|e| self.io_err(e))?;
                    }
                    Err(e) => return Err(e),
                }
            };
            let miss = match &batch.entries()[i].req {
                Request::Memcache(req) => memcache::is_miss(req, &reply),
                Request::Redis(req) => redis::is_miss(req, &reply),
                Request::MemcacheBinary(_) => None,
            };
            self.record_hit_miss(miss);
            let entry = &mut batch.entries_mut()[i];
            entry.read_at = Some(Instant::now());
            entry.reply = Some(reply);
        }
        Ok(())
    }

    async fn read_binary_batch(&mut self, batch: &mut MsgBatch) -> Result<()> {
        let last = match batch.entries().iter().rposition(|e| !e.skip_write()) {
            Some(i) => i,
            None => return Ok(()),
        };
        loop {
            let (opaque, reply) = loop {
                let start = self.rd.mark();
                match binary::decode_reply_packet(&mut self.rd) {
                    Ok(decoded) => break decoded,
                    Err(Error::BufferIncomplete) => {
                        self.rd.advance_to(start);
                        self.rd.fill().await.map_err(|e| self.io_err(e))?;
                    }
                    Err(e) => return Err(e),
                }
            };
            let idx = opaque as usize;
            if idx >= batch.count() {
                return Err(Error::Protocol(format!("stray reply opaque {opaque}")));
            }
            let miss = match &batch.entries()[idx].req {
                Request::MemcacheBinary(req) => binary::is_miss(req, &reply),
                _ => return Err(Error::BadAssert),
            };
            self.record_hit_miss(miss);
            let entry = &mut batch.entries_mut()[idx];
            entry.read_at = Some(Instant::now());
            entry.reply = Some(reply);
            if idx == last {
                return Ok(());
            }
        }
    }

    fn record_hit_miss(&self, miss: Option<bool>) {
        match miss {
            Some(true) => self.metrics.misses.inc([&self.cluster, &self.addr]),
            Some(false) => self.metrics.hits.inc([&self.cluster, &self.addr]),
            None => {}
        }
    }

    /// Send the dialect probe and verify its reply.
    pub async fn ping(&mut self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        self.wr
            .write(self.ctype.ping_request())
            .map_err(|e| self.io_err(e))?;
        self.wr.flush().await.map_err(|e| self.io_err(e))?;
        loop {
            let start = self.rd.mark();
            match self.ctype.check_ping_reply(&mut self.rd) {
                Ok(()) => return Ok(()),
                Err(Error::BufferIncomplete) => {
                    self.rd.advance_to(start);
                    self.rd.fill().await.map_err(|e| self.io_err(e))?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Idempotent open→closed transition. The socket itself closes when the
    /// connection is dropped.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(cluster = %self.cluster, addr = %self.addr, "backend connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
