//! Buffered socket I/O for the proxy hot path.
//!
//! [`Reader`] buffers inbound bytes in a growable buffer and hands decoders
//! positions into it; a decoder that runs short of bytes returns
//! [`Error::BufferIncomplete`], the caller rewinds to the start of the
//! incomplete frame with [`Reader::advance_to`], awaits [`Reader::fill`] and
//! retries. Completed frames are frozen out of the buffer with
//! [`Reader::consume_to`] as refcounted [`Bytes`], so a frame stays valid for
//! as long as any message references it.
//!
//! [`Writer`] queues borrowed slices without copying and flushes them with
//! scatter-gather writes. After the first I/O error every subsequent write
//! and flush returns that error; recovery requires a fresh connection.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::ops::Range;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

use crate::error::{Error, Result};

/// Initial capacity for connection read buffers.
pub const INIT_BUF_SIZE: usize = 4 * 1024;

/// Cap on slices per scatter-gather submission.
const MAX_IOVEC: usize = 64;

/// Buffered reader over one socket read half.
pub struct Reader<R> {
    rd: R,
    buf: BytesMut,
    pos: usize,
    timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> Reader<R> {
    pub fn new(rd: R, timeout: Option<Duration>) -> Self {
        Self {
            rd,
            buf: buffer_pool().get(INIT_BUF_SIZE),
            pos: 0,
            timeout,
        }
    }

    /// Current decode position. Opaque; only meaningful to [`advance_to`].
    ///
    /// [`advance_to`]: Reader::advance_to
    pub fn mark(&self) -> usize {
        self.pos
    }

    /// Rewind (or advance) the decode position to a previously taken mark.
    pub fn advance_to(&mut self, mark: usize) {
        debug_assert!(mark <= self.buf.len());
        self.pos = mark;
    }

    /// Bytes buffered beyond the decode position.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Pull more bytes from the socket, growing the buffer when full.
    /// Returns `UnexpectedEof` when the peer closed the stream.
    pub async fn fill(&mut self) -> io::Result<()> {
        if self.buf.capacity() - self.buf.len() < 512 {
            self.buf.reserve(self.buf.capacity().max(INIT_BUF_SIZE));
        }
        let n = match self.timeout {
            Some(t) => time::timeout(t, self.rd.read_buf(&mut self.buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read deadline expired"))??,
            None => self.rd.read_buf(&mut self.buf).await?,
        };
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    /// Scan forward for `delim`, returning the range of bytes up to and
    /// including it and advancing past it.
    pub fn read_until(&mut self, delim: u8) -> Result<Range<usize>> {
        match self.buf[self.pos..].iter().position(|&b| b == delim) {
            Some(i) => {
                let range = self.pos..self.pos + i + 1;
                self.pos = range.end;
                Ok(range)
            }
            None => Err(Error::BufferIncomplete),
        }
    }

    /// Take exactly `n` bytes, advancing past them.
    pub fn read_exact(&mut self, n: usize) -> Result<Range<usize>> {
        if self.buffered() < n {
            return Err(Error::BufferIncomplete);
        }
        let range = self.pos..self.pos + n;
        self.pos = range.end;
        Ok(range)
    }

    /// Borrow a previously returned range. Valid until the next
    /// [`consume_to`](Reader::consume_to).
    pub fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range]
    }

    /// Freeze and hand out everything up to `upto`, which must not exceed the
    /// decode position. Remaining positions shift down by `upto`.
    pub fn consume_to(&mut self, upto: usize) -> Bytes {
        debug_assert!(upto <= self.pos);
        let frame = self.buf.split_to(upto).freeze();
        self.pos -= upto;
        frame
    }
}

impl<R> Drop for Reader<R> {
    fn drop(&mut self) {
        buffer_pool().put(std::mem::take(&mut self.buf));
    }
}

/// Vectored writer over one socket write half.
///
/// Slices are queued by reference ([`Bytes`]) and written with one
/// scatter-gather submission per flush. The first error is sticky.
pub struct Writer<W> {
    wr: W,
    queue: VecDeque<Bytes>,
    err: Option<(io::ErrorKind, String)>,
    timeout: Option<Duration>,
}

impl<W: AsyncWrite + Unpin> Writer<W> {
    pub fn new(wr: W, timeout: Option<Duration>) -> Self {
        Self {
            wr,
            queue: VecDeque::with_capacity(MAX_IOVEC),
            err: None,
            timeout,
        }
    }

    fn sticky(&self) -> Option<io::Error> {
        self.err
            .as_ref()
            .map(|(kind, msg)| io::Error::new(*kind, msg.clone()))
    }

    /// Queue one slice. No copy, no I/O.
    pub fn write(&mut self, data: Bytes) -> io::Result<()> {
        if let Some(e) = self.sticky() {
            return Err(e);
        }
        if !data.is_empty() {
            self.queue.push_back(data);
        }
        Ok(())
    }

    /// Queue a static byte string.
    pub fn write_static(&mut self, data: &'static [u8]) -> io::Result<()> {
        self.write(Bytes::from_static(data))
    }

    /// Number of queued slices not yet flushed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Write all queued slices with vectored writes, then clear the queue.
    pub async fn flush(&mut self) -> io::Result<()> {
        if let Some(e) = self.sticky() {
            return Err(e);
        }
        while !self.queue.is_empty() {
            let slices: Vec<IoSlice<'_>> = self
                .queue
                .iter()
                .take(MAX_IOVEC)
                .map(|b| IoSlice::new(b))
                .collect();
            let res = match self.timeout {
                Some(t) => time::timeout(t, self.wr.write_vectored(&slices))
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline expired"))
                    }),
                None => self.wr.write_vectored(&slices).await,
            };
            let mut n = match res {
                Ok(0) => {
                    let e = io::Error::from(io::ErrorKind::WriteZero);
                    self.err = Some((e.kind(), e.to_string()));
                    return Err(e);
                }
                Ok(n) => n,
                Err(e) => {
                    self.err = Some((e.kind(), e.to_string()));
                    return Err(e);
                }
            };
            while n > 0 {
                let front = self.queue.front_mut().expect("queue drained mid-write");
                if n >= front.len() {
                    n -= front.len();
                    self.queue.pop_front();
                } else {
                    front.advance(n);
                    n = 0;
                }
            }
        }
        Ok(())
    }
}

/// Free list of read buffers in power-of-two size buckets.
///
/// A buffer returned while frozen slices still point into its storage fails
/// `try_reclaim` and is dropped instead of reused, so pooled buffers are
/// never aliased.
pub struct BufferPool {
    buckets: [Mutex<Vec<BytesMut>>; BUCKETS],
}

const BUCKETS: usize = 8;
const MIN_BUCKET: usize = 512;
const PER_BUCKET: usize = 64;

impl BufferPool {
    fn new() -> Self {
        Self {
            buckets: Default::default(),
        }
    }

    fn bucket_index(size: usize) -> usize {
        let mut cap = MIN_BUCKET;
        for i in 0..BUCKETS {
            if size <= cap {
                return i;
            }
            cap <<= 1;
        }
        BUCKETS - 1
    }

    fn bucket_cap(i: usize) -> usize {
        MIN_BUCKET << i
    }

    /// Take a buffer with at least `size` capacity.
    pub fn get(&self, size: usize) -> BytesMut {
        let i = Self::bucket_index(size);
        if let Some(buf) = self.buckets[i].lock().pop() {
            return buf;
        }
        BytesMut::with_capacity(Self::bucket_cap(i))
    }

    /// Return a buffer to its bucket. Buffers whose storage is still shared
    /// with outstanding frames are dropped.
    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        let cap = buf.capacity();
        if cap < MIN_BUCKET || !buf.try_reclaim(cap) {
            return;
        }
        let i = Self::bucket_index(cap);
        if Self::bucket_cap(i) > cap {
            return;
        }
        let mut bucket = self.buckets[i].lock();
        if bucket.len() < PER_BUCKET {
            bucket.push(buf);
        }
    }
}

/// Process-wide buffer pool.
pub fn buffer_pool() -> &'static BufferPool {
    use std::sync::OnceLock;
    static POOL: OnceLock<BufferPool> = OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_until_and_rewind() {
        let (mut tx, rx) = duplex(64);
        let mut rd = Reader::new(rx, None);

        tokio::io::AsyncWriteExt::write_all(&mut tx, b"hel").await.unwrap();
        rd.fill().await.unwrap();
        let start = rd.mark();
        assert!(matches!(rd.read_until(b'\n'), Err(Error::BufferIncomplete)));
        rd.advance_to(start);

        tokio::io::AsyncWriteExt::write_all(&mut tx, b"lo\r\nrest").await.unwrap();
        rd.fill().await.unwrap();
        let range = rd.read_until(b'\n').unwrap();
        assert_eq!(rd.slice(range.clone()), b"hello\r\n");
        let frame = rd.consume_to(range.end);
        assert_eq!(&frame[..], b"hello\r\n");
        assert_eq!(rd.mark(), 0);
        assert_eq!(rd.buffered(), 4);
    }

    #[tokio::test]
    async fn test_read_exact_restartable() {
        let (mut tx, rx) = duplex(64);
        let mut rd = Reader::new(rx, None);

        tokio::io::AsyncWriteExt::write_all(&mut tx, b"abcd").await.unwrap();
        rd.fill().await.unwrap();
        let start = rd.mark();
        assert!(rd.read_exact(8).is_err());
        rd.advance_to(start);

        tokio::io::AsyncWriteExt::write_all(&mut tx, b"efgh").await.unwrap();
        rd.fill().await.unwrap();
        let range = rd.read_exact(8).unwrap();
        assert_eq!(rd.slice(range), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_fill_eof() {
        let (tx, rx) = duplex(64);
        drop(tx);
        let mut rd = Reader::new(rx, None);
        let err = rd.fill().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_writer_vectored_flush() {
        let (tx, mut rx) = duplex(256);
        let mut wr = Writer::new(tx, None);
        wr.write(Bytes::from_static(b"GET ")).unwrap();
        wr.write(Bytes::from_static(b"key")).unwrap();
        wr.write_static(b"\r\n").unwrap();
        assert_eq!(wr.pending(), 3);
        wr.flush().await.unwrap();
        assert_eq!(wr.pending(), 0);

        let mut out = vec![0u8; 9];
        tokio::io::AsyncReadExt::read_exact(&mut rx, &mut out).await.unwrap();
        assert_eq!(&out, b"GET key\r\n");
    }

    #[tokio::test]
    async fn test_writer_sticky_error() {
        let (tx, rx) = duplex(16);
        drop(rx);
        let mut wr = Writer::new(tx, None);
        wr.write(Bytes::from_static(b"data")).unwrap();
        assert!(wr.flush().await.is_err());
        // every later call reports the same failure
        assert!(wr.write(Bytes::from_static(b"more")).is_err());
        assert!(wr.flush().await.is_err());
    }

    #[test]
    fn test_pool_buckets() {
        assert_eq!(BufferPool::bucket_index(1), 0);
        assert_eq!(BufferPool::bucket_index(512), 0);
        assert_eq!(BufferPool::bucket_index(513), 1);
        assert_eq!(BufferPool::bucket_index(usize::MAX), BUCKETS - 1);
    }

    #[test]
    fn test_pool_round_trip() {
        let pool = BufferPool::new();
        let buf = pool.get(1024);
        assert!(buf.capacity() >= 1024);
        pool.put(buf);
        let again = pool.get(1024);
        assert!(again.capacity() >= 1024);
    }

    #[test]
    fn test_pool_refuses_shared_storage() {
        let pool = BufferPool::new();
        let mut buf = pool.get(1024);
        buf.extend_from_slice(b"payload");
        let frame = buf.split_to(7).freeze();
        pool.put(buf);
        // storage is still referenced by `frame`; the bucket must not serve it
        assert_eq!(&frame[..], b"payload");
    }
}
