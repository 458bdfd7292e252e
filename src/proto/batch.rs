//! Per-backend message batches.
//!
//! Dispatch groups the (sub-)requests of one client frame by destination
//! backend into [`MsgBatch`]es. Each non-empty batch travels to one backend
//! worker as a [`BatchJob`] and comes back over the frame's completion
//! channel with reply and error slots filled. The bounded completion channel
//! is the frame's countdown latch: the handler simply receives one batch per
//! submission.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::proto::Request;

/// One routed (sub-)request inside a batch.
#[derive(Debug)]
pub struct BatchEntry {
    pub req: Request,
    /// Index of the owning message within its frame.
    pub parent: usize,
    /// Ordinal of the sub-message within its parent (0 when unsplit).
    pub sub: usize,
    pub reply: Option<Bytes>,
    pub err: Option<Arc<Error>>,
    pub written_at: Option<Instant>,
    pub read_at: Option<Instant>,
}

impl BatchEntry {
    fn new(req: Request, parent: usize, sub: usize) -> Self {
        Self {
            req,
            parent,
            sub,
            reply: None,
            err: None,
            written_at: None,
            read_at: None,
        }
    }

    /// Record the first error; later calls are no-ops.
    pub fn set_err(&mut self, err: Arc<Error>) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// Skipped by the node-connection writer and reader.
    pub fn skip_write(&self) -> bool {
        self.req.is_control() || self.req.is_unsupported()
    }

    /// Written to the backend but no reply will come back.
    pub fn skip_read(&self) -> bool {
        self.skip_write() || self.req.is_noreply()
    }
}

/// All messages of one frame destined for one backend.
#[derive(Debug)]
pub struct MsgBatch {
    backend: usize,
    entries: Vec<BatchEntry>,
}

impl MsgBatch {
    pub fn new(backend: usize) -> Self {
        Self {
            backend,
            entries: Vec::new(),
        }
    }

    pub fn backend(&self) -> usize {
        self.backend
    }

    pub fn push(&mut self, req: Request, parent: usize, sub: usize) {
        self.entries.push(BatchEntry::new(req, parent, sub));
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [BatchEntry] {
        &mut self.entries
    }

    pub fn into_entries(self) -> Vec<BatchEntry> {
        self.entries
    }

    /// Fail every entry that has neither a reply nor an earlier error.
    pub fn fail_unfilled(&mut self, err: &Arc<Error>) {
        for entry in &mut self.entries {
            if entry.reply.is_none() && entry.err.is_none() && !entry.skip_read() {
                entry.set_err(err.clone());
            }
        }
    }

    /// Clear entries for reuse, rebinding to a backend.
    pub fn reset(&mut self, backend: usize) {
        self.backend = backend;
        self.entries.clear();
    }
}

/// A batch in flight to a backend worker, with the way home.
#[derive(Debug)]
pub struct BatchJob {
    pub batch: MsgBatch,
    pub done: mpsc::Sender<MsgBatch>,
}

impl BatchJob {
    /// Hand the processed batch back to its frame. The channel is sized for
    /// one slot per submitted batch and each job sends exactly once, so the
    /// send cannot hit capacity. The frame owner may have gone away (client
    /// disconnect); that is not the worker's problem.
    pub fn finish(self) {
        let _ = self.done.try_send(self.batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::redis::RedisRequest;

    fn get_req(key: &str) -> Request {
        Request::Redis(RedisRequest::synth("GET", &[key.as_bytes()]))
    }

    #[test]
    fn test_push_and_fail_unfilled() {
        let mut batch = MsgBatch::new(1);
        batch.push(get_req("a"), 0, 0);
        batch.push(get_req("b"), 0, 1);
        batch.entries_mut()[0].reply = Some(Bytes::from_static(b"$1\r\nx\r\n"));

        let err = Arc::new(Error::Closed);
        batch.fail_unfilled(&err);
        assert!(batch.entries()[0].err.is_none());
        assert!(matches!(
            batch.entries()[1].err.as_deref(),
            Some(Error::Closed)
        ));
    }

    #[test]
    fn test_entry_error_set_once() {
        let mut batch = MsgBatch::new(0);
        batch.push(get_req("a"), 0, 0);
        batch.entries_mut()[0].set_err(Arc::new(Error::NoAvailableBackend));
        batch.entries_mut()[0].set_err(Arc::new(Error::Closed));
        assert!(matches!(
            batch.entries()[0].err.as_deref(),
            Some(Error::NoAvailableBackend)
        ));
    }

    #[tokio::test]
    async fn test_job_finish_returns_batch() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut batch = MsgBatch::new(2);
        batch.push(get_req("a"), 3, 0);
        BatchJob { batch, done: tx }.finish();
        let back = rx.recv().await.unwrap();
        assert_eq!(back.backend(), 2);
        assert_eq!(back.count(), 1);
        assert_eq!(back.entries()[0].parent, 3);
    }
}
