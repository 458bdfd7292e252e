//! Client-frame message lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::Error;
use crate::proto::Request;

/// One client request travelling through the proxy.
///
/// A multi-key request owns an ordered list of [`SubMessage`]s; their replies
/// are gathered back in key order by the merge step. The error slot is
/// write-once: the first error observed wins.
#[derive(Debug)]
pub struct Message {
    req: Request,
    subs: Vec<SubMessage>,
    reply: Option<Bytes>,
    err: Option<Arc<Error>>,
    received_at: Instant,
    done_at: Option<Instant>,
}

impl Message {
    pub fn new(req: Request) -> Self {
        Self {
            req,
            subs: Vec::new(),
            reply: None,
            err: None,
            received_at: Instant::now(),
            done_at: None,
        }
    }

    pub fn request(&self) -> &Request {
        &self.req
    }

    /// Install the ordered sub-requests produced by the codec's split.
    pub fn set_subs(&mut self, reqs: Vec<Request>) {
        self.subs = reqs.into_iter().map(SubMessage::new).collect();
    }

    pub fn subs(&self) -> &[SubMessage] {
        &self.subs
    }

    pub fn subs_mut(&mut self) -> &mut [SubMessage] {
        &mut self.subs
    }

    pub fn has_subs(&self) -> bool {
        !self.subs.is_empty()
    }

    pub fn set_reply(&mut self, reply: Bytes) {
        self.reply = Some(reply);
    }

    pub fn reply(&self) -> Option<&Bytes> {
        self.reply.as_ref()
    }

    /// Record the first error; later calls are no-ops.
    pub fn set_err(&mut self, err: Arc<Error>) {
        if self.err.is_none() {
            self.err = Some(err);
        }
    }

    /// First error observed by this message or any of its sub-messages.
    pub fn err(&self) -> Option<&Arc<Error>> {
        self.err
            .as_ref()
            .or_else(|| self.subs.iter().find_map(|s| s.err.as_ref()))
    }

    pub fn mark_done(&mut self) {
        self.done_at = Some(Instant::now());
    }

    /// Client-observed duration, decode to encode.
    pub fn total_dur(&self) -> Duration {
        self.done_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.received_at)
    }

    /// Drop sub-messages and replies so the allocation can be reused.
    pub fn reset_subs(&mut self) {
        self.subs.clear();
        self.reply = None;
    }
}

/// One single-key piece of a split request.
///
/// Carries only its request and result slots; the parent finds it by ordinal,
/// so no back-pointer is needed.
#[derive(Debug)]
pub struct SubMessage {
    pub req: Request,
    pub reply: Option<Bytes>,
    pub err: Option<Arc<Error>>,
}

impl SubMessage {
    pub fn new(req: Request) -> Self {
        Self {
            req,
            reply: None,
            err: None,
        }
    }

    /// Record the first error; later calls are no-ops.
    pub fn set_err(&mut self, err: Arc<Error>) {
        if self.err.is_none() {
            self.err = Some(err);
        }
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
    fn test_first_error_wins() {
        let mut msg = Message::new(get_req("a"));
        msg.set_err(Arc::new(Error::NoAvailableBackend));
        msg.set_err(Arc::new(Error::Closed));
        assert!(matches!(**msg.err().unwrap(), Error::NoAvailableBackend));
    }

    #[test]
    fn test_sub_error_surfaces_on_parent() {
        let mut msg = Message::new(get_req("a"));
        msg.set_subs(vec![get_req("a"), get_req("b")]);
        msg.subs_mut()[1].set_err(Arc::new(Error::NoAvailableBackend));
        assert!(matches!(**msg.err().unwrap(), Error::NoAvailableBackend));
    }

    #[test]
    fn test_reset_subs() {
        let mut msg = Message::new(get_req("a"));
        msg.set_subs(vec![get_req("a")]);
        msg.set_reply(Bytes::from_static(b"+OK\r\n"));
        msg.reset_subs();
        assert!(!msg.has_subs());
        assert!(msg.reply().is_none());
    }
}
