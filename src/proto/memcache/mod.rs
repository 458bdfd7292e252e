//! Memcached ASCII protocol codec.
//!
//! Command grammar: `<cmd> [<key>] [<args>...]\r\n[<data>\r\n]`. Retrieval
//! commands may carry several keys and are split into one sub-request per
//! key; the merged client response concatenates the sub-responses' VALUE
//! blocks in original key order under a single terminating `END\r\n`.

pub mod binary;

use std::ops::Range;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::bufio::{Reader, Writer};
use crate::error::{Error, Result};
use crate::proto::message::Message;
use crate::proto::Category;

const END: &[u8] = b"END\r\n";
const STORED: &[u8] = b"STORED\r\n";
const PING: &[u8] = b"set _ping 0 0 4\r\npong\r\n";

/// ASCII protocol command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McCommand {
    Get,
    Gets,
    Gat,
    Gats,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
    Incr,
    Decr,
    Delete,
    Touch,
    Quit,
    Unknown,
}

/// Command families with distinct framing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McClass {
    Retrieval,
    Storage,
    Arith,
    Delete,
    Touch,
    Control,
    Unknown,
}

impl McCommand {
    fn parse(token: &[u8]) -> Self {
        match token {
            b"get" => McCommand::Get,
            b"gets" => McCommand::Gets,
            b"gat" => McCommand::Gat,
            b"gats" => McCommand::Gats,
            b"set" => McCommand::Set,
            b"add" => McCommand::Add,
            b"replace" => McCommand::Replace,
            b"append" => McCommand::Append,
            b"prepend" => McCommand::Prepend,
            b"cas" => McCommand::Cas,
            b"incr" => McCommand::Incr,
            b"decr" => McCommand::Decr,
            b"delete" => McCommand::Delete,
            b"touch" => McCommand::Touch,
            b"quit" => McCommand::Quit,
            _ => McCommand::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            McCommand::Get => "get",
            McCommand::Gets => "gets",
            McCommand::Gat => "gat",
            McCommand::Gats => "gats",
            McCommand::Set => "set",
            McCommand::Add => "add",
            McCommand::Replace => "replace",
            McCommand::Append => "append",
            McCommand::Prepend => "prepend",
            McCommand::Cas => "cas",
            McCommand::Incr => "incr",
            McCommand::Decr => "decr",
            McCommand::Delete => "delete",
            McCommand::Touch => "touch",
            McCommand::Quit => "quit",
            McCommand::Unknown => "unknown",
        }
    }

    pub fn class(&self) -> McClass {
        match self {
            McCommand::Get | McCommand::Gets | McCommand::Gat | McCommand::Gats => {
                McClass::Retrieval
            }
            McCommand::Set
            | McCommand::Add
            | McCommand::Replace
            | McCommand::Append
            | McCommand::Prepend
            | McCommand::Cas => McClass::Storage,
            McCommand::Incr | McCommand::Decr => McClass::Arith,
            McCommand::Delete => McClass::Delete,
            McCommand::Touch => McClass::Touch,
            McCommand::Quit => McClass::Control,
            McCommand::Unknown => McClass::Unknown,
        }
    }
}

/// One decoded ASCII command.
///
/// `data` is everything after the key up to the end of the frame — the tail
/// of the command line plus any data block — except for `gat`/`gats`, where
/// it holds the exptime token re-emitted before each sub-request's key.
#[derive(Debug, Clone)]
pub struct McRequest {
    cmd: McCommand,
    keys: Vec<Bytes>,
    data: Bytes,
    noreply: bool,
}

impl McRequest {
    pub fn cmd(&self) -> McCommand {
        self.cmd
    }

    pub fn key(&self) -> &[u8] {
        self.keys.first().map(|k| &k[..]).unwrap_or(b"")
    }

    pub fn command(&self) -> &'static str {
        self.cmd.as_str()
    }

    pub fn category(&self) -> Category {
        match self.cmd.class() {
            McClass::Control => Category::Control,
            McClass::Unknown => Category::Unsupported,
            _ => Category::Supported,
        }
    }

    pub fn is_noreply(&self) -> bool {
        self.noreply
    }

    pub fn is_quit(&self) -> bool {
        self.cmd == McCommand::Quit
    }

    /// One sub-request per key for multi-key retrievals.
    pub fn split(&self) -> Option<Vec<McRequest>> {
        if self.cmd.class() != McClass::Retrieval || self.keys.len() < 2 {
            return None;
        }
        Some(
            self.keys
                .iter()
                .map(|k| McRequest {
                    cmd: self.cmd,
                    keys: vec![k.clone()],
                    data: self.data.clone(),
                    noreply: false,
                })
                .collect(),
        )
    }

    fn invalid(err: Error) -> (Self, Error) {
        (
            McRequest {
                cmd: McCommand::Unknown,
                keys: Vec::new(),
                data: Bytes::new(),
                noreply: false,
            },
            err,
        )
    }
}

/// Checked ASCII digits to usize.
pub(crate) fn btou(bs: &[u8]) -> Result<usize> {
    if bs.is_empty() || bs.len() > 19 {
        return Err(Error::Protocol("bad number".into()));
    }
    let mut n = 0usize;
    for &b in bs {
        if !b.is_ascii_digit() {
            return Err(Error::Protocol("bad number".into()));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add((b - b'0') as usize))
            .ok_or_else(|| Error::Protocol("number overflow".into()))?;
    }
    Ok(n)
}

/// Whitespace-split token ranges of `line` (absolute buffer offsets).
fn tokens(line: &[u8], base: usize) -> Vec<Range<usize>> {
    let mut out = Vec::with_capacity(6);
    let mut i = 0;
    while i < line.len() {
        if line[i] == b' ' {
            i += 1;
            continue;
        }
        let start = i;
        while i < line.len() && line[i] != b' ' {
            i += 1;
        }
        out.push(base + start..base + i);
    }
    out
}

/// Pull complete requests out of the buffer, up to `max` messages total.
pub fn decode_requests<R: AsyncRead + Unpin>(
    rd: &mut Reader<R>,
    out: &mut Vec<Message>,
    max: usize,
) -> Result<()> {
    while out.len() < max {
        match decode_one(rd)? {
            Some(msg) => out.push(msg),
            None => break,
        }
    }
    Ok(())
}

fn decode_one<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<Option<Message>> {
    let start = rd.mark();
    debug_assert_eq!(start, 0, "frames are consumed whole");
    let line = match rd.read_until(b'\n') {
        Ok(r) => r,
        Err(Error::BufferIncomplete) => {
            rd.advance_to(start);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    // content excludes the CRLF; a bare LF line is malformed
    let (toks, crlf_ok) = {
        let bs = rd.slice(line.clone());
        let crlf_ok = bs.len() >= 2 && bs[bs.len() - 2] == b'\r';
        let content = if crlf_ok { &bs[..bs.len() - 2] } else { &bs[..bs.len() - 1] };
        (tokens(content, line.start), crlf_ok)
    };
    if !crlf_ok || toks.is_empty() {
        rd.consume_to(line.end);
        return Ok(Some(error_message(Error::Protocol(
            "bad command line".into(),
        ))));
    }

    let cmd = McCommand::parse(rd.slice(toks[0].clone()));
    match cmd.class() {
        McClass::Retrieval => decode_retrieval(rd, cmd, &toks, line.end).map(Some),
        McClass::Storage => decode_storage(rd, cmd, &toks, line.end, start),
        McClass::Arith | McClass::Delete | McClass::Touch => {
            decode_plain(rd, cmd, &toks, line.end).map(Some)
        }
        McClass::Control => {
            rd.consume_to(line.end);
            Ok(Some(Message::new(crate::proto::Request::Memcache(
                McRequest {
                    cmd,
                    keys: Vec::new(),
                    data: Bytes::new(),
                    noreply: false,
                },
            ))))
        }
        McClass::Unknown => {
            let name = String::from_utf8_lossy(rd.slice(toks[0].clone())).into_owned();
            rd.consume_to(line.end);
            Ok(Some(error_message(Error::Unsupported(name))))
        }
    }
}

fn decode_retrieval<R: AsyncRead + Unpin>(
    rd: &mut Reader<R>,
    cmd: McCommand,
    toks: &[Range<usize>],
    frame_end: usize,
) -> Result<Message> {
    let with_exptime = matches!(cmd, McCommand::Gat | McCommand::Gats);
    let first_key = if with_exptime { 2 } else { 1 };
    if toks.len() < first_key + 1 {
        rd.consume_to(frame_end);
        return Ok(error_message(Error::Protocol("missing key".into())));
    }
    let key_ranges: Vec<Range<usize>> = toks[first_key..].to_vec();
    let data_range = if with_exptime { toks[1].clone() } else { 0..0 };

    let frame = rd.consume_to(frame_end);
    let keys = key_ranges
        .iter()
        .map(|r| frame.slice(r.clone()))
        .collect::<Vec<_>>();
    let data = if with_exptime {
        frame.slice(data_range)
    } else {
        Bytes::new()
    };
    Ok(Message::new(crate::proto::Request::Memcache(McRequest {
        cmd,
        keys,
        data,
        noreply: false,
    })))
}

fn decode_storage<R: AsyncRead + Unpin>(
    rd: &mut Reader<R>,
    cmd: McCommand,
    toks: &[Range<usize>],
    line_end: usize,
    start: usize,
) -> Result<Option<Message>> {
    let min = if cmd == McCommand::Cas { 6 } else { 5 };
    if toks.len() < min {
        rd.consume_to(line_end);
        return Ok(Some(error_message(Error::Protocol(
            "bad command line format".into(),
        ))));
    }
    let len = match btou(rd.slice(toks[4].clone())) {
        Ok(n) => n,
        Err(e) => {
            rd.consume_to(line_end);
            return Ok(Some(error_message(e)));
        }
    };
    let block = match rd.read_exact(len + 2) {
        Ok(r) => r,
        Err(Error::BufferIncomplete) => {
            rd.advance_to(start);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    let block_ok = rd.slice(block.clone()).ends_with(b"\r\n");
    let noreply = rd.slice(toks[toks.len() - 1].clone()) == b"noreply";
    let key_range = toks[1].clone();
    let frame = rd.consume_to(block.end);
    if !block_ok {
        return Ok(Some(error_message(Error::Protocol(
            "bad data chunk".into(),
        ))));
    }
    let key = frame.slice(key_range.clone());
    let data = frame.slice(key_range.end..frame.len());
    Ok(Some(Message::new(crate::proto::Request::Memcache(
        McRequest {
            cmd,
            keys: vec![key],
            data,
            noreply,
        },
    ))))
}

fn decode_plain<R: AsyncRead + Unpin>(
    rd: &mut Reader<R>,
    cmd: McCommand,
    toks: &[Range<usize>],
    frame_end: usize,
) -> Result<Message> {
    let min = match cmd.class() {
        McClass::Delete => 2,
        _ => 3,
    };
    if toks.len() < min {
        rd.consume_to(frame_end);
        return Ok(error_message(Error::Protocol(
            "bad command line format".into(),
        )));
    }
    let noreply = rd.slice(toks[toks.len() - 1].clone()) == b"noreply";
    let key_range = toks[1].clone();
    let frame = rd.consume_to(frame_end);
    let key = frame.slice(key_range.clone());
    let data = frame.slice(key_range.end..frame.len());
    Ok(Message::new(crate::proto::Request::Memcache(McRequest {
        cmd,
        keys: vec![key],
        data,
        noreply,
    })))
}

fn error_message(err: Error) -> Message {
    let (req, err) = McRequest::invalid(err);
    let mut msg = Message::new(crate::proto::Request::Memcache(req));
    msg.set_err(std::sync::Arc::new(err));
    msg
}

/// Queue one backend-bound request.
pub fn encode_request<W: AsyncWrite + Unpin>(req: &McRequest, wr: &mut Writer<W>) -> Result<()> {
    let map_io = |e: std::io::Error| Error::BackendIo {
        addr: String::new(),
        source: e,
    };
    match req.cmd.class() {
        McClass::Retrieval => {
            wr.write_static(req.cmd.as_str().as_bytes()).map_err(map_io)?;
            wr.write_static(b" ").map_err(map_io)?;
            if matches!(req.cmd, McCommand::Gat | McCommand::Gats) {
                wr.write(req.data.clone()).map_err(map_io)?;
                wr.write_static(b" ").map_err(map_io)?;
            }
            wr.write(req.keys[0].clone()).map_err(map_io)?;
            wr.write_static(b"\r\n").map_err(map_io)?;
            Ok(())
        }
        McClass::Storage | McClass::Arith | McClass::Delete | McClass::Touch => {
            wr.write_static(req.cmd.as_str().as_bytes()).map_err(map_io)?;
            wr.write_static(b" ").map_err(map_io)?;
            wr.write(req.keys[0].clone()).map_err(map_io)?;
            wr.write(req.data.clone()).map_err(map_io)?;
            Ok(())
        }
        McClass::Control | McClass::Unknown => Err(Error::BadAssert),
    }
}

/// Decode one backend reply for `req`. On success the full reply frame is
/// consumed and returned; [`Error::BufferIncomplete`] leaves the caller to
/// rewind and refill.
pub fn decode_reply<R: AsyncRead + Unpin>(req: &McRequest, rd: &mut Reader<R>) -> Result<Bytes> {
    match req.cmd.class() {
        McClass::Retrieval => decode_retrieval_reply(rd),
        McClass::Storage | McClass::Arith | McClass::Delete | McClass::Touch => {
            let line = rd.read_until(b'\n')?;
            Ok(rd.consume_to(line.end))
        }
        McClass::Control | McClass::Unknown => Err(Error::BadAssert),
    }
}

fn decode_retrieval_reply<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<Bytes> {
    let mut cursor;
    let first = rd.read_until(b'\n')?;
    {
        let bs = rd.slice(first.clone());
        if bs == END || !bs.starts_with(b"VALUE ") {
            // miss, or an error line such as SERVER_ERROR
            return Ok(rd.consume_to(first.end));
        }
    }
    cursor = first;
    loop {
        // cursor is a VALUE line: VALUE <key> <flags> <bytes> [<cas>]\r\n
        let len = {
            let bs = rd.slice(cursor.clone());
            let toks = tokens(&bs[..bs.len().saturating_sub(2)], 0);
            if toks.len() < 4 {
                return Err(Error::Protocol("bad VALUE line".into()));
            }
            btou(&bs[toks[3].clone()])?
        };
        rd.read_exact(len + 2)?;
        let next = rd.read_until(b'\n')?;
        let done = {
            let bs = rd.slice(next.clone());
            if bs == END {
                true
            } else if bs.starts_with(b"VALUE ") {
                false
            } else {
                return Err(Error::Protocol("bad retrieval response".into()));
            }
        };
        if done {
            return Ok(rd.consume_to(next.end));
        }
        cursor = next;
    }
}

/// Hit/miss classification for retrieval replies; `None` for other classes.
pub fn is_miss(req: &McRequest, reply: &[u8]) -> Option<bool> {
    if req.cmd.class() == McClass::Retrieval {
        Some(reply.starts_with(END))
    } else {
        None
    }
}

/// Encode the client-visible response for one message.
pub fn encode_response<W: AsyncWrite + Unpin>(msg: &Message, wr: &mut Writer<W>) -> Result<()> {
    let req = match msg.request() {
        crate::proto::Request::Memcache(r) => r,
        _ => return Err(Error::BadAssert),
    };
    if let Some(err) = msg.err() {
        return write_all(wr, error_reply(err));
    }
    if req.is_quit() {
        return Ok(()); // quit: close without a reply
    }
    if msg.has_subs() {
        return encode_merged(msg, wr);
    }
    if req.is_noreply() {
        return Ok(());
    }
    match msg.reply() {
        Some(reply) => write_all(wr, reply.clone()),
        None => write_all(wr, error_reply(&Error::Closed)),
    }
}

/// Concatenate sub-responses' VALUE blocks in key order under one `END`.
fn encode_merged<W: AsyncWrite + Unpin>(msg: &Message, wr: &mut Writer<W>) -> Result<()> {
    for sub in msg.subs() {
        let reply = match &sub.reply {
            Some(r) => r,
            None => return write_all(wr, error_reply(&Error::Closed)),
        };
        if reply.starts_with(END) {
            continue;
        }
        if reply.ends_with(END) {
            write_all(wr, reply.slice(0..reply.len() - END.len()))?;
        } else {
            // backend error line passes through and terminates the merge
            return write_all(wr, reply.clone());
        }
    }
    write_all(wr, Bytes::from_static(END))
}

fn write_all<W: AsyncWrite + Unpin>(wr: &mut Writer<W>, data: Bytes) -> Result<()> {
    wr.write(data).map_err(Error::ClientIo)
}

/// Dialect-shaped error line.
pub fn error_reply(err: &Error) -> Bytes {
    match err {
        Error::Unsupported(_) => Bytes::from_static(b"ERROR\r\n"),
        Error::Protocol(msg) => Bytes::from(format!("CLIENT_ERROR {msg}\r\n")),
        other => Bytes::from(format!("SERVER_ERROR {other}\r\n")),
    }
}

/// Probe frame: a short `set` whose value is `pong`.
pub fn ping_request() -> Bytes {
    Bytes::from_static(PING)
}

/// Verify the probe reply (`STORED`).
pub fn check_ping_reply<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<()> {
    let line = rd.read_until(b'\n')?;
    let ok = rd.slice(line.clone()) == STORED;
    rd.consume_to(line.end);
    if ok {
        Ok(())
    } else {
        Err(Error::Protocol("unexpected ping reply".into()))
    }
}
