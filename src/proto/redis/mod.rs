//! Redis RESP2 protocol codec.
//!
//! Client requests are arrays of bulk strings. Replies are passed through as
//! opaque frames; only the type byte and, for count merges, the integer value
//! are inspected. Multi-key commands split per the command table and merge
//! per their [`MergeType`].

pub mod command;

use std::ops::Range;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::bufio::{Reader, Writer};
use crate::error::{Error, Result};
use crate::proto::message::Message;
use crate::proto::Category;
pub use command::{CmdKind, CmdSpec, MergeType};

const PONG: &[u8] = b"+PONG\r\n";
const PING: &[u8] = b"*1\r\n$4\r\nPING\r\n";
const OK: &[u8] = b"+OK\r\n";

/// One decoded RESP command.
#[derive(Debug, Clone)]
pub struct RedisRequest {
    frame: Bytes,
    /// Bulk-string contents: `args[0]` is the command name.
    args: Vec<Bytes>,
    cmd: String,
    spec: CmdSpec,
}

impl RedisRequest {
    /// Build a request from parts, encoding the wire frame.
    pub fn synth(cmd: &str, args: &[&[u8]]) -> Self {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(format!("*{}\r\n", args.len() + 1).as_bytes());
        buf.extend_from_slice(format!("${}\r\n{}\r\n", cmd.len(), cmd).as_bytes());
        for arg in args {
            buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            buf.extend_from_slice(arg);
            buf.extend_from_slice(b"\r\n");
        }
        let frame = buf.freeze();
        // rebuild arg slices against the frame for cheap clones
        let mut all = Vec::with_capacity(args.len() + 1);
        let mut pos = 0usize;
        for _ in 0..args.len() + 2 {
            // skip over header lines while collecting bulk bodies
            let nl = frame[pos..].iter().position(|&b| b == b'\n').unwrap() + pos + 1;
            if frame[pos] == b'$' {
                let len: usize = std::str::from_utf8(&frame[pos + 1..nl - 2])
                    .unwrap()
                    .parse()
                    .unwrap();
                all.push(frame.slice(nl..nl + len));
                pos = nl + len + 2;
            } else {
                pos = nl;
            }
        }
        let cmd = cmd.to_ascii_uppercase();
        let spec = command::lookup(&cmd);
        Self {
            frame,
            args: all,
            cmd,
            spec,
        }
    }

    pub fn frame(&self) -> &Bytes {
        &self.frame
    }

    pub fn key(&self) -> &[u8] {
        self.args.get(1).map(|a| &a[..]).unwrap_or(b"")
    }

    pub fn arg(&self, i: usize) -> Option<&Bytes> {
        self.args.get(i)
    }

    pub fn command(&self) -> &str {
        &self.cmd
    }

    pub fn merge_type(&self) -> MergeType {
        self.spec.merge
    }

    pub fn category(&self) -> Category {
        match self.spec.kind {
            CmdKind::Supported => Category::Supported,
            CmdKind::Unsupported => Category::Unsupported,
            CmdKind::Control => Category::Control,
        }
    }

    pub fn is_quit(&self) -> bool {
        self.cmd == "QUIT"
    }

    /// One sub-request per `batch_step` elements after the command name.
    pub fn split(&self) -> Option<Vec<RedisRequest>> {
        let step = self.spec.batch_step;
        if step == 0 {
            return None;
        }
        let items = (self.args.len() - 1) / step;
        let sub_cmd = self.spec.sub_cmd.unwrap_or(&self.cmd);
        let mut subs = Vec::with_capacity(items);
        for i in 0..items {
            let group: Vec<&[u8]> = self.args[1 + i * step..1 + (i + 1) * step]
                .iter()
                .map(|a| &a[..])
                .collect();
            subs.push(RedisRequest::synth(sub_cmd, &group));
        }
        Some(subs)
    }
}

/// Signed RESP integer line body (digits after the type byte).
fn parse_int(bs: &[u8]) -> Result<i64> {
    if bs.is_empty() || bs.len() > 20 {
        return Err(Error::Protocol("bad integer".into()));
    }
    let (neg, digits) = if bs[0] == b'-' {
        (true, &bs[1..])
    } else {
        (false, bs)
    };
    if digits.is_empty() {
        return Err(Error::Protocol("bad integer".into()));
    }
    let mut n = 0i64;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(Error::Protocol("bad integer".into()));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add((b - b'0') as i64))
            .ok_or_else(|| Error::Protocol("integer overflow".into()))?;
    }
    Ok(if neg { -n } else { n })
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
    if rd.buffered() == 0 {
        return Ok(None);
    }

    let header = match rd.read_until(b'\n') {
        Ok(r) => r,
        Err(Error::BufferIncomplete) => {
            rd.advance_to(start);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    let count = {
        let bs = rd.slice(header.clone());
        if bs[0] != b'*' {
            // not an array; resync at the line boundary
            rd.consume_to(header.end);
            return Ok(Some(error_message(Error::Protocol(
                "expected RESP array".into(),
            ))));
        }
        match line_int(bs) {
            Ok(n) if n >= 1 => n as usize,
            _ => {
                rd.consume_to(header.end);
                return Ok(Some(error_message(Error::Protocol(
                    "bad array header".into(),
                ))));
            }
        }
    };
    if count > 1024 * 1024 {
        rd.consume_to(header.end);
        return Ok(Some(error_message(Error::Protocol("array too large".into()))));
    }

    let mut bodies: Vec<Range<usize>> = Vec::with_capacity(count);
    for _ in 0..count {
        let line = match rd.read_until(b'\n') {
            Ok(r) => r,
            Err(Error::BufferIncomplete) => {
                rd.advance_to(start);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let len = {
            let bs = rd.slice(line.clone());
            if bs[0] != b'$' {
                rd.consume_to(line.end);
                return Ok(Some(error_message(Error::Protocol(
                    "expected bulk string".into(),
                ))));
            }
            match line_int(bs) {
                Ok(n) if n >= 0 => n as usize,
                _ => {
                    rd.consume_to(line.end);
                    return Ok(Some(error_message(Error::Protocol(
                        "bad bulk length".into(),
                    ))));
                }
            }
        };
        let body = match rd.read_exact(len + 2) {
            Ok(r) => r,
            Err(Error::BufferIncomplete) => {
                rd.advance_to(start);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        bodies.push(body.start..body.start + len);
    }

    let end = rd.mark();
    let frame = rd.consume_to(end);
    let args: Vec<Bytes> = bodies.iter().map(|r| frame.slice(r.clone())).collect();
    let cmd = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    let spec = command::lookup(&cmd);

    // arity checks before routing
    let argc = args.len() - 1;
    let arity_ok = match spec.kind {
        CmdKind::Supported => {
            if spec.batch_step > 0 {
                argc >= spec.batch_step && argc % spec.batch_step == 0
            } else {
                argc >= 1
            }
        }
        CmdKind::Control => match cmd.as_str() {
            "ECHO" => argc == 1,
            "AUTH" => argc == 1,
            "SELECT" => argc == 1,
            _ => true,
        },
        CmdKind::Unsupported => true,
    };
    let req = RedisRequest {
        frame,
        args,
        cmd,
        spec,
    };
    let mut msg = Message::new(crate::proto::Request::Redis(req));
    if !arity_ok {
        let cmd = match msg.request() {
            crate::proto::Request::Redis(r) => r.command().to_ascii_lowercase(),
            _ => unreachable!(),
        };
        msg.set_err(std::sync::Arc::new(Error::Protocol(format!(
            "wrong number of arguments for '{cmd}' command"
        ))));
    }
    Ok(Some(msg))
}

/// Integer body of a `*N`/`$N` header line.
fn line_int(line: &[u8]) -> Result<i64> {
    if line.len() < 4 || line[line.len() - 2] != b'\r' {
        return Err(Error::Protocol("bad header line".into()));
    }
    parse_int(&line[1..line.len() - 2])
}

fn error_message(err: Error) -> Message {
    let req = RedisRequest {
        frame: Bytes::new(),
        args: Vec::new(),
        cmd: String::new(),
        spec: CmdSpec {
            kind: CmdKind::Unsupported,
            batch_step: 0,
            merge: MergeType::Basic,
            sub_cmd: None,
        },
    };
    let mut msg = Message::new(crate::proto::Request::Redis(req));
    msg.set_err(std::sync::Arc::new(err));
    msg
}

/// Queue one backend-bound request (the original wire frame).
pub fn encode_request<W: AsyncWrite + Unpin>(req: &RedisRequest, wr: &mut Writer<W>) -> Result<()> {
    wr.write(req.frame.clone()).map_err(|e| Error::BackendIo {
        addr: String::new(),
        source: e,
    })
}

/// Scan one complete RESP value, advancing the reader position.
fn scan_value<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<()> {
    let line = rd.read_until(b'\n')?;
    let (tag, val) = {
        let bs = rd.slice(line.clone());
        let tag = bs[0];
        let val = match tag {
            b'$' | b'*' => line_int(bs)?,
            b'+' | b'-' | b':' => 0,
            other => {
                return Err(Error::Protocol(format!(
                    "bad RESP type byte 0x{other:02x}"
                )))
            }
        };
        (tag, val)
    };
    match tag {
        b'$' if val >= 0 => {
            rd.read_exact(val as usize + 2)?;
        }
        b'*' if val >= 0 => {
            for _ in 0..val {
                scan_value(rd)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Decode one backend reply for `req`, consuming and returning its frame.
pub fn decode_reply<R: AsyncRead + Unpin>(_req: &RedisRequest, rd: &mut Reader<R>) -> Result<Bytes> {
    scan_value(rd)?;
    let end = rd.mark();
    Ok(rd.consume_to(end))
}

/// Hit/miss classification for GET replies; `None` for other commands.
pub fn is_miss(req: &RedisRequest, reply: &[u8]) -> Option<bool> {
    if req.cmd == "GET" {
        Some(reply.starts_with(b"$-1"))
    } else {
        None
    }
}

/// Encode the client-visible response for one message.
pub fn encode_response<W: AsyncWrite + Unpin>(msg: &Message, wr: &mut Writer<W>) -> Result<()> {
    let req = match msg.request() {
        crate::proto::Request::Redis(r) => r,
        _ => return Err(Error::BadAssert),
    };
    if let Some(err) = msg.err() {
        return write_all(wr, error_reply(err));
    }
    match req.category() {
        Category::Control => {
            let reply = match req.command() {
                "PING" => Bytes::from_static(PONG),
                "ECHO" => {
                    let arg = req.arg(1).cloned().unwrap_or_default();
                    let mut buf = BytesMut::new();
                    buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
                    buf.extend_from_slice(&arg);
                    buf.extend_from_slice(b"\r\n");
                    buf.freeze()
                }
                // QUIT, AUTH, SELECT
                _ => Bytes::from_static(OK),
            };
            write_all(wr, reply)
        }
        Category::Unsupported => write_all(
            wr,
            error_reply(&Error::Unsupported(req.command().to_string())),
        ),
        Category::Supported => {
            if msg.has_subs() {
                return encode_merged(req.merge_type(), msg, wr);
            }
            match msg.reply() {
                Some(reply) => write_all(wr, reply.clone()),
                None => write_all(wr, error_reply(&Error::Closed)),
            }
        }
    }
}

fn encode_merged<W: AsyncWrite + Unpin>(
    merge: MergeType,
    msg: &Message,
    wr: &mut Writer<W>,
) -> Result<()> {
    let subs = msg.subs();
    match merge {
        MergeType::Basic => {
            // single sub-response becomes the client response
            match subs.first().and_then(|s| s.reply.clone()) {
                Some(reply) => write_all(wr, reply),
                None => write_all(wr, error_reply(&Error::Closed)),
            }
        }
        MergeType::Join => {
            write_all(wr, Bytes::from(format!("*{}\r\n", subs.len())))?;
            for sub in subs {
                match &sub.reply {
                    Some(reply) => write_all(wr, reply.clone())?,
                    None => write_all(wr, Bytes::from_static(b"$-1\r\n"))?,
                }
            }
            Ok(())
        }
        MergeType::Count => {
            let mut total = 0i64;
            for sub in subs {
                let reply = match &sub.reply {
                    Some(r) => r,
                    None => return write_all(wr, error_reply(&Error::Closed)),
                };
                match reply.first() {
                    Some(b':') => {
                        total += parse_int(&reply[1..reply.len() - 2])?;
                    }
                    Some(b'-') => return write_all(wr, reply.clone()),
                    _ => return Err(Error::Protocol("expected integer reply".into())),
                }
            }
            write_all(wr, Bytes::from(format!(":{total}\r\n")))
        }
        MergeType::Ok => {
            for sub in subs {
                if let Some(reply) = &sub.reply {
                    if reply.starts_with(b"-") {
                        return write_all(wr, reply.clone());
                    }
                }
            }
            write_all(wr, Bytes::from_static(OK))
        }
    }
}

fn write_all<W: AsyncWrite + Unpin>(wr: &mut Writer<W>, data: Bytes) -> Result<()> {
    wr.write(data).map_err(Error::ClientIo)
}

/// Dialect-shaped error frame.
pub fn error_reply(err: &Error) -> Bytes {
    let msg = match err {
        Error::Unsupported(cmd) => format!("-ERR unknown command '{cmd}'\r\n"),
        Error::Protocol(m) => format!("-ERR {m}\r\n"),
        other => format!("-ERR proxy: {other}\r\n"),
    };
    Bytes::from(msg)
}

/// `AUTH` frame passed through to backends on connect.
pub fn auth_request(password: &str) -> Bytes {
    RedisRequest::synth("AUTH", &[password.as_bytes()]).frame().clone()
}

/// Probe frame.
pub fn ping_request() -> Bytes {
    Bytes::from_static(PING)
}

/// Verify the probe reply (`+PONG`).
pub fn check_ping_reply<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<()> {
    let line = rd.read_until(b'\n')?;
    let ok = rd.slice(line.clone()) == PONG;
    rd.consume_to(line.end);
    if ok {
        Ok(())
    } else {
        Err(Error::Protocol("unexpected ping reply".into()))
    }
}
