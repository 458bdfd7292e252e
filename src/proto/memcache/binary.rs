//! Memcached binary protocol codec.
//!
//! Frames are a fixed 24-byte header (magic 0x80 request / 0x81 response)
//! plus `total body length` bytes. Multi-get arrives as a chain of quiet get
//! frames (`getq`/`getkq`) terminated by a non-quiet get or a `noop`; the
//! chain becomes one message with one sub-request per frame. On the backend
//! leg sub-request opaques are rewritten to the sub index (and the last quiet
//! get of each batch is made non-quiet to force a terminating reply); both
//! rewrites are undone on the client leg. A quiet miss contributes no reply.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::bufio::{Reader, Writer};
use crate::error::{Error, Result};
use crate::proto::message::Message;
use crate::proto::Category;

pub const HEADER_LEN: usize = 24;
pub const REQ_MAGIC: u8 = 0x80;
pub const RES_MAGIC: u8 = 0x81;

/// Response status codes used by the proxy itself.
const STATUS_UNKNOWN_COMMAND: u16 = 0x0081;
const STATUS_TEMPORARY_FAILURE: u16 = 0x0086;

/// Binary protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Touch = 0x1c,
    Gat = 0x1d,
    GatQ = 0x1e,
    GatK = 0x23,
    GatKQ = 0x24,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x05 => Opcode::Increment,
            0x06 => Opcode::Decrement,
            0x07 => Opcode::Quit,
            0x08 => Opcode::Flush,
            0x09 => Opcode::GetQ,
            0x0a => Opcode::Noop,
            0x0b => Opcode::Version,
            0x0c => Opcode::GetK,
            0x0d => Opcode::GetKQ,
            0x0e => Opcode::Append,
            0x0f => Opcode::Prepend,
            0x10 => Opcode::Stat,
            0x11 => Opcode::SetQ,
            0x12 => Opcode::AddQ,
            0x13 => Opcode::ReplaceQ,
            0x14 => Opcode::DeleteQ,
            0x15 => Opcode::IncrementQ,
            0x16 => Opcode::DecrementQ,
            0x17 => Opcode::QuitQ,
            0x18 => Opcode::FlushQ,
            0x19 => Opcode::AppendQ,
            0x1a => Opcode::PrependQ,
            0x1c => Opcode::Touch,
            0x1d => Opcode::Gat,
            0x1e => Opcode::GatQ,
            0x23 => Opcode::GatK,
            0x24 => Opcode::GatKQ,
            _ => return None,
        })
    }

    /// Quiet opcodes elicit no reply on miss (gets) or at all (mutations).
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            Opcode::GetQ
                | Opcode::GetKQ
                | Opcode::GatQ
                | Opcode::GatKQ
                | Opcode::SetQ
                | Opcode::AddQ
                | Opcode::ReplaceQ
                | Opcode::DeleteQ
                | Opcode::IncrementQ
                | Opcode::DecrementQ
                | Opcode::QuitQ
                | Opcode::FlushQ
                | Opcode::AppendQ
                | Opcode::PrependQ
        )
    }

    pub fn is_get(&self) -> bool {
        matches!(
            self,
            Opcode::Get
                | Opcode::GetK
                | Opcode::GetQ
                | Opcode::GetKQ
                | Opcode::Gat
                | Opcode::GatK
                | Opcode::GatQ
                | Opcode::GatKQ
        )
    }

    fn is_quiet_get(&self) -> bool {
        self.is_quiet() && self.is_get()
    }

    /// The non-quiet counterpart, used to force a terminating reply.
    pub fn loud(&self) -> Opcode {
        match self {
            Opcode::GetQ => Opcode::Get,
            Opcode::GetKQ => Opcode::GetK,
            Opcode::GatQ => Opcode::Gat,
            Opcode::GatKQ => Opcode::GatK,
            Opcode::SetQ => Opcode::Set,
            Opcode::AddQ => Opcode::Add,
            Opcode::ReplaceQ => Opcode::Replace,
            Opcode::DeleteQ => Opcode::Delete,
            Opcode::IncrementQ => Opcode::Increment,
            Opcode::DecrementQ => Opcode::Decrement,
            Opcode::AppendQ => Opcode::Append,
            Opcode::PrependQ => Opcode::Prepend,
            other => *other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Opcode::Get => "get",
            Opcode::Set => "set",
            Opcode::Add => "add",
            Opcode::Replace => "replace",
            Opcode::Delete => "delete",
            Opcode::Increment => "incr",
            Opcode::Decrement => "decr",
            Opcode::Quit => "quit",
            Opcode::Flush => "flush",
            Opcode::GetQ => "getq",
            Opcode::Noop => "noop",
            Opcode::Version => "version",
            Opcode::GetK => "getk",
            Opcode::GetKQ => "getkq",
            Opcode::Append => "append",
            Opcode::Prepend => "prepend",
            Opcode::Stat => "stat",
            Opcode::SetQ => "setq",
            Opcode::AddQ => "addq",
            Opcode::ReplaceQ => "replaceq",
            Opcode::DeleteQ => "deleteq",
            Opcode::IncrementQ => "incrq",
            Opcode::DecrementQ => "decrq",
            Opcode::QuitQ => "quitq",
            Opcode::FlushQ => "flushq",
            Opcode::AppendQ => "appendq",
            Opcode::PrependQ => "prependq",
            Opcode::Touch => "touch",
            Opcode::Gat => "gat",
            Opcode::GatQ => "gatq",
            Opcode::GatK => "gatk",
            Opcode::GatKQ => "gatkq",
        }
    }
}

/// One decoded binary request. For a quiet-get chain the top-level request
/// holds the per-frame sub-requests in `chain`.
#[derive(Debug, Clone)]
pub struct BinRequest {
    opcode: Opcode,
    /// Full frame: header plus body. Empty for synthetic invalid requests.
    packet: Bytes,
    key: Bytes,
    opaque: u32,
    chain: Vec<BinRequest>,
    /// Opaque of the `noop` that terminated the chain, answered locally.
    noop_tail: Option<u32>,
    unsupported: bool,
}

impl BinRequest {
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn packet(&self) -> &Bytes {
        &self.packet
    }

    pub fn command(&self) -> &'static str {
        self.opcode.label()
    }

    pub fn category(&self) -> Category {
        if self.unsupported {
            return Category::Unsupported;
        }
        match self.opcode {
            Opcode::Noop | Opcode::Version | Opcode::Quit | Opcode::QuitQ => Category::Control,
            Opcode::Flush | Opcode::FlushQ | Opcode::Stat => Category::Unsupported,
            _ => Category::Supported,
        }
    }

    /// Quiet mutations are written without awaiting a reply.
    pub fn is_noreply(&self) -> bool {
        self.opcode.is_quiet() && !self.opcode.is_get()
    }

    pub fn is_quiet_get(&self) -> bool {
        self.opcode.is_quiet_get()
    }

    pub fn is_quit(&self) -> bool {
        matches!(self.opcode, Opcode::Quit | Opcode::QuitQ)
    }

    pub fn split(&self) -> Option<Vec<BinRequest>> {
        if self.chain.is_empty() {
            None
        } else {
            Some(self.chain.clone())
        }
    }
}

struct FrameInfo {
    opcode_byte: u8,
    key: std::ops::Range<usize>,
    opaque: u32,
    start: usize,
    end: usize,
}

/// Scan one request frame without consuming it. The caller rewinds on
/// [`Error::BufferIncomplete`].
fn scan_frame<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<FrameInfo> {
    let hdr = rd.read_exact(HEADER_LEN)?;
    let (opcode_byte, key_len, extras_len, body_len, opaque) = {
        let h = rd.slice(hdr.clone());
        if h[0] != REQ_MAGIC {
            return Err(Error::Protocol(format!("bad request magic 0x{:02x}", h[0])));
        }
        (
            h[1],
            u16::from_be_bytes([h[2], h[3]]) as usize,
            h[4] as usize,
            u32::from_be_bytes([h[8], h[9], h[10], h[11]]) as usize,
            u32::from_be_bytes([h[12], h[13], h[14], h[15]]),
        )
    };
    if key_len + extras_len > body_len {
        return Err(Error::Protocol("key and extras exceed body".into()));
    }
    let body = rd.read_exact(body_len)?;
    let key_start = hdr.end + extras_len;
    Ok(FrameInfo {
        opcode_byte,
        key: key_start..key_start + key_len,
        opaque,
        start: hdr.start,
        end: body.end,
    })
}

fn request_from_frame(frame: &FrameInfo, packet: Bytes, base: usize) -> BinRequest {
    let opcode = Opcode::from_u8(frame.opcode_byte);
    let key = packet.slice(frame.key.start - base..frame.key.end - base);
    BinRequest {
        opcode: opcode.unwrap_or(Opcode::Noop),
        packet,
        key,
        opaque: frame.opaque,
        chain: Vec::new(),
        noop_tail: None,
        unsupported: opcode.is_none(),
    }
}

/// Pull complete requests (quiet-get chains count as one) out of the buffer.
pub fn decode_requests<R: AsyncRead + Unpin>(
    rd: &mut Reader<R>,
    out: &mut Vec<Message>,
    max: usize,
) -> Result<()> {
    while out.len() < max {
        let start = rd.mark();
        debug_assert_eq!(start, 0, "frames are consumed whole");
        let first = match scan_frame(rd) {
            Ok(f) => f,
            Err(Error::BufferIncomplete) => {
                rd.advance_to(start);
                break;
            }
            Err(e) => return Err(e),
        };

        let first_op = Opcode::from_u8(first.opcode_byte);
        if !first_op.map(|o| o.is_quiet_get()).unwrap_or(false) {
            let packet = rd.consume_to(first.end);
            out.push(Message::new(crate::proto::Request::MemcacheBinary(
                request_from_frame(&first, packet, start),
            )));
            continue;
        }

        // quiet-get chain: accumulate frames until a terminator
        let mut frames = vec![first];
        let mut noop_tail = None;
        let chain_end;
        loop {
            let mark = rd.mark();
            let next = match scan_frame(rd) {
                Ok(f) => f,
                Err(Error::BufferIncomplete) => {
                    // the whole chain waits for its terminator
                    rd.advance_to(start);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            match Opcode::from_u8(next.opcode_byte) {
                Some(op) if op.is_quiet_get() => frames.push(next),
                Some(op) if op.is_get() => {
                    frames.push(next);
                    chain_end = frames.last().unwrap().end;
                    break;
                }
                Some(Opcode::Noop) => {
                    noop_tail = Some(next.opaque);
                    chain_end = next.end;
                    break;
                }
                _ => {
                    // unrelated command: the chain ends before it
                    rd.advance_to(mark);
                    chain_end = frames.last().unwrap().end;
                    break;
                }
            }
        }

        let packet = rd.consume_to(chain_end);
        let chain: Vec<BinRequest> = frames
            .iter()
            .map(|f| {
                let p = packet.slice(f.start - start..f.end - start);
                request_from_frame(f, p, f.start)
            })
            .collect();
        let head = &chain[0];
        let parent = BinRequest {
            opcode: head.opcode,
            packet: packet.clone(),
            key: head.key.clone(),
            opaque: head.opaque,
            chain,
            noop_tail,
            unsupported: false,
        };
        out.push(Message::new(crate::proto::Request::MemcacheBinary(parent)));
    }
    Ok(())
}

/// Patch a frame's opcode and opaque, returning (header, body) slices.
pub fn patch_frame(packet: &Bytes, opcode: Opcode, opaque: u32) -> (Bytes, Bytes) {
    let mut hdr = BytesMut::with_capacity(HEADER_LEN);
    hdr.extend_from_slice(&packet[..HEADER_LEN]);
    hdr[1] = opcode as u8;
    hdr[12..16].copy_from_slice(&opaque.to_be_bytes());
    (hdr.freeze(), packet.slice(HEADER_LEN..))
}

/// Response status of a reply packet.
pub fn reply_status(reply: &[u8]) -> u16 {
    u16::from_be_bytes([reply[6], reply[7]])
}

/// Decode one reply packet: `(opaque, frame)`.
pub fn decode_reply_packet<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<(u32, Bytes)> {
    let hdr = rd.read_exact(HEADER_LEN)?;
    let (body_len, opaque) = {
        let h = rd.slice(hdr.clone());
        if h[0] != RES_MAGIC {
            return Err(Error::Protocol(format!("bad response magic 0x{:02x}", h[0])));
        }
        (
            u32::from_be_bytes([h[8], h[9], h[10], h[11]]) as usize,
            u32::from_be_bytes([h[12], h[13], h[14], h[15]]),
        )
    };
    let body = rd.read_exact(body_len)?;
    Ok((opaque, rd.consume_to(body.end)))
}

/// Hit/miss classification for get replies; `None` for other opcodes.
pub fn is_miss(req: &BinRequest, reply: &[u8]) -> Option<bool> {
    if req.opcode.is_get() {
        Some(reply_status(reply) != 0)
    } else {
        None
    }
}

fn build_response(opcode: Opcode, status: u16, opaque: u32, body: &[u8]) -> Bytes {
    let mut pkt = BytesMut::with_capacity(HEADER_LEN + body.len());
    pkt.put_u8(RES_MAGIC);
    pkt.put_u8(opcode as u8);
    pkt.put_u16(0); // key length
    pkt.put_u8(0); // extras length
    pkt.put_u8(0); // data type
    pkt.put_u16(status);
    pkt.put_u32(body.len() as u32);
    pkt.put_u32(opaque);
    pkt.put_u64(0); // cas
    pkt.extend_from_slice(body);
    pkt.freeze()
}

fn build_request(opcode: Opcode) -> Bytes {
    let mut pkt = BytesMut::with_capacity(HEADER_LEN);
    pkt.put_u8(REQ_MAGIC);
    pkt.put_u8(opcode as u8);
    pkt.put_bytes(0, HEADER_LEN - 2);
    pkt.freeze()
}

/// Dialect-shaped error packet for a failed message.
pub fn error_reply(req: &BinRequest, err: &Error) -> Bytes {
    let status = match err {
        Error::Unsupported(_) => STATUS_UNKNOWN_COMMAND,
        _ => STATUS_TEMPORARY_FAILURE,
    };
    build_response(req.opcode, status, req.opaque, err.to_string().as_bytes())
}

/// Encode the client-visible response for one message.
pub fn encode_response<W: AsyncWrite + Unpin>(msg: &Message, wr: &mut Writer<W>) -> Result<()> {
    let req = match msg.request() {
        crate::proto::Request::MemcacheBinary(r) => r,
        _ => return Err(Error::BadAssert),
    };
    if let Some(err) = msg.err() {
        return write_all(wr, error_reply(req, err));
    }
    match req.category() {
        Category::Control => {
            match req.opcode {
                Opcode::Noop => write_all(wr, build_response(Opcode::Noop, 0, req.opaque, b""))?,
                Opcode::Version => write_all(
                    wr,
                    build_response(
                        Opcode::Version,
                        0,
                        req.opaque,
                        env!("CARGO_PKG_VERSION").as_bytes(),
                    ),
                )?,
                Opcode::Quit => write_all(wr, build_response(Opcode::Quit, 0, req.opaque, b""))?,
                // QuitQ closes silently
                _ => {}
            }
            Ok(())
        }
        Category::Unsupported => write_all(wr, error_reply(req, &Error::Unsupported(req.command().into()))),
        Category::Supported => {
            if msg.has_subs() {
                for sub in msg.subs() {
                    let sreq = match &sub.req {
                        crate::proto::Request::MemcacheBinary(r) => r,
                        _ => return Err(Error::BadAssert),
                    };
                    match &sub.reply {
                        Some(reply) => {
                            if sreq.is_quiet_get() && reply_status(reply) != 0 {
                                continue; // quiet miss stays silent
                            }
                            let (hdr, body) = patch_frame(reply, sreq.opcode, sreq.opaque);
                            write_all(wr, hdr)?;
                            write_all(wr, body)?;
                        }
                        None => continue, // quiet miss: backend sent nothing
                    }
                }
                if let Some(opaque) = req.noop_tail {
                    write_all(wr, build_response(Opcode::Noop, 0, opaque, b""))?;
                }
                return Ok(());
            }
            if req.is_noreply() {
                return Ok(());
            }
            match msg.reply() {
                Some(reply) => {
                    if req.is_quiet_get() && reply_status(reply) != 0 {
                        return Ok(());
                    }
                    let (hdr, body) = patch_frame(reply, req.opcode, req.opaque);
                    write_all(wr, hdr)?;
                    write_all(wr, body)
                }
                None => {
                    if req.opcode.is_quiet() {
                        Ok(())
                    } else {
                        write_all(wr, error_reply(req, &Error::Closed))
                    }
                }
            }
        }
    }
}

fn write_all<W: AsyncWrite + Unpin>(wr: &mut Writer<W>, data: Bytes) -> Result<()> {
    wr.write(data).map_err(Error::ClientIo)
}

/// Probe frame: a `version` request.
pub fn ping_request() -> Bytes {
    build_request(Opcode::Version)
}

/// Verify the probe reply: any zero-status `version` response.
pub fn check_ping_reply<R: AsyncRead + Unpin>(rd: &mut Reader<R>) -> Result<()> {
    let (_, reply) = decode_reply_packet(rd)?;
    if reply_status(&reply) == 0 {
        Ok(())
    } else {
        Err(Error::Protocol("unexpected ping reply".into()))
    }
}
