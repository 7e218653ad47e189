//! Per-connection HTTP state machine.
//!
//! Walks the receive buffer on every read: fires `HttpHdrs` when a
//! header block completes, decodes chunked framing in place, fires
//! `HttpMsg` when the body is in, and gates pipelined requests behind
//! the response flag so a server handler replies before the next request
//! decodes. During a message event the receive buffer is temporarily
//! detached, so handlers must take what they need from the message view.

use weft::{Connection, Event, Flags, Handler, Manager, Proto};
use weft_io::IoBuf;
use weft_utils::bstr;

use crate::{
    BodyLen, Parsed, body_len, parse,
    serve::Serving,
};

/// Listens for HTTP connections.
pub fn listen(mgr: &mut Manager, url: &str, handler: Handler) -> std::io::Result<u64> {
    let id = mgr.listen(url, handler)?;
    mgr.set_proto(id, Box::new(HttpProto::default()));
    Ok(id)
}

/// Outbound HTTP connection; write the request from your `Connect`
/// handler, the response arrives as `HttpMsg`.
pub fn connect(mgr: &mut Manager, url: &str, handler: Handler) -> std::io::Result<u64> {
    let id = mgr.connect(url, handler)?;
    mgr.set_proto(id, Box::new(HttpProto::default()));
    Ok(id)
}

#[derive(Default)]
pub struct HttpProto {
    hdrs_fired: bool,
    /// Decoded chunked-body bytes accumulated directly after the head.
    dechunked: usize,
}

enum DeliverKind {
    Hdrs,
    Msg,
    Chunk { from: usize, len: usize },
}

impl Proto for HttpProto {
    fn on_event(&mut self, mgr: &mut Manager, c: &mut Connection, ev: &Event<'_>) {
        match ev {
            Event::Read(_) | Event::Poll(_) => {
                self.drive(mgr, c);
                pump_file(c);
            }
            Event::Write(_) => pump_file(c),
            Event::Close => self.deliver_partial(mgr, c),
            _ => {}
        }
    }

    fn spawn(&self) -> Box<dyn Proto> {
        Box::new(Self::default())
    }
}

impl HttpProto {
    fn drive(&mut self, mgr: &mut Manager, c: &mut Connection) {
        loop {
            if c.flags.contains(Flags::RESP)
                || c.flags.contains(Flags::CLOSING)
                || c.recv.is_empty()
            {
                return;
            }
            enum Step {
                Wait,
                Fail(&'static str),
                Head(usize, BodyLen),
            }
            let step = match parse(c.recv.as_slice()) {
                Parsed::Malformed => Step::Fail("HTTP parse"),
                Parsed::Partial => Step::Wait,
                Parsed::Complete(ref hm, head) => match body_len(hm) {
                    BodyLen::BadEncoding => Step::Fail("Invalid Transfer-Encoding"),
                    BodyLen::Missing => Step::Fail("Content length missing from request"),
                    blen => Step::Head(head, blen),
                },
            };
            match step {
                Step::Wait => return,
                Step::Fail(msg) => {
                    mgr.fail(c, msg);
                    return;
                }
                Step::Head(head, BodyLen::Known(len)) => {
                    let len = len as usize;
                    let have = c.recv.len() - head;
                    if !self.hdrs_fired {
                        self.hdrs_fired = true;
                        if !self.deliver(mgr, c, head, have.min(len), DeliverKind::Hdrs) {
                            return;
                        }
                    }
                    if have < len {
                        return;
                    }
                    // The response gate goes up before the handler runs;
                    // reply() (or a WebSocket upgrade) takes it down
                    if c.flags.contains(Flags::ACCEPTED) {
                        c.flags.insert(Flags::RESP);
                    }
                    let keep_going = self.deliver(mgr, c, head, len, DeliverKind::Msg);
                    self.finish_message(c, head + len);
                    if !keep_going {
                        return;
                    }
                }
                Step::Head(head, BodyLen::Chunked) => {
                    if !self.hdrs_fired {
                        self.hdrs_fired = true;
                        if !self.deliver(mgr, c, head, 0, DeliverKind::Hdrs) {
                            return;
                        }
                    }
                    if !self.drive_chunked(mgr, c, head) {
                        return;
                    }
                }
                Step::Head(head, _) => {
                    // Body runs until close; deliver on the Close event
                    if !self.hdrs_fired {
                        self.hdrs_fired = true;
                        let have = c.recv.len() - head;
                        if !self.deliver(mgr, c, head, have, DeliverKind::Hdrs) {
                            return;
                        }
                    }
                    return;
                }
            }
        }
    }

    /// Strips chunk framing in place, firing `HttpChunk` per chunk and
    /// `HttpMsg` at the zero chunk. Returns true when the outer loop
    /// should re-run (a full message was consumed).
    fn drive_chunked(&mut self, mgr: &mut Manager, c: &mut Connection, head: usize) -> bool {
        loop {
            let base = head + self.dechunked;
            let parsed = chunk_size(&c.recv.as_slice()[base..]);
            let (line, size) = match parsed {
                ChunkLine::Incomplete => return false,
                ChunkLine::Malformed => {
                    mgr.fail(c, "HTTP parse");
                    return false;
                }
                ChunkLine::Line(line, size) => (line, size),
            };
            if size == 0 {
                // Final chunk is "0 CRLF CRLF" (no trailer support)
                if c.recv.len() < base + line + 2 {
                    return false;
                }
                if &c.recv.as_slice()[base + line..base + line + 2] != b"\r\n" {
                    mgr.fail(c, "HTTP parse");
                    return false;
                }
                c.recv.del(base, line + 2);
                let body = self.dechunked;
                if c.flags.contains(Flags::ACCEPTED) {
                    c.flags.insert(Flags::RESP);
                }
                let keep_going = self.deliver(mgr, c, head, body, DeliverKind::Msg);
                self.finish_message(c, head + body);
                self.dechunked = 0;
                return keep_going;
            }
            if c.recv.len() < base + line + size + 2 {
                return false;
            }
            if &c.recv.as_slice()[base + line + size..base + line + size + 2] != b"\r\n" {
                mgr.fail(c, "HTTP parse");
                return false;
            }
            c.recv.del(base, line); // chunk-size line
            c.recv.del(base + size, 2); // chunk CRLF
            self.dechunked += size;
            if !self.deliver(mgr, c, head, self.dechunked, DeliverKind::Chunk { from: base, len: size })
            {
                return false;
            }
        }
    }

    /// Builds message views from a detached receive buffer and runs the
    /// user handler. Returns false when processing must stop (the
    /// handler closed the connection or swapped the protocol, e.g. a
    /// WebSocket upgrade).
    fn deliver(
        &mut self,
        mgr: &mut Manager,
        c: &mut Connection,
        head: usize,
        body: usize,
        kind: DeliverKind,
    ) -> bool {
        let buf = std::mem::replace(&mut c.recv, IoBuf::new(1));
        if let Parsed::Complete(mut hm, _) = parse(buf.as_slice()) {
            let all = buf.as_slice();
            hm.body = &all[head..head + body];
            hm.message = &all[..head + body];
            match kind {
                DeliverKind::Hdrs => mgr.call_user(c, &Event::HttpHdrs(&hm)),
                DeliverKind::Msg => mgr.call_user(c, &Event::HttpMsg(&hm)),
                DeliverKind::Chunk { from, len } => {
                    hm.body = &all[from..from + len];
                    mgr.call_user(c, &Event::HttpChunk(&hm));
                }
            }
        }
        c.recv = buf;
        !c.has_proto() && !c.flags.contains(Flags::CLOSING)
    }

    fn finish_message(&mut self, c: &mut Connection, consumed: usize) {
        c.recv.del(0, consumed);
        self.hdrs_fired = false;
    }

    /// Close with a partial body: hand over whatever was buffered.
    fn deliver_partial(&mut self, mgr: &mut Manager, c: &mut Connection) {
        if c.recv.is_empty() {
            return;
        }
        if let Parsed::Complete(ref hm, head) = parse(c.recv.as_slice()) {
            let body = match body_len(hm) {
                BodyLen::UntilClose => c.recv.len() - head,
                BodyLen::Chunked => self.dechunked,
                _ => return,
            };
            self.deliver(mgr, c, head, body, DeliverKind::Msg);
            c.recv.del(0, head + body);
        }
    }
}

enum ChunkLine {
    Incomplete,
    Malformed,
    /// (size-line length including CRLF, chunk size)
    Line(usize, usize),
}

/// Parses a `SIZE[;ext]CRLF` chunk-size line.
fn chunk_size(rest: &[u8]) -> ChunkLine {
    let Some(nl) = rest.iter().position(|b| *b == b'\n') else {
        return if rest.len() > 80 { ChunkLine::Malformed } else { ChunkLine::Incomplete };
    };
    let line = &rest[..nl];
    let line_trimmed = line.strip_suffix(b"\r").unwrap_or(line);
    let digits = match line_trimmed.iter().position(|b| *b == b';') {
        Some(p) => &line_trimmed[..p],
        None => line_trimmed,
    };
    match bstr::parse_hex(bstr::trim(digits), 8) {
        Some(v) => ChunkLine::Line(nl + 1, v as usize),
        None => ChunkLine::Malformed,
    }
}

/// Feeds the next slice of a statically-served file into the send
/// buffer, keeping it below a watermark so memory stays bounded.
fn pump_file(c: &mut Connection) {
    const WATERMARK: usize = 16 * 1024;
    const STEP: usize = 8 * 1024;
    loop {
        let Some(serving) = c.scratch.as_mut().and_then(|s| s.downcast_mut::<Serving>()) else {
            return;
        };
        if serving.remaining == 0 {
            c.scratch = None;
            return;
        }
        if c.send.len() >= WATERMARK {
            return;
        }
        let want = STEP.min(serving.remaining as usize);
        let mut chunk = vec![0u8; want];
        match serving.file.read(&mut chunk) {
            Ok(0) | Err(_) => {
                c.scratch = None;
                c.drain();
                return;
            }
            Ok(n) => {
                serving.remaining -= n as u64;
                chunk.truncate(n);
                c.send(&chunk);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chunk_size_lines() {
        assert!(matches!(chunk_size(b"4\r\nwiki"), ChunkLine::Line(3, 4)));
        assert!(matches!(chunk_size(b"1A;ext=1\r\n"), ChunkLine::Line(10, 0x1a)));
        assert!(matches!(chunk_size(b"4"), ChunkLine::Incomplete));
        assert!(matches!(chunk_size(b"zz\r\n"), ChunkLine::Malformed));
    }
}
