//! WebSocket (RFC 6455): HTTP upgrade handshake on both sides and the
//! frame codec. Client frames are masked, server frames never are;
//! fragmented messages are reassembled before delivery while control
//! frames cut the line.

use base64::Engine as _;
use sha1::{Digest, Sha1};
use weft::{Connection, Event, Flags, Handler, HttpMsg, Manager, ParsedUrl, Proto, WsMsg};
use weft_io::IoBuf;
use weft_utils::bstr;

use crate::{Parsed, parse};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
/// Per-frame payload cap.
const MAX_FRAME: u64 = 1 << 30;

pub const OP_CONT: u8 = 0;
pub const OP_TEXT: u8 = 1;
pub const OP_BINARY: u8 = 2;
pub const OP_CLOSE: u8 = 8;
pub const OP_PING: u8 = 9;
pub const OP_PONG: u8 = 10;

/// `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &[u8]) -> String {
    let mut h = Sha1::new();
    h.update(key);
    h.update(GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(h.finalize())
}

/// Server side: answers the upgrade request with a 101 and switches the
/// connection to the WebSocket protocol. Call from the `HttpMsg` event.
pub fn upgrade(mgr: &mut Manager, c: &mut Connection, hm: &HttpMsg<'_>, extra_headers: &str) {
    let Some(key) = hm.header("Sec-WebSocket-Key") else {
        mgr.fail(c, "WS handshake error");
        return;
    };
    let accept = accept_key(bstr::trim(key));
    c.send_fmt(format_args!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n{extra_headers}\r\n",
    ));
    c.flags.insert(Flags::WEBSOCKET);
    c.flags.remove(Flags::RESP);
    c.set_proto(Box::new(WsProto::server()));
    mgr.call_user(c, &Event::WsOpen(hm));
}

/// Client side: connects and performs the upgrade; `WsOpen` fires once
/// the 101 verifies.
pub fn connect(mgr: &mut Manager, url: &str, handler: Handler) -> std::io::Result<u64> {
    let p = ParsedUrl::parse(url)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let id = mgr.connect(url, handler)?;
    let key: [u8; 16] = rand::random();
    let key_b64 = base64::engine::general_purpose::STANDARD.encode(key);
    mgr.set_proto(
        id,
        Box::new(WsProto {
            client: Some(ClientHs { key_b64, host: p.host.clone(), uri: p.uri.clone() }),
            frag_op: 0,
            frag: Vec::new(),
        }),
    );
    Ok(id)
}

/// Sends one frame. Client connections mask with a fresh random key.
pub fn send(c: &mut Connection, op: u8, data: &[u8]) -> bool {
    let client = c.flags.contains(Flags::CLIENT);
    let mut hdr = [0u8; 14];
    let n = frame_header(&mut hdr, op, client, data.len());
    if client {
        let mask: [u8; 4] = rand::random();
        hdr[n - 4..n].copy_from_slice(&mask);
        let mut masked = data.to_vec();
        for (i, b) in masked.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
        c.send(&hdr[..n]) && c.send(&masked)
    } else {
        c.send(&hdr[..n]) && c.send(data)
    }
}

/// Frames the last `n` bytes already appended to the send buffer
/// (write-then-wrap, for `send_fmt`-built payloads).
pub fn wrap(c: &mut Connection, n: usize, op: u8) {
    let client = c.flags.contains(Flags::CLIENT);
    let mut hdr = [0u8; 14];
    let hl = frame_header(&mut hdr, op, client, n);
    let at = c.send.len() - n;
    if client {
        let mask: [u8; 4] = rand::random();
        hdr[hl - 4..hl].copy_from_slice(&mask);
        let buf = c.send.as_mut_slice();
        for i in 0..n {
            buf[at + i] ^= mask[i % 4];
        }
    }
    c.send.add(at, &hdr[..hl]);
}

/// Builds a frame header into `hdr`, returning its length (mask bytes
/// reserved but not filled).
fn frame_header(hdr: &mut [u8; 14], op: u8, masked: bool, len: usize) -> usize {
    hdr[0] = 0x80 | (op & 0x0f);
    let mut n = 2;
    if len < 126 {
        hdr[1] = len as u8;
    } else if len <= usize::from(u16::MAX) {
        hdr[1] = 126;
        hdr[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        n = 4;
    } else {
        hdr[1] = 127;
        hdr[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        n = 10;
    }
    if masked {
        hdr[1] |= 0x80;
        n += 4;
    }
    n
}

struct ClientHs {
    key_b64: String,
    host: String,
    uri: String,
}

pub struct WsProto {
    /// Present until the client handshake completes; servers never set
    /// it.
    client: Option<ClientHs>,
    frag_op: u8,
    frag: Vec<u8>,
}

impl WsProto {
    fn server() -> Self {
        Self { client: None, frag_op: 0, frag: Vec::new() }
    }
}

enum Frame {
    Incomplete,
    TooBig,
    /// (flags byte, payload offset, payload length, mask)
    Ready(u8, usize, usize, Option<[u8; 4]>),
}

fn parse_frame(buf: &[u8]) -> Frame {
    if buf.len() < 2 {
        return Frame::Incomplete;
    }
    let b0 = buf[0];
    let masked = buf[1] & 0x80 != 0;
    let len7 = buf[1] & 0x7f;
    let (len, mut ofs) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Frame::Incomplete;
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Frame::Incomplete;
            }
            (u64::from_be_bytes(buf[2..10].try_into().unwrap_or_default()), 10)
        }
        n => (u64::from(n), 2),
    };
    if len > MAX_FRAME {
        return Frame::TooBig;
    }
    let mask = if masked {
        if buf.len() < ofs + 4 {
            return Frame::Incomplete;
        }
        let m = [buf[ofs], buf[ofs + 1], buf[ofs + 2], buf[ofs + 3]];
        ofs += 4;
        Some(m)
    } else {
        None
    };
    let len = len as usize;
    if buf.len() < ofs + len {
        return Frame::Incomplete;
    }
    Frame::Ready(b0, ofs, len, mask)
}

impl Proto for WsProto {
    fn on_event(&mut self, mgr: &mut Manager, c: &mut Connection, ev: &Event<'_>) {
        match ev {
            Event::Connect => {
                if let Some(hs) = &self.client {
                    c.send_fmt(format_args!(
                        "GET {} HTTP/1.1\r\n\
                         Host: {}\r\n\
                         Upgrade: websocket\r\n\
                         Connection: Upgrade\r\n\
                         Sec-WebSocket-Version: 13\r\n\
                         Sec-WebSocket-Key: {}\r\n\r\n",
                        hs.uri, hs.host, hs.key_b64
                    ));
                }
            }
            Event::Read(_) => {
                if self.client.is_some() && !c.flags.contains(Flags::WEBSOCKET) {
                    if !self.client_handshake(mgr, c) {
                        return;
                    }
                }
                if c.flags.contains(Flags::WEBSOCKET) {
                    self.drive_frames(mgr, c);
                }
            }
            _ => {}
        }
    }

    fn spawn(&self) -> Box<dyn Proto> {
        Box::new(Self::server())
    }
}

impl WsProto {
    /// Waits for the 101, verifies the accept key, consumes the head.
    fn client_handshake(&mut self, mgr: &mut Manager, c: &mut Connection) -> bool {
        let (ok, head) = {
            let Some(hs) = &self.client else { return false };
            match parse(c.recv.as_slice()) {
                Parsed::Partial => return false,
                Parsed::Malformed => (false, 0),
                Parsed::Complete(ref hm, head) => {
                    let expected = accept_key(hs.key_b64.as_bytes());
                    let ok = hm.status() == 101
                        && hm
                            .header("Sec-WebSocket-Accept")
                            .is_some_and(|v| bstr::trim(v) == expected.as_bytes());
                    (ok, head)
                }
            }
        };
        if !ok {
            mgr.fail(c, "WS handshake error");
            return false;
        }
        c.flags.insert(Flags::WEBSOCKET);
        self.client = None;
        // Deliver the 101 as WsOpen, then drop it from the buffer
        let buf = std::mem::replace(&mut c.recv, IoBuf::new(1));
        if let Parsed::Complete(ref hm, _) = parse(buf.as_slice()) {
            mgr.call_user(c, &Event::WsOpen(hm));
        }
        c.recv = buf;
        c.recv.del(0, head);
        true
    }

    fn drive_frames(&mut self, mgr: &mut Manager, c: &mut Connection) {
        loop {
            if c.flags.contains(Flags::CLOSING) {
                return;
            }
            let (b0, ofs, len, mask) = match parse_frame(c.recv.as_slice()) {
                Frame::Incomplete => return,
                Frame::TooBig => {
                    mgr.fail(c, "WS frame too big");
                    return;
                }
                Frame::Ready(b0, ofs, len, mask) => (b0, ofs, len, mask),
            };
            if let Some(m) = mask {
                let buf = &mut c.recv.as_mut_slice()[ofs..ofs + len];
                for (i, b) in buf.iter_mut().enumerate() {
                    *b ^= m[i % 4];
                }
            }
            let op = b0 & 0x0f;
            let fin = b0 & 0x80 != 0;
            let total = ofs + len;
            if op >= OP_CLOSE {
                self.control(mgr, c, b0, ofs, len);
                c.recv.del(0, total);
                continue;
            }
            if fin && op != OP_CONT && self.frag.is_empty() {
                // Unfragmented fast path, straight out of the buffer
                let buf = std::mem::replace(&mut c.recv, IoBuf::new(1));
                let wm = WsMsg { flags: b0, data: &buf.as_slice()[ofs..ofs + len] };
                mgr.call_user(c, &Event::WsMsg(&wm));
                c.recv = buf;
                c.recv.del(0, total);
                continue;
            }
            // Fragmented: accumulate, deliver on FIN of the final
            // continuation
            if op != OP_CONT {
                self.frag_op = op;
                self.frag.clear();
            }
            self.frag.extend_from_slice(&c.recv.as_slice()[ofs..ofs + len]);
            c.recv.del(0, total);
            if fin {
                let wm = WsMsg { flags: 0x80 | self.frag_op, data: &self.frag };
                mgr.call_user(c, &Event::WsMsg(&wm));
                self.frag.clear();
                self.frag_op = 0;
            }
        }
    }

    /// Ping gets an echo pong, close echoes the payload and drains; all
    /// control frames surface as `WsCtl`.
    fn control(&mut self, mgr: &mut Manager, c: &mut Connection, b0: u8, ofs: usize, len: usize) {
        let op = b0 & 0x0f;
        match op {
            OP_PING => {
                let payload = c.recv.as_slice()[ofs..ofs + len].to_vec();
                send(c, OP_PONG, &payload);
            }
            OP_CLOSE => {
                let payload = c.recv.as_slice()[ofs..ofs + len].to_vec();
                send(c, OP_CLOSE, &payload);
                c.drain();
            }
            _ => {}
        }
        let buf = std::mem::replace(&mut c.recv, IoBuf::new(1));
        let wm = WsMsg { flags: b0, data: &buf.as_slice()[ofs..ofs + len] };
        mgr.call_user(c, &Event::WsCtl(&wm));
        c.recv = buf;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rfc_sample_accept_key() {
        // The key/accept pair from RFC 6455 section 1.3
        assert_eq!(accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn header_sizes() {
        let mut h = [0u8; 14];
        assert_eq!(frame_header(&mut h, OP_TEXT, false, 5), 2);
        assert_eq!(h[0], 0x81);
        assert_eq!(h[1], 5);
        assert_eq!(frame_header(&mut h, OP_BINARY, false, 300), 4);
        assert_eq!(h[1], 126);
        assert_eq!(frame_header(&mut h, OP_BINARY, false, 70_000), 10);
        assert_eq!(h[1], 127);
        assert_eq!(frame_header(&mut h, OP_TEXT, true, 5), 6);
        assert_eq!(h[1] & 0x80, 0x80);
    }

    #[test]
    fn parse_masked_frame() {
        // "Hello" masked with 37fa213d, from RFC 6455 section 5.7
        let frame = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        match parse_frame(&frame) {
            Frame::Ready(b0, ofs, len, Some(mask)) => {
                assert_eq!(b0, 0x81);
                assert_eq!((ofs, len), (6, 5));
                let dec: Vec<u8> =
                    frame[ofs..ofs + len].iter().enumerate().map(|(i, b)| b ^ mask[i % 4]).collect();
                assert_eq!(dec, b"Hello");
            }
            _ => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn incomplete_and_toobig() {
        assert!(matches!(parse_frame(&[0x81]), Frame::Incomplete));
        assert!(matches!(parse_frame(&[0x81, 0x05, b'h']), Frame::Incomplete));
        let mut big = vec![0x82, 127];
        big.extend_from_slice(&(MAX_FRAME + 1).to_be_bytes());
        assert!(matches!(parse_frame(&big), Frame::TooBig));
    }

    #[test]
    fn encode_decode_identity() {
        // server -> client frame: encode then decode gives the payload back
        let mut h = [0u8; 14];
        let n = frame_header(&mut h, OP_BINARY, false, 3);
        let mut frame = h[..n].to_vec();
        frame.extend_from_slice(b"abc");
        match parse_frame(&frame) {
            Frame::Ready(b0, ofs, len, None) => {
                assert_eq!(b0 & 0x0f, OP_BINARY);
                assert_eq!(&frame[ofs..ofs + len], b"abc");
            }
            _ => panic!("roundtrip failed"),
        }
    }
}
