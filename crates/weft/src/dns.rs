//! DNS resolver for outbound connections.
//!
//! One shared UDP connection per configured server (v4/v6), created
//! lazily. Requests are tracked per target connection: at most one
//! outstanding lookup each, expired by the reactor against
//! `Manager::dns_timeout_ms`.

use tracing::debug;

use crate::{Addr, Connection, Event, Manager, Proto, conn};

pub const QTYPE_A: u16 = 1;
pub const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;
/// Answer records examined per response.
const MAX_ANSWERS: usize = 10;
/// Compression pointer recursion bound.
const MAX_DEPTH: usize = 5;

pub(crate) struct DnsReq {
    pub target: u64,
    pub txn_id: u16,
    pub expire_ms: u64,
    pub name: String,
    /// AAAA already issued (no further fallback).
    pub v6: bool,
}

pub(crate) struct DnsState {
    pub reqs: Vec<DnsReq>,
    pub conn4: Option<u64>,
    pub conn6: Option<u64>,
    pub next_txn: u16,
}

impl Default for DnsState {
    fn default() -> Self {
        Self { reqs: Vec::new(), conn4: None, conn6: None, next_txn: rand::random() }
    }
}

struct DnsProto;

impl Proto for DnsProto {
    fn on_event(&mut self, mgr: &mut Manager, c: &mut Connection, ev: &Event<'_>) {
        if let Event::Read(_) = ev {
            let msg = c.recv.as_slice().to_vec();
            c.recv.clear();
            handle_response(mgr, &msg);
        }
    }

    fn spawn(&self) -> Box<dyn Proto> {
        Box::new(Self)
    }
}

/// Starts an A lookup for the connection in slot `idx`.
pub(crate) fn start_lookup(mgr: &mut Manager, idx: usize, name: String) {
    let Some(target) = mgr.conns[idx].as_ref().map(|c| c.id) else { return };
    mgr.dns.next_txn = mgr.dns.next_txn.wrapping_add(1);
    let txn_id = mgr.dns.next_txn;
    let expire_ms = mgr.now_ms + mgr.dns_timeout_ms;
    mgr.dns.reqs.push(DnsReq { target, txn_id, expire_ms, name: name.clone(), v6: false });
    issue(mgr, target, txn_id, &name, false);
}

/// Sends one query over the (lazily created) server connection.
fn issue(mgr: &mut Manager, target: u64, txn_id: u16, name: &str, v6: bool) {
    let Some(dns_id) = server_conn(mgr, v6) else {
        mgr.dns.reqs.retain(|r| r.target != target);
        mgr.fail_id(target, "DNS server URL is NULL");
        return;
    };
    let qtype = if v6 { QTYPE_AAAA } else { QTYPE_A };
    let q = build_query(txn_id, name, qtype);
    if !mgr.send(dns_id, &q) {
        mgr.dns.reqs.retain(|r| r.target != target);
        mgr.fail_id(target, "DNS send");
    }
}

fn server_conn(mgr: &mut Manager, v6: bool) -> Option<u64> {
    let existing = if v6 { mgr.dns.conn6 } else { mgr.dns.conn4 };
    if let Some(id) = existing
        && mgr.conn_mut(id).is_some()
    {
        return Some(id);
    }
    let url = if v6 { mgr.dns6.clone() } else { mgr.dns4.clone() }?;
    let id = mgr
        .connect(&url, conn::handler(|_, _, _| {}))
        .inspect_err(|e| debug!("DNS connect: {e}"))
        .ok()?;
    mgr.set_proto(id, Box::new(DnsProto));
    if v6 {
        mgr.dns.conn6 = Some(id);
    } else {
        mgr.dns.conn4 = Some(id);
    }
    Some(id)
}

/// Fails lookups whose deadline passed.
pub(crate) fn poll_expired(mgr: &mut Manager) {
    let now = mgr.now_ms;
    let expired: Vec<u64> =
        mgr.dns.reqs.iter().filter(|r| now > r.expire_ms).map(|r| r.target).collect();
    if expired.is_empty() {
        return;
    }
    mgr.dns.reqs.retain(|r| now <= r.expire_ms);
    for target in expired {
        mgr.fail_id(target, "DNS timeout");
    }
}

/// Drops pending lookups for a closing connection.
pub(crate) fn cancel(mgr: &mut Manager, conn_id: u64) {
    mgr.dns.reqs.retain(|r| r.target != conn_id);
    if mgr.dns.conn4 == Some(conn_id) {
        mgr.dns.conn4 = None;
    }
    if mgr.dns.conn6 == Some(conn_id) {
        mgr.dns.conn6 = None;
    }
}

fn handle_response(mgr: &mut Manager, msg: &[u8]) {
    let Some((txn_id, addr)) = parse_response(msg) else { return };
    let Some(pos) = mgr.dns.reqs.iter().position(|r| r.txn_id == txn_id) else {
        debug!(txn_id, "DNS response for unknown transaction");
        return;
    };
    match addr {
        Some(mut a) => {
            let req = mgr.dns.reqs.swap_remove(pos);
            let Some(idx) = mgr.conns.iter().position(|s| {
                s.as_ref().is_some_and(|c| c.id == req.target)
            }) else {
                return;
            };
            if let Some(c) = mgr.conns[idx].as_mut() {
                a.port = c.rem.port;
                c.rem = a;
            }
            mgr.connect_resolved(idx);
        }
        None => {
            // No usable answer; try AAAA once if enabled, else give up
            let retry = mgr.use_dns6 && !mgr.dns.reqs[pos].v6 && mgr.dns6.is_some();
            if retry {
                mgr.dns.next_txn = mgr.dns.next_txn.wrapping_add(1);
                let txn = mgr.dns.next_txn;
                let req = &mut mgr.dns.reqs[pos];
                req.txn_id = txn;
                req.v6 = true;
                let (target, name) = (req.target, req.name.clone());
                issue(mgr, target, txn, &name, true);
            } else {
                let req = mgr.dns.reqs.swap_remove(pos);
                let msg = format!("{} DNS lookup failed", req.name);
                mgr.fail_id(req.target, &msg);
            }
        }
    }
}

// ---- wire format --------------------------------------------------------

/// Builds a standard recursive query for `name`.
pub fn build_query(txn_id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(17 + name.len());
    pkt.extend_from_slice(&txn_id.to_be_bytes());
    pkt.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    pkt.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    pkt.extend_from_slice(&[0; 6]); // AN/NS/AR
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            continue;
        }
        pkt.push(label.len() as u8);
        pkt.extend_from_slice(label.as_bytes());
    }
    pkt.push(0);
    pkt.extend_from_slice(&qtype.to_be_bytes());
    pkt.extend_from_slice(&QCLASS_IN.to_be_bytes());
    pkt
}

/// Returns `(txn_id, Some(addr))` for a usable answer, `(txn_id, None)`
/// for NXDOMAIN or a response without one, `None` for garbage.
pub fn parse_response(msg: &[u8]) -> Option<(u16, Option<Addr>)> {
    if msg.len() < 12 {
        return None;
    }
    let txn_id = u16::from_be_bytes([msg[0], msg[1]]);
    let flags = u16::from_be_bytes([msg[2], msg[3]]);
    if flags & 0x8000 == 0 {
        return None; // not a response
    }
    if flags & 0x000f != 0 {
        return Some((txn_id, None)); // NXDOMAIN and friends
    }
    let qd = u16::from_be_bytes([msg[4], msg[5]]) as usize;
    let an = u16::from_be_bytes([msg[6], msg[7]]) as usize;
    let mut pos = 12;
    for _ in 0..qd {
        pos = skip_name(msg, pos)?;
        pos = pos.checked_add(4)?;
    }
    for _ in 0..an.min(MAX_ANSWERS) {
        pos = skip_name(msg, pos)?;
        if pos + 10 > msg.len() {
            return Some((txn_id, None));
        }
        let atype = u16::from_be_bytes([msg[pos], msg[pos + 1]]);
        let aclass = u16::from_be_bytes([msg[pos + 2], msg[pos + 3]]);
        let rdlen = u16::from_be_bytes([msg[pos + 8], msg[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlen > msg.len() {
            return Some((txn_id, None));
        }
        let rdata = &msg[pos..pos + rdlen];
        pos += rdlen;
        if aclass != QCLASS_IN {
            continue;
        }
        if atype == QTYPE_A && rdlen == 4 {
            let mut a = Addr::default();
            a.ip[..4].copy_from_slice(rdata);
            return Some((txn_id, Some(a)));
        }
        if atype == QTYPE_AAAA && rdlen == 16 {
            let mut a = Addr { is_ip6: true, ..Addr::default() };
            a.ip.copy_from_slice(rdata);
            return Some((txn_id, Some(a)));
        }
    }
    Some((txn_id, None))
}

/// Advances past a possibly-compressed name.
fn skip_name(msg: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *msg.get(pos)? as usize;
        if len == 0 {
            return Some(pos + 1);
        }
        if len & 0xc0 == 0xc0 {
            return Some(pos + 2);
        }
        pos += 1 + len;
    }
}

/// Decodes a name, following compression pointers up to [`MAX_DEPTH`].
pub fn decode_name(msg: &[u8], mut pos: usize) -> Option<String> {
    let mut out = String::new();
    let mut depth = 0;
    loop {
        let len = *msg.get(pos)? as usize;
        if len == 0 {
            return Some(out);
        }
        if len & 0xc0 == 0xc0 {
            depth += 1;
            if depth > MAX_DEPTH {
                return None;
            }
            pos = (((len & 0x3f) << 8) | *msg.get(pos + 1)? as usize) & 0x3fff;
            continue;
        }
        let label = msg.get(pos + 1..pos + 1 + len)?;
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(std::str::from_utf8(label).ok()?);
        pos += 1 + len;
        if out.len() > 253 {
            return None;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn query_shape() {
        let q = build_query(0x1234, "example.com", QTYPE_A);
        assert_eq!(&q[..2], &[0x12, 0x34]);
        assert_eq!(&q[12..], b"\x07example\x03com\x00\x00\x01\x00\x01");
    }

    #[test]
    fn name_roundtrip() {
        // parse(build(name)) == name
        for name in ["example.com", "a.b.c.d.e", "x", "very-long-label-here.io"] {
            let q = build_query(1, name, QTYPE_A);
            assert_eq!(decode_name(&q, 12).as_deref(), Some(name));
        }
    }

    #[test]
    fn a_answer() {
        let mut msg = build_query(7, "example.com", QTYPE_A);
        msg[2] = 0x81; // QR + RD
        msg[3] = 0x80; // RA
        msg[7] = 1; // ANCOUNT
        msg.extend_from_slice(&[0xc0, 0x0c]); // name ptr to question
        msg.extend_from_slice(&QTYPE_A.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&300u32.to_be_bytes());
        msg.extend_from_slice(&4u16.to_be_bytes());
        msg.extend_from_slice(&[93, 184, 216, 34]);
        let (txn, addr) = parse_response(&msg).unwrap();
        assert_eq!(txn, 7);
        assert_eq!(addr.unwrap().ip4(), [93, 184, 216, 34]);
    }

    #[test]
    fn nxdomain() {
        let mut msg = build_query(9, "nope.invalid", QTYPE_A);
        msg[2] = 0x81;
        msg[3] = 0x83; // RCODE 3
        assert_eq!(parse_response(&msg), Some((9, None)));
    }

    #[test]
    fn pointer_loop_bounded() {
        // A name that points at itself must not recurse forever
        let msg = [0u8, 1, 0x81, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0xc0, 0x0c];
        assert_eq!(decode_name(&msg, 12), None);
    }

    #[test]
    fn query_is_not_a_response() {
        let q = build_query(3, "example.com", QTYPE_A);
        assert_eq!(parse_response(&q), None);
    }
}
