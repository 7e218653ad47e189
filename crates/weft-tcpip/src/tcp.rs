//! TCP state machine over raw frames, plus the ARP/connect plumbing
//! shared with UDP connections.
//!
//! Sequence bookkeeping per connection: `seq` is the next byte we send,
//! `ack` the next byte we expect, `acked` the highest ack we told the
//! peer, `unacked` how many received bytes an ACK still owes. ACKs
//! coalesce: past half the window they go out immediately, otherwise on
//! a 150 ms timer.

use tracing::{debug, trace};
use weft::{Event, Flags, Sock};

use crate::{
    iface::{Iface, LinkState, Route},
    wire::{EthHdr, Ip4Hdr, PROTO_TCP, PROTO_UDP, TCP_LEN, TcpHdr, UdpHdr, tcpflags},
};

pub(crate) const ACK_MS: u64 = 150;
pub(crate) const ARP_MS: u64 = 100;
pub(crate) const SYN_MS: u64 = 15_000;
pub(crate) const FIN_MS: u64 = 1_000;
pub(crate) const KEEPALIVE_MS: u64 = 45_000;
/// Advertised receive window; half of it is the ACK-coalescing limit.
pub(crate) const TCP_WIN: u16 = 6000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Keepalive,
    Ack,
    Arp,
    Syn,
    Fin,
}

impl TimerKind {
    const fn period(self) -> u64 {
        match self {
            Self::Keepalive => KEEPALIVE_MS,
            Self::Ack => ACK_MS,
            Self::Arp => ARP_MS,
            Self::Syn => SYN_MS,
            Self::Fin => FIN_MS,
        }
    }
}

/// Engine-side state of one stack connection.
pub(crate) struct ConnState {
    pub seq: u32,
    pub ack: u32,
    pub acked: u32,
    pub unacked: usize,
    pub timer: u64,
    pub ttype: TimerKind,
    pub tmiss: u8,
    /// Resolved next-hop MAC.
    pub mac: [u8; 6],
}

impl ConnState {
    fn new(mac: [u8; 6]) -> Self {
        Self {
            seq: 0,
            ack: 0,
            acked: 0,
            unacked: 0,
            timer: 0,
            ttype: TimerKind::Keepalive,
            tmiss: 0,
            mac,
        }
    }

    fn arm(&mut self, now: u64, kind: TimerKind) {
        self.timer = now + kind.period();
        self.ttype = kind;
    }
}

/// `a < b` under sequence-number wraparound.
#[inline]
const fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Exact 4-tuple match among stack connections; optionally fall back to
/// a listener on the destination port.
pub(crate) fn find_conn(
    ifc: &mut Iface,
    src_ip: u32,
    sport: u16,
    dport: u16,
    listener: bool,
) -> Option<u64> {
    let mut fallback = None;
    for id in ifc.mgr.conn_ids() {
        let Some(c) = ifc.mgr.conn_mut(id) else { continue };
        if !matches!(c.sock, Sock::Stack) || c.flags.contains(Flags::UDP) {
            continue;
        }
        if c.loc.host_port() != dport {
            continue;
        }
        if c.flags.contains(Flags::LISTENING) {
            if listener {
                fallback.get_or_insert(id);
            }
        } else if c.rem.host_port() == sport && c.rem.ip4() == src_ip.to_be_bytes() {
            return Some(id);
        }
    }
    fallback
}

// ---- outbound connect / ARP ---------------------------------------------

/// First engine touch of a fresh outbound connection: assign the local
/// endpoint, resolve the next-hop MAC (ARP if needed), then SYN.
pub(crate) fn start_connect(ifc: &mut Iface, id: u64) {
    let now = ifc.now_ms;
    let our_ip = ifc.ip;
    let (dst, is_udp, needs_port) = {
        let Some(c) = ifc.mgr.conn_mut(id) else { return };
        c.loc.ip[..4].copy_from_slice(&our_ip.to_be_bytes());
        (
            u32::from_be_bytes(c.rem.ip4()),
            c.flags.contains(Flags::UDP),
            c.loc.host_port() == 0,
        )
    };
    if needs_port {
        let p = ifc.next_eport();
        if let Some(c) = ifc.mgr.conn_mut(id) {
            c.loc.set_host_port(p);
        }
    }
    match ifc.route(dst) {
        Route::OnLink => {
            let mut s = ConnState::new([0; 6]);
            s.arm(now, TimerKind::Arp);
            ifc.states.insert(id, s);
            if let Some(c) = ifc.mgr.conn_mut(id) {
                c.flags.insert(Flags::ARP_LOOKING);
            }
            ifc.arp_request(dst);
        }
        Route::Gateway(mac) => {
            ifc.states.insert(id, ConnState::new(mac));
            if is_udp {
                udp_connected(ifc, id);
            } else {
                send_syn(ifc, id);
            }
        }
        Route::NeedGatewayMac => {
            let mut s = ConnState::new([0; 6]);
            s.arm(now, TimerKind::Arp);
            ifc.states.insert(id, s);
            if let Some(c) = ifc.mgr.conn_mut(id) {
                c.flags.insert(Flags::ARP_LOOKING);
            }
            ifc.arp_gateway();
        }
    }
}

/// An ARP reply landed: complete every connection that was waiting on
/// this address (or on the gateway).
pub(crate) fn arp_resolved(ifc: &mut Iface, spa: u32, sha: [u8; 6]) {
    let gw_resolved = spa == ifc.gw && ifc.gw != 0;
    for id in ifc.mgr.conn_ids() {
        let Some(c) = ifc.mgr.conn_mut(id) else { continue };
        if !matches!(c.sock, Sock::Stack) || !c.flags.contains(Flags::ARP_LOOKING) {
            continue;
        }
        let dst = u32::from_be_bytes(c.rem.ip4());
        let on_link = matches!(ifc.route(dst), Route::OnLink);
        let hit = if on_link { dst == spa } else { gw_resolved };
        if !hit {
            continue;
        }
        let mac = if on_link { sha } else { ifc.gwmac };
        let is_udp = {
            let Some(c) = ifc.mgr.conn_mut(id) else { continue };
            c.flags.remove(Flags::ARP_LOOKING);
            c.flags.contains(Flags::UDP)
        };
        if let Some(s) = ifc.states.get_mut(&id) {
            s.mac = mac;
        }
        if is_udp {
            udp_connected(ifc, id);
        } else {
            send_syn(ifc, id);
        }
    }
}

fn udp_connected(ifc: &mut Iface, id: u64) {
    if let Some(s) = ifc.states.get_mut(&id) {
        s.timer = 0;
    }
    if let Some(c) = ifc.mgr.conn_mut(id) {
        c.flags.remove(Flags::CONNECTING);
    }
    ifc.mgr.fire(id, &Event::Connect);
}

fn send_syn(ifc: &mut Iface, id: u64) {
    let now = ifc.now_ms;
    let Some(c) = ifc.mgr.conn_mut(id) else { return };
    // ISN = local port; predictable, see the note on `Iface`
    let isn = u32::from(c.loc.host_port());
    let quad = Quad::of(c);
    let Some(s) = ifc.states.get_mut(&id) else { return };
    s.seq = isn.wrapping_add(1);
    s.arm(now, TimerKind::Syn);
    let mac = s.mac;
    tx_seg(ifc, mac, &quad, tcpflags::SYN, isn, 0, &[]);
}

// ---- segment ingress ----------------------------------------------------

pub(crate) fn handle_tcp(ifc: &mut Iface, eth: &EthHdr, ip: &Ip4Hdr, body: &[u8]) {
    let Some((tcph, payload)) = TcpHdr::parse(body) else {
        ifc.ndrop += 1;
        return;
    };
    if ip.dst != ifc.ip || ifc.state != LinkState::Ready {
        ifc.ndrop += 1;
        return;
    }
    if let Some(id) = find_conn(ifc, ip.src, tcph.sport, tcph.dport, false) {
        if ifc.states.contains_key(&id) {
            segment(ifc, id, eth, ip, &tcph, payload);
            return;
        }
    }
    // No established peer: listener handshake or RST
    let listener = find_conn(ifc, ip.src, tcph.sport, tcph.dport, true);
    let syn_only = tcph.flags & (tcpflags::SYN | tcpflags::ACK) == tcpflags::SYN;
    match listener {
        Some(_) if syn_only => {
            // Stateless SYN-ACK; the connection materializes on the
            // final ACK of the handshake
            let isn = u32::from(tcph.dport);
            let quad = Quad {
                src_ip: ifc.ip,
                dst_ip: ip.src,
                sport: tcph.dport,
                dport: tcph.sport,
            };
            tx_seg(
                ifc,
                eth.src,
                &quad,
                tcpflags::SYN | tcpflags::ACK,
                isn,
                tcph.seq.wrapping_add(1),
                &[],
            );
        }
        Some(lid)
            if tcph.flags & tcpflags::ACK != 0
                && tcph.flags & tcpflags::RST == 0
                && tcph.ack == u32::from(tcph.dport).wrapping_add(1) =>
        {
            accept(ifc, lid, eth, ip, &tcph, payload);
        }
        // A listener ignores stray RSTs
        Some(_) if tcph.flags & tcpflags::RST != 0 => {}
        _ => {
            if tcph.flags & tcpflags::RST == 0 {
                let quad = Quad {
                    src_ip: ifc.ip,
                    dst_ip: ip.src,
                    sport: tcph.dport,
                    dport: tcph.sport,
                };
                tx_seg(ifc, eth.src, &quad, tcpflags::RST | tcpflags::ACK, tcph.ack, tcph.seq, &[]);
            }
            ifc.ndrop += 1;
        }
    }
}

fn accept(ifc: &mut Iface, listener_id: u64, eth: &EthHdr, ip: &Ip4Hdr, tcph: &TcpHdr, payload: &[u8]) {
    let now = ifc.now_ms;
    let Some(id) = ifc.mgr.accept_stack_conn(listener_id) else { return };
    if let Some(c) = ifc.mgr.conn_mut(id) {
        c.rem = weft::Addr::new4(ip.src.to_be_bytes(), tcph.sport);
        c.loc = weft::Addr::new4(ifc.ip.to_be_bytes(), tcph.dport);
    }
    let mut s = ConnState::new(eth.src);
    s.seq = u32::from(tcph.dport).wrapping_add(1);
    s.ack = tcph.seq;
    s.acked = tcph.seq;
    s.arm(now, TimerKind::Keepalive);
    ifc.states.insert(id, s);
    debug!(id, peer = %weft::Addr::new4(ip.src.to_be_bytes(), tcph.sport), "tcp accept");
    ifc.mgr.fire(id, &Event::Open(""));
    ifc.mgr.fire(id, &Event::Accept);
    if !payload.is_empty() {
        segment(ifc, id, eth, ip, tcph, payload);
    }
}

fn segment(ifc: &mut Iface, id: u64, eth: &EthHdr, _ip: &Ip4Hdr, tcph: &TcpHdr, payload: &[u8]) {
    let now = ifc.now_ms;
    let (closing, draining, connecting, is_tls) = {
        let Some(c) = ifc.mgr.conn_mut(id) else { return };
        (
            c.flags.contains(Flags::CLOSING),
            c.flags.contains(Flags::DRAINING),
            c.flags.contains(Flags::CONNECTING),
            c.flags.contains(Flags::TLS),
        )
    };
    if tcph.flags & tcpflags::RST != 0 {
        if closing || draining {
            if let Some(c) = ifc.mgr.conn_mut(id) {
                c.flags.insert(Flags::CLOSING);
            }
        } else {
            ifc.mgr.fail_id(id, "peer RST");
        }
        return;
    }
    // Peer MAC may move (failover); track the latest
    if let Some(s) = ifc.states.get_mut(&id) {
        s.mac = eth.src;
        s.tmiss = 0;
    }
    if connecting {
        // Expect SYN-ACK acking our ISN+1
        let s_seq = ifc.states.get(&id).map_or(0, |s| s.seq);
        if tcph.flags & (tcpflags::SYN | tcpflags::ACK) == (tcpflags::SYN | tcpflags::ACK)
            && tcph.ack == s_seq
        {
            let (quad, mac) = {
                let Some(c) = ifc.mgr.conn_mut(id) else { return };
                c.flags.remove(Flags::CONNECTING);
                (Quad::of(c), ifc.states.get(&id).map_or([0; 6], |s| s.mac))
            };
            if let Some(s) = ifc.states.get_mut(&id) {
                s.ack = tcph.seq.wrapping_add(1);
                s.acked = s.ack;
                s.arm(now, TimerKind::Keepalive);
            }
            let (seq, ack) = ifc.states.get(&id).map_or((0, 0), |s| (s.seq, s.ack));
            tx_seg(ifc, mac, &quad, tcpflags::ACK, seq, ack, &[]);
            ifc.mgr.fire(id, &Event::Connect);
        }
        return;
    }

    let expected = ifc.states.get(&id).map_or(0, |s| s.ack);
    if tcph.seq != expected {
        if tcph.seq == expected.wrapping_sub(1) {
            // Keep-alive probe: acknowledge, deliver nothing
            send_ack(ifc, id);
        } else if seq_lt(tcph.seq, expected) {
            trace!(id, seq = tcph.seq, expected, "duplicate segment");
        } else {
            trace!(id, seq = tcph.seq, expected, "out of order, dup-ack");
            send_ack(ifc, id);
        }
        return;
    }

    // In-order data
    if !payload.is_empty() {
        let force_ack = {
            let Some(s) = ifc.states.get_mut(&id) else { return };
            s.ack = s.ack.wrapping_add(payload.len() as u32);
            s.unacked += payload.len();
            s.unacked > usize::from(TCP_WIN) / 2
        };
        if let Some(c) = ifc.mgr.conn_mut(id) {
            if is_tls {
                c.rtls.push(payload);
            } else {
                c.recv.push(payload);
            }
        }
        if force_ack {
            send_ack(ifc, id);
        } else if let Some(s) = ifc.states.get_mut(&id)
            && s.ttype != TimerKind::Ack
        {
            s.arm(now, TimerKind::Ack);
        }
        ifc.mgr.fire(id, &Event::Read(payload.len()));
    }

    let fin_wait = ifc.states.get(&id).is_some_and(|s| s.ttype == TimerKind::Fin);
    if tcph.flags & tcpflags::ACK != 0 && fin_wait {
        let s_seq = ifc.states.get(&id).map_or(0, |s| s.seq);
        if tcph.ack == s_seq.wrapping_add(1) {
            // Our FIN is acknowledged
            if let Some(c) = ifc.mgr.conn_mut(id) {
                c.flags.insert(Flags::CLOSING);
            }
        }
    }

    if tcph.flags & tcpflags::FIN != 0 {
        handle_fin(ifc, id, tcph);
    }
}

fn handle_fin(ifc: &mut Iface, id: u64, tcph: &TcpHdr) {
    let fin_sent = ifc.states.get(&id).is_some_and(|s| s.ttype == TimerKind::Fin);
    let (mac, seq, ack) = {
        let Some(s) = ifc.states.get_mut(&id) else { return };
        s.ack = s.ack.wrapping_add(1);
        let mac = s.mac;
        if fin_sent {
            // Simultaneous close: our FIN is implicitly acked only when
            // the peer's ack already covers it
            if tcph.ack == s.seq.wrapping_add(1) {
                s.seq = s.seq.wrapping_add(1);
            }
        }
        (mac, s.seq, s.ack)
    };
    let quad = {
        let Some(c) = ifc.mgr.conn_mut(id) else { return };
        c.drain();
        Quad::of(c)
    };
    if fin_sent {
        tx_seg(ifc, mac, &quad, tcpflags::ACK, seq, ack, &[]);
        if let Some(s) = ifc.states.get_mut(&id) {
            s.acked = s.ack;
        }
        if let Some(c) = ifc.mgr.conn_mut(id) {
            c.flags.insert(Flags::CLOSING);
        }
    } else {
        // Close both directions at once
        tx_seg(ifc, mac, &quad, tcpflags::FIN | tcpflags::ACK, seq, ack, &[]);
        let now = ifc.now_ms;
        if let Some(s) = ifc.states.get_mut(&id) {
            s.acked = s.ack;
            s.arm(now, TimerKind::Fin);
        }
    }
}

// ---- timers -------------------------------------------------------------

pub(crate) fn timer_fired(ifc: &mut Iface, id: u64, kind: TimerKind) {
    let now = ifc.now_ms;
    match kind {
        TimerKind::Ack => {
            let owed = ifc.states.get(&id).is_some_and(|s| s.acked != s.ack);
            if owed {
                send_ack(ifc, id);
            }
            if let Some(s) = ifc.states.get_mut(&id) {
                s.arm(now, TimerKind::Keepalive);
            }
        }
        TimerKind::Arp => ifc.mgr.fail_id(id, "ARP timeout"),
        TimerKind::Syn => ifc.mgr.fail_id(id, "Connection timeout"),
        TimerKind::Fin => {
            if let Some(c) = ifc.mgr.conn_mut(id) {
                c.flags.insert(Flags::CLOSING);
            }
        }
        TimerKind::Keepalive => {
            let miss = {
                let Some(s) = ifc.states.get_mut(&id) else { return };
                s.tmiss += 1;
                s.tmiss
            };
            if miss >= 3 {
                ifc.mgr.fail_id(id, "keepalive");
                return;
            }
            // Zero-length probe one byte behind our sequence
            let (quad, mac, seq, ack) = {
                let Some(c) = ifc.mgr.conn_mut(id) else { return };
                let quad = Quad::of(c);
                let Some(s) = ifc.states.get(&id) else { return };
                (quad, s.mac, s.seq.wrapping_sub(1), s.ack)
            };
            tx_seg(ifc, mac, &quad, tcpflags::ACK, seq, ack, &[]);
            if let Some(s) = ifc.states.get_mut(&id) {
                s.arm(now, TimerKind::Keepalive);
            }
        }
    }
}

// ---- egress -------------------------------------------------------------

/// Flushes queued sends for one connection: framed datagrams for UDP,
/// MSS-sized segments for TCP; then FIN progression for drains/closes.
pub(crate) fn drive_io(ifc: &mut Iface, id: u64) {
    let is_udp = ifc.mgr.conn_mut(id).is_some_and(|c| c.flags.contains(Flags::UDP));
    if is_udp {
        drive_udp(ifc, id);
    } else {
        drive_tcp(ifc, id);
    }
}

fn drive_udp(ifc: &mut Iface, id: u64) {
    loop {
        let Some((payload, consumed, quad, mac)) = ({
            let Some(c) = ifc.mgr.conn_mut(id) else { return };
            let buf = c.send.as_slice();
            if buf.len() < 4 {
                None
            } else {
                let len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
                if buf.len() < 4 + len {
                    None
                } else {
                    let quad = Quad::of(c);
                    let mac = ifc.states.get(&id).map_or([0; 6], |s| s.mac);
                    Some((buf[4..4 + len].to_vec(), 4 + len, quad, mac))
                }
            }
        }) else {
            return;
        };
        // Datagrams never fragment: oversized ones are clipped (the
        // warning comes from tx_ip)
        let mut dgram = Vec::with_capacity(payload.len() + 8);
        UdpHdr::put(quad.sport, quad.dport, quad.src_ip, quad.dst_ip, &payload, &mut dgram);
        ifc.tx_ip(mac, PROTO_UDP, quad.src_ip, quad.dst_ip, &dgram);
        if let Some(c) = ifc.mgr.conn_mut(id) {
            c.send.del(0, consumed);
        }
        ifc.mgr.fire(id, &Event::Write(payload.len()));
    }
}

fn drive_tcp(ifc: &mut Iface, id: u64) {
    let mss = ifc.cfg.mtu - crate::wire::IP4_LEN - TCP_LEN;
    let mut total = 0usize;
    loop {
        let Some((chunk, quad, mac, seq, ack)) = ({
            let Some(s) = ifc.states.get(&id) else { return };
            let (mac, seq, ack) = (s.mac, s.seq, s.ack);
            let Some(c) = ifc.mgr.conn_mut(id) else { return };
            if c.send.is_empty()
                || c.flags.contains(Flags::ARP_LOOKING)
                || c.flags.contains(Flags::TLS_HS)
            {
                None
            } else {
                let n = c.send.len().min(mss);
                Some((c.send.as_slice()[..n].to_vec(), Quad::of(c), mac, seq, ack))
            }
        }) else {
            break;
        };
        tx_seg(ifc, mac, &quad, tcpflags::PSH | tcpflags::ACK, seq, ack, &chunk);
        let n = chunk.len();
        if let Some(s) = ifc.states.get_mut(&id) {
            s.seq = s.seq.wrapping_add(n as u32);
            s.acked = s.ack;
            s.unacked = 0;
        }
        if let Some(c) = ifc.mgr.conn_mut(id) {
            c.send.del(0, n);
        }
        total += n;
    }
    if total > 0 {
        ifc.mgr.fire(id, &Event::Write(total));
    }
    // FIN once the send queue drains on a draining/closing connection
    let wants_fin = {
        let Some(c) = ifc.mgr.conn_mut(id) else { return };
        let done = c.send.is_empty()
            && (c.flags.contains(Flags::DRAINING) || c.flags.contains(Flags::CLOSING));
        done && ifc.states.get(&id).is_some_and(|s| s.ttype != TimerKind::Fin)
    };
    if wants_fin {
        let (quad, mac, seq, ack) = {
            let Some(c) = ifc.mgr.conn_mut(id) else { return };
            let quad = Quad::of(c);
            let Some(s) = ifc.states.get(&id) else { return };
            (quad, s.mac, s.seq, s.ack)
        };
        tx_seg(ifc, mac, &quad, tcpflags::FIN | tcpflags::ACK, seq, ack, &[]);
        let now = ifc.now_ms;
        if let Some(s) = ifc.states.get_mut(&id) {
            s.arm(now, TimerKind::Fin);
        }
    }
}

fn send_ack(ifc: &mut Iface, id: u64) {
    let (quad, mac, seq, ack) = {
        let Some(c) = ifc.mgr.conn_mut(id) else { return };
        let quad = Quad::of(c);
        let Some(s) = ifc.states.get(&id) else { return };
        (quad, s.mac, s.seq, s.ack)
    };
    tx_seg(ifc, mac, &quad, tcpflags::ACK, seq, ack, &[]);
    if let Some(s) = ifc.states.get_mut(&id) {
        s.acked = s.ack;
        s.unacked = 0;
    }
}

/// Local/remote endpoints in transmit orientation.
pub(crate) struct Quad {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub sport: u16,
    pub dport: u16,
}

impl Quad {
    fn of(c: &weft::Connection) -> Self {
        Self {
            src_ip: u32::from_be_bytes(c.loc.ip4()),
            dst_ip: u32::from_be_bytes(c.rem.ip4()),
            sport: c.loc.host_port(),
            dport: c.rem.host_port(),
        }
    }
}

fn tx_seg(ifc: &mut Iface, mac: [u8; 6], quad: &Quad, flags: u8, seq: u32, ack: u32, payload: &[u8]) {
    let mut seg = Vec::with_capacity(TCP_LEN + payload.len());
    TcpHdr::put(
        quad.sport, quad.dport, seq, ack, flags, TCP_WIN, quad.src_ip, quad.dst_ip, payload,
        &mut seg,
    );
    ifc.tx_ip(mac, PROTO_TCP, quad.src_ip, quad.dst_ip, &seg);
}
