use std::collections::HashMap;

use tracing::{debug, trace, warn};
use weft::{Event, Flags, Manager, Sock};
use weft_io::{FrameQueue, FrameReceiver, FrameSender};

use crate::{
    dhcp,
    tcp::{self, ConnState, TimerKind},
    wire::{
        self, ArpPkt, BROADCAST, ETH_LEN, ETYPE_ARP, ETYPE_IP4, ETYPE_IP6, EthHdr, Ip4Hdr,
        PROTO_ICMP, PROTO_TCP, PROTO_UDP, TcpHdr, UdpHdr,
    },
};

/// Ethernet MAC/PHY abstraction. Polled drivers implement
/// [`rx`](Driver::rx); interrupt-driven ones leave the default and push
/// frames through [`Iface::frame_sender`] instead.
pub trait Driver {
    /// Bring the PHY up and program the MAC filter.
    fn init(&mut self, mac: &[u8; 6]) -> bool;

    /// Enqueue one frame; returns bytes accepted, 0 on backpressure.
    fn tx(&mut self, frame: &[u8]) -> usize;

    /// Poll one received frame into `buf`; 0 when none is pending.
    fn rx(&mut self, _buf: &mut [u8]) -> usize {
        0
    }

    /// Link state, sampled at 1 Hz.
    fn up(&mut self) -> bool;
}

/// Interface configuration. A zero `ip` enables the DHCP client.
#[derive(Clone, Copy, Debug)]
pub struct IfaceCfg {
    pub mac: [u8; 6],
    /// Host-order IPv4 address; 0 means "obtain via DHCP".
    pub ip: u32,
    pub mask: u32,
    pub gw: u32,
    pub mtu: usize,
    /// Drop frames whose destination MAC is neither ours nor broadcast.
    pub mac_check: bool,
    /// Verify a trailing FCS on received frames.
    pub crc_check: bool,
    pub enable_dhcp_server: bool,
    /// Capacity of the ISR-to-poller frame ring.
    pub queue_len: usize,
}

impl Default for IfaceCfg {
    fn default() -> Self {
        Self {
            mac: [2, 0, 0, 0, 0, 1],
            ip: 0,
            mask: 0,
            gw: 0,
            mtu: 1500,
            mac_check: true,
            crc_check: false,
            enable_dhcp_server: false,
            queue_len: 8192,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// No link.
    Down,
    /// Link up, no address yet (DHCP DISCOVER phase).
    Up,
    /// DHCP REQUEST sent, waiting for the ACK.
    Req,
    /// Addressed and usable.
    Ready,
}

/// The built-in network interface. Owns a bare [`Manager`] and feeds it
/// from raw Ethernet frames; one `poll` turn pumps the driver, runs the
/// TCP timers, then the manager's reactor phases.
///
/// The TCP initial sequence number is derived from the local port
/// (`ISN = port`), which is predictable; this matches the wire behavior
/// of small embedded stacks and keeps retransmitted handshakes cheap.
/// Front it with a TLS layer when that matters.
pub struct Iface {
    pub mgr: Manager,
    pub(crate) driver: Box<dyn Driver>,
    pub(crate) mac: [u8; 6],
    pub(crate) ip: u32,
    pub(crate) mask: u32,
    pub(crate) gw: u32,
    pub(crate) gwmac: [u8; 6],
    pub(crate) state: LinkState,
    pub(crate) cfg: IfaceCfg,
    /// Static configuration disables the DHCP client.
    pub(crate) dhcp_client: bool,
    pub(crate) lease_expire_ms: u64,
    pub(crate) now_ms: u64,
    pub(crate) nsent: u64,
    pub(crate) nrecv: u64,
    pub(crate) ndrop: u64,
    pub(crate) nerr: u64,
    /// Ephemeral port cursor, always >= 32768.
    eport: u16,
    txbuf: Vec<u8>,
    rx_ring: FrameQueue,
    rx_recv: FrameReceiver,
    scratch: Vec<u8>,
    timer_1000ms: u64,
    /// Per-connection TCP/ARP state, keyed by connection id.
    pub(crate) states: HashMap<u64, ConnState>,
    pub(crate) dhcp_server: dhcp::ServerState,
    started: std::time::Instant,
}

impl Iface {
    pub fn new(cfg: IfaceCfg, mut driver: Box<dyn Driver>, mgr: Manager) -> Self {
        let rx_ring = FrameQueue::with_capacity(cfg.queue_len).expect("frame ring too small");
        let rx_recv = rx_ring.receiver();
        if !driver.init(&cfg.mac) {
            warn!("driver init failed");
        }
        Self {
            mgr,
            driver,
            mac: cfg.mac,
            ip: cfg.ip,
            mask: cfg.mask,
            gw: cfg.gw,
            gwmac: [0; 6],
            state: LinkState::Down,
            dhcp_client: cfg.ip == 0,
            lease_expire_ms: 0,
            now_ms: 0,
            nsent: 0,
            nrecv: 0,
            ndrop: 0,
            nerr: 0,
            eport: 32768,
            txbuf: Vec::with_capacity(cfg.mtu + ETH_LEN),
            rx_ring,
            rx_recv,
            scratch: vec![0; cfg.mtu + ETH_LEN + 4],
            timer_1000ms: 0,
            states: HashMap::new(),
            dhcp_server: dhcp::ServerState::default(),
            started: std::time::Instant::now(),
            cfg,
        }
    }

    /// Producer handle for interrupt-driven drivers: push received
    /// frames here, the poller drains them.
    pub fn frame_sender(&self) -> FrameSender {
        self.rx_ring.sender()
    }

    pub const fn link_state(&self) -> LinkState {
        self.state
    }

    /// Host-order interface address (0 until DHCP binds).
    pub const fn ip(&self) -> u32 {
        self.ip
    }

    pub(crate) fn next_eport(&mut self) -> u16 {
        let p = self.eport;
        self.eport = if self.eport == u16::MAX { 32768 } else { self.eport + 1 };
        p
    }

    /// One reactor turn using the wall clock.
    pub fn poll(&mut self, ms: u64) {
        let now = self.started.elapsed().as_millis() as u64;
        self.poll_at(now, ms);
    }

    /// One reactor turn with an explicit clock (tests own time).
    pub fn poll_at(&mut self, now: u64, ms: u64) {
        self.now_ms = now;
        self.mgr.now_ms = now;
        if weft::timer_expired(&mut self.timer_1000ms, 1000, now) {
            self.tick_1hz();
        }
        self.pump_frames();
        self.tcp_timers();
        self.conn_sweep();
        self.mgr.poll_at(now, ms);
        // Free engine state for connections the sweep released
        let live = self.mgr.conn_ids();
        self.states.retain(|id, _| live.contains(id));
    }

    /// 1 Hz housekeeping: link transitions, DHCP progress, lease expiry,
    /// gateway ARP and statistics.
    fn tick_1hz(&mut self) {
        let up = self.driver.up();
        match (up, self.state) {
            (true, LinkState::Down) => {
                if self.dhcp_client {
                    self.ip = 0;
                    self.state = LinkState::Up;
                    debug!("link up, starting DHCP");
                    dhcp::discover(self);
                } else {
                    self.state = LinkState::Ready;
                    debug!(ip = %ip_str(self.ip), "link up");
                    self.arp_gateway();
                }
            }
            (false, s) if s != LinkState::Down => {
                debug!("link down");
                self.state = LinkState::Down;
                if self.dhcp_client {
                    self.ip = 0;
                }
                self.gwmac = [0; 6];
            }
            (true, LinkState::Up) => dhcp::discover(self),
            (true, LinkState::Req) => dhcp::discover(self), // re-run the exchange
            (true, LinkState::Ready) => {
                if self.dhcp_client && self.lease_expire_ms > 0 {
                    if self.now_ms >= self.lease_expire_ms {
                        debug!("DHCP lease expired");
                        self.ip = 0;
                        self.lease_expire_ms = 0;
                        self.state = LinkState::Up;
                        return;
                    }
                    // Rebind once inside the final 30 minutes
                    if self.lease_expire_ms - self.now_ms < 30 * 60 * 1000 {
                        dhcp::renew(self);
                    }
                }
                if self.gw != 0 && self.gwmac == [0; 6] {
                    self.arp_gateway();
                }
            }
            _ => {}
        }
        trace!(
            nsent = self.nsent,
            nrecv = self.nrecv,
            ndrop = self.ndrop,
            nerr = self.nerr,
            state = ?self.state,
            "if stats"
        );
    }

    fn pump_frames(&mut self) {
        let mut scratch = std::mem::take(&mut self.scratch);
        // Polled driver path
        loop {
            let n = self.driver.rx(&mut scratch);
            if n == 0 {
                break;
            }
            self.nrecv += 1;
            self.handle_frame_buf(&scratch[..n]);
        }
        // ISR ring path
        loop {
            let n = match self.rx_recv.peek() {
                Some(frame) if frame.len() <= scratch.len() => {
                    scratch[..frame.len()].copy_from_slice(frame);
                    frame.len()
                }
                Some(_) => 0, // oversized, dropped below
                None => break,
            };
            self.rx_recv.pop();
            if n == 0 {
                self.ndrop += 1;
                continue;
            }
            self.nrecv += 1;
            self.handle_frame_buf(&scratch[..n]);
        }
        self.scratch = scratch;
    }

    fn handle_frame_buf(&mut self, mut frame: &[u8]) {
        if self.cfg.crc_check && frame.len() > 4 {
            let (body, fcs) = frame.split_at(frame.len() - 4);
            if wire::crc32(body) != u32::from_le_bytes([fcs[0], fcs[1], fcs[2], fcs[3]]) {
                self.nerr += 1;
                return;
            }
            frame = body;
        }
        let Some((eth, payload)) = EthHdr::parse(frame) else {
            self.ndrop += 1;
            return;
        };
        if self.cfg.mac_check && eth.dst != self.mac && eth.dst != BROADCAST && eth.dst[0] & 1 == 0
        {
            self.ndrop += 1;
            return;
        }
        match eth.etype {
            ETYPE_ARP => self.handle_arp(payload),
            ETYPE_IP4 => self.handle_ip4(&eth, payload),
            ETYPE_IP6 => self.handle_ip6(payload),
            _ => self.ndrop += 1,
        }
    }

    fn handle_ip4(&mut self, eth: &EthHdr, payload: &[u8]) {
        let Some((ip, body)) = Ip4Hdr::parse(payload) else {
            self.ndrop += 1;
            return;
        };
        if ip.is_fragment() {
            self.ndrop += 1;
            // Reassembly is out of scope; a TCP conn losing a fragment
            // cannot recover, so error it out
            if ip.proto == PROTO_TCP
                && let Some((tcph, _)) = TcpHdr::parse(body)
                && let Some(id) = tcp::find_conn(self, ip.src, tcph.sport, tcph.dport, false)
            {
                self.mgr.fail_id(id, "Received fragmented packet");
            }
            return;
        }
        match ip.proto {
            PROTO_ICMP => self.handle_icmp(eth, &ip, body),
            PROTO_UDP => self.handle_udp(eth, &ip, body),
            PROTO_TCP => tcp::handle_tcp(self, eth, &ip, body),
            _ => self.ndrop += 1,
        }
    }

    /// Minimal IPv6 ingress: only UDP is demuxed; everything else is
    /// counted and dropped (no NDP, no forwarding).
    fn handle_ip6(&mut self, payload: &[u8]) {
        if payload.len() < 40 || payload[6] != PROTO_UDP {
            self.ndrop += 1;
            return;
        }
        let body = &payload[40..];
        let Some((udp, data)) = UdpHdr::parse(body) else {
            self.ndrop += 1;
            return;
        };
        let mut src = weft::Addr { is_ip6: true, ..Default::default() };
        src.ip.copy_from_slice(&payload[8..24]);
        src.set_host_port(udp.sport);
        self.deliver_udp(udp.dport, src, data);
    }

    fn handle_icmp(&mut self, eth: &EthHdr, ip: &Ip4Hdr, body: &[u8]) {
        // Echo request -> echo reply, nothing else
        if body.len() < 8 || body[0] != 8 || ip.dst != self.ip {
            self.ndrop += 1;
            return;
        }
        let mut reply = Vec::with_capacity(body.len());
        reply.push(0); // echo reply
        reply.push(0);
        reply.extend_from_slice(&[0, 0]); // csum slot
        reply.extend_from_slice(&body[4..]);
        let csum = wire::checksum(&reply);
        reply[2..4].copy_from_slice(&csum.to_be_bytes());
        self.tx_ip(eth.src, PROTO_ICMP, self.ip, ip.src, &reply);
    }

    fn handle_arp(&mut self, payload: &[u8]) {
        let Some(arp) = ArpPkt::parse(payload) else {
            self.ndrop += 1;
            return;
        };
        match arp.op {
            1 if arp.tpa == self.ip && self.ip != 0 => {
                // Request for our address
                let reply = ArpPkt {
                    op: 2,
                    sha: self.mac,
                    spa: self.ip,
                    tha: arp.sha,
                    tpa: arp.spa,
                };
                let mut out = Vec::with_capacity(ETH_LEN + wire::ARP_LEN);
                EthHdr { dst: arp.sha, src: self.mac, etype: ETYPE_ARP }.put(&mut out);
                reply.put(&mut out);
                self.tx_frame_vec(out);
            }
            2 => {
                if arp.spa == self.gw && self.gw != 0 {
                    debug!(mac = %mac_str(&arp.sha), "gateway MAC resolved");
                    self.gwmac = arp.sha;
                }
                tcp::arp_resolved(self, arp.spa, arp.sha);
            }
            _ => {}
        }
    }

    fn handle_udp(&mut self, eth: &EthHdr, ip: &Ip4Hdr, body: &[u8]) {
        let Some((udp, data)) = UdpHdr::parse(body) else {
            self.ndrop += 1;
            return;
        };
        if udp.dport == 68 && self.dhcp_client {
            dhcp::client_input(self, eth, data);
            return;
        }
        if udp.dport == 67 && self.cfg.enable_dhcp_server {
            dhcp::server_input(self, eth, data);
            return;
        }
        let src = weft::Addr::new4(ip.src.to_be_bytes(), udp.sport);
        self.deliver_udp(udp.dport, src, data);
    }

    /// Hands a datagram to the matching UDP connection: a connected
    /// client on the exact peer, else a listener on the port.
    fn deliver_udp(&mut self, dport: u16, src: weft::Addr, data: &[u8]) {
        let mut hit = None;
        for id in self.mgr.conn_ids() {
            let Some(c) = self.mgr.conn_mut(id) else { continue };
            if !matches!(c.sock, Sock::Stack) || !c.flags.contains(Flags::UDP) {
                continue;
            }
            if c.loc.host_port() != dport {
                continue;
            }
            if c.flags.contains(Flags::LISTENING) {
                hit.get_or_insert(id);
            } else if c.rem.ip == src.ip && c.rem.port == src.port {
                hit = Some(id);
                break;
            }
        }
        let Some(id) = hit else {
            self.ndrop += 1;
            return;
        };
        if let Some(c) = self.mgr.conn_mut(id) {
            if c.flags.contains(Flags::LISTENING) {
                c.rem = src;
            }
            c.recv.push(data);
        }
        self.mgr.fire(id, &Event::Read(data.len()));
    }

    /// Sweeps connections for engine work: fresh connects, pending
    /// sends, draining and closing.
    fn conn_sweep(&mut self) {
        for id in self.mgr.conn_ids() {
            let Some(c) = self.mgr.conn_mut(id) else { continue };
            if !matches!(c.sock, Sock::Stack) {
                continue;
            }
            let flags = c.flags;
            if flags.contains(Flags::LISTENING) {
                continue;
            }
            if flags.contains(Flags::CONNECTING) && !flags.contains(Flags::ARP_LOOKING) {
                if self.state != LinkState::Ready {
                    self.mgr.fail_id(id, "net down");
                    continue;
                }
                tcp::start_connect(self, id);
                continue;
            }
            if flags.contains(Flags::ARP_LOOKING) || flags.contains(Flags::CONNECTING) {
                continue;
            }
            if self.states.contains_key(&id) || flags.contains(Flags::UDP) {
                tcp::drive_io(self, id);
            }
        }
    }

    fn tcp_timers(&mut self) {
        let due: Vec<(u64, TimerKind)> = self
            .states
            .iter()
            .filter(|(_, s)| self.now_ms > s.timer && s.timer != 0)
            .map(|(id, s)| (*id, s.ttype))
            .collect();
        for (id, kind) in due {
            tcp::timer_fired(self, id, kind);
        }
    }

    pub(crate) fn arp_gateway(&mut self) {
        if self.gw != 0 {
            self.arp_request(self.gw);
        }
    }

    pub(crate) fn arp_request(&mut self, target: u32) {
        let req = ArpPkt { op: 1, sha: self.mac, spa: self.ip, tha: [0; 6], tpa: target };
        let mut out = Vec::with_capacity(ETH_LEN + wire::ARP_LEN);
        EthHdr { dst: BROADCAST, src: self.mac, etype: ETYPE_ARP }.put(&mut out);
        req.put(&mut out);
        self.tx_frame_vec(out);
    }

    /// Builds and transmits one Ethernet+IPv4 frame. The payload is
    /// clipped so the IP packet never exceeds the MTU (UDP callers are
    /// expected to have truncated already; TCP segments are sized to the
    /// MSS and never hit the clip).
    pub(crate) fn tx_ip(&mut self, dst_mac: [u8; 6], proto: u8, src: u32, dst: u32, payload: &[u8]) {
        let max = self.cfg.mtu - wire::IP4_LEN;
        let payload = if payload.len() > max {
            warn!(len = payload.len(), max, "IP payload truncated");
            &payload[..max]
        } else {
            payload
        };
        let mut out = std::mem::take(&mut self.txbuf);
        out.clear();
        EthHdr { dst: dst_mac, src: self.mac, etype: ETYPE_IP4 }.put(&mut out);
        Ip4Hdr::put(proto, src, dst, payload.len(), &mut out);
        out.extend_from_slice(payload);
        self.tx_frame(&out);
        self.txbuf = out;
    }

    pub(crate) fn tx_frame(&mut self, frame: &[u8]) {
        if self.driver.tx(frame) == 0 {
            self.nerr += 1;
            trace!(len = frame.len(), "tx backpressure");
        } else {
            self.nsent += 1;
        }
    }

    fn tx_frame_vec(&mut self, frame: Vec<u8>) {
        self.tx_frame(&frame);
    }

    /// Next-hop MAC for `dst`: on-link peers need ARP, everything else
    /// goes through the gateway.
    pub(crate) fn route(&self, dst: u32) -> Route {
        if self.mask != 0 && (dst ^ self.ip) & self.mask == 0 {
            Route::OnLink
        } else if self.gwmac != [0; 6] {
            Route::Gateway(self.gwmac)
        } else {
            Route::NeedGatewayMac
        }
    }
}

pub(crate) enum Route {
    OnLink,
    Gateway([u8; 6]),
    NeedGatewayMac,
}

pub(crate) fn ip_str(ip: u32) -> String {
    let b = ip.to_be_bytes();
    format!("{}.{}.{}.{}", b[0], b[1], b[2], b[3])
}

pub(crate) fn mac_str(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}
