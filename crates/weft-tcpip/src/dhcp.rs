//! DHCP client (RFC 2131 DISCOVER/REQUEST/BOUND/RENEW) and a minimal
//! lease server for the built-in stack.
//!
//! Transactions are tagged with the low 4 bytes of our MAC, so every
//! response can be matched without extra state.

use tracing::{debug, trace};

use crate::{
    iface::{Iface, LinkState, ip_str},
    wire::{BROADCAST, ETH_LEN, ETYPE_IP4, EthHdr, Ip4Hdr, PROTO_UDP, UdpHdr},
};

const MAGIC: u32 = 0x6382_5363;
/// BOOTP header (through `file`) plus the magic cookie.
const HDR_LEN: usize = 240;

const DISCOVER: u8 = 1;
const OFFER: u8 = 2;
const REQUEST: u8 = 3;
const ACK: u8 = 5;
const NAK: u8 = 6;

const OPT_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE: u8 = 51;
const OPT_MSG_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAM_LIST: u8 = 55;
const OPT_END: u8 = 0xff;

fn xid_of(mac: &[u8; 6]) -> u32 {
    u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]])
}

/// Decoded subset of a DHCP message.
#[derive(Default, Clone, Copy, Debug)]
pub struct DhcpMsg {
    pub op: u8,
    pub xid: u32,
    pub yiaddr: u32,
    pub chaddr: [u8; 6],
    pub msg_type: u8,
    pub mask: u32,
    pub router: u32,
    pub dns: u32,
    pub lease_s: u32,
    pub server_id: u32,
    pub requested_ip: u32,
}

pub fn parse(data: &[u8]) -> Option<DhcpMsg> {
    if data.len() < HDR_LEN {
        return None;
    }
    if u32::from_be_bytes(data[236..240].try_into().ok()?) != MAGIC {
        return None;
    }
    let mut m = DhcpMsg {
        op: data[0],
        xid: u32::from_be_bytes(data[4..8].try_into().ok()?),
        yiaddr: u32::from_be_bytes(data[16..20].try_into().ok()?),
        chaddr: data[28..34].try_into().ok()?,
        ..DhcpMsg::default()
    };
    let mut p = HDR_LEN;
    // Options: tag, length, value; 0xff terminates
    while p + 1 < data.len() {
        let tag = data[p];
        if tag == OPT_END {
            break;
        }
        if tag == 0 {
            p += 1;
            continue;
        }
        let len = data[p + 1] as usize;
        let val = data.get(p + 2..p + 2 + len)?;
        match (tag, len) {
            (OPT_MSG_TYPE, 1) => m.msg_type = val[0],
            (OPT_MASK, 4) => m.mask = u32::from_be_bytes(val.try_into().ok()?),
            (OPT_ROUTER, 4..) => m.router = u32::from_be_bytes(val[..4].try_into().ok()?),
            (OPT_DNS, 4..) => m.dns = u32::from_be_bytes(val[..4].try_into().ok()?),
            (OPT_LEASE, 4) => m.lease_s = u32::from_be_bytes(val.try_into().ok()?),
            (OPT_SERVER_ID, 4) => m.server_id = u32::from_be_bytes(val.try_into().ok()?),
            (OPT_REQUESTED_IP, 4) => m.requested_ip = u32::from_be_bytes(val.try_into().ok()?),
            _ => {}
        }
        p += 2 + len;
    }
    Some(m)
}

fn header(op: u8, xid: u32, ciaddr: u32, yiaddr: u32, mac: &[u8; 6], out: &mut Vec<u8>) {
    out.push(op);
    out.push(1); // ethernet
    out.push(6);
    out.push(0);
    out.extend_from_slice(&xid.to_be_bytes());
    out.extend_from_slice(&[0; 2]); // secs
    out.extend_from_slice(&0x8000u16.to_be_bytes()); // broadcast reply
    out.extend_from_slice(&ciaddr.to_be_bytes());
    out.extend_from_slice(&yiaddr.to_be_bytes());
    out.extend_from_slice(&[0; 8]); // siaddr, giaddr
    out.extend_from_slice(mac);
    out.resize(out.len() + 10 + 64 + 128, 0); // chaddr pad, sname, file
    out.extend_from_slice(&MAGIC.to_be_bytes());
}

fn opt(out: &mut Vec<u8>, tag: u8, val: &[u8]) {
    out.push(tag);
    out.push(val.len() as u8);
    out.extend_from_slice(val);
}

/// Broadcasts one UDP 68->67 (or 67->68) datagram outside any
/// connection.
fn tx_dhcp(ifc: &mut Iface, dst_mac: [u8; 6], src_ip: u32, sport: u16, dport: u16, msg: &[u8]) {
    let mut dgram = Vec::with_capacity(msg.len() + 8);
    UdpHdr::put(sport, dport, src_ip, u32::MAX, msg, &mut dgram);
    let mut frame = Vec::with_capacity(ETH_LEN + 20 + dgram.len());
    EthHdr { dst: dst_mac, src: ifc.mac, etype: ETYPE_IP4 }.put(&mut frame);
    Ip4Hdr::put(PROTO_UDP, src_ip, u32::MAX, dgram.len(), &mut frame);
    frame.extend_from_slice(&dgram);
    ifc.tx_frame(&frame);
}

// ---- client -------------------------------------------------------------

pub(crate) fn discover(ifc: &mut Iface) {
    let xid = xid_of(&ifc.mac);
    let mac = ifc.mac;
    let mut msg = Vec::with_capacity(HDR_LEN + 16);
    header(1, xid, 0, 0, &mac, &mut msg);
    opt(&mut msg, OPT_MSG_TYPE, &[DISCOVER]);
    opt(&mut msg, OPT_PARAM_LIST, &[OPT_MASK, OPT_ROUTER, OPT_DNS, OPT_LEASE]);
    msg.push(OPT_END);
    trace!("DHCP discover");
    tx_dhcp(ifc, BROADCAST, 0, 68, 67, &msg);
}

fn request(ifc: &mut Iface, yiaddr: u32, server_id: u32) {
    let xid = xid_of(&ifc.mac);
    let mac = ifc.mac;
    let mut msg = Vec::with_capacity(HDR_LEN + 20);
    header(1, xid, 0, 0, &mac, &mut msg);
    opt(&mut msg, OPT_MSG_TYPE, &[REQUEST]);
    opt(&mut msg, OPT_REQUESTED_IP, &yiaddr.to_be_bytes());
    if server_id != 0 {
        opt(&mut msg, OPT_SERVER_ID, &server_id.to_be_bytes());
    }
    msg.push(OPT_END);
    trace!(ip = %ip_str(yiaddr), "DHCP request");
    tx_dhcp(ifc, BROADCAST, 0, 68, 67, &msg);
}

/// Rebind attempt while bound, inside the final stretch of the lease.
pub(crate) fn renew(ifc: &mut Iface) {
    let (ip, xid) = (ifc.ip, xid_of(&ifc.mac));
    let mac = ifc.mac;
    let mut msg = Vec::with_capacity(HDR_LEN + 12);
    header(1, xid, ip, 0, &mac, &mut msg);
    opt(&mut msg, OPT_MSG_TYPE, &[REQUEST]);
    msg.push(OPT_END);
    tx_dhcp(ifc, BROADCAST, ip, 68, 67, &msg);
}

pub(crate) fn client_input(ifc: &mut Iface, eth: &EthHdr, data: &[u8]) {
    let Some(m) = parse(data) else {
        ifc.ndrop += 1;
        return;
    };
    if m.op != 2 || m.xid != xid_of(&ifc.mac) {
        return;
    }
    match m.msg_type {
        OFFER if ifc.state == LinkState::Up => {
            // A usable offer names an address, a gateway and a lease
            if m.yiaddr == 0 || m.router == 0 || m.lease_s == 0 {
                return;
            }
            debug!(ip = %ip_str(m.yiaddr), "DHCP offer");
            ifc.state = LinkState::Req;
            request(ifc, m.yiaddr, m.server_id);
        }
        ACK => {
            ifc.ip = m.yiaddr;
            if m.mask != 0 {
                ifc.mask = m.mask;
            }
            if m.router != 0 {
                ifc.gw = m.router;
            }
            ifc.lease_expire_ms = ifc.now_ms + u64::from(m.lease_s) * 1000;
            ifc.state = LinkState::Ready;
            // Source MAC serves as the gateway MAC until ARP resolves it
            ifc.gwmac = eth.src;
            debug!(
                ip = %ip_str(ifc.ip),
                gw = %ip_str(ifc.gw),
                lease_s = m.lease_s,
                "DHCP bound, interface ready"
            );
            ifc.arp_gateway();
        }
        NAK => {
            debug!("DHCP NAK, restarting");
            ifc.ip = 0;
            ifc.lease_expire_ms = 0;
            ifc.state = LinkState::Up;
        }
        _ => {}
    }
}

// ---- server -------------------------------------------------------------

/// Lease table of the built-in DHCP server: MAC to host index.
#[derive(Default)]
pub struct ServerState {
    leases: Vec<[u8; 6]>,
}

impl ServerState {
    /// Stable host number for a client, first-come first-served,
    /// starting at .100.
    fn host_for(&mut self, mac: [u8; 6]) -> u32 {
        let idx = self.leases.iter().position(|m| *m == mac).unwrap_or_else(|| {
            self.leases.push(mac);
            self.leases.len() - 1
        });
        100 + idx as u32
    }
}

pub(crate) fn server_input(ifc: &mut Iface, eth: &EthHdr, data: &[u8]) {
    let Some(m) = parse(data) else {
        ifc.ndrop += 1;
        return;
    };
    if m.op != 1 || ifc.ip == 0 {
        return;
    }
    let reply_type = match m.msg_type {
        DISCOVER => OFFER,
        REQUEST => ACK,
        _ => return,
    };
    let host = ifc.dhcp_server.host_for(m.chaddr);
    let yiaddr = (ifc.ip & ifc.mask) | (host & !ifc.mask);
    let our_ip = ifc.ip;
    let mask = ifc.mask;
    let mut msg = Vec::with_capacity(HDR_LEN + 40);
    header(2, m.xid, 0, yiaddr, &m.chaddr, &mut msg);
    opt(&mut msg, OPT_MSG_TYPE, &[reply_type]);
    opt(&mut msg, OPT_SERVER_ID, &our_ip.to_be_bytes());
    opt(&mut msg, OPT_LEASE, &3600u32.to_be_bytes());
    opt(&mut msg, OPT_MASK, &mask.to_be_bytes());
    opt(&mut msg, OPT_ROUTER, &our_ip.to_be_bytes());
    opt(&mut msg, OPT_DNS, &our_ip.to_be_bytes());
    msg.push(OPT_END);
    trace!(client = ?m.chaddr, ip = %ip_str(yiaddr), t = reply_type, "DHCP serve");
    tx_dhcp(ifc, eth.src, our_ip, 67, 68, &msg);
}
