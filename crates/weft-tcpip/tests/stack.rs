use std::{cell::RefCell, rc::Rc};

use weft::{Event, Manager, handler};
use weft_tcpip::{
    Iface, IfaceCfg, LinkState, MockDriver,
    wire::{self, ETYPE_IP4, EthHdr, Ip4Hdr, TcpHdr, UdpHdr, tcpflags},
};

const OUR_MAC: [u8; 6] = [2, 0, 0, 0, 0, 1];
const PEER_MAC: [u8; 6] = [2, 0, 0, 0, 0, 9];
const OUR_IP: u32 = u32::from_be_bytes([192, 0, 2, 2]);
const PEER_IP: u32 = u32::from_be_bytes([192, 0, 2, 3]);
const GW_IP: u32 = u32::from_be_bytes([192, 0, 2, 1]);

fn static_cfg() -> IfaceCfg {
    IfaceCfg {
        mac: OUR_MAC,
        ip: OUR_IP,
        mask: u32::from_be_bytes([255, 255, 255, 0]),
        gw: GW_IP,
        ..IfaceCfg::default()
    }
}

fn tcp_frame(seq: u32, ack: u32, flags: u8, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut seg = Vec::new();
    TcpHdr::put(sport, dport, seq, ack, flags, 6000, PEER_IP, OUR_IP, payload, &mut seg);
    let mut frame = Vec::new();
    EthHdr { dst: OUR_MAC, src: PEER_MAC, etype: ETYPE_IP4 }.put(&mut frame);
    Ip4Hdr::put(wire::PROTO_TCP, PEER_IP, OUR_IP, seg.len(), &mut frame);
    frame.extend_from_slice(&seg);
    frame
}

/// Decoded TCP segments the interface transmitted.
fn sent_tcp(handle: &weft_tcpip::MockHandle) -> Vec<(TcpHdr, Vec<u8>)> {
    handle
        .take_tx()
        .iter()
        .filter_map(|f| {
            let (eth, rest) = EthHdr::parse(f)?;
            if eth.etype != ETYPE_IP4 {
                return None;
            }
            let (ip, body) = Ip4Hdr::parse(rest)?;
            if ip.proto != wire::PROTO_TCP {
                return None;
            }
            let (tcp, payload) = TcpHdr::parse(body)?;
            Some((tcp, payload.to_vec()))
        })
        .collect()
}

fn ready_iface() -> (Iface, weft_tcpip::MockHandle, Rc<RefCell<Vec<String>>>) {
    let (drv, handle) = MockDriver::new();
    let mut mgr = Manager::bare();
    let events: Rc<RefCell<Vec<String>>> = Rc::default();
    let ev = Rc::clone(&events);
    mgr.listen(
        "tcp://0.0.0.0:80",
        handler(move |_, c, e| match e {
            Event::Accept => ev.borrow_mut().push("accept".into()),
            Event::Read(_) => {
                let msg = String::from_utf8_lossy(c.recv.as_slice()).to_string();
                c.recv.clear();
                ev.borrow_mut().push(format!("read:{msg}"));
                c.send(b"yo");
            }
            Event::Close => ev.borrow_mut().push("close".into()),
            Event::Error(e) => ev.borrow_mut().push(format!("err:{e}")),
            _ => {}
        }),
    )
    .unwrap();
    let mut ifc = Iface::new(static_cfg(), Box::new(drv), mgr);
    ifc.poll_at(0, 0);
    ifc.poll_at(1000, 0); // 1 Hz tick: link up, static config goes Ready
    assert_eq!(ifc.link_state(), LinkState::Ready);
    handle.take_tx(); // discard the gateway ARP
    (ifc, handle, events)
}

#[test]
fn accept_handshake_and_data() {
    let (mut ifc, handle, events) = ready_iface();

    // SYN: expect a SYN-ACK with ack = S+1 and seq derived from the port
    handle.push_rx(&tcp_frame(1000, 0, tcpflags::SYN, 5000, 80, &[]));
    ifc.poll_at(1010, 0);
    let sent = sent_tcp(&handle);
    assert_eq!(sent.len(), 1);
    let (synack, _) = &sent[0];
    assert_eq!(synack.flags, tcpflags::SYN | tcpflags::ACK);
    assert_eq!(synack.ack, 1001);
    assert_eq!(synack.seq, 80);
    assert!(events.borrow().is_empty()); // nothing allocated yet

    // Handshake ACK materializes the connection
    handle.push_rx(&tcp_frame(1001, 81, tcpflags::ACK, 5000, 80, &[]));
    ifc.poll_at(1020, 0);
    assert_eq!(events.borrow().as_slice(), ["accept"]);

    // In-order data reaches the handler; the reply is segmented out
    handle.push_rx(&tcp_frame(1001, 81, tcpflags::PSH | tcpflags::ACK, 5000, 80, b"hi"));
    ifc.poll_at(1030, 0);
    assert!(events.borrow().contains(&"read:hi".to_string()));
    let sent = sent_tcp(&handle);
    let data = sent.iter().find(|(_, p)| !p.is_empty()).expect("data segment");
    assert_eq!(data.1, b"yo");
    assert_eq!(data.0.seq, 81);
    assert_eq!(data.0.ack, 1003);
}

#[test]
fn duplicate_seq_is_acked_without_delivery() {
    let (mut ifc, handle, events) = ready_iface();
    handle.push_rx(&tcp_frame(1000, 0, tcpflags::SYN, 5000, 80, &[]));
    ifc.poll_at(1010, 0);
    handle.push_rx(&tcp_frame(1001, 81, tcpflags::ACK, 5000, 80, &[]));
    ifc.poll_at(1020, 0);
    handle.take_tx();

    // Keep-alive probe: seq one behind the expected value
    handle.push_rx(&tcp_frame(1000, 81, tcpflags::ACK, 5000, 80, &[]));
    ifc.poll_at(1030, 0);
    let sent = sent_tcp(&handle);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.flags, tcpflags::ACK);
    assert_eq!(sent[0].0.ack, 1001);
    assert!(!events.borrow().iter().any(|e| e.starts_with("read")));
}

#[test]
fn unknown_peer_gets_rst() {
    let (mut ifc, handle, _) = ready_iface();
    // ACK to a port nobody listens on
    handle.push_rx(&tcp_frame(7, 9, tcpflags::ACK, 5000, 8080, &[]));
    ifc.poll_at(1010, 0);
    let sent = sent_tcp(&handle);
    assert_eq!(sent.len(), 1);
    assert_ne!(sent[0].0.flags & tcpflags::RST, 0);
}

#[test]
fn peer_fin_is_answered_and_closes() {
    let (mut ifc, handle, events) = ready_iface();
    handle.push_rx(&tcp_frame(1000, 0, tcpflags::SYN, 5000, 80, &[]));
    ifc.poll_at(1010, 0);
    handle.push_rx(&tcp_frame(1001, 81, tcpflags::ACK, 5000, 80, &[]));
    ifc.poll_at(1020, 0);
    handle.take_tx();

    handle.push_rx(&tcp_frame(1001, 81, tcpflags::FIN | tcpflags::ACK, 5000, 80, &[]));
    ifc.poll_at(1030, 0);
    let sent = sent_tcp(&handle);
    assert!(sent.iter().any(|(t, _)| t.flags & tcpflags::FIN != 0), "FIN|ACK expected");
    // Peer acks our FIN; the connection is released
    handle.push_rx(&tcp_frame(1002, 82, tcpflags::ACK, 5000, 80, &[]));
    ifc.poll_at(1040, 0);
    assert!(events.borrow().contains(&"close".to_string()));
}

#[test]
fn peer_rst_fails_connection() {
    let (mut ifc, handle, events) = ready_iface();
    handle.push_rx(&tcp_frame(1000, 0, tcpflags::SYN, 5000, 80, &[]));
    ifc.poll_at(1010, 0);
    handle.push_rx(&tcp_frame(1001, 81, tcpflags::ACK, 5000, 80, &[]));
    ifc.poll_at(1020, 0);

    handle.push_rx(&tcp_frame(1001, 81, tcpflags::RST, 5000, 80, &[]));
    ifc.poll_at(1030, 0);
    assert!(events.borrow().contains(&"err:peer RST".to_string()));
}

#[test]
fn fragmented_packets_are_dropped() {
    let (mut ifc, handle, _) = ready_iface();
    let mut frame = tcp_frame(1, 0, tcpflags::SYN, 5000, 80, &[]);
    frame[wire::ETH_LEN + 6] = 0x20; // MF bit
    // re-checksum the mangled IP header
    frame[wire::ETH_LEN + 10] = 0;
    frame[wire::ETH_LEN + 11] = 0;
    let csum = wire::checksum(&frame[wire::ETH_LEN..wire::ETH_LEN + 20]);
    frame[wire::ETH_LEN + 10..wire::ETH_LEN + 12].copy_from_slice(&csum.to_be_bytes());
    handle.push_rx(&frame);
    ifc.poll_at(1010, 0);
    assert!(sent_tcp(&handle).is_empty());
}

#[test]
fn icmp_echo_is_answered() {
    let (mut ifc, handle, _) = ready_iface();
    let mut icmp = vec![8u8, 0, 0, 0, 0, 1, 0, 7]; // echo request, id 1, seq 7
    icmp.extend_from_slice(b"payload");
    let csum = wire::checksum(&icmp);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());
    let mut frame = Vec::new();
    EthHdr { dst: OUR_MAC, src: PEER_MAC, etype: ETYPE_IP4 }.put(&mut frame);
    Ip4Hdr::put(wire::PROTO_ICMP, PEER_IP, OUR_IP, icmp.len(), &mut frame);
    frame.extend_from_slice(&icmp);
    handle.push_rx(&frame);
    ifc.poll_at(1010, 0);

    let tx = handle.take_tx();
    assert_eq!(tx.len(), 1);
    let (_, rest) = EthHdr::parse(&tx[0]).unwrap();
    let (ip, body) = Ip4Hdr::parse(rest).unwrap();
    assert_eq!(ip.proto, wire::PROTO_ICMP);
    assert_eq!(ip.dst, PEER_IP);
    assert_eq!(body[0], 0); // echo reply
    assert_eq!(&body[8..], b"payload");
}

#[test]
fn arp_request_for_our_ip_is_answered() {
    let (mut ifc, handle, _) = ready_iface();
    let mut frame = Vec::new();
    EthHdr { dst: wire::BROADCAST, src: PEER_MAC, etype: wire::ETYPE_ARP }.put(&mut frame);
    wire::ArpPkt { op: 1, sha: PEER_MAC, spa: PEER_IP, tha: [0; 6], tpa: OUR_IP }.put(&mut frame);
    handle.push_rx(&frame);
    ifc.poll_at(1010, 0);

    let tx = handle.take_tx();
    assert_eq!(tx.len(), 1);
    let (eth, rest) = EthHdr::parse(&tx[0]).unwrap();
    assert_eq!(eth.dst, PEER_MAC);
    let arp = wire::ArpPkt::parse(rest).unwrap();
    assert_eq!(arp.op, 2);
    assert_eq!(arp.sha, OUR_MAC);
    assert_eq!(arp.spa, OUR_IP);
    assert_eq!(arp.tpa, PEER_IP);
}

#[test]
fn udp_listener_sees_datagrams() {
    let (drv, handle) = MockDriver::new();
    let mut mgr = Manager::bare();
    let got: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
    let g = Rc::clone(&got);
    mgr.listen(
        "udp://0.0.0.0:5353",
        handler(move |_, c, e| {
            if let Event::Read(_) = e {
                g.borrow_mut().push(c.recv.as_slice().to_vec());
                c.recv.clear();
            }
        }),
    )
    .unwrap();
    let mut ifc = Iface::new(static_cfg(), Box::new(drv), mgr);
    ifc.poll_at(0, 0);
    ifc.poll_at(1000, 0);

    let mut dgram = Vec::new();
    UdpHdr::put(9999, 5353, PEER_IP, OUR_IP, b"mdns?", &mut dgram);
    let mut frame = Vec::new();
    EthHdr { dst: OUR_MAC, src: PEER_MAC, etype: ETYPE_IP4 }.put(&mut frame);
    Ip4Hdr::put(wire::PROTO_UDP, PEER_IP, OUR_IP, dgram.len(), &mut frame);
    frame.extend_from_slice(&dgram);
    handle.push_rx(&frame);
    ifc.poll_at(1010, 0);

    assert_eq!(got.borrow().as_slice(), [b"mdns?".to_vec()]);
    let _ = handle.take_tx();
}
