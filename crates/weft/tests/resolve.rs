use std::{cell::RefCell, rc::Rc};

use weft::{Event, Manager, handler, sntp};

/// Answers one A query with 127.0.0.1, then accepts one TCP connection.
fn fake_dns_and_target() -> (u16, u16, std::thread::JoinHandle<()>) {
    let dns = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let dns_port = dns.local_addr().unwrap().port();
    let target = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let target_port = target.local_addr().unwrap().port();
    let t = std::thread::spawn(move || {
        let mut buf = [0u8; 512];
        let (n, from) = dns.recv_from(&mut buf).unwrap();
        let mut resp = buf[..n].to_vec();
        resp[2] = 0x81; // QR + RD
        resp[3] = 0x80; // RA
        resp[7] = 1; // one answer
        resp.extend_from_slice(&[0xc0, 0x0c]); // name pointer
        resp.extend_from_slice(&1u16.to_be_bytes()); // A
        resp.extend_from_slice(&1u16.to_be_bytes()); // IN
        resp.extend_from_slice(&60u32.to_be_bytes());
        resp.extend_from_slice(&4u16.to_be_bytes());
        resp.extend_from_slice(&[127, 0, 0, 1]);
        dns.send_to(&resp, from).unwrap();
        let _ = target.accept();
    });
    (dns_port, target_port, t)
}

#[test]
fn hostname_resolves_then_connects() {
    let (dns_port, target_port, t) = fake_dns_and_target();

    let mut mgr = Manager::new();
    mgr.dns4 = Some(format!("udp://127.0.0.1:{dns_port}"));
    let state: Rc<RefCell<Vec<&'static str>>> = Rc::default();
    let s = Rc::clone(&state);
    mgr.connect(
        &format!("tcp://files.example:{target_port}"),
        handler(move |_, c, ev| match ev {
            Event::Resolve => {
                assert_eq!(c.rem.ip4(), [127, 0, 0, 1]);
                s.borrow_mut().push("resolve");
            }
            Event::Connect => s.borrow_mut().push("connect"),
            Event::Error(e) => panic!("unexpected error: {e}"),
            _ => {}
        }),
    )
    .unwrap();

    for _ in 0..500 {
        mgr.poll(2);
        if state.borrow().contains(&"connect") {
            break;
        }
    }
    t.join().unwrap();
    assert_eq!(state.borrow().as_slice(), ["resolve", "connect"]);
}

#[test]
fn lookup_timeout_errors_out() {
    // A DNS server that never answers
    let dns = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let dns_port = dns.local_addr().unwrap().port();

    let mut mgr = Manager::new();
    mgr.dns4 = Some(format!("udp://127.0.0.1:{dns_port}"));
    mgr.dns_timeout_ms = 50;
    let err: Rc<RefCell<Option<String>>> = Rc::default();
    let e = Rc::clone(&err);
    mgr.connect(
        "tcp://nxdomain.example:80",
        handler(move |_, _, ev| {
            if let Event::Error(msg) = ev {
                *e.borrow_mut() = Some((*msg).to_string());
            }
        }),
    )
    .unwrap();

    for _ in 0..500 {
        mgr.poll(2);
        if err.borrow().is_some() {
            break;
        }
    }
    assert_eq!(err.borrow().as_deref(), Some("DNS timeout"));
}

#[test]
fn sntp_reply_surfaces_epoch_ms() {
    let srv = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = srv.local_addr().unwrap().port();
    let t = std::thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (_, from) = srv.recv_from(&mut buf).unwrap();
        let mut resp = [0u8; 48];
        resp[0] = (4 << 3) | 4; // VN=4, server
        resp[1] = 2; // stratum
        // 2024-01-01T00:00:00Z in NTP seconds
        resp[40..44].copy_from_slice(&3_913_056_000u32.to_be_bytes());
        srv.send_to(&resp, from).unwrap();
    });

    let mut mgr = Manager::new();
    let got: Rc<RefCell<Option<u64>>> = Rc::default();
    let g = Rc::clone(&got);
    sntp::connect(
        &mut mgr,
        Some(&format!("udp://127.0.0.1:{port}")),
        handler(move |_, _, ev| {
            if let Event::SntpTime(ms) = ev {
                *g.borrow_mut() = Some(*ms);
            }
        }),
    )
    .unwrap();

    for _ in 0..500 {
        mgr.poll(2);
        if got.borrow().is_some() {
            break;
        }
    }
    t.join().unwrap();
    assert_eq!(*got.borrow(), Some(1_704_067_200_000));
}
