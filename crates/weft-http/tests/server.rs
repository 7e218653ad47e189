use std::{
    cell::RefCell,
    io::{Read, Write},
    rc::Rc,
    thread,
};

use weft::{Event, Manager, handler};
use weft_http::{ServeOpts, StdFs, reply, serve_dir, ws};

fn spin<F: FnMut() -> bool>(mgr: &mut Manager, mut done: F) {
    for _ in 0..1000 {
        mgr.poll(2);
        if done() {
            return;
        }
    }
    panic!("test did not settle");
}

#[test]
fn echo_request_response() {
    let mut mgr = Manager::new();
    let lid = weft_http::listen(
        &mut mgr,
        "http://127.0.0.1:0",
        handler(|_, c, ev| {
            if let Event::HttpMsg(hm) = ev {
                assert_eq!(hm.method, b"GET");
                assert_eq!(hm.uri, b"/x");
                assert_eq!(hm.query, b"");
                reply(c, 200, "", b"hi");
                c.drain();
            }
        }),
    )
    .unwrap();
    let port = mgr.conn_mut(lid).unwrap().loc.host_port();

    let cli = thread::spawn(move || {
        let mut s = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        s.write_all(b"GET /x HTTP/1.0\r\nHost: h\r\n\r\n").unwrap();
        let mut buf = Vec::new();
        s.read_to_end(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf).to_string();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("Content-Length: 2\r\n"), "{text}");
        assert!(text.ends_with("\r\n\r\nhi"), "{text}");
    });

    spin(&mut mgr, || cli.is_finished());
    cli.join().unwrap();
}

#[test]
fn zero_length_body_fires_immediately() {
    let mut mgr = Manager::new();
    let bodies: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
    let b = Rc::clone(&bodies);
    let lid = weft_http::listen(
        &mut mgr,
        "http://127.0.0.1:0",
        handler(move |_, c, ev| {
            if let Event::HttpMsg(hm) = ev {
                b.borrow_mut().push(hm.body.to_vec());
                reply(c, 200, "", b"");
                c.drain();
            }
        }),
    )
    .unwrap();
    let port = mgr.conn_mut(lid).unwrap().loc.host_port();

    let cli = thread::spawn(move || {
        let mut s = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        s.write_all(b"POST /z HTTP/1.1\r\nContent-Length: 0\r\n\r\n").unwrap();
        let mut buf = Vec::new();
        s.read_to_end(&mut buf).unwrap();
    });

    spin(&mut mgr, || cli.is_finished());
    cli.join().unwrap();
    assert_eq!(bodies.borrow().as_slice(), [Vec::<u8>::new()]);
}

#[test]
fn chunked_body_reassembles() {
    let mut mgr = Manager::new();
    let got: Rc<RefCell<Vec<(usize, Vec<u8>)>>> = Rc::default();
    let g = Rc::clone(&got);
    let lid = weft_http::listen(
        &mut mgr,
        "http://127.0.0.1:0",
        handler(move |_, c, ev| match ev {
            Event::HttpChunk(hm) => g.borrow_mut().push((1, hm.body.to_vec())),
            Event::HttpMsg(hm) => {
                g.borrow_mut().push((2, hm.body.to_vec()));
                reply(c, 200, "", b"");
                c.drain();
            }
            _ => {}
        }),
    )
    .unwrap();
    let port = mgr.conn_mut(lid).unwrap().loc.host_port();

    let cli = thread::spawn(move || {
        let mut s = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        s.write_all(
            b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .unwrap();
        let mut buf = Vec::new();
        s.read_to_end(&mut buf).unwrap();
    });

    spin(&mut mgr, || cli.is_finished());
    cli.join().unwrap();
    let got = got.borrow();
    assert_eq!(got[0], (1, b"Wiki".to_vec()));
    assert_eq!(got[1], (1, b"pedia".to_vec()));
    assert_eq!(got[2], (2, b"Wikipedia".to_vec()));
}

#[test]
fn empty_chunked_body() {
    let mut mgr = Manager::new();
    let got: Rc<RefCell<Option<usize>>> = Rc::default();
    let g = Rc::clone(&got);
    let lid = weft_http::listen(
        &mut mgr,
        "http://127.0.0.1:0",
        handler(move |_, c, ev| {
            if let Event::HttpMsg(hm) = ev {
                *g.borrow_mut() = Some(hm.body.len());
                reply(c, 200, "", b"");
                c.drain();
            }
        }),
    )
    .unwrap();
    let port = mgr.conn_mut(lid).unwrap().loc.host_port();

    let cli = thread::spawn(move || {
        let mut s = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        s.write_all(b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n").unwrap();
        let mut buf = Vec::new();
        s.read_to_end(&mut buf).unwrap();
    });

    spin(&mut mgr, || cli.is_finished());
    cli.join().unwrap();
    assert_eq!(*got.borrow(), Some(0));
}

#[test]
fn websocket_upgrade_and_ping() {
    let mut mgr = Manager::new();
    let ctl: Rc<RefCell<Vec<u8>>> = Rc::default();
    let ctl2 = Rc::clone(&ctl);
    let lid = weft_http::listen(
        &mut mgr,
        "http://127.0.0.1:0",
        handler(move |mgr, c, ev| match ev {
            Event::HttpMsg(hm) if hm.uri == b"/ws" => ws::upgrade(mgr, c, hm, ""),
            Event::WsCtl(wm) => ctl2.borrow_mut().push(wm.flags),
            _ => {}
        }),
    )
    .unwrap();
    let port = mgr.conn_mut(lid).unwrap().loc.host_port();

    let cli = thread::spawn(move || {
        let mut s = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        s.write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: h\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .unwrap();
        // Read the 101 head
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            s.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        let text = String::from_utf8_lossy(&head).to_string();
        assert!(text.starts_with("HTTP/1.1 101"), "{text}");
        assert!(
            text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"),
            "{text}"
        );
        // Masked empty ping (clients must mask)
        s.write_all(&[0x89, 0x80, 0, 0, 0, 0]).unwrap();
        let mut pong = [0u8; 2];
        s.read_exact(&mut pong).unwrap();
        assert_eq!(pong, [0x8a, 0x00]);
        // Close is echoed back, then the server hangs up
        s.write_all(&[0x88, 0x80, 0, 0, 0, 0]).unwrap();
        let mut close = [0u8; 2];
        s.read_exact(&mut close).unwrap();
        assert_eq!(close, [0x88, 0x00]);
        let mut rest = Vec::new();
        s.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    });

    spin(&mut mgr, || cli.is_finished());
    cli.join().unwrap();
    assert_eq!(ctl.borrow().as_slice(), [0x89, 0x88]);
}

#[test]
fn static_files_etag_and_range() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), b"<h1>home</h1>").unwrap();
    std::fs::write(dir.path().join("data.txt"), b"0123456789").unwrap();

    let mut mgr = Manager::new();
    let opts = ServeOpts {
        root_dir: dir.path().to_str().unwrap().to_string(),
        ..ServeOpts::default()
    };
    let lid = weft_http::listen(
        &mut mgr,
        "http://127.0.0.1:0",
        handler(move |mgr, c, ev| {
            if let Event::HttpMsg(hm) = ev {
                serve_dir(mgr, c, hm, &StdFs, &opts);
            }
        }),
    )
    .unwrap();
    let port = mgr.conn_mut(lid).unwrap().loc.host_port();

    let cli = thread::spawn(move || {
        let fetch = |req: &str| -> (String, Vec<u8>) {
            let mut s = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            s.write_all(req.as_bytes()).unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                s.read_exact(&mut byte).unwrap();
                head.push(byte[0]);
            }
            let head = String::from_utf8_lossy(&head).to_string();
            let cl: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .map_or(0, |v| v.trim().parse().unwrap());
            let mut body = vec![0u8; cl];
            s.read_exact(&mut body).unwrap();
            (head, body)
        };

        // Directory falls back to index.html
        let (head, body) = fetch("GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");
        assert_eq!(body, b"<h1>home</h1>");

        // ETag is "mtime.size"; a matching If-None-Match gives 304
        let (head, body) = fetch("GET /data.txt HTTP/1.1\r\nHost: h\r\n\r\n");
        assert_eq!(body, b"0123456789");
        let etag = head
            .lines()
            .find_map(|l| l.strip_prefix("Etag: "))
            .unwrap()
            .trim()
            .to_string();
        let (head, _) = fetch(&format!(
            "GET /data.txt HTTP/1.1\r\nHost: h\r\nIf-None-Match: {etag}\r\n\r\n"
        ));
        assert!(head.starts_with("HTTP/1.1 304"), "{head}");

        // Byte range
        let (head, body) =
            fetch("GET /data.txt HTTP/1.1\r\nHost: h\r\nRange: bytes=2-5\r\n\r\n");
        assert!(head.starts_with("HTTP/1.1 206"), "{head}");
        assert!(head.contains("Content-Range: bytes 2-5/10\r\n"), "{head}");
        assert_eq!(body, b"2345");

        // Missing file
        let (head, _) = fetch("GET /nope HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(head.starts_with("HTTP/1.1 404"), "{head}");
    });

    spin(&mut mgr, || cli.is_finished());
    cli.join().unwrap();
}

#[test]
fn pipelined_requests_wait_for_replies() {
    let mut mgr = Manager::new();
    let uris: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
    let u = Rc::clone(&uris);
    let lid = weft_http::listen(
        &mut mgr,
        "http://127.0.0.1:0",
        handler(move |_, c, ev| {
            if let Event::HttpMsg(hm) = ev {
                u.borrow_mut().push(hm.uri.to_vec());
                reply(c, 200, "", hm.uri);
            }
        }),
    )
    .unwrap();
    let port = mgr.conn_mut(lid).unwrap().loc.host_port();

    let cli = thread::spawn(move || {
        let mut s = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        // Two requests in one write; replies must come back in order
        s.write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();
        s.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let mut buf = Vec::new();
        let mut tmp = [0u8; 256];
        loop {
            let n = s.read(&mut tmp).unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&tmp[..n]);
            let text = String::from_utf8_lossy(&buf);
            if text.contains("\r\n\r\n/a") && text.contains("\r\n\r\n/b") {
                break;
            }
        }
        let text = String::from_utf8_lossy(&buf).to_string();
        let a = text.find("\r\n\r\n/a").expect("reply a");
        let b = text.find("\r\n\r\n/b").expect("reply b");
        assert!(a < b, "{text}");
    });

    spin(&mut mgr, || cli.is_finished());
    cli.join().unwrap();
}
