use std::{io::Read, time::Duration};

use mio::{Events, Poll as MioPoll, Token};
use tracing::{debug, error, trace, warn};
use weft_utils::safe_panic;

use crate::{
    Addr, Connection, Event, Flags, Handler, ParsedUrl, Proto, Sock, conn,
    dns::{self, DnsState},
    timers::Timers,
    tls::{TlsCtx, TlsIo},
    util,
};

/// Buffer growth step for connection reads.
pub const IO_SIZE: usize = 2048;
/// Hard cap on a connection's receive buffer.
pub const MAX_RECV_SIZE: usize = 3 * 1024 * 1024;

/// Single-threaded cooperative reactor owning every connection.
///
/// All state transitions happen inside [`poll`](Self::poll); user
/// handlers run synchronously on the polling thread and must not block.
/// The only cross-thread door is the [`Wakeup`] handle.
pub struct Manager {
    pub(crate) conns: Vec<Option<Connection>>,
    pub(crate) timers: Timers,
    next_id: u64,
    poller: Option<MioPoll>,
    mio_events: Events,
    /// DNS server URLs, `udp://host:53`.
    pub dns4: Option<String>,
    pub dns6: Option<String>,
    pub dns_timeout_ms: u64,
    pub use_dns6: bool,
    pub(crate) dns: DnsState,
    mqtt_id: u16,
    pub(crate) tls_ctx: Option<Box<dyn TlsCtx>>,
    /// Kernel SO_SNDBUF/SO_RCVBUF applied to every socket, when set.
    socket_buf_size: Option<usize>,
    /// Current poll cycle's timestamp, ms since manager start.
    pub now_ms: u64,
    started: std::time::Instant,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    /// Hosted-sockets manager: readiness comes from `mio`.
    pub fn new() -> Self {
        let poller = MioPoll::new().expect("couldn't set up a readiness poll");
        Self::build(Some(poller))
    }

    /// No readiness subsystem; the built-in TCP/IP engine wraps this and
    /// drives the reactor phases itself.
    pub fn bare() -> Self {
        Self::build(None)
    }

    fn build(poller: Option<MioPoll>) -> Self {
        Self {
            conns: Vec::new(),
            timers: Timers::default(),
            next_id: 0,
            poller,
            mio_events: Events::with_capacity(128),
            dns4: Some("udp://8.8.8.8:53".into()),
            dns6: Some("udp://[2001:4860:4860::8888]:53".into()),
            dns_timeout_ms: 3000,
            use_dns6: false,
            dns: DnsState::default(),
            mqtt_id: 0,
            tls_ctx: None,
            socket_buf_size: None,
            now_ms: 0,
            started: std::time::Instant::now(),
        }
    }

    pub fn set_tls_ctx(&mut self, ctx: Box<dyn TlsCtx>) {
        self.tls_ctx = Some(ctx);
    }

    /// Applies kernel SO_SNDBUF and SO_RCVBUF to every socket this
    /// manager opens or accepts.
    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.socket_buf_size = Some(size);
        self
    }

    /// Whether this manager runs on the built-in stack (no socket poller).
    pub fn is_bare(&self) -> bool {
        self.poller.is_none()
    }

    /// Monotonically increasing MQTT packet id, skipping 0.
    pub fn next_mqtt_id(&mut self) -> u16 {
        self.mqtt_id = self.mqtt_id.wrapping_add(1);
        if self.mqtt_id == 0 {
            self.mqtt_id = 1;
        }
        self.mqtt_id
    }

    // ---- connection table ----------------------------------------------

    pub(crate) fn alloc_conn(&mut self, sock: Sock) -> usize {
        self.next_id += 1;
        let c = Connection::new(self.next_id, sock);
        self.conns.push(Some(c));
        self.conns.len() - 1
    }

    pub fn conn_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.conns.iter_mut().flatten().find(|c| c.id == id)
    }

    /// Snapshot of live connection ids (the table may change mid-loop).
    pub fn conn_ids(&self) -> Vec<u64> {
        self.conns.iter().flatten().map(|c| c.id).collect()
    }

    fn idx_of(&self, id: u64) -> Option<usize> {
        self.conns.iter().position(|s| s.as_ref().is_some_and(|c| c.id == id))
    }

    /// Attaches a protocol state machine to a connection. Listeners pass
    /// it on to every accepted connection via [`Proto::spawn`].
    pub fn set_proto(&mut self, id: u64, proto: Box<dyn Proto>) {
        if let Some(c) = self.conn_mut(id) {
            c.proto = Some(proto);
        }
    }

    // ---- event dispatch -------------------------------------------------

    /// Runs the protocol handler, then the user handler.
    pub fn call(&mut self, c: &mut Connection, ev: &Event<'_>) {
        trace!(id = c.id, ev = ev.name(), "event");
        if let Some(mut p) = c.proto.take() {
            p.on_event(self, c, ev);
            // A handler may have installed a new protocol (e.g. a
            // WebSocket upgrade); the old state machine then retires
            if c.proto.is_none() {
                c.proto = Some(p);
            }
        }
        self.call_user(c, ev);
    }

    /// Runs only the user handler; protocol drivers use this for the
    /// events they synthesize themselves.
    pub fn call_user(&mut self, c: &mut Connection, ev: &Event<'_>) {
        if let Some(h) = c.handler.clone() {
            (h.borrow_mut())(self, c, ev);
        }
    }

    /// Dispatches an event to a connection identified by id. Used by the
    /// built-in stack, which never holds a `&mut Connection` across a
    /// dispatch.
    pub fn fire(&mut self, id: u64, ev: &Event<'_>) {
        if let Some(idx) = self.idx_of(id) {
            self.with_conn(idx, |mgr, c| mgr.call(c, ev));
        }
    }

    /// Fatal per-connection error: log, mark closing, fire `Error`.
    /// The handler may clean up but cannot resurrect the connection.
    pub fn fail(&mut self, c: &mut Connection, msg: &str) {
        error!(id = c.id, rem = %c.rem, "{msg}");
        c.flags.insert(Flags::CLOSING);
        self.call(c, &Event::Error(msg));
    }

    pub fn fail_id(&mut self, id: u64, msg: &str) {
        if let Some(idx) = self.idx_of(id) {
            self.with_conn(idx, |mgr, c| mgr.fail(c, msg));
        }
    }

    /// Queues bytes on a connection by id.
    pub fn send(&mut self, id: u64, data: &[u8]) -> bool {
        self.conn_mut(id).is_some_and(|c| c.send(data))
    }

    /// Detach a connection slot, run `f` with both the manager and the
    /// connection borrowed, reattach. This is what lets handlers receive
    /// `&mut Manager` and `&mut Connection` at once: while detached, the
    /// connection is simply absent from the table.
    pub(crate) fn with_conn<R>(
        &mut self,
        idx: usize,
        f: impl FnOnce(&mut Self, &mut Connection) -> R,
    ) -> Option<R> {
        let mut c = self.conns.get_mut(idx)?.take()?;
        let r = f(self, &mut c);
        self.conns[idx] = Some(c);
        Some(r)
    }

    // ---- connection creation -------------------------------------------

    /// Opens a listening connection. `url` is `scheme://host:port`;
    /// `udp://` listens on a datagram socket, anything else on TCP. On
    /// the built-in stack only the local port is recorded.
    pub fn listen(&mut self, url: &str, handler: Handler) -> std::io::Result<u64> {
        let p = ParsedUrl::parse(url)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let Some(mut addr) = Addr::parse_literal(p.bare_host(), p.port) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid listening URL",
            ));
        };
        let sock = if self.is_bare() {
            Sock::Stack
        } else if p.is_udp {
            let s = mio::net::UdpSocket::bind(addr.to_socket_addr())?;
            addr = Addr::from_socket_addr(s.local_addr()?);
            Sock::Udp(s)
        } else {
            let l = mio::net::TcpListener::bind(addr.to_socket_addr())?;
            addr = Addr::from_socket_addr(l.local_addr()?);
            Sock::Listener(l)
        };
        let idx = self.alloc_conn(sock);
        {
            let c = self.conns[idx].as_mut().expect("fresh slot");
            c.loc = addr;
            c.handler = Some(handler);
            c.flags.insert(Flags::LISTENING);
            if p.is_udp {
                c.flags.insert(Flags::UDP);
            }
            if p.is_ssl {
                c.flags.insert(Flags::TLS);
            }
        }
        self.register_idx(idx);
        let id = self.conns[idx].as_ref().expect("fresh slot").id;
        debug!(id, url, "listening");
        self.with_conn(idx, |mgr, c| mgr.call(c, &Event::Open(url)));
        Ok(id)
    }

    /// Creates an outbound connection: DNS resolution (unless the host is
    /// a literal IP), then non-blocking connect, then `Event::Connect`.
    pub fn connect(&mut self, url: &str, handler: Handler) -> std::io::Result<u64> {
        let p = ParsedUrl::parse(url)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let idx = self.alloc_conn(Sock::None);
        let id = {
            let c = self.conns[idx].as_mut().expect("fresh slot");
            c.handler = Some(handler);
            c.flags.insert(Flags::CLIENT);
            if p.is_udp {
                c.flags.insert(Flags::UDP);
            }
            if p.is_ssl {
                c.flags.insert(Flags::TLS);
            }
            c.rem.set_host_port(p.port);
            c.id
        };
        self.with_conn(idx, |mgr, c| mgr.call(c, &Event::Open(url)));
        let host = p.bare_host();
        let literal = if host.eq_ignore_ascii_case("localhost") {
            Addr::parse_literal("127.0.0.1", p.port)
        } else {
            Addr::parse_literal(host, p.port)
        };
        if let Some(addr) = literal {
            if let Some(c) = self.conns[idx].as_mut() {
                c.rem = addr;
            }
            self.connect_resolved(idx);
        } else {
            if let Some(c) = self.conns[idx].as_mut() {
                c.flags.insert(Flags::RESOLVING);
            }
            dns::start_lookup(self, idx, host.to_string());
        }
        Ok(id)
    }

    /// Resolution finished (or was immediate): open the transport.
    pub(crate) fn connect_resolved(&mut self, idx: usize) {
        self.with_conn(idx, |mgr, c| {
            c.flags.remove(Flags::RESOLVING);
            mgr.call(c, &Event::Resolve);
            if c.flags.contains(Flags::CLOSING) {
                return;
            }
            if matches!(c.sock, Sock::Stack) || mgr.is_bare() {
                // The engine picks up CONNECTING connections on its next
                // poll: ARP (or gateway MAC), then SYN.
                c.sock = Sock::Stack;
                c.flags.insert(Flags::CONNECTING);
                return;
            }
            let r = if c.flags.contains(Flags::UDP) {
                open_udp(c)
            } else {
                mio::net::TcpStream::connect(c.rem.to_socket_addr()).map(|s| {
                    c.sock = Sock::Tcp(s);
                    c.flags.insert(Flags::CONNECTING);
                })
            };
            match r {
                Ok(()) => {
                    if let Some(size) = mgr.socket_buf_size {
                        conn::set_socket_buf_size(&c.sock, size);
                    }
                    if let Some(p) = mgr.poller.as_ref()
                        && let Err(e) = c.register(p.registry())
                    {
                        mgr.fail(c, &format!("register: {e}"));
                    }
                }
                Err(e) => {
                    debug!(id = c.id, "connect: {e}");
                    mgr.fail(c, "socket error");
                }
            }
        });
    }

    /// Adopts an externally-owned stream as a full-duplex connection.
    pub fn wrap(&mut self, stream: std::net::TcpStream, handler: Handler) -> std::io::Result<u64> {
        stream.set_nonblocking(true)?;
        let loc = stream.local_addr().map(Addr::from_socket_addr).unwrap_or_default();
        let rem = stream.peer_addr().map(Addr::from_socket_addr).unwrap_or_default();
        let s = mio::net::TcpStream::from_std(stream);
        let idx = self.alloc_conn(Sock::Tcp(s));
        let id = {
            let c = self.conns[idx].as_mut().expect("fresh slot");
            c.loc = loc;
            c.rem = rem;
            c.handler = Some(handler);
            c.id
        };
        self.register_idx(idx);
        self.with_conn(idx, |mgr, c| {
            mgr.call(c, &Event::Open(""));
        });
        Ok(id)
    }

    /// Materializes a connection accepted by the built-in stack: state
    /// inherited from the listener, transport owned by the engine. The
    /// caller sets the peer address and fires `Open`/`Accept`.
    pub fn accept_stack_conn(&mut self, listener_id: u64) -> Option<u64> {
        let (loc, handler, proto, tls) = {
            let l = self.conn_mut(listener_id)?;
            (
                l.loc,
                l.handler.clone(),
                l.proto.as_ref().map(|p| p.spawn()),
                l.flags.contains(Flags::TLS),
            )
        };
        self.next_id += 1;
        let mut c = Connection::new(self.next_id, Sock::Stack);
        c.loc = loc;
        c.handler = handler;
        c.proto = proto;
        c.flags.insert(Flags::ACCEPTED);
        if tls {
            c.flags.insert(Flags::TLS | Flags::TLS_HS);
        }
        let id = c.id;
        self.conns.push(Some(c));
        Some(id)
    }

    fn register_idx(&mut self, idx: usize) {
        let buf_size = self.socket_buf_size;
        if let Some(p) = self.poller.as_ref() {
            let registry = p.registry();
            if let Some(c) = self.conns[idx].as_mut() {
                if let Some(size) = buf_size {
                    conn::set_socket_buf_size(&c.sock, size);
                }
                if let Err(e) = c.register(registry) {
                    warn!(id = c.id, "register: {e}");
                }
            }
        }
    }

    // ---- the reactor loop ----------------------------------------------

    /// One reactor iteration, blocking at most `ms` milliseconds.
    pub fn poll(&mut self, ms: u64) {
        let now = self.started.elapsed().as_millis() as u64;
        self.poll_at(now, ms);
    }

    /// [`poll`](Self::poll) with an explicit clock, for deterministic
    /// tests and for the built-in stack (which owns the clock).
    pub fn poll_at(&mut self, now: u64, ms: u64) {
        self.now_ms = now;
        self.run_timers(now);
        dns::poll_expired(self);
        self.wait_readiness(now, ms);
        // Poll notifications, one shared timestamp for the whole cycle
        for idx in 0..self.conns.len() {
            self.with_conn(idx, |mgr, c| mgr.call(c, &Event::Poll(now)));
        }
        // I/O dispatch; the table may grow mid-loop (accepts, handler
        // connects) — new connections get their first I/O next cycle.
        let mut idx = 0;
        while idx < self.conns.len() {
            self.with_conn(idx, |mgr, c| mgr.conn_io(c));
            idx += 1;
        }
        self.close_sweep();
    }

    fn wait_readiness(&mut self, now: u64, ms: u64) {
        let Some(poller) = self.poller.as_mut() else { return };
        let registry = poller.registry();
        let mut urgent = false;
        for c in self.conns.iter_mut().flatten() {
            c.flags.remove(Flags::READABLE | Flags::WRITABLE);
            c.sync_interest(registry);
            // Decrypted-but-undelivered TLS data must not wait on the OS
            if c.tls.as_ref().is_some_and(|t| t.pending() > 0)
                || (c.flags.contains(Flags::TLS) && !c.flags.contains(Flags::TLS_HS) && c.rtls.len() > 0)
            {
                urgent = true;
                c.flags.insert(Flags::READABLE);
            }
        }
        let mut wait = ms;
        if let Some(deadline) = self.timers.next_deadline(now) {
            wait = wait.min(deadline.saturating_sub(now));
        }
        if urgent {
            wait = 0;
        }
        if let Err(e) = poller.poll(&mut self.mio_events, Some(Duration::from_millis(wait))) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                safe_panic!("readiness poll: {e}");
            }
            return;
        }
        for ev in self.mio_events.iter() {
            let Token(id) = ev.token();
            if let Some(c) = self.conns.iter_mut().flatten().find(|c| c.id == id as u64) {
                if ev.is_readable() {
                    c.flags.insert(Flags::READABLE);
                }
                if ev.is_writable() {
                    c.flags.insert(Flags::WRITABLE);
                }
            }
        }
    }

    /// Per-connection I/O for one cycle: accept, finish connect, read,
    /// then flush. Runs with the connection detached.
    fn conn_io(&mut self, c: &mut Connection) {
        if c.flags.contains(Flags::RESOLVING) || c.flags.contains(Flags::CLOSING) {
            return;
        }
        if c.flags.contains(Flags::LISTENING) && !c.flags.contains(Flags::UDP) {
            if c.flags.contains(Flags::READABLE) {
                self.accept_all(c);
            }
            return;
        }
        if c.flags.contains(Flags::CONNECTING) {
            if c.flags.contains(Flags::WRITABLE) {
                self.finish_connect(c);
            }
            return;
        }
        if c.flags.contains(Flags::TLS) && c.tls.is_none() {
            // Built-in-stack connections reach here without the hosted
            // connect/accept hooks having run
            c.flags.insert(Flags::TLS_HS);
            self.init_tls(c);
            if c.flags.contains(Flags::CLOSING) {
                return;
            }
        }
        if c.flags.contains(Flags::TLS_HS) {
            if c.flags.contains(Flags::READABLE) {
                self.read_raw(c);
            }
            self.drive_handshake(c);
            return;
        }
        if c.flags.contains(Flags::READABLE) && !c.flags.contains(Flags::FULL) {
            self.read_conn(c);
        }
        if c.send.len() > 0 && !matches!(c.sock, Sock::Stack) {
            if c.flags.contains(Flags::TLS) {
                let Some(mut tls) = c.tls.take() else { return };
                let r = tls.send(c);
                c.tls = Some(tls);
                match r {
                    TlsIo::Done(n) if n > 0 => self.call(c, &Event::Write(n)),
                    TlsIo::Err => self.fail(c, "TLS send"),
                    _ => {}
                }
            } else {
                match c.flush() {
                    Some(0) => {}
                    Some(n) => self.call(c, &Event::Write(n)),
                    None => c.flags.insert(Flags::CLOSING),
                }
            }
        }
    }

    fn accept_all(&mut self, listener: &mut Connection) {
        loop {
            let (stream, peer) = match &listener.sock {
                Sock::Listener(l) => match l.accept() {
                    Ok(x) => x,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(e) => {
                        debug!(id = listener.id, "accept: {e}");
                        return;
                    }
                },
                _ => return,
            };
            self.next_id += 1;
            let mut c = Connection::new(self.next_id, Sock::Tcp(stream));
            c.loc = listener.loc;
            c.rem = Addr::from_socket_addr(peer);
            c.flags.insert(Flags::ACCEPTED);
            c.handler = listener.handler.clone();
            c.proto = listener.proto.as_ref().map(|p| p.spawn());
            if listener.flags.contains(Flags::TLS) {
                c.flags.insert(Flags::TLS | Flags::TLS_HS);
            }
            if let Some(size) = self.socket_buf_size {
                conn::set_socket_buf_size(&c.sock, size);
            }
            if let Some(p) = self.poller.as_ref()
                && let Err(e) = c.register(p.registry())
            {
                warn!(id = c.id, "register accepted: {e}");
                continue;
            }
            debug!(id = c.id, peer = %c.rem, "accepted");
            self.call(&mut c, &Event::Open(""));
            if c.flags.contains(Flags::TLS) {
                self.init_tls(&mut c);
            }
            self.call(&mut c, &Event::Accept);
            self.conns.push(Some(c));
        }
    }

    fn finish_connect(&mut self, c: &mut Connection) {
        if let Sock::Tcp(s) = &c.sock {
            match s.take_error() {
                Ok(None) => {}
                Ok(Some(e)) => {
                    debug!(id = c.id, "connect: {e}");
                    self.fail(c, "socket error");
                    return;
                }
                Err(e) => {
                    debug!(id = c.id, "connect: {e}");
                    self.fail(c, "socket error");
                    return;
                }
            }
            if let Ok(a) = s.local_addr() {
                c.loc = Addr::from_socket_addr(a);
            }
        }
        c.flags.remove(Flags::CONNECTING);
        if c.flags.contains(Flags::TLS) {
            c.flags.insert(Flags::TLS_HS);
            self.init_tls(c);
        }
        self.call(c, &Event::Connect);
    }

    pub(crate) fn init_tls(&mut self, c: &mut Connection) {
        let Some(ctx) = self.tls_ctx.as_mut() else {
            self.fail(c, "TLS context not initialized");
            return;
        };
        let opts = c.tls_opts.take().unwrap_or_default();
        c.tls = Some(ctx.new_session(c, &opts));
    }

    fn drive_handshake(&mut self, c: &mut Connection) {
        let Some(mut tls) = c.tls.take() else { return };
        let r = tls.handshake(c);
        c.tls = Some(tls);
        match r {
            TlsIo::Err => self.fail(c, "TLS handshake"),
            _ => {
                if !c.flags.contains(Flags::TLS_HS) {
                    self.call(c, &Event::TlsHs);
                }
            }
        }
    }

    /// Reads socket bytes into `rtls` (TLS) without firing events; the
    /// handshake driver and record decryptor consume them.
    fn read_raw(&mut self, c: &mut Connection) {
        loop {
            if c.rtls.spare_mut().is_empty() {
                let len = c.rtls.len();
                c.rtls.resize(len + IO_SIZE);
            }
            let r = match &mut c.sock {
                Sock::Tcp(s) => s.read(c.rtls.spare_mut()),
                _ => return,
            };
            match r {
                Ok(0) => {
                    c.flags.insert(Flags::CLOSING);
                    return;
                }
                Ok(n) => c.rtls.grow(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // Peer reset is a close, not an error
                    debug!(id = c.id, "read: {e}");
                    c.flags.insert(Flags::CLOSING);
                    return;
                }
            }
        }
    }

    fn read_conn(&mut self, c: &mut Connection) {
        if c.flags.contains(Flags::TLS) {
            self.read_raw(c);
            if c.flags.contains(Flags::CLOSING) && c.rtls.is_empty() {
                return;
            }
            // Decrypt every complete record that has arrived
            let Some(mut tls) = c.tls.take() else { return };
            let before = c.recv.len();
            loop {
                match tls.recv(c) {
                    TlsIo::Done(n) if n > 0 => {}
                    TlsIo::Err => {
                        c.tls = Some(tls);
                        self.fail(c, "TLS recv");
                        return;
                    }
                    _ => break,
                }
            }
            c.tls = Some(tls);
            let n = c.recv.len() - before;
            if n > 0 {
                self.call(c, &Event::Read(n));
            }
            return;
        }
        if c.flags.contains(Flags::UDP) {
            self.read_udp(c);
            return;
        }
        loop {
            if c.recv.len() >= MAX_RECV_SIZE {
                self.fail(c, "max_recv_buf_size reached");
                return;
            }
            if c.recv.spare_mut().is_empty() {
                let len = c.recv.len();
                c.recv.resize((len + IO_SIZE).min(MAX_RECV_SIZE));
            }
            let r = match &mut c.sock {
                Sock::Tcp(s) => s.read(c.recv.spare_mut()),
                _ => return,
            };
            match r {
                Ok(0) => {
                    c.flags.insert(Flags::CLOSING);
                    return;
                }
                Ok(n) => {
                    c.recv.grow(n);
                    if c.flags.contains(Flags::HEXDUMPING) {
                        let len = c.recv.len();
                        util::hexdump(c.id, "rx", &c.recv.as_slice()[len - n..]);
                    }
                    self.call(c, &Event::Read(n));
                    if c.flags.contains(Flags::CLOSING) || c.flags.contains(Flags::FULL) {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(id = c.id, "read: {e}");
                    c.flags.insert(Flags::CLOSING);
                    return;
                }
            }
        }
    }

    /// One `Event::Read` per datagram, preserving datagram boundaries.
    /// On a listening socket `rem` tracks the sender of each datagram.
    fn read_udp(&mut self, c: &mut Connection) {
        loop {
            if c.recv.len() + IO_SIZE * 8 > MAX_RECV_SIZE {
                self.fail(c, "max_recv_buf_size reached");
                return;
            }
            let want = c.recv.len() + IO_SIZE * 8; // jumbo datagrams fit
            c.recv.reserve(want);
            let listening = c.flags.contains(Flags::LISTENING);
            let r = match &mut c.sock {
                Sock::Udp(s) => {
                    if listening {
                        s.recv_from(c.recv.spare_mut()).map(|(n, from)| (n, Some(from)))
                    } else {
                        s.recv(c.recv.spare_mut()).map(|n| (n, None))
                    }
                }
                _ => return,
            };
            match r {
                Ok((n, from)) => {
                    if let Some(from) = from {
                        c.rem = Addr::from_socket_addr(from);
                    }
                    c.recv.grow(n);
                    if c.flags.contains(Flags::HEXDUMPING) {
                        let len = c.recv.len();
                        util::hexdump(c.id, "rx", &c.recv.as_slice()[len - n..]);
                    }
                    self.call(c, &Event::Read(n));
                    if c.flags.contains(Flags::CLOSING) {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(id = c.id, "udp read: {e}");
                    return;
                }
            }
        }
    }

    fn close_sweep(&mut self) {
        let mut idx = 0;
        while idx < self.conns.len() {
            let should_close = match self.conns[idx].as_ref() {
                Some(c) => {
                    let drained = c.flags.contains(Flags::DRAINING)
                        && c.send.is_empty()
                        && c.rtls.is_empty()
                        && !matches!(c.sock, Sock::Stack);
                    c.flags.contains(Flags::CLOSING) || drained
                }
                None => false,
            };
            if should_close {
                self.close_at(idx);
            }
            idx += 1;
        }
        // Reclaim trailing free slots; nothing is detached here
        while matches!(self.conns.last(), Some(None)) {
            self.conns.pop();
        }
    }

    fn close_at(&mut self, idx: usize) {
        let Some(mut c) = self.conns.get_mut(idx).and_then(Option::take) else { return };
        c.flags.insert(Flags::CLOSING);
        debug!(id = c.id, rem = %c.rem, "closing");
        // Close fires while buffers are still intact
        self.call(&mut c, &Event::Close);
        dns::cancel(self, c.id);
        if let Some(p) = self.poller.as_ref() {
            c.deregister(p.registry());
        }
        // Buffers wiped on drop (IoBuf zeroes before freeing)
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        for c in self.conns.iter_mut().flatten() {
            c.flags.insert(Flags::CLOSING);
        }
        let now = self.started.elapsed().as_millis() as u64;
        self.poll_at(now, 0);
    }
}

fn open_udp(c: &mut Connection) -> std::io::Result<()> {
    let bind: std::net::SocketAddr =
        if c.rem.is_ip6 { "[::]:0".parse().unwrap() } else { "0.0.0.0:0".parse().unwrap() };
    let s = mio::net::UdpSocket::bind(bind)?;
    s.connect(c.rem.to_socket_addr())?;
    if let Ok(a) = s.local_addr() {
        c.loc = Addr::from_socket_addr(a);
    }
    c.sock = Sock::Udp(s);
    // Datagram sockets are usable immediately
    c.flags.insert(Flags::CONNECTING | Flags::WRITABLE);
    Ok(())
}

// ---- cross-thread wakeup ------------------------------------------------

/// Cloneable, `Send` handle delivering [`Event::Wakeup`] payloads into
/// the reactor from other threads. Wire format: 4-byte native-endian
/// connection id followed by the payload.
pub struct Wakeup {
    sock: std::net::UdpSocket,
}

impl Wakeup {
    pub fn wakeup(&self, conn_id: u64, data: &[u8]) -> bool {
        let mut buf = Vec::with_capacity(4 + data.len());
        buf.extend_from_slice(&(conn_id as u32).to_ne_bytes());
        buf.extend_from_slice(data);
        self.sock.send(&buf).is_ok()
    }

    pub fn try_clone(&self) -> std::io::Result<Self> {
        Ok(Self { sock: self.sock.try_clone()? })
    }
}

struct WakeupProto;

impl Proto for WakeupProto {
    fn on_event(&mut self, mgr: &mut Manager, c: &mut Connection, ev: &Event<'_>) {
        if let Event::Read(_) = ev {
            let msg = c.recv.as_slice().to_vec();
            c.recv.clear();
            if msg.len() >= 4 {
                let id = u64::from(u32::from_ne_bytes([msg[0], msg[1], msg[2], msg[3]]));
                mgr.fire(id, &Event::Wakeup(&msg[4..]));
            }
        }
    }

    fn spawn(&self) -> Box<dyn Proto> {
        Box::new(Self)
    }
}

impl Manager {
    /// Creates the loopback socket pair backing [`Wakeup`]. Call once;
    /// each call builds an independent pair.
    pub fn wakeup_handle(&mut self) -> std::io::Result<Wakeup> {
        let rx = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let tx = std::net::UdpSocket::bind("127.0.0.1:0")?;
        tx.connect(rx.local_addr()?)?;
        rx.set_nonblocking(true)?;
        let rx = mio::net::UdpSocket::from_std(rx);
        let idx = self.alloc_conn(Sock::Udp(rx));
        {
            let c = self.conns[idx].as_mut().expect("fresh slot");
            c.flags.insert(Flags::UDP | Flags::LISTENING);
            c.proto = Some(Box::new(WakeupProto));
        }
        self.register_idx(idx);
        Ok(Wakeup { sock: tx })
    }
}
