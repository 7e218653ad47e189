use std::{cell::RefCell, fmt::Write as _, io::Write as _, rc::Rc};

use bitflags::bitflags;
use tracing::debug;
use weft_io::IoBuf;

use crate::{Addr, Event, Manager, manager::IO_SIZE, tls::TlsSession, util};

bitflags! {
    /// Connection state bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Flags: u32 {
        const LISTENING   = 1 << 0;
        const CLIENT      = 1 << 1;
        const ACCEPTED    = 1 << 2;
        const UDP         = 1 << 3;
        const CONNECTING  = 1 << 4;
        const RESOLVING   = 1 << 5;
        const CLOSING     = 1 << 6;
        /// Finish sending, then close.
        const DRAINING    = 1 << 7;
        const TLS         = 1 << 8;
        /// TLS handshake still in progress.
        const TLS_HS      = 1 << 9;
        const WEBSOCKET   = 1 << 10;
        const MQTT5       = 1 << 11;
        /// Accepted HTTP connection is owed a response; pipelined
        /// requests are not decoded until it is sent.
        const RESP        = 1 << 12;
        /// Built-in stack: waiting for an ARP reply before SYN.
        const ARP_LOOKING = 1 << 13;
        const READABLE    = 1 << 14;
        const WRITABLE    = 1 << 15;
        const HEXDUMPING  = 1 << 16;
        /// Receive buffer is full; stop reading until the user drains it.
        const FULL        = 1 << 17;
    }
}

/// Transport slot of a connection.
pub enum Sock {
    /// Not opened yet (resolving, or awaiting the built-in stack).
    None,
    Listener(mio::net::TcpListener),
    Tcp(mio::net::TcpStream),
    Udp(mio::net::UdpSocket),
    /// Owned by the built-in TCP/IP engine; its per-connection state is
    /// a side table in that crate, keyed by connection id.
    Stack,
}

/// User event handler. Shared between a listener and the connections it
/// accepts, hence the `Rc`; dispatch happens only from the poll thread.
pub type Handler = Rc<RefCell<dyn FnMut(&mut Manager, &mut Connection, &Event<'_>)>>;

/// Wraps a closure into a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: FnMut(&mut Manager, &mut Connection, &Event<'_>) + 'static,
{
    Rc::new(RefCell::new(f))
}

/// Library-internal protocol state machine attached to a connection.
/// Runs before the user handler for every event and may rewrite or
/// drain the connection's buffers.
pub trait Proto {
    fn on_event(&mut self, mgr: &mut Manager, c: &mut Connection, ev: &Event<'_>);

    /// Fresh protocol state for a connection accepted off a listener
    /// that carries this protocol.
    fn spawn(&self) -> Box<dyn Proto>;
}

/// A logical network endpoint: two iobufs, a bag of flags, an optional
/// protocol state machine and a user handler.
pub struct Connection {
    pub id: u64,
    pub sock: Sock,
    pub loc: Addr,
    pub rem: Addr,
    pub send: IoBuf,
    pub recv: IoBuf,
    /// Raw TLS ciphertext staging, used only while `Flags::TLS` is set.
    pub rtls: IoBuf,
    pub flags: Flags,
    pub(crate) proto: Option<Box<dyn Proto>>,
    pub(crate) handler: Option<Handler>,
    pub(crate) tls: Option<Box<dyn TlsSession>>,
    /// TLS options consumed when the session is created on connect/accept.
    pub tls_opts: Option<crate::tls::TlsOpts>,
    /// Protocol scratch area (e.g. the file being streamed by the HTTP
    /// static server). Owned by whichever protocol is attached.
    pub scratch: Option<Box<dyn std::any::Any>>,
    /// Whether write interest is currently registered with the poller.
    pub(crate) wr_armed: bool,
}

impl Connection {
    pub(crate) fn new(id: u64, sock: Sock) -> Self {
        Self {
            id,
            sock,
            loc: Addr::default(),
            rem: Addr::default(),
            send: IoBuf::new(IO_SIZE),
            recv: IoBuf::new(IO_SIZE),
            rtls: IoBuf::new(IO_SIZE),
            flags: Flags::empty(),
            proto: None,
            handler: None,
            tls: None,
            tls_opts: None,
            scratch: None,
            wr_armed: false,
        }
    }

    /// Queues (TCP) or emits (UDP) `data`. Never blocks. Returns false
    /// when the datagram could not be sent or the connection is closing.
    ///
    /// The send buffer always holds plaintext; on TLS connections the
    /// session encrypts at flush time, after the handshake clears.
    pub fn send(&mut self, data: &[u8]) -> bool {
        if self.flags.contains(Flags::CLOSING) {
            return false;
        }
        self.send_plain(data)
    }

    pub(crate) fn send_plain(&mut self, data: &[u8]) -> bool {
        if self.flags.contains(Flags::HEXDUMPING) {
            util::hexdump(self.id, "tx", data);
        }
        match &mut self.sock {
            Sock::Udp(sock) => {
                let r = if self.flags.contains(Flags::LISTENING) {
                    sock.send_to(data, self.rem.to_socket_addr())
                } else {
                    sock.send(data)
                };
                match r {
                    Ok(n) => n == data.len(),
                    Err(e) => {
                        debug!(id = self.id, "udp send: {e}");
                        false
                    }
                }
            }
            Sock::Stack if self.flags.contains(Flags::UDP) => {
                // The engine drains one length-framed datagram per frame
                // on the same poll turn.
                self.send.push(&(data.len() as u32).to_ne_bytes());
                self.send.push(data);
                true
            }
            Sock::Listener(_) => false,
            _ => {
                self.send.push(data);
                true
            }
        }
    }

    /// Formatted send, the printf-style counterpart of [`send`](Self::send).
    pub fn send_fmt(&mut self, args: std::fmt::Arguments<'_>) -> bool {
        if self.flags.contains(Flags::UDP) {
            let mut s = String::new();
            let _ = s.write_fmt(args);
            return self.send(s.as_bytes());
        }
        let _ = self.send.write_fmt(args);
        true
    }

    /// Raw transport write, bypassing the send buffer. TLS sessions use
    /// this to emit handshake and record ciphertext. `Ok(0)` means the
    /// transport is not ready; retry next poll.
    pub fn write_raw(&mut self, data: &[u8]) -> std::io::Result<usize> {
        match &mut self.sock {
            Sock::Tcp(s) => match s.write(data) {
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
                r => r,
            },
            _ => Ok(0),
        }
    }

    /// A connection without a transport or manager slot. Protocol
    /// crates use this to unit-test codecs against the send/recv
    /// buffers.
    pub fn detached() -> Self {
        Self::new(0, Sock::None)
    }

    /// Installs a protocol state machine on a detached connection (for
    /// in-handler switches like a WebSocket upgrade; otherwise use
    /// `Manager::set_proto`).
    pub fn set_proto(&mut self, p: Box<dyn Proto>) {
        self.proto = Some(p);
    }

    /// True while a protocol state machine is attached. During protocol
    /// dispatch the running machine is detached, so this also tells a
    /// machine whether a handler installed a replacement.
    pub fn has_proto(&self) -> bool {
        self.proto.is_some()
    }

    /// Close after the current poll iteration flushes events.
    #[inline]
    pub fn close(&mut self) {
        self.flags.insert(Flags::CLOSING);
    }

    /// Finish sending queued bytes, then close.
    #[inline]
    pub fn drain(&mut self) {
        self.flags.insert(Flags::DRAINING);
    }

    #[inline]
    pub fn is_listening(&self) -> bool {
        self.flags.contains(Flags::LISTENING)
    }

    #[inline]
    pub fn is_udp(&self) -> bool {
        self.flags.contains(Flags::UDP)
    }

    pub(crate) fn register(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        use mio::Interest;
        let token = mio::Token(self.id as usize);
        let interest = Interest::READABLE;
        match &mut self.sock {
            Sock::Listener(l) => registry.register(l, token, interest),
            Sock::Tcp(s) => registry.register(s, token, interest),
            Sock::Udp(s) => registry.register(s, token, interest),
            Sock::None | Sock::Stack => Ok(()),
        }
    }

    /// Keeps write interest in sync with "has something to flush".
    pub(crate) fn sync_interest(&mut self, registry: &mio::Registry) {
        use mio::Interest;
        let want_write = self.flags.contains(Flags::CONNECTING)
            || (self.send.len() > 0 && !self.flags.contains(Flags::TLS_HS));
        if want_write == self.wr_armed {
            return;
        }
        let token = mio::Token(self.id as usize);
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let r = match &mut self.sock {
            Sock::Tcp(s) => registry.reregister(s, token, interest),
            Sock::Udp(s) => registry.reregister(s, token, interest),
            _ => Ok(()),
        };
        if let Err(e) = r {
            debug!(id = self.id, "reregister: {e}");
        } else {
            self.wr_armed = want_write;
        }
    }

    pub(crate) fn deregister(&mut self, registry: &mio::Registry) {
        let _ = match &mut self.sock {
            Sock::Listener(l) => registry.deregister(l),
            Sock::Tcp(s) => registry.deregister(s),
            Sock::Udp(s) => registry.deregister(s),
            Sock::None | Sock::Stack => Ok(()),
        };
    }

    /// Writes as much queued data as the socket accepts right now.
    /// Returns `Some(bytes_flushed)`, or `None` on a fatal write error.
    pub(crate) fn flush(&mut self) -> Option<usize> {
        let mut total = 0;
        while self.send.len() > 0 {
            let r = match &mut self.sock {
                Sock::Tcp(s) => s.write(self.send.as_slice()),
                _ => return Some(total),
            };
            match r {
                Ok(0) => return None,
                Ok(n) => {
                    self.send.del(0, n);
                    total += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(id = self.id, "write: {e}");
                    return None;
                }
            }
        }
        Some(total)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection(id={}, rem={}, flags={:?})", self.id, self.rem, self.flags)
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a connection's socket.
#[cfg(unix)]
pub(crate) fn set_socket_buf_size(sock: &Sock, size: usize) {
    use std::os::fd::{AsRawFd, RawFd};
    let fd: RawFd = match sock {
        Sock::Tcp(s) => s.as_raw_fd(),
        Sock::Udp(s) => s.as_raw_fd(),
        _ => return,
    };
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            (&raw const size).cast::<libc::c_void>(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&raw const size).cast::<libc::c_void>(),
            size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(unix))]
pub(crate) fn set_socket_buf_size(_sock: &Sock, _size: usize) {}
