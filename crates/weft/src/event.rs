use weft_utils::{ArrayVec, bstr};

/// Hard cap on parsed header table size.
pub const MAX_HTTP_HEADERS: usize = 40;

/// Decoded HTTP request or response, borrowing from the connection's
/// receive buffer. For responses the status token is carried in `uri`
/// (the parser treats the status line as a request line whose method is
/// the `HTTP/x.y` token); use [`HttpMsg::status`] to read it.
#[derive(Clone, Copy)]
pub struct HttpMsg<'a> {
    pub method: &'a [u8],
    pub uri: &'a [u8],
    pub query: &'a [u8],
    pub proto: &'a [u8],
    pub headers: ArrayVec<(&'a [u8], &'a [u8]), MAX_HTTP_HEADERS>,
    /// Message body (what has been buffered of it).
    pub body: &'a [u8],
    /// Request line + headers + terminating CRLFCRLF.
    pub head: &'a [u8],
    /// Full message: head + body.
    pub message: &'a [u8],
}

impl<'a> HttpMsg<'a> {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&'a [u8]> {
        self.headers
            .as_slice()
            .iter()
            .find(|(n, _)| bstr::eq_ignore_case(n, name.as_bytes()))
            .map(|(_, v)| *v)
    }

    /// Response status code; 0 when this is not a response.
    pub fn status(&self) -> u32 {
        bstr::parse_dec(self.uri, 3).map_or(0, |v| v as u32)
    }
}

/// One delivered WebSocket message. Top bit of `flags` is FIN, low
/// nibble the opcode.
#[derive(Clone, Copy)]
pub struct WsMsg<'a> {
    pub flags: u8,
    pub data: &'a [u8],
}

impl WsMsg<'_> {
    #[inline]
    pub const fn opcode(&self) -> u8 {
        self.flags & 0x0f
    }

    #[inline]
    pub const fn fin(&self) -> bool {
        self.flags & 0x80 != 0
    }
}

/// Decoded MQTT packet.
#[derive(Clone, Copy)]
pub struct MqttMsg<'a> {
    /// The whole packet, fixed header included.
    pub dgram: &'a [u8],
    pub cmd: u8,
    pub qos: u8,
    pub id: u16,
    /// CONNACK/SUBACK reason code.
    pub ack: u8,
    pub topic: &'a [u8],
    pub data: &'a [u8],
    /// Byte range of the v5 property block inside `dgram`.
    pub props_start: usize,
    pub props_size: usize,
}

/// Events delivered to protocol and user handlers.
///
/// Within one poll cycle the order is: timers, then `Poll` for every
/// connection, then I/O (`Accept`/`Connect`/`Read`/`Write`), then
/// `Close`. The protocol handler always sees an event before the user
/// handler does.
pub enum Event<'a> {
    /// Fatal per-connection error; the connection closes after this.
    Error(&'a str),
    /// Connection allocated (payload: the URL it was created from).
    Open(&'a str),
    /// One reactor iteration; payload is the cycle's timestamp in ms.
    Poll(u64),
    /// DNS resolution finished for an outbound connection.
    Resolve,
    Accept,
    Connect,
    /// TLS handshake completed.
    TlsHs,
    /// Bytes appended to `recv` (payload: how many).
    Read(usize),
    /// Bytes flushed from `send` (payload: how many).
    Write(usize),
    /// Fires before buffers are released, so handlers may still inspect
    /// `recv`/`send`.
    Close,
    HttpHdrs(&'a HttpMsg<'a>),
    HttpMsg(&'a HttpMsg<'a>),
    HttpChunk(&'a HttpMsg<'a>),
    WsOpen(&'a HttpMsg<'a>),
    WsMsg(&'a WsMsg<'a>),
    WsCtl(&'a WsMsg<'a>),
    MqttCmd(&'a MqttMsg<'a>),
    MqttMsg(&'a MqttMsg<'a>),
    /// CONNACK received; payload is the ack code (0 = accepted).
    MqttOpen(u8),
    /// SNTP reply; payload is milliseconds since the Unix epoch.
    SntpTime(u64),
    /// Cross-thread wakeup payload.
    Wakeup(&'a [u8]),
}

impl Event<'_> {
    /// Short name for tracing.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Error(_) => "error",
            Self::Open(_) => "open",
            Self::Poll(_) => "poll",
            Self::Resolve => "resolve",
            Self::Accept => "accept",
            Self::Connect => "connect",
            Self::TlsHs => "tls_hs",
            Self::Read(_) => "read",
            Self::Write(_) => "write",
            Self::Close => "close",
            Self::HttpHdrs(_) => "http_hdrs",
            Self::HttpMsg(_) => "http_msg",
            Self::HttpChunk(_) => "http_chunk",
            Self::WsOpen(_) => "ws_open",
            Self::WsMsg(_) => "ws_msg",
            Self::WsCtl(_) => "ws_ctl",
            Self::MqttCmd(_) => "mqtt_cmd",
            Self::MqttMsg(_) => "mqtt_msg",
            Self::MqttOpen(_) => "mqtt_open",
            Self::SntpTime(_) => "sntp_time",
            Self::Wakeup(_) => "wakeup",
        }
    }
}
