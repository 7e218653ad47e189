//! Event-driven connection manager for embedded networking.
//!
//! A [`Manager`] owns every connection and drives them from a single
//! cooperative [`Manager::poll`] loop: timers first, then socket
//! readiness, then per-connection events. Protocol state machines
//! (HTTP, WebSocket, MQTT in their own crates; DNS and SNTP here) run
//! against the same [`Connection`] byte-stream abstraction, always ahead
//! of the user handler for the same event.
//!
//! On hosted targets readiness comes from `mio`; on bare metal the
//! built-in TCP/IP engine (`weft-tcpip`) wraps a [`Manager`] built with
//! [`Manager::bare`] and feeds the same machinery from raw Ethernet
//! frames.

mod addr;
mod conn;
pub mod dns;
mod event;
mod manager;
pub mod sntp;
mod timers;
pub mod tls;
mod urlx;
pub mod util;

pub use addr::Addr;
pub use conn::{Connection, Flags, Handler, Proto, Sock, handler};
pub use event::{HttpMsg, MAX_HTTP_HEADERS, MqttMsg, Event, WsMsg};
pub use manager::{IO_SIZE, MAX_RECV_SIZE, Manager, Wakeup};
pub use timers::{TimerFlags, timer_expired};
pub use urlx::{ParsedUrl, default_port, is_ssl_scheme, url_decode, url_encode};
pub use weft_io as io;
pub use weft_utils as utils;
