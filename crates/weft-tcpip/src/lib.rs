//! Built-in TCP/IP engine: drives a raw Ethernet MAC through a
//! four-method [`Driver`] trait and plugs the resulting byte streams
//! into the same connection manager the hosted sockets use.
//!
//! ARP, IPv4, ICMP echo, UDP, a small TCP state machine and a DHCP
//! client/server are implemented over raw frames; IP fragments are
//! detected and dropped, and outgoing IP always sets DF.

pub mod dhcp;
mod drivers;
mod iface;
pub mod phy;
mod tcp;
pub mod wire;

pub use drivers::{MockDriver, MockHandle};
pub use iface::{Driver, Iface, IfaceCfg, LinkState};
pub use phy::Phy;
