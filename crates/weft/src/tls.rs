//! Seam to an external TLS 1.2/1.3 record layer.
//!
//! The connection core only moves bytes: inbound ciphertext is staged in
//! `Connection::rtls`, a session decrypts it into `recv` and encrypts
//! outbound plaintext into `send`. The actual record codec, certificate
//! handling and key exchange live behind these traits.

use crate::Connection;

/// Soft/hard outcome of a TLS operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsIo {
    /// Bytes produced/consumed.
    Done(usize),
    /// Needs more input; retry next poll.
    Want,
    /// Unrecoverable; the connection fails.
    Err,
}

impl TlsIo {
    pub fn is_ok(self) -> bool {
        !matches!(self, Self::Err)
    }
}

/// Per-connection TLS options.
#[derive(Default, Clone)]
pub struct TlsOpts {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
    /// SNI / verification name; empty to skip verification.
    pub name: String,
}

/// One TLS session, owned by its connection.
pub trait TlsSession {
    /// Drives the handshake from `c.rtls`, appending records to
    /// `c.send`. Implementations clear [`crate::Flags::TLS_HS`] on
    /// completion; the manager then fires [`crate::Event::TlsHs`].
    fn handshake(&mut self, c: &mut Connection) -> TlsIo;

    /// Encrypts queued plaintext from `c.send` and emits the records
    /// through `c.write_raw`, removing what was consumed. Returns the
    /// plaintext bytes taken.
    fn send(&mut self, c: &mut Connection) -> TlsIo;

    /// Decrypts staged ciphertext from `c.rtls` into `c.recv`.
    fn recv(&mut self, c: &mut Connection) -> TlsIo;

    /// Decrypted-but-undelivered plaintext held inside the session.
    fn pending(&self) -> usize;
}

/// Process-wide TLS state (trust roots, session cache).
pub trait TlsCtx {
    fn new_session(&mut self, c: &Connection, opts: &TlsOpts) -> Box<dyn TlsSession>;
}
