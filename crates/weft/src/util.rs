use std::fmt::Write;

use tracing::debug;

/// Logs `data` as a classic 16-byte-per-row hex + ASCII dump.
/// Driven by [`crate::Flags::HEXDUMPING`].
pub fn hexdump(id: u64, dir: &str, data: &[u8]) {
    for (row, chunk) in data.chunks(16).enumerate() {
        let mut hex = String::with_capacity(48);
        let mut ascii = String::with_capacity(16);
        for b in chunk {
            let _ = write!(hex, "{b:02x} ");
            ascii.push(if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' });
        }
        debug!(id, "{dir} {:04x}  {hex:<48} {ascii}", row * 16);
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
