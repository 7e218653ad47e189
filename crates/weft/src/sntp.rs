//! SNTP client (RFC 4330 subset): one request, one timestamp back.

use tracing::debug;

use crate::{Connection, Event, Handler, Manager, Proto};

const DEFAULT_URL: &str = "udp://time.google.com:123";
/// Seconds between the NTP era (1900) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Creates a UDP connection to an SNTP server (default
/// `time.google.com`) and sends a request; the reply arrives as
/// [`Event::SntpTime`] with milliseconds since the Unix epoch.
pub fn connect(mgr: &mut Manager, url: Option<&str>, handler: Handler) -> std::io::Result<u64> {
    let id = mgr.connect(url.unwrap_or(DEFAULT_URL), handler)?;
    mgr.set_proto(id, Box::new(SntpProto));
    Ok(id)
}

/// Re-sends a request on an existing SNTP connection (for periodic
/// resync driven by a timer).
pub fn request(c: &mut Connection) -> bool {
    let mut pkt = [0u8; 48];
    pkt[0] = 0x23; // LI=0, VN=4, mode=3 (client)
    c.send(&pkt)
}

/// Extracts the transmit timestamp from a server reply.
/// `None` for kiss-o'-death, wrong mode, or short packets.
pub fn parse_reply(pkt: &[u8]) -> Option<u64> {
    if pkt.len() < 48 {
        return None;
    }
    let mode = pkt[0] & 7;
    let li = pkt[0] >> 6;
    let stratum = pkt[1];
    if !(mode == 4 || mode == 5) || li == 3 || stratum == 0 {
        return None;
    }
    let secs = u64::from(u32::from_be_bytes([pkt[40], pkt[41], pkt[42], pkt[43]]));
    let frac = u64::from(u32::from_be_bytes([pkt[44], pkt[45], pkt[46], pkt[47]]));
    let unix_secs = secs.checked_sub(NTP_UNIX_OFFSET)?;
    Some(unix_secs * 1000 + (frac * 1000 >> 32))
}

struct SntpProto;

impl Proto for SntpProto {
    fn on_event(&mut self, mgr: &mut Manager, c: &mut Connection, ev: &Event<'_>) {
        match ev {
            Event::Connect => {
                request(c);
            }
            Event::Read(_) => {
                let pkt = c.recv.as_slice().to_vec();
                c.recv.clear();
                match parse_reply(&pkt) {
                    Some(ms) => mgr.call_user(c, &Event::SntpTime(ms)),
                    None => debug!(id = c.id, "malformed SNTP reply, dropped"),
                }
            }
            _ => {}
        }
    }

    fn spawn(&self) -> Box<dyn Proto> {
        Box::new(Self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn reply(mode: u8, li: u8, stratum: u8, secs: u32, frac: u32) -> [u8; 48] {
        let mut p = [0u8; 48];
        p[0] = (li << 6) | (4 << 3) | mode;
        p[1] = stratum;
        p[40..44].copy_from_slice(&secs.to_be_bytes());
        p[44..48].copy_from_slice(&frac.to_be_bytes());
        p
    }

    #[test]
    fn server_reply_to_ms() {
        // 2024-01-01T00:00:00Z = 1704067200 Unix = 3913056000 NTP
        let p = reply(4, 0, 2, 3_913_056_000, 0x8000_0000);
        assert_eq!(parse_reply(&p), Some(1_704_067_200_000 + 500));
    }

    #[test]
    fn kiss_of_death_dropped() {
        let p = reply(4, 0, 0, 3_913_056_000, 0);
        assert_eq!(parse_reply(&p), None);
    }

    #[test]
    fn wrong_mode_dropped() {
        assert_eq!(parse_reply(&reply(3, 0, 2, 3_913_056_000, 0)), None);
        assert_eq!(parse_reply(&reply(4, 3, 2, 3_913_056_000, 0)), None);
    }

    #[test]
    fn short_packet_dropped() {
        assert_eq!(parse_reply(&[0u8; 40]), None);
    }
}
