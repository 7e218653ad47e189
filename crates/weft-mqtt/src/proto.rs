use tracing::debug;
use weft::{Connection, Event, Flags, Handler, Manager, MqttMsg, Proto};

use crate::codec::{
    CMD_CONNACK, CMD_CONNECT, CMD_DISCONNECT, CMD_PINGREQ, CMD_PUBACK, CMD_PUBCOMP, CMD_PUBLISH,
    CMD_PUBREC, CMD_PUBREL, CMD_SUBSCRIBE, CMD_UNSUBSCRIBE, Packet, encode_varint, parse_inner,
};

/// Connection and publish options.
#[derive(Default, Clone)]
pub struct MqttOpts {
    pub user: String,
    pub pass: String,
    /// Random 20-hex-char id when empty.
    pub client_id: String,
    /// Will/publish topic.
    pub topic: String,
    /// Will/publish payload.
    pub message: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub clean: bool,
    /// Keep-alive interval, seconds (0 keeps the broker default off).
    pub keepalive: u16,
    /// 4 = MQTT 3.1.1 (default when 0), 5 = MQTT 5.
    pub version: u8,
    /// Non-zero: retransmit this packet id with the DUP bit set.
    pub retransmit_id: u16,
}

/// Connects to an MQTT broker and sends CONNECT once the transport is
/// up. CONNACK arrives as `MqttOpen`, publishes as `MqttMsg`, every
/// packet as `MqttCmd`.
pub fn connect(
    mgr: &mut Manager,
    url: &str,
    opts: MqttOpts,
    handler: Handler,
) -> std::io::Result<u64> {
    let id = mgr.connect(url, handler)?;
    if opts.version == 5
        && let Some(c) = mgr.conn_mut(id)
    {
        c.flags.insert(Flags::MQTT5);
    }
    mgr.set_proto(id, Box::new(MqttProto { opts }));
    Ok(id)
}

fn fixed_header(c: &mut Connection, cmd: u8, flags: u8, len: usize) {
    let mut hdr = Vec::with_capacity(5);
    hdr.push((cmd << 4) | flags);
    encode_varint(len, &mut hdr);
    c.send(&hdr);
}

fn put_str(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s);
}

fn send_connect(c: &mut Connection, opts: &MqttOpts) {
    let is_v5 = c.flags.contains(Flags::MQTT5);
    let client_id = if opts.client_id.is_empty() {
        let r: [u8; 10] = rand::random();
        r.iter().map(|b| format!("{b:02x}")).collect()
    } else {
        opts.client_id.clone()
    };
    let mut flags = 0u8;
    if opts.clean {
        flags |= 0x02;
    }
    if !opts.topic.is_empty() {
        flags |= 0x04 | (opts.qos & 3) << 3;
        if opts.retain {
            flags |= 0x20;
        }
    }
    if !opts.pass.is_empty() {
        flags |= 0x40;
    }
    if !opts.user.is_empty() {
        flags |= 0x80;
    }
    let mut body = Vec::with_capacity(32);
    put_str(&mut body, b"MQTT");
    body.push(if is_v5 { 5 } else { 4 });
    body.push(flags);
    body.extend_from_slice(&opts.keepalive.to_be_bytes());
    if is_v5 {
        encode_varint(0, &mut body); // connect properties
    }
    put_str(&mut body, client_id.as_bytes());
    if !opts.topic.is_empty() {
        if is_v5 {
            encode_varint(0, &mut body); // will properties
        }
        put_str(&mut body, opts.topic.as_bytes());
        put_str(&mut body, &opts.message);
    }
    if !opts.user.is_empty() {
        put_str(&mut body, opts.user.as_bytes());
    }
    if !opts.pass.is_empty() {
        put_str(&mut body, opts.pass.as_bytes());
    }
    fixed_header(c, CMD_CONNECT, 0, body.len());
    c.send(&body);
}

/// Publishes to `opts.topic`. QoS > 0 packets take a fresh id from the
/// manager counter (or reuse `retransmit_id` with DUP set). Returns the
/// packet id.
pub fn publish(mgr: &mut Manager, c: &mut Connection, opts: &MqttOpts) -> u16 {
    let mut flags = (opts.qos & 3) << 1;
    if opts.retain {
        flags |= 1;
    }
    let mut id = 0;
    let mut body = Vec::with_capacity(opts.topic.len() + opts.message.len() + 8);
    put_str(&mut body, opts.topic.as_bytes());
    if opts.qos > 0 {
        id = if opts.retransmit_id == 0 {
            mgr.next_mqtt_id()
        } else {
            flags |= 0x08; // DUP
            opts.retransmit_id
        };
        body.extend_from_slice(&id.to_be_bytes());
    }
    if c.flags.contains(Flags::MQTT5) {
        encode_varint(0, &mut body);
    }
    body.extend_from_slice(&opts.message);
    fixed_header(c, CMD_PUBLISH, flags, body.len());
    c.send(&body);
    id
}

/// Subscribes to one topic filter.
pub fn subscribe(mgr: &mut Manager, c: &mut Connection, topic: &str, qos: u8) -> u16 {
    let id = mgr.next_mqtt_id();
    let mut body = Vec::with_capacity(topic.len() + 5);
    body.extend_from_slice(&id.to_be_bytes());
    if c.flags.contains(Flags::MQTT5) {
        encode_varint(0, &mut body);
    }
    put_str(&mut body, topic.as_bytes());
    body.push(qos & 3);
    fixed_header(c, CMD_SUBSCRIBE, 2, body.len());
    c.send(&body);
    id
}

pub fn unsubscribe(mgr: &mut Manager, c: &mut Connection, topic: &str) -> u16 {
    let id = mgr.next_mqtt_id();
    let mut body = Vec::with_capacity(topic.len() + 4);
    body.extend_from_slice(&id.to_be_bytes());
    if c.flags.contains(Flags::MQTT5) {
        encode_varint(0, &mut body);
    }
    put_str(&mut body, topic.as_bytes());
    fixed_header(c, CMD_UNSUBSCRIBE, 2, body.len());
    c.send(&body);
    id
}

pub fn ping(c: &mut Connection) {
    fixed_header(c, CMD_PINGREQ, 0, 0);
}

/// DISCONNECT; v5 carries reason code 0 and an empty property block.
pub fn disconnect(c: &mut Connection, _opts: &MqttOpts) {
    if c.flags.contains(Flags::MQTT5) {
        fixed_header(c, CMD_DISCONNECT, 0, 2);
        c.send(&[0, 0]); // reason, properties
    } else {
        fixed_header(c, CMD_DISCONNECT, 0, 0);
    }
    c.drain();
}

fn send_ack(c: &mut Connection, cmd: u8, id: u16) {
    // PUBREL carries the reserved flag bits 0b0010
    let flags = if cmd == CMD_PUBREL { 2 } else { 0 };
    fixed_header(c, cmd, flags, 2);
    c.send(&id.to_be_bytes());
}

pub struct MqttProto {
    opts: MqttOpts,
}

impl Proto for MqttProto {
    fn on_event(&mut self, mgr: &mut Manager, c: &mut Connection, ev: &Event<'_>) {
        match ev {
            Event::Connect => send_connect(c, &self.opts),
            Event::Read(_) => drive(mgr, c),
            _ => {}
        }
    }

    fn spawn(&self) -> Box<dyn Proto> {
        Box::new(Self { opts: self.opts.clone() })
    }
}

fn drive(mgr: &mut Manager, c: &mut Connection) {
    loop {
        if c.flags.contains(Flags::CLOSING) || c.recv.is_empty() {
            return;
        }
        let is_v5 = c.flags.contains(Flags::MQTT5);
        // Shape check with a short borrow, then a detached delivery pass
        let total = match parse_inner(c.recv.as_slice(), is_v5) {
            Packet::Incomplete => return,
            Packet::Malformed => {
                mgr.fail(c, "MQTT malformed message");
                return;
            }
            Packet::Ready(ref m, n) => {
                debug!(id = c.id, cmd = m.cmd, "mqtt packet");
                n
            }
        };
        let buf = std::mem::replace(&mut c.recv, weft::io::IoBuf::new(1));
        if let Packet::Ready(m, _) = parse_inner(buf.as_slice(), is_v5) {
            react(mgr, c, &m);
        }
        c.recv = buf;
        c.recv.del(0, total);
    }
}

/// Protocol reactions, then the user events.
fn react(mgr: &mut Manager, c: &mut Connection, m: &MqttMsg<'_>) {
    match m.cmd {
        CMD_CONNACK => {
            mgr.call_user(c, &Event::MqttCmd(m));
            mgr.call_user(c, &Event::MqttOpen(m.ack));
            return;
        }
        CMD_PUBLISH => {
            match m.qos {
                1 => send_ack(c, CMD_PUBACK, m.id),
                2 => send_ack(c, CMD_PUBREC, m.id),
                _ => {}
            }
            mgr.call_user(c, &Event::MqttCmd(m));
            mgr.call_user(c, &Event::MqttMsg(m));
            return;
        }
        CMD_PUBREL => send_ack(c, CMD_PUBCOMP, m.id),
        _ => {}
    }
    mgr.call_user(c, &Event::MqttCmd(m));
}

#[cfg(test)]
mod test {
    use super::*;

    fn conn() -> Connection {
        Connection::detached()
    }

    #[test]
    fn connect_flags_user_pass_clean() {
        // user + pass + clean session = 0xC2
        let mut c = conn();
        let opts = MqttOpts {
            user: "u".into(),
            pass: "p".into(),
            clean: true,
            ..MqttOpts::default()
        };
        send_connect(&mut c, &opts);
        let pkt = c.send.as_slice();
        assert_eq!(pkt[0], 0x10); // CONNECT
        // variable header: len(2) "MQTT" level flags
        assert_eq!(&pkt[2..8], b"\x00\x04MQTT");
        assert_eq!(pkt[8], 4); // 3.1.1
        assert_eq!(pkt[9], 0xc2);
    }

    #[test]
    fn will_flags() {
        let mut c = conn();
        let opts = MqttOpts {
            topic: "will/t".into(),
            message: b"gone".to_vec(),
            qos: 1,
            retain: true,
            ..MqttOpts::default()
        };
        send_connect(&mut c, &opts);
        let flags = c.send.as_slice()[9];
        assert_eq!(flags & 0x04, 0x04); // will
        assert_eq!(flags & 0x18, 0x08); // will qos 1
        assert_eq!(flags & 0x20, 0x20); // will retain
    }

    #[test]
    fn random_client_id_when_empty() {
        let mut c = conn();
        send_connect(&mut c, &MqttOpts::default());
        let pkt = c.send.as_slice();
        // client id sits right after the keepalive
        let id_len = u16::from_be_bytes([pkt[12], pkt[13]]) as usize;
        assert_eq!(id_len, 20);
    }

    #[test]
    fn publish_qos0_shape() {
        let mut mgr = Manager::bare();
        let mut c = conn();
        let opts =
            MqttOpts { topic: "t".into(), message: b"m".to_vec(), ..MqttOpts::default() };
        let id = publish(&mut mgr, &mut c, &opts);
        assert_eq!(id, 0);
        let pkt = c.send.as_slice().to_vec();
        let (m, _) = crate::parse_packet(&pkt, false).unwrap();
        assert_eq!(m.cmd, CMD_PUBLISH);
        assert_eq!(m.topic, b"t");
        assert_eq!(m.data, b"m");
    }

    #[test]
    fn publish_qos1_takes_ids() {
        let mut mgr = Manager::bare();
        let mut c = conn();
        let opts = MqttOpts { topic: "t".into(), qos: 1, ..MqttOpts::default() };
        let a = publish(&mut mgr, &mut c, &opts);
        let b = publish(&mut mgr, &mut c, &opts);
        assert_eq!((a, b), (1, 2));
    }

    #[test]
    fn retransmit_sets_dup() {
        let mut mgr = Manager::bare();
        let mut c = conn();
        let opts =
            MqttOpts { topic: "t".into(), qos: 1, retransmit_id: 7, ..MqttOpts::default() };
        let id = publish(&mut mgr, &mut c, &opts);
        assert_eq!(id, 7);
        assert_eq!(c.send.as_slice()[0] & 0x08, 0x08);
    }
}
