//! MQTT 3.1.1 and 5 client codec on top of the connection manager.
//!
//! Remaining lengths are varints of at most 4 bytes. Version 5 packets
//! carry a property block whose entries are typed by a fixed table;
//! [`next_prop`] walks it. QoS 1 publishes are acknowledged with PUBACK,
//! QoS 2 with the PUBREC/PUBREL/PUBCOMP exchange.

mod codec;
mod proto;

pub use codec::{
    CMD_CONNACK, CMD_CONNECT, CMD_DISCONNECT, CMD_PINGREQ, CMD_PINGRESP, CMD_PUBACK, CMD_PUBCOMP,
    CMD_PUBLISH, CMD_PUBREC, CMD_PUBREL, CMD_SUBACK, CMD_SUBSCRIBE, CMD_UNSUBACK, CMD_UNSUBSCRIBE,
    PropVal, decode_varint, encode_varint, next_prop, parse_packet,
};
pub use proto::{MqttOpts, MqttProto, connect, disconnect, ping, publish, subscribe, unsubscribe};
