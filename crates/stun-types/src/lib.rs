#![deny(unreachable_pub, unsafe_code)]

//! STUN (RFC 5389/8489) message codec, shared by the ICE agent and its TURN client.
//!
//! The codec is sans-IO: it only encodes/decodes byte buffers and never touches a socket.

use std::fmt;

pub mod attributes;
mod integrity;
mod message;

pub use integrity::Credentials;
pub use message::{DecodeError, Message, MessageBuilder};

/// The fixed magic cookie that appears after the first two header bytes of every STUN message.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// 96-bit STUN transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 12];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// STUN message class, the `C` bits of the message type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::Success => 0b10,
            Class::Error => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::Success,
            _ => Class::Error,
        }
    }
}

/// STUN/TURN method, the `M` bits of the message type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Binding,
    Allocate,
    Refresh,
    Send,
    Data,
    CreatePermission,
    ChannelBind,
    Unknown(u16),
}

impl Method {
    fn bits(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
            Method::Send => 0x006,
            Method::Data => 0x007,
            Method::CreatePermission => 0x008,
            Method::ChannelBind => 0x009,
            Method::Unknown(m) => m,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits {
            0x001 => Method::Binding,
            0x003 => Method::Allocate,
            0x004 => Method::Refresh,
            0x006 => Method::Send,
            0x007 => Method::Data,
            0x008 => Method::CreatePermission,
            0x009 => Method::ChannelBind,
            other => Method::Unknown(other),
        }
    }
}

/// Packs method + class bits into the 14-bit STUN message type field (RFC 5389 §6).
fn pack_message_type(method: Method, class: Class) -> u16 {
    let m = method.bits();
    let c = class.bits();

    let m0_3 = m & 0x000F;
    let m4_6 = (m >> 4) & 0x0007;
    let m7_11 = (m >> 7) & 0x001F;

    (m7_11 << 9) | ((c & 0b10) << 7) | (m4_6 << 5) | ((c & 0b01) << 4) | m0_3
}

fn unpack_message_type(bits: u16) -> (Method, Class) {
    let m0_3 = bits & 0x000F;
    let c0 = (bits >> 4) & 0x1;
    let m4_6 = (bits >> 5) & 0x0007;
    let c1 = (bits >> 8) & 0x1;
    let m7_11 = (bits >> 9) & 0x001F;

    let method = (m7_11 << 7) | (m4_6 << 4) | m0_3;
    let class = (c1 << 1) | c0;

    (Method::from_bits(method), Class::from_bits(class))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_round_trips() {
        for method in [
            Method::Binding,
            Method::Allocate,
            Method::Refresh,
            Method::Send,
            Method::Data,
            Method::CreatePermission,
            Method::ChannelBind,
        ] {
            for class in [Class::Request, Class::Indication, Class::Success, Class::Error] {
                let bits = pack_message_type(method, class);
                let (m, c) = unpack_message_type(bits);
                assert_eq!(m.bits(), method.bits());
                assert_eq!(c.bits(), class.bits());
            }
        }
    }

    #[test]
    fn binding_request_is_0x0001() {
        assert_eq!(pack_message_type(Method::Binding, Class::Request), 0x0001);
    }

    #[test]
    fn binding_success_is_0x0101() {
        assert_eq!(pack_message_type(Method::Binding, Class::Success), 0x0101);
    }
}
