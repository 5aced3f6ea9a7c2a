//! Typed STUN/TURN attributes (RFC 5389 §15, RFC 5766 §14, RFC 8656).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::{DecodeError, TransactionId, MAGIC_COOKIE};

/// A single STUN/TURN attribute: knows its own wire type and how to encode/decode its value.
pub trait Attribute: Sized {
    const TYPE: u16;

    /// `transaction_id` is only consulted by the XOR-* address attributes; every
    /// other attribute ignores it. It is threaded through uniformly so the
    /// message builder/decoder can treat all attributes the same way.
    fn encode(&self, transaction_id: &TransactionId) -> Vec<u8>;
    fn decode(value: &[u8], transaction_id: &TransactionId) -> Result<Self, DecodeError>;
}

const FAMILY_IPV4: u16 = 0x01;
const FAMILY_IPV6: u16 = 0x02;

fn encode_address(addr: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.push(0);
    match addr.ip() {
        IpAddr::V4(v4) => {
            out.extend_from_slice(&FAMILY_IPV4.to_be_bytes());
            out.extend_from_slice(&addr.port().to_be_bytes());
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.extend_from_slice(&FAMILY_IPV6.to_be_bytes());
            out.extend_from_slice(&addr.port().to_be_bytes());
            out.extend_from_slice(&v6.octets());
        }
    }
    out
}

fn decode_address(value: &[u8]) -> Result<SocketAddr, DecodeError> {
    if value.len() < 4 {
        return Err(DecodeError::Malformed);
    }

    let family = u16::from_be_bytes([value[0], value[1]]);
    let port = u16::from_be_bytes([value[2], value[3]]);

    match family {
        FAMILY_IPV4 => {
            let octets: [u8; 4] = value.get(4..8).ok_or(DecodeError::Malformed)?.try_into().unwrap();
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        FAMILY_IPV6 => {
            let octets: [u8; 16] = value.get(4..20).ok_or(DecodeError::Malformed)?.try_into().unwrap();
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(DecodeError::Malformed),
    }
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &TransactionId) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.push(0);

    let cookie_hi: u16 = (MAGIC_COOKIE >> 16) as u16;
    let x_port = addr.port() ^ cookie_hi;

    match addr.ip() {
        IpAddr::V4(v4) => {
            out.extend_from_slice(&FAMILY_IPV4.to_be_bytes());
            out.extend_from_slice(&x_port.to_be_bytes());
            let x_addr = u32::from_be_bytes(v4.octets()) ^ MAGIC_COOKIE;
            out.extend_from_slice(&x_addr.to_be_bytes());
        }
        IpAddr::V6(v6) => {
            out.extend_from_slice(&FAMILY_IPV6.to_be_bytes());
            out.extend_from_slice(&x_port.to_be_bytes());

            let mut xor_const = [0u8; 16];
            xor_const[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_const[4..].copy_from_slice(transaction_id.as_bytes());

            let mut octets = v6.octets();
            for (o, x) in octets.iter_mut().zip(xor_const.iter()) {
                *o ^= x;
            }
            out.extend_from_slice(&octets);
        }
    }
    out
}

fn decode_xor_address(value: &[u8], transaction_id: &TransactionId) -> Result<SocketAddr, DecodeError> {
    if value.len() < 4 {
        return Err(DecodeError::Malformed);
    }

    let family = u16::from_be_bytes([value[0], value[1]]);
    let x_port = u16::from_be_bytes([value[2], value[3]]);
    let cookie_hi: u16 = (MAGIC_COOKIE >> 16) as u16;
    let port = x_port ^ cookie_hi;

    match family {
        FAMILY_IPV4 => {
            let bytes: [u8; 4] = value.get(4..8).ok_or(DecodeError::Malformed)?.try_into().unwrap();
            let x_addr = u32::from_be_bytes(bytes) ^ MAGIC_COOKIE;
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(x_addr)), port))
        }
        FAMILY_IPV6 => {
            let bytes: [u8; 16] = value.get(4..20).ok_or(DecodeError::Malformed)?.try_into().unwrap();

            let mut xor_const = [0u8; 16];
            xor_const[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_const[4..].copy_from_slice(transaction_id.as_bytes());

            let mut octets = bytes;
            for (o, x) in octets.iter_mut().zip(xor_const.iter()) {
                *o ^= x;
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(DecodeError::Malformed),
    }
}

fn decode_utf8(value: &[u8]) -> Result<String, DecodeError> {
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| DecodeError::Malformed)
}

macro_rules! address_attribute {
    ($name:ident, $type:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub SocketAddr);

        impl Attribute for $name {
            const TYPE: u16 = $type;

            fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
                encode_address(self.0)
            }

            fn decode(value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
                decode_address(value).map(Self)
            }
        }
    };
}

macro_rules! xor_address_attribute {
    ($name:ident, $type:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub SocketAddr);

        impl Attribute for $name {
            const TYPE: u16 = $type;

            fn encode(&self, transaction_id: &TransactionId) -> Vec<u8> {
                encode_xor_address(self.0, transaction_id)
            }

            fn decode(value: &[u8], transaction_id: &TransactionId) -> Result<Self, DecodeError> {
                decode_xor_address(value, transaction_id).map(Self)
            }
        }
    };
}

address_attribute!(MappedAddress, 0x0001);
xor_address_attribute!(XorMappedAddress, 0x0020);
xor_address_attribute!(XorPeerAddress, 0x0012);
xor_address_attribute!(XorRelayedAddress, 0x0016);

macro_rules! string_attribute {
    ($name:ident, $type:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(pub String);

        impl Attribute for $name {
            const TYPE: u16 = $type;

            fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
                self.0.as_bytes().to_vec()
            }

            fn decode(value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
                decode_utf8(value).map(Self)
            }
        }
    };
}

string_attribute!(Username, 0x0006);
string_attribute!(Realm, 0x0014);
string_attribute!(Nonce, 0x0015);
string_attribute!(Software, 0x8022);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority(pub u32);

impl Attribute for Priority {
    const TYPE: u16 = 0x0024;

    fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    fn decode(value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
        let bytes: [u8; 4] = value.try_into().map_err(|_| DecodeError::Malformed)?;
        Ok(Self(u32::from_be_bytes(bytes)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseCandidate;

impl Attribute for UseCandidate {
    const TYPE: u16 = 0x0025;

    fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
        Vec::new()
    }

    fn decode(_value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DontFragment;

impl Attribute for DontFragment {
    const TYPE: u16 = 0x001A;

    fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
        Vec::new()
    }

    fn decode(_value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
        Ok(Self)
    }
}

macro_rules! tie_breaker_attribute {
    ($name:ident, $type:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub u64);

        impl Attribute for $name {
            const TYPE: u16 = $type;

            fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
                self.0.to_be_bytes().to_vec()
            }

            fn decode(value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
                let bytes: [u8; 8] = value.try_into().map_err(|_| DecodeError::Malformed)?;
                Ok(Self(u64::from_be_bytes(bytes)))
            }
        }
    };
}

tie_breaker_attribute!(IceControlled, 0x8029);
tie_breaker_attribute!(IceControlling, 0x802A);

/// FINGERPRINT is parsed specially by the message decoder (it is verified
/// inline, not lazily like MESSAGE-INTEGRITY), but is exposed here so callers
/// can check whether one was present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint(pub u32);

impl Attribute for Fingerprint {
    const TYPE: u16 = 0x8028;

    fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    fn decode(value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
        let bytes: [u8; 4] = value.try_into().map_err(|_| DecodeError::Malformed)?;
        Ok(Self(u32::from_be_bytes(bytes)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub code: u16,
    pub reason: String,
}

impl Attribute for ErrorCode {
    const TYPE: u16 = 0x0009;

    fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
        let class = (self.code / 100) as u8;
        let number = (self.code % 100) as u8;

        let mut out = vec![0, 0, 0, 0];
        out[2] = class;
        out[3] = number;
        out.extend_from_slice(self.reason.as_bytes());
        out
    }

    fn decode(value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
        if value.len() < 4 {
            return Err(DecodeError::Malformed);
        }

        let class = value[2] as u16;
        let number = value[3] as u16;
        let code = class * 100 + number;
        let reason = decode_utf8(&value[4..])?;

        Ok(Self { code, reason })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAttributes(pub Vec<u16>);

impl Attribute for UnknownAttributes {
    const TYPE: u16 = 0x000A;

    fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * 2);
        for typ in &self.0 {
            out.extend_from_slice(&typ.to_be_bytes());
        }
        out
    }

    fn decode(value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
        if value.len() % 2 != 0 {
            return Err(DecodeError::Malformed);
        }

        let types = value
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();

        Ok(Self(types))
    }
}

/// TURN REQUESTED-TRANSPORT: the high byte is the IANA protocol number (17 = UDP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedTransport(pub u8);

impl RequestedTransport {
    pub const UDP: RequestedTransport = RequestedTransport(17);
}

impl Attribute for RequestedTransport {
    const TYPE: u16 = 0x0019;

    fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
        vec![self.0, 0, 0, 0]
    }

    fn decode(value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
        let byte = *value.first().ok_or(DecodeError::Malformed)?;
        Ok(Self(byte))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime(pub u32);

impl Attribute for Lifetime {
    const TYPE: u16 = 0x000D;

    fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    fn decode(value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
        let bytes: [u8; 4] = value.try_into().map_err(|_| DecodeError::Malformed)?;
        Ok(Self(u32::from_be_bytes(bytes)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelNumber(pub u16);

impl Attribute for ChannelNumber {
    const TYPE: u16 = 0x000C;

    fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
        let mut out = self.0.to_be_bytes().to_vec();
        out.extend_from_slice(&[0, 0]);
        out
    }

    fn decode(value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
        let bytes: [u8; 2] = value.get(0..2).ok_or(DecodeError::Malformed)?.try_into().unwrap();
        Ok(Self(u16::from_be_bytes(bytes)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data(pub Vec<u8>);

impl Attribute for Data {
    const TYPE: u16 = 0x0013;

    fn encode(&self, _transaction_id: &TransactionId) -> Vec<u8> {
        self.0.clone()
    }

    fn decode(value: &[u8], _transaction_id: &TransactionId) -> Result<Self, DecodeError> {
        Ok(Self(value.to_vec()))
    }
}
