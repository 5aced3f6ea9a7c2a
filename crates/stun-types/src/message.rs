use thiserror::Error;

use crate::attributes::Attribute;
use crate::integrity::{fingerprint_crc32, hmac_sha1, Credentials};
use crate::{pack_message_type, unpack_message_type, Class, Method, TransactionId, MAGIC_COOKIE};

const MESSAGE_INTEGRITY_TYPE: u16 = 0x0008;
const FINGERPRINT_TYPE: u16 = 0x8028;

/// Attributes the decoder recognizes by type; anything below 0x8000 that
/// isn't in this set makes the message `UnknownRequired` per RFC 5389 §7.3.1.
const KNOWN_ATTRIBUTE_TYPES: &[u16] = &[
    0x0001, // MAPPED-ADDRESS
    0x0006, // USERNAME
    MESSAGE_INTEGRITY_TYPE,
    0x0009, // ERROR-CODE
    0x000A, // UNKNOWN-ATTRIBUTES
    0x0014, // REALM
    0x0015, // NONCE
    0x0020, // XOR-MAPPED-ADDRESS
    0x0024, // PRIORITY
    0x0025, // USE-CANDIDATE
    0x000C, // CHANNEL-NUMBER
    0x000D, // LIFETIME
    0x0012, // XOR-PEER-ADDRESS
    0x0013, // DATA
    0x0016, // XOR-RELAYED-ADDRESS
    0x0019, // REQUESTED-TRANSPORT
    0x001A, // DONT-FRAGMENT
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed STUN message")]
    Malformed,
    /// Carries the transaction id alongside the offending types so a caller
    /// can still build the required 420 response (RFC 5389 §7.3.1).
    #[error("unknown comprehension-required attributes: {1:?}")]
    UnknownRequired(TransactionId, Vec<u16>),
    #[error("MESSAGE-INTEGRITY missing")]
    IntegrityMissing,
    #[error("MESSAGE-INTEGRITY verification failed")]
    IntegrityMismatch,
}

#[derive(Debug, Clone)]
struct RawAttribute {
    typ: u16,
    value: Vec<u8>,
}

fn encode_tlv(out: &mut Vec<u8>, typ: u16, value: &[u8]) {
    out.extend_from_slice(&typ.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
    let padding = (4 - (value.len() % 4)) % 4;
    out.extend(std::iter::repeat(0).take(padding));
}

/// Rewrites the header length field to `virtual_len` bytes of body, as required
/// while computing MESSAGE-INTEGRITY/FINGERPRINT over a prefix of the message.
fn rewrite_length(buf: &mut [u8], virtual_len: u16) {
    buf[2..4].copy_from_slice(&virtual_len.to_be_bytes());
}

/// Builds and encodes a STUN/TURN message: attributes in caller order, then
/// MESSAGE-INTEGRITY (if credentials were supplied), then FINGERPRINT always.
pub struct MessageBuilder {
    method: Method,
    class: Class,
    transaction_id: TransactionId,
    body: Vec<u8>,
    credentials: Option<Credentials>,
}

impl MessageBuilder {
    pub fn new(method: Method, class: Class, transaction_id: TransactionId) -> Self {
        Self {
            method,
            class,
            transaction_id,
            body: Vec::new(),
            credentials: None,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn add_attribute<A: Attribute>(&mut self, attr: &A) -> &mut Self {
        let value = attr.encode(&self.transaction_id);
        encode_tlv(&mut self.body, A::TYPE, &value);
        self
    }

    pub fn credentials(&mut self, credentials: Credentials) -> &mut Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + self.body.len() + 32);
        out.extend_from_slice(&pack_message_type(self.method, self.class).to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // length placeholder
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(self.transaction_id.as_bytes());
        out.extend_from_slice(&self.body);

        if let Some(credentials) = &self.credentials {
            let key = credentials.key();

            let virtual_len = (out.len() - 20 + 24) as u16;
            rewrite_length(&mut out, virtual_len);

            let mac = hmac_sha1(&key, &out);
            encode_tlv(&mut out, MESSAGE_INTEGRITY_TYPE, &mac);
        }

        let virtual_len = (out.len() - 20 + 8) as u16;
        rewrite_length(&mut out, virtual_len);

        let crc = fingerprint_crc32(&out);
        encode_tlv(&mut out, FINGERPRINT_TYPE, &crc.to_be_bytes());

        out
    }
}

/// A decoded STUN/TURN message. MESSAGE-INTEGRITY verification is lazy: the
/// caller must call [`Message::verify_integrity`] with the right key.
pub struct Message {
    method: Method,
    class: Class,
    transaction_id: TransactionId,
    attributes: Vec<RawAttribute>,
    raw: Vec<u8>,
    integrity: Option<(usize, [u8; 20])>,
    has_fingerprint: bool,
}

impl Message {
    pub fn method(&self) -> Method {
        self.method
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn has_fingerprint(&self) -> bool {
        self.has_fingerprint
    }

    pub fn has_integrity(&self) -> bool {
        self.integrity.is_some()
    }

    /// Looks up and decodes a single attribute. Returns `None` if it is absent,
    /// `Some(Err(_))` if present but malformed.
    pub fn get_attribute<A: Attribute>(&self) -> Option<Result<A, DecodeError>> {
        self.attributes
            .iter()
            .find(|attr| attr.typ == A::TYPE)
            .map(|attr| A::decode(&attr.value, &self.transaction_id))
    }

    pub fn has_attribute(&self, typ: u16) -> bool {
        self.attributes.iter().any(|attr| attr.typ == typ)
    }

    /// Recomputes MESSAGE-INTEGRITY over the message prefix stored at decode
    /// time and compares it against the value that was on the wire.
    pub fn verify_integrity(&self, credentials: &Credentials) -> Result<(), DecodeError> {
        let (offset, wire_mac) = self.integrity.ok_or(DecodeError::IntegrityMissing)?;

        let mut prefix = self.raw[..offset].to_vec();
        let virtual_len = (offset - 20 + 24) as u16;
        rewrite_length(&mut prefix, virtual_len);

        let computed = hmac_sha1(&credentials.key(), &prefix);
        if computed == wire_mac {
            Ok(())
        } else {
            Err(DecodeError::IntegrityMismatch)
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < 20 {
            return Err(DecodeError::Malformed);
        }

        let message_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        if cookie != MAGIC_COOKIE || length % 4 != 0 || bytes.len() != 20 + length {
            return Err(DecodeError::Malformed);
        }

        let transaction_id = TransactionId::from_bytes(bytes[8..20].try_into().unwrap());
        let (method, class) = unpack_message_type(message_type);

        let end = 20 + length;
        let mut pos = 20;
        let mut attributes = Vec::new();
        let mut unknown_required = Vec::new();
        let mut integrity = None;
        let mut has_fingerprint = false;

        while pos + 4 <= end {
            let typ = u16::from_be_bytes([bytes[pos], bytes[pos + 1]]);
            let len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
            let val_start = pos + 4;
            let val_end = val_start + len;
            let padded_len = len.div_ceil(4) * 4;

            if val_end > end || val_start + padded_len > end {
                return Err(DecodeError::Malformed);
            }

            let value = bytes[val_start..val_end].to_vec();

            if typ == MESSAGE_INTEGRITY_TYPE {
                if len != 20 {
                    return Err(DecodeError::Malformed);
                }
                let mut mac = [0u8; 20];
                mac.copy_from_slice(&value);
                integrity = Some((pos, mac));
            } else if typ == FINGERPRINT_TYPE {
                if len != 4 {
                    return Err(DecodeError::Malformed);
                }

                let expected = u32::from_be_bytes(value[..4].try_into().unwrap());

                let mut prefix = bytes[..pos].to_vec();
                let virtual_len = (pos - 20 + 8) as u16;
                rewrite_length(&mut prefix, virtual_len);

                if fingerprint_crc32(&prefix) != expected {
                    return Err(DecodeError::Malformed);
                }
                has_fingerprint = true;
            } else if typ < 0x8000 && !KNOWN_ATTRIBUTE_TYPES.contains(&typ) {
                unknown_required.push(typ);
            }

            attributes.push(RawAttribute { typ, value });
            pos = val_start + padded_len;
        }

        if pos != end {
            return Err(DecodeError::Malformed);
        }

        if !unknown_required.is_empty() {
            return Err(DecodeError::UnknownRequired(transaction_id, unknown_required));
        }

        Ok(Message {
            method,
            class,
            transaction_id,
            attributes,
            raw: bytes.to_vec(),
            integrity,
            has_fingerprint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{Priority, Username};

    #[test]
    fn encode_decode_round_trip_with_integrity() {
        let txn = TransactionId::random();
        let mut builder = MessageBuilder::new(Method::Binding, Class::Request, txn);
        builder.add_attribute(&Username("alice:bob".to_owned()));
        builder.add_attribute(&Priority(12345));
        builder.credentials(Credentials::short_term("swordfish"));

        let bytes = builder.build();
        let decoded = Message::decode(&bytes).unwrap();

        assert_eq!(decoded.method(), Method::Binding);
        assert_eq!(decoded.class(), Class::Request);
        assert_eq!(decoded.transaction_id(), txn);
        assert!(decoded.has_fingerprint());
        assert!(decoded.has_integrity());

        let username: Username = decoded.get_attribute().unwrap().unwrap();
        assert_eq!(username.0, "alice:bob");

        let priority: Priority = decoded.get_attribute().unwrap().unwrap();
        assert_eq!(priority.0, 12345);

        decoded
            .verify_integrity(&Credentials::short_term("swordfish"))
            .unwrap();

        assert_eq!(
            decoded.verify_integrity(&Credentials::short_term("wrong")),
            Err(DecodeError::IntegrityMismatch)
        );
    }

    #[test]
    fn decode_rejects_bad_cookie() {
        let mut bytes = vec![0u8; 20];
        bytes[0..2].copy_from_slice(&0x0001u16.to_be_bytes());
        assert_eq!(Message::decode(&bytes), Err(DecodeError::Malformed));
    }

    #[test]
    fn decode_never_panics_on_garbage() {
        for len in 0..64 {
            let bytes = vec![0xAAu8; len];
            let _ = Message::decode(&bytes);
        }
    }

    #[test]
    fn decode_flags_unknown_required_attribute() {
        let txn = TransactionId::random();

        // A bare header plus one comprehension-required attribute (0x7001 is
        // below 0x8000 and not in the known set) with no integrity/fingerprint.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&pack_message_type(Method::Binding, Class::Request).to_be_bytes());
        bytes.extend_from_slice(&8u16.to_be_bytes());
        bytes.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes.extend_from_slice(txn.as_bytes());
        bytes.extend_from_slice(&0x7001u16.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);

        match Message::decode(&bytes) {
            Err(DecodeError::UnknownRequired(got_txn, types)) => {
                assert_eq!(got_txn, txn);
                assert_eq!(types, vec![0x7001]);
            }
            other => panic!("expected UnknownRequired, got {other:?}"),
        }
    }
}
