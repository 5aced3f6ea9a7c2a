//! Fixed test vectors from RFC 5769 ("Test Vectors for STUN").

use stun_types::attributes::{IceControlled, Priority, Software, Username};
use stun_types::{Class, Credentials, Message, Method};

/// RFC 5769 §2.1 "Sample Request".
#[rustfmt::skip]
const SAMPLE_REQUEST: &[u8] = &[
    0x00, 0x01, 0x00, 0x58,
    0x21, 0x12, 0xa4, 0x42,
    0xb7, 0xe7, 0xa7, 0x01,
    0xbc, 0x34, 0xd6, 0x86,
    0xfa, 0x87, 0xdf, 0xae,

    0x80, 0x22, 0x00, 0x10,
    0x53, 0x54, 0x55, 0x4e,
    0x20, 0x74, 0x65, 0x73,
    0x74, 0x20, 0x63, 0x6c,
    0x69, 0x65, 0x6e, 0x74,

    0x00, 0x06, 0x00, 0x09,
    0x65, 0x76, 0x74, 0x6a,
    0x3a, 0x68, 0x36, 0x76,
    0x59, 0x20, 0x20, 0x20,

    0x00, 0x24, 0x00, 0x04,
    0x6e, 0x00, 0x01, 0xff,

    0x80, 0x29, 0x00, 0x08,
    0x93, 0x2f, 0xf9, 0xb1,
    0x51, 0x26, 0x3b, 0x36,

    0x00, 0x08, 0x00, 0x14,
    0x9a, 0xea, 0xa7, 0x0c,
    0xbf, 0xd8, 0xcb, 0x56,
    0x78, 0x1e, 0xf2, 0xb5,
    0xb2, 0xd3, 0xf2, 0x49,
    0xc1, 0xb5, 0x71, 0xa2,

    0x80, 0x28, 0x00, 0x04,
    0xe5, 0x7a, 0x3b, 0xcf,
];

const SAMPLE_PASSWORD: &str = "VOkJxbRl1RmTxUk/WvJxBt";

#[test]
fn sample_request_decodes() {
    let message = Message::decode(SAMPLE_REQUEST).expect("well-formed sample message");

    assert_eq!(message.method(), Method::Binding);
    assert_eq!(message.class(), Class::Request);
    assert!(message.has_fingerprint());
    assert!(message.has_integrity());

    let username: Username = message.get_attribute().unwrap().unwrap();
    assert_eq!(username.0, "evtj:h6vY");

    let software: Software = message.get_attribute().unwrap().unwrap();
    assert_eq!(software.0, "STUN test client");

    let priority: Priority = message.get_attribute().unwrap().unwrap();
    assert_eq!(priority.0, 0x6e0001ff);

    let _ice_controlled: IceControlled = message.get_attribute().unwrap().unwrap();

    message
        .verify_integrity(&Credentials::short_term(SAMPLE_PASSWORD))
        .expect("MESSAGE-INTEGRITY must verify under the sample password");
}

#[test]
fn sample_request_integrity_rejects_wrong_password() {
    let message = Message::decode(SAMPLE_REQUEST).unwrap();
    assert!(message
        .verify_integrity(&Credentials::short_term("not the right password"))
        .is_err());
}
