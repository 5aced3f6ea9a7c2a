//! spec.md §8 end-to-end scenario 4: TURN Allocate challenged with a 401,
//! retried with long-term credentials, then closed with a LIFETIME=0 Refresh.
//! The fake server here is just hand-built STUN/TURN messages fed straight
//! into `TurnClient::receive`, mirroring `turn.rs`'s own `allocate_retries_after_401`
//! unit test but carried through to a full allocate-then-close round trip.

use std::net::SocketAddr;
use std::time::Instant;

use ice_agent::{TurnClient, TurnEvent};
use stun_types::attributes::{ErrorCode, Lifetime, Nonce, Realm, XorRelayedAddress};
use stun_types::{Class, Message, MessageBuilder, Method};

fn server_addr() -> SocketAddr {
    "203.0.113.1:3478".parse().unwrap()
}

#[test]
fn allocate_survives_401_challenge_then_closes_with_lifetime_zero() {
    let server = server_addr();
    let mut client = TurnClient::new(server, "alice".into(), "secret".into());
    let now = Instant::now();

    let mut events = Vec::new();
    client.allocate(now, &mut |event| events.push(event));
    assert_eq!(events.len(), 1);
    let first_request = match events.remove(0) {
        TurnEvent::SendToServer(bytes) => bytes,
        other => panic!("expected SendToServer, got {other:?}"),
    };
    let first_message = Message::decode(&first_request).unwrap();
    assert_eq!(first_message.method(), Method::Allocate);

    let mut challenge = MessageBuilder::new(Method::Allocate, Class::Error, first_message.transaction_id());
    challenge.add_attribute(&ErrorCode {
        code: 401,
        reason: "Unauthorized".into(),
    });
    challenge.add_attribute(&Realm("example.org".into()));
    challenge.add_attribute(&Nonce("n0nce".into()));
    let challenge_bytes = challenge.build();

    let mut events = Vec::new();
    let consumed = client.receive(server, &challenge_bytes, now, &mut |event| events.push(event));
    assert!(consumed, "401 challenge must be recognized as TURN traffic");
    assert_eq!(events.len(), 1);
    let retried_request = match events.remove(0) {
        TurnEvent::SendToServer(bytes) => bytes,
        other => panic!("expected a retried Allocate, got {other:?}"),
    };
    let retried_message = Message::decode(&retried_request).unwrap();
    assert_eq!(retried_message.method(), Method::Allocate);
    assert_ne!(
        retried_message.transaction_id(),
        first_message.transaction_id(),
        "the retried Allocate must use a fresh transaction id"
    );

    let relayed: SocketAddr = "198.51.100.9:55000".parse().unwrap();
    let mut success = MessageBuilder::new(Method::Allocate, Class::Success, retried_message.transaction_id());
    success.add_attribute(&XorRelayedAddress(relayed));
    success.add_attribute(&Lifetime(3600));
    let success_bytes = success.build();

    let mut events = Vec::new();
    let consumed = client.receive(server, &success_bytes, now, &mut |event| events.push(event));
    assert!(consumed);
    assert!(
        events.iter().any(|event| matches!(event, TurnEvent::RelayedAddress(addr) if *addr == relayed)),
        "expected a RelayedAddress event carrying {relayed}"
    );
    assert_eq!(client.relayed_address(), Some(relayed));
    assert!(!client.is_failed());

    let mut events = Vec::new();
    client.close(&mut |event| events.push(event));
    assert_eq!(events.len(), 1);
    let close_request = match events.remove(0) {
        TurnEvent::SendToServer(bytes) => bytes,
        other => panic!("expected a closing Refresh, got {other:?}"),
    };
    let close_message = Message::decode(&close_request).unwrap();
    assert_eq!(close_message.method(), Method::Refresh);
    let lifetime = close_message.get_attribute::<Lifetime>().unwrap().unwrap();
    assert_eq!(lifetime.0, 0, "closing Refresh must carry LIFETIME=0");
    assert_eq!(client.relayed_address(), None, "allocation must be considered released after close");
}
