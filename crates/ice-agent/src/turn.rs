//! TURN client: Allocate, Refresh, CreatePermission, ChannelBind, Send/Data (spec §4.2).
//!
//! Grounded on `snownet::allocation::Allocation`, reimplemented against
//! `stun_types` instead of `stun_codec`/`bytecodec`, and corrected to the
//! timing/range constants spec.md §3/§4.2 names explicitly.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use stun_types::attributes::{
    ChannelNumber, Data, DontFragment, ErrorCode, Lifetime, Nonce, Realm, RequestedTransport,
    Username, XorPeerAddress, XorRelayedAddress,
};
use stun_types::{Class, Credentials, Message, MessageBuilder, Method, TransactionId};

use crate::error::TurnError;

const FIRST_CHANNEL: u16 = 0x4000;
const LAST_CHANNEL: u16 = 0x7FFE;
const PERMISSION_LIFETIME: Duration = Duration::from_secs(5 * 60);
const CHANNEL_LIFETIME: Duration = Duration::from_secs(10 * 60);
const CHANNEL_REBIND_AFTER: Duration = Duration::from_secs(9 * 60);
const SENDS_BEFORE_CHANNEL_BIND: u32 = 2;
const INITIAL_RTO: Duration = Duration::from_millis(500);
const MAX_RETRANSMITS: u32 = 7;

#[derive(Debug)]
pub enum TurnEvent {
    /// A STUN/TURN message to send to the TURN server.
    SendToServer(Vec<u8>),
    /// A ChannelData-framed payload to send to the TURN server.
    SendChannelData(Vec<u8>),
    /// The relayed transport address the application should advertise.
    RelayedAddress(SocketAddr),
    /// Data received from `peer` via this allocation.
    DataReceived { peer: SocketAddr, data: Vec<u8> },
    Failed(String),
}

#[derive(Debug)]
enum RequestState {
    InProgress {
        transaction_id: TransactionId,
        body: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
        on_timeout_fails_allocation: bool,
    },
    Idle,
}

#[derive(Debug)]
struct Permission {
    expires_at: Instant,
}

#[derive(Debug)]
struct Channel {
    number: u16,
    peer: SocketAddr,
    rebind_at: Instant,
}

/// Sans-IO TURN client for a single allocation on one relay server.
pub struct TurnClient {
    server: SocketAddr,
    username: String,
    password: String,
    realm: Option<String>,
    nonce: Option<String>,

    relayed_address: Option<SocketAddr>,
    lifetime: Option<Duration>,
    refresh_at: Option<Instant>,

    permissions: HashMap<IpAddr, Permission>,
    channels: HashMap<SocketAddr, Channel>,
    channel_by_number: HashMap<u16, SocketAddr>,
    next_channel_number: u16,
    send_counts: HashMap<SocketAddr, u32>,

    pending_channel_binds: VecDeque<SocketAddr>,
    request: RequestState,
    allocated: bool,
    failed: bool,
}

impl TurnClient {
    pub fn new(server: SocketAddr, username: String, password: String) -> Self {
        Self {
            server,
            username,
            password,
            realm: None,
            nonce: None,
            relayed_address: None,
            lifetime: None,
            refresh_at: None,
            permissions: HashMap::new(),
            channels: HashMap::new(),
            channel_by_number: HashMap::new(),
            next_channel_number: FIRST_CHANNEL,
            send_counts: HashMap::new(),
            pending_channel_binds: VecDeque::new(),
            request: RequestState::Idle,
            allocated: false,
            failed: false,
        }
    }

    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.relayed_address
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Kicks off the Allocate exchange. A no-op if already allocated/allocating.
    pub fn allocate(&mut self, now: Instant, on_event: &mut dyn FnMut(TurnEvent)) {
        if self.allocated || matches!(self.request, RequestState::InProgress { .. }) {
            return;
        }

        let mut builder = self.new_request(Method::Allocate);
        builder.add_attribute(&RequestedTransport::UDP);
        builder.add_attribute(&DontFragment);
        self.send_request(builder, now, true, on_event);
    }

    pub fn create_permission(&mut self, peer: IpAddr, now: Instant, on_event: &mut dyn FnMut(TurnEvent)) {
        if let Some(permission) = self.permissions.get(&peer) {
            if permission.expires_at > now {
                return;
            }
        }

        if !self.allocated {
            return;
        }

        let mut builder = self.new_request(Method::CreatePermission);
        builder.add_attribute(&XorPeerAddress(SocketAddr::new(peer, 0)));
        self.send_request(builder, now, false, on_event);

        self.permissions.insert(
            peer,
            Permission {
                expires_at: now + PERMISSION_LIFETIME,
            },
        );
    }

    /// Requests a channel binding for `peer`, buffering the request if the
    /// allocation hasn't completed yet (mirrors `snownet`'s
    /// `BufferedChannelBindings`).
    pub fn bind_channel(&mut self, peer: SocketAddr, now: Instant, on_event: &mut dyn FnMut(TurnEvent)) {
        if self.channels.contains_key(&peer) {
            return;
        }

        if !self.allocated {
            self.pending_channel_binds.push_back(peer);
            return;
        }

        self.send_channel_bind(peer, now, on_event);
    }

    fn send_channel_bind(&mut self, peer: SocketAddr, now: Instant, on_event: &mut dyn FnMut(TurnEvent)) {
        let number = self.next_channel_number;
        self.next_channel_number = if self.next_channel_number >= LAST_CHANNEL {
            FIRST_CHANNEL
        } else {
            self.next_channel_number + 1
        };

        let mut builder = self.new_request(Method::ChannelBind);
        builder.add_attribute(&ChannelNumber(number));
        builder.add_attribute(&XorPeerAddress(peer));
        self.send_request(builder, now, false, on_event);

        self.channels.insert(
            peer,
            Channel {
                number,
                peer,
                rebind_at: now + CHANNEL_REBIND_AFTER,
            },
        );
        self.channel_by_number.insert(number, peer);
    }

    /// Sends application data to `peer`: via ChannelData once bound, otherwise
    /// wrapped in a Send indication. A ChannelBind is attempted automatically
    /// after the configured number of Send indications to the same peer.
    pub fn send_to(&mut self, peer: SocketAddr, data: &[u8], now: Instant, on_event: &mut dyn FnMut(TurnEvent)) {
        if let Some(channel) = self.channels.get(&peer) {
            let mut framed = Vec::with_capacity(4 + data.len() + 3);
            framed.extend_from_slice(&channel.number.to_be_bytes());
            framed.extend_from_slice(&(data.len() as u16).to_be_bytes());
            framed.extend_from_slice(data);
            let padding = (4 - (data.len() % 4)) % 4;
            framed.extend(std::iter::repeat(0).take(padding));
            on_event(TurnEvent::SendChannelData(framed));
            return;
        }

        let mut builder = MessageBuilder::new(Method::Send, Class::Indication, TransactionId::random());
        builder.add_attribute(&XorPeerAddress(peer));
        builder.add_attribute(&Data(data.to_vec()));
        on_event(TurnEvent::SendToServer(builder.build()));

        let count = self.send_counts.entry(peer).or_insert(0);
        *count += 1;
        if *count >= SENDS_BEFORE_CHANNEL_BIND {
            self.bind_channel(peer, now, on_event);
        }
    }

    /// Feeds a datagram received from the TURN server. Returns `true` if the
    /// datagram was TURN-owned (STUN response or ChannelData) and consumed.
    pub fn receive(&mut self, from: SocketAddr, data: &[u8], now: Instant, on_event: &mut dyn FnMut(TurnEvent)) -> bool {
        if from != self.server {
            return false;
        }

        if data.len() >= 4 && (data[0] & 0b1100_0000) == 0b0100_0000 {
            let number = u16::from_be_bytes([data[0], data[1]]);
            let length = u16::from_be_bytes([data[2], data[3]]) as usize;
            if let Some(&peer) = self.channel_by_number.get(&number) {
                if let Some(payload) = data.get(4..4 + length) {
                    on_event(TurnEvent::DataReceived {
                        peer,
                        data: payload.to_vec(),
                    });
                }
            }
            return true;
        }

        let Ok(message) = Message::decode(data) else {
            return true;
        };

        self.handle_message(message, now, on_event);
        true
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        match &self.request {
            RequestState::InProgress { retransmit_at, .. } => Some(*retransmit_at),
            RequestState::Idle => self.refresh_at,
        }
    }

    pub fn poll(&mut self, now: Instant, on_event: &mut dyn FnMut(TurnEvent)) {
        if let RequestState::InProgress {
            body,
            retransmit_at,
            retransmits,
            on_timeout_fails_allocation,
            ..
        } = &mut self.request
        {
            if now >= *retransmit_at {
                if *retransmits >= MAX_RETRANSMITS {
                    let fails_allocation = *on_timeout_fails_allocation;
                    self.request = RequestState::Idle;
                    on_event(TurnEvent::Failed("TURN transaction timed out".into()));
                    if fails_allocation {
                        self.failed = true;
                    }
                    return;
                }

                on_event(TurnEvent::SendToServer(body.clone()));
                *retransmits += 1;
                *retransmit_at = now + INITIAL_RTO * 2u32.pow(*retransmits);
                return;
            }
        }

        if let Some(refresh_at) = self.refresh_at {
            if now >= refresh_at && matches!(self.request, RequestState::Idle) {
                self.refresh(now, on_event);
            }
        }

        let mut rebind = Vec::new();
        for channel in self.channels.values() {
            if now >= channel.rebind_at {
                rebind.push(channel.peer);
            }
        }
        for peer in rebind {
            self.channels.remove(&peer);
            self.send_channel_bind(peer, now, on_event);
        }
    }

    fn refresh(&mut self, now: Instant, on_event: &mut dyn FnMut(TurnEvent)) {
        let mut builder = self.new_request(Method::Refresh);
        builder.add_attribute(&Lifetime(3600));
        self.send_request(builder, now, false, on_event);
    }

    /// Releases the allocation with a Refresh carrying LIFETIME=0, best-effort,
    /// one attempt (spec §5 "Cancellation").
    pub fn close(&mut self, on_event: &mut dyn FnMut(TurnEvent)) {
        if !self.allocated {
            return;
        }
        let mut builder = self.new_request(Method::Refresh);
        builder.add_attribute(&Lifetime(0));
        on_event(TurnEvent::SendToServer(builder.build()));
        self.allocated = false;
        self.relayed_address = None;
    }

    fn new_request(&self, method: Method) -> MessageBuilder {
        let mut builder = MessageBuilder::new(method, Class::Request, TransactionId::random());

        if let (Some(realm), Some(nonce)) = (&self.realm, &self.nonce) {
            builder.add_attribute(&Username(self.username.clone()));
            builder.add_attribute(&Realm(realm.clone()));
            builder.add_attribute(&Nonce(nonce.clone()));
            builder.credentials(Credentials::long_term(&self.username, realm, &self.password));
        }

        builder
    }

    fn send_request(
        &mut self,
        builder: MessageBuilder,
        now: Instant,
        on_timeout_fails_allocation: bool,
        on_event: &mut dyn FnMut(TurnEvent),
    ) {
        let transaction_id = builder.transaction_id();
        let body = builder.build();
        on_event(TurnEvent::SendToServer(body.clone()));

        self.request = RequestState::InProgress {
            transaction_id,
            body,
            retransmit_at: now + INITIAL_RTO,
            retransmits: 0,
            on_timeout_fails_allocation,
        };
    }

    fn handle_message(&mut self, message: Message, now: Instant, on_event: &mut dyn FnMut(TurnEvent)) {
        let RequestState::InProgress { transaction_id, .. } = &self.request else {
            return;
        };

        if message.transaction_id() != *transaction_id {
            return;
        }

        let method = message.method();
        self.request = RequestState::Idle;

        match message.class() {
            Class::Error => {
                let Some(Ok(error)) = message.get_attribute::<ErrorCode>() else {
                    on_event(TurnEvent::Failed("TURN error response missing ERROR-CODE".into()));
                    return;
                };

                match error.code {
                    401 => {
                        if let (Some(Ok(realm)), Some(Ok(nonce))) = (
                            message.get_attribute::<Realm>(),
                            message.get_attribute::<Nonce>(),
                        ) {
                            self.realm = Some(realm.0);
                            self.nonce = Some(nonce.0);
                            self.retry(method, now, on_event);
                        }
                    }
                    438 => {
                        if let Some(Ok(nonce)) = message.get_attribute::<Nonce>() {
                            self.nonce = Some(nonce.0);
                            self.retry(method, now, on_event);
                        }
                    }
                    _ => {
                        on_event(TurnEvent::Failed(format!("TURN error {}", error.code)));
                        if method == Method::Allocate {
                            self.failed = true;
                        }
                    }
                }
            }
            Class::Success => match method {
                Method::Allocate => {
                    self.allocated = true;

                    if let Some(Ok(relayed)) = message.get_attribute::<XorRelayedAddress>() {
                        self.relayed_address = Some(relayed.0);
                        on_event(TurnEvent::RelayedAddress(relayed.0));
                    }

                    if let Some(Ok(lifetime)) = message.get_attribute::<Lifetime>() {
                        let lifetime = Duration::from_secs(lifetime.0 as u64);
                        self.lifetime = Some(lifetime);
                        self.refresh_at = Some(now + lifetime.mul_f64(0.75));
                    }

                    let pending: Vec<_> = self.pending_channel_binds.drain(..).collect();
                    for peer in pending {
                        self.send_channel_bind(peer, now, on_event);
                    }
                }
                Method::Refresh => {
                    if let Some(Ok(lifetime)) = message.get_attribute::<Lifetime>() {
                        if lifetime.0 == 0 {
                            self.allocated = false;
                            self.relayed_address = None;
                        } else {
                            let lifetime = Duration::from_secs(lifetime.0 as u64);
                            self.refresh_at = Some(now + lifetime.mul_f64(0.75));
                        }
                    }
                }
                Method::ChannelBind | Method::CreatePermission => {}
                _ => {}
            },
            _ => {}
        }
    }

    fn retry(&mut self, method: Method, now: Instant, on_event: &mut dyn FnMut(TurnEvent)) {
        let mut builder = self.new_request(method);
        if method == Method::Allocate {
            builder.add_attribute(&RequestedTransport::UDP);
            builder.add_attribute(&DontFragment);
        }
        self.send_request(builder, now, method == Method::Allocate, on_event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_numbers_stay_in_range() {
        let mut client = TurnClient::new("203.0.113.1:3478".parse().unwrap(), "u".into(), "p".into());
        client.allocated = true;

        let mut events = Vec::new();
        for i in 0..5u16 {
            let peer: SocketAddr = format!("198.51.100.{}:1000", i + 1).parse().unwrap();
            client.send_channel_bind(peer, Instant::now(), &mut |e| events.push(e));
        }

        for (_, channel) in &client.channels {
            assert!((FIRST_CHANNEL..=LAST_CHANNEL).contains(&channel.number));
        }
    }

    #[test]
    fn allocate_retries_after_401() {
        let mut client = TurnClient::new("203.0.113.1:3478".parse().unwrap(), "u".into(), "p".into());
        let now = Instant::now();
        let mut events = Vec::new();
        client.allocate(now, &mut |e| events.push(e));
        assert!(matches!(events[0], TurnEvent::SendToServer(_)));

        let transaction_id = match &client.request {
            RequestState::InProgress { transaction_id, .. } => *transaction_id,
            RequestState::Idle => panic!("expected an in-progress Allocate"),
        };

        let mut response = MessageBuilder::new(Method::Allocate, Class::Error, transaction_id);
        response.add_attribute(&ErrorCode {
            code: 401,
            reason: "Unauthorized".into(),
        });
        response.add_attribute(&Realm("example.org".into()));
        response.add_attribute(&Nonce("abc123".into()));
        let bytes = response.build();

        events.clear();
        client.receive("203.0.113.1:3478".parse().unwrap(), &bytes, now, &mut |e| events.push(e));

        assert_eq!(client.realm.as_deref(), Some("example.org"));
        assert_eq!(client.nonce.as_deref(), Some("abc123"));
        assert!(matches!(client.request, RequestState::InProgress { .. }));
    }
}
