//! The ICE agent state machine (spec §4.3): gathering, pair formation,
//! checklist, triggered checks, nomination, keep-alive, role conflict.
//!
//! Generalized from `ezk-ice`'s `IceAgent`, dropping its RTP/RTCP dual
//! `Component` model (this agent fixes component at 1), adding the Relayed
//! candidate kind, real Failed-state logic, and string foundations.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use rand::distributions::{Alphanumeric, DistString};
use sdp_types::{IceCandidate as WireCandidate, UntaggedAddress};
use slotmap::SlotMap;
use stun_types::attributes::{
    ErrorCode, IceControlled, IceControlling, Priority, UnknownAttributes, UseCandidate, Username,
    XorMappedAddress,
};
use stun_types::{Class, Credentials, DecodeError, Message, MessageBuilder, Method, TransactionId};

use crate::candidate::{compute_foundation, compute_priority, Candidate, CandidateKind, LocalCandidateId, RemoteCandidateId};
use crate::pair::{pair_priority, CandidatePair, CandidatePairState};
use crate::turn::{TurnClient, TurnEvent};

const TA_INTERVAL: Duration = Duration::from_millis(50);
const INITIAL_RTO: Duration = Duration::from_millis(500);
const MAX_RETRANSMITS: u32 = 7;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const GATHERING_CAP: Duration = Duration::from_secs(10);
const NO_SUCCESS_DEADLINE: Duration = Duration::from_secs(30);
const PEER_REFLEXIVE_LOCAL_PREF: u16 = 65535;

/// Short-term credentials exchanged over signaling (spec §3).
#[derive(Debug, Clone)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    /// `ufrag` length >= 4, `pwd` length >= 22 (spec §3).
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            ufrag: Alphanumeric.sample_string(&mut rng, 8),
            pwd: Alphanumeric.sample_string(&mut rng, 24),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Completed,
    Failed,
}

/// A datagram received on the agent's UDP transport.
pub struct ReceivedPkt {
    pub data: Vec<u8>,
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

#[derive(Debug)]
pub enum IceEvent {
    StateChanged { old: AgentState, new: AgentState },
    GatheringDone,
    CandidateGathered(WireCandidate),
    /// Application payload received on the selected pair.
    Data(Vec<u8>),
    /// Bytes the dispatcher must hand to the UDP transport.
    Transmit { data: Vec<u8>, target: SocketAddr },
}

#[derive(Debug)]
enum StunBindingState {
    Waiting,
    InProgress {
        transaction_id: TransactionId,
        body: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
    },
    Done,
    Failed,
}

/// Gathers one server-reflexive candidate from a configured STUN server.
struct StunServerBinding {
    server: SocketAddr,
    state: StunBindingState,
}

impl StunServerBinding {
    fn new(server: SocketAddr) -> Self {
        Self {
            server,
            state: StunBindingState::Waiting,
        }
    }

    fn completed(&self) -> bool {
        matches!(self.state, StunBindingState::Done | StunBindingState::Failed)
    }

    fn poll(&mut self, now: Instant, on_event: &mut dyn FnMut(IceEvent)) {
        match &mut self.state {
            StunBindingState::Waiting => {
                let transaction_id = TransactionId::random();
                let body = MessageBuilder::new(Method::Binding, Class::Request, transaction_id).build();
                on_event(IceEvent::Transmit {
                    data: body.clone(),
                    target: self.server,
                });
                self.state = StunBindingState::InProgress {
                    transaction_id,
                    body,
                    retransmit_at: now + INITIAL_RTO,
                    retransmits: 0,
                };
            }
            StunBindingState::InProgress {
                body,
                retransmit_at,
                retransmits,
                ..
            } => {
                if now < *retransmit_at {
                    return;
                }
                if *retransmits >= MAX_RETRANSMITS {
                    self.state = StunBindingState::Failed;
                    return;
                }
                on_event(IceEvent::Transmit {
                    data: body.clone(),
                    target: self.server,
                });
                *retransmits += 1;
                *retransmit_at = now + INITIAL_RTO * 2u32.pow(*retransmits);
            }
            StunBindingState::Done | StunBindingState::Failed => {}
        }
    }

    fn wants_response(&self, transaction_id: TransactionId) -> bool {
        matches!(&self.state, StunBindingState::InProgress { transaction_id: t, .. } if *t == transaction_id)
    }

    fn receive_response(&mut self, message: &Message) -> Option<SocketAddr> {
        let mapped = message.get_attribute::<XorMappedAddress>()?.ok()?;
        self.state = StunBindingState::Done;
        Some(mapped.0)
    }

    fn fail(&mut self) {
        self.state = StunBindingState::Failed;
    }
}

/// A TURN allocation in progress or established; tracks the relayed candidate
/// it produced once the allocation succeeds.
struct TurnAllocation {
    client: TurnClient,
    server: SocketAddr,
    announced: bool,
}

pub struct IceAgent {
    local_credentials: IceCredentials,
    remote_credentials: Option<IceCredentials>,

    is_controlling: bool,
    tie_breaker: u64,
    aggressive_nomination: bool,

    local_candidates: SlotMap<LocalCandidateId, Candidate>,
    remote_candidates: SlotMap<RemoteCandidateId, Candidate>,
    pairs: Vec<CandidatePair>,
    triggered_check_queue: VecDeque<(LocalCandidateId, RemoteCandidateId)>,

    local_base: SocketAddr,
    stun_servers: Vec<StunServerBinding>,
    turn_allocations: Vec<TurnAllocation>,

    gathering_state: GatheringState,
    gathering_started_at: Option<Instant>,
    agent_state: AgentState,
    selected_pair: Option<(LocalCandidateId, RemoteCandidateId)>,

    first_check_at: Option<Instant>,
    last_ta_trigger: Option<Instant>,
    last_keepalive_at: Option<Instant>,
}

impl IceAgent {
    pub fn new(local_credentials: IceCredentials, is_controlling: bool, local_base: SocketAddr) -> Self {
        Self {
            local_credentials,
            remote_credentials: None,
            is_controlling,
            tie_breaker: rand::random(),
            aggressive_nomination: false,
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            pairs: Vec::new(),
            triggered_check_queue: VecDeque::new(),
            local_base,
            stun_servers: Vec::new(),
            turn_allocations: Vec::new(),
            gathering_state: GatheringState::New,
            gathering_started_at: None,
            agent_state: AgentState::Disconnected,
            selected_pair: None,
            first_check_at: None,
            last_ta_trigger: None,
            last_keepalive_at: None,
        }
    }

    pub fn set_aggressive_nomination(&mut self, aggressive: bool) {
        self.aggressive_nomination = aggressive;
    }

    pub fn credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    pub fn gathering_state(&self) -> GatheringState {
        self.gathering_state
    }

    pub fn agent_state(&self) -> AgentState {
        self.agent_state
    }

    pub fn add_stun_server(&mut self, server: SocketAddr) {
        self.stun_servers.push(StunServerBinding::new(server));
    }

    pub fn add_turn_server(&mut self, server: SocketAddr, username: String, password: String) {
        self.turn_allocations.push(TurnAllocation {
            client: TurnClient::new(server, username, password),
            server,
            announced: false,
        });
    }

    /// Registers a host candidate address (spec §4.3 "Gathering" step 1);
    /// the caller supplies addresses via [`crate::address::gather_host_candidates`].
    pub fn add_host_candidate(&mut self, ip: IpAddr) {
        let addr = SocketAddr::new(ip, self.local_base.port());
        self.add_local_candidate(CandidateKind::Host, addr, addr, None);
    }

    pub fn set_remote_credentials(&mut self, credentials: IceCredentials) {
        self.remote_credentials = Some(credentials);
    }

    pub fn add_remote_candidate(&mut self, candidate: &WireCandidate) {
        let kind = match candidate.typ.as_str() {
            "host" => CandidateKind::Host,
            "srflx" => CandidateKind::ServerReflexive,
            "relay" => CandidateKind::Relayed,
            _ => return,
        };

        if !candidate.transport.eq_ignore_ascii_case("udp") {
            return;
        }

        let ip = match candidate.address {
            UntaggedAddress::Fqdn(_) => return,
            UntaggedAddress::IpAddress(ip) => ip,
        };

        let addr = SocketAddr::new(ip, candidate.port);
        let priority = match u32::try_from(candidate.priority) {
            Ok(priority) => priority,
            Err(_) => return,
        };

        self.remote_candidates.insert(Candidate {
            addr,
            kind,
            priority,
            foundation: candidate.foundation.clone(),
            base: addr,
        });

        self.form_pairs();
    }

    fn add_local_candidate(
        &mut self,
        kind: CandidateKind,
        addr: SocketAddr,
        base: SocketAddr,
        server: Option<SocketAddr>,
    ) -> LocalCandidateId {
        if let Some((id, _)) = self
            .local_candidates
            .iter()
            .find(|(_, c)| c.kind == kind && c.base == base && c.addr == addr)
        {
            return id;
        }

        let local_pref = match kind {
            CandidateKind::Host => 65535,
            CandidateKind::ServerReflexive => 65534,
            CandidateKind::Relayed => 65533,
            CandidateKind::PeerReflexive => 65532,
        };
        let priority = compute_priority(kind, local_pref, 1);
        let foundation = compute_foundation(kind, base.ip(), server);

        let id = self.local_candidates.insert(Candidate {
            addr,
            kind,
            priority,
            foundation,
            base,
        });

        log::debug!("gathered local candidate {kind:?} {addr} base={base}");
        self.form_pairs();
        id
    }

    fn form_pairs(&mut self) {
        let local_ids: Vec<_> = self.local_candidates.keys().collect();
        let remote_ids: Vec<_> = self.remote_candidates.keys().collect();

        for &local_id in &local_ids {
            for &remote_id in &remote_ids {
                if self.remote_candidates[remote_id].kind == CandidateKind::PeerReflexive {
                    continue;
                }

                let local = &self.local_candidates[local_id];
                let remote = &self.remote_candidates[remote_id];

                if local.base.is_ipv4() != remote.addr.is_ipv4() {
                    continue;
                }

                self.add_pair_if_new(local_id, remote_id, false);
            }
        }

        self.pairs.sort_unstable_by(|a, b| b.priority.cmp(&a.priority));
        self.unfreeze_initial();
    }

    /// Enforces "at most one pair per (local.base, remote)" by keeping only the
    /// highest-priority pair whenever two local candidates share a base.
    fn add_pair_if_new(&mut self, local_id: LocalCandidateId, remote_id: RemoteCandidateId, received_use_candidate: bool) -> bool {
        let local = &self.local_candidates[local_id];
        let remote = &self.remote_candidates[remote_id];
        let base = local.base;
        let priority = pair_priority(local.priority, remote.priority, self.is_controlling);

        if let Some(existing_idx) = self.pairs.iter().position(|p| {
            p.remote == remote_id && self.local_candidates[p.local].base == base
        }) {
            if self.pairs[existing_idx].priority >= priority {
                return false;
            }
            self.pairs.remove(existing_idx);
        }

        let local = &self.local_candidates[local_id];
        let mut pair = CandidatePair::new(local_id, remote_id, priority, local.foundation.clone());
        pair.received_use_candidate = received_use_candidate;
        self.pairs.push(pair);
        true
    }

    /// Spec §3 checklist invariant: one Waiting pair per foundation group
    /// (its lowest-priority... actually highest-priority member), rest Frozen.
    fn unfreeze_initial(&mut self) {
        let mut seen_foundations: Vec<String> = Vec::new();

        for pair in &mut self.pairs {
            if matches!(pair.state, CandidatePairState::Succeeded | CandidatePairState::Failed | CandidatePairState::InProgress { .. }) {
                continue;
            }

            if seen_foundations.contains(&pair.foundation) {
                pair.state = CandidatePairState::Frozen;
            } else {
                seen_foundations.push(pair.foundation.clone());
                pair.state = CandidatePairState::Waiting;
            }
        }
    }

    fn unfreeze_foundation(&mut self, foundation: &str) {
        for pair in &mut self.pairs {
            if pair.foundation == foundation && matches!(pair.state, CandidatePairState::Frozen) {
                pair.state = CandidatePairState::Waiting;
            }
        }
    }

    fn recompute_pair_priorities(&mut self) {
        for pair in &mut self.pairs {
            pair.priority = pair_priority(
                self.local_candidates[pair.local].priority,
                self.remote_candidates[pair.remote].priority,
                self.is_controlling,
            );
        }
        self.pairs.sort_unstable_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn receive(&mut self, pkt: &ReceivedPkt, now: Instant, on_event: &mut dyn FnMut(IceEvent)) {
        for allocation in &mut self.turn_allocations {
            let server = allocation.server;
            let mut announced = None;
            let consumed = allocation.client.receive(pkt.source, &pkt.data, now, &mut |event| {
                Self::forward_turn_event(event, server, on_event, &mut announced);
            });
            if let Some(relayed) = announced {
                self.promote_turn_candidate(relayed, on_event);
            }
            if consumed {
                return;
            }
        }

        let looks_like_stun = pkt.data.first().is_some_and(|&b| b >> 6 == 0);
        if let Some((_, remote_id)) = self.selected_pair {
            if pkt.source == self.remote_candidates[remote_id].addr && !looks_like_stun {
                on_event(IceEvent::Data(pkt.data.clone()));
                return;
            }
        }

        let message = match Message::decode(&pkt.data) {
            Ok(message) => message,
            Err(DecodeError::UnknownRequired(transaction_id, types)) => {
                let response = make_unknown_attributes_response(transaction_id, &self.local_credentials.pwd, types);
                on_event(IceEvent::Transmit { data: response, target: pkt.source });
                return;
            }
            Err(_) => {
                log::warn!("dropping malformed STUN datagram from {}", pkt.source);
                return;
            }
        };

        match message.class() {
            Class::Request => self.receive_request(pkt, message, on_event),
            Class::Success => self.receive_success(pkt, message, now, on_event),
            Class::Error => self.receive_error(message),
            Class::Indication => {}
        }
    }

    fn forward_turn_event(event: TurnEvent, server: SocketAddr, on_event: &mut dyn FnMut(IceEvent), announced: &mut Option<SocketAddr>) {
        match event {
            TurnEvent::SendToServer(data) | TurnEvent::SendChannelData(data) => {
                on_event(IceEvent::Transmit { data, target: server });
            }
            TurnEvent::RelayedAddress(addr) => *announced = Some(addr),
            TurnEvent::DataReceived { data, .. } => on_event(IceEvent::Data(data)),
            TurnEvent::Failed(reason) => log::warn!("TURN allocation failed: {reason}"),
        }
    }

    fn promote_turn_candidate(&mut self, relayed: SocketAddr, on_event: &mut dyn FnMut(IceEvent)) {
        let already = self.local_candidates.values().any(|c| c.kind == CandidateKind::Relayed && c.addr == relayed);
        if already {
            return;
        }
        let id = self.add_local_candidate(CandidateKind::Relayed, relayed, relayed, None);
        let candidate = &self.local_candidates[id];
        on_event(IceEvent::CandidateGathered(to_wire_candidate(candidate)));
    }

    fn receive_success(&mut self, pkt: &ReceivedPkt, message: Message, _now: Instant, on_event: &mut dyn FnMut(IceEvent)) {
        for binding in &mut self.stun_servers {
            if !binding.wants_response(message.transaction_id()) {
                continue;
            }
            let Some(mapped) = binding.receive_response(&message) else {
                binding.fail();
                return;
            };
            let server = binding.server;
            self.add_local_candidate(CandidateKind::ServerReflexive, mapped, pkt.destination, Some(server));
            return;
        }

        let Some(remote_pwd) = self.remote_credentials.as_ref().map(|c| c.pwd.clone()) else {
            return;
        };
        if message.verify_integrity(&Credentials::short_term(remote_pwd)).is_err() {
            log::debug!("incoming STUN success failed integrity check, discarding");
            return;
        }

        let Some(pair_idx) = self.pairs.iter().position(|p| {
            matches!(&p.state, CandidatePairState::InProgress { transaction_id, .. } if *transaction_id == message.transaction_id())
        }) else {
            return;
        };

        let CandidatePairState::InProgress { source, target, .. } = self.pairs[pair_idx].state.clone() else {
            unreachable!()
        };

        if pkt.source != target || pkt.destination.ip() != source {
            self.pairs[pair_idx].state = CandidatePairState::Failed;
            self.pairs[pair_idx].nominated = false;
            return;
        }

        let local_id = self.pairs[pair_idx].local;
        let remote_id = self.pairs[pair_idx].remote;
        let foundation = self.pairs[pair_idx].foundation.clone();

        let local_addr = self.local_candidates[local_id].addr;
        if let Some(Ok(mapped)) = message.get_attribute::<XorMappedAddress>() {
            if mapped.0 != local_addr {
                let base = self.local_candidates[local_id].base;
                let prflx_id = self.add_local_candidate(CandidateKind::PeerReflexive, mapped.0, base, None);
                self.add_pair_if_new(prflx_id, remote_id, false);
            }
        }

        self.pairs[pair_idx].state = CandidatePairState::Succeeded;
        self.unfreeze_foundation(&foundation);

        if self.pairs[pair_idx].nominated {
            self.selected_pair = Some((local_id, remote_id));
            self.set_agent_state(AgentState::Completed, on_event);
        }
    }

    fn receive_error(&mut self, message: Message) {
        let Some(remote_pwd) = self.remote_credentials.as_ref().map(|c| c.pwd.clone()) else {
            return;
        };
        if message.verify_integrity(&Credentials::short_term(remote_pwd)).is_err() {
            return;
        }

        let Some(pair_idx) = self.pairs.iter().position(|p| {
            matches!(&p.state, CandidatePairState::InProgress { transaction_id, .. } if *transaction_id == message.transaction_id())
        }) else {
            return;
        };

        let Some(Ok(error)) = message.get_attribute::<ErrorCode>() else {
            self.pairs[pair_idx].state = CandidatePairState::Failed;
            return;
        };

        if error.code == 487 {
            let we_were_controlled = message.get_attribute::<IceControlled>().is_some();
            let we_were_controlling = message.get_attribute::<IceControlling>().is_some();

            if we_were_controlled {
                self.is_controlling = true;
            } else if we_were_controlling {
                self.is_controlling = false;
            }

            self.pairs[pair_idx].state = CandidatePairState::Waiting;
            let local = self.pairs[pair_idx].local;
            let remote = self.pairs[pair_idx].remote;
            self.triggered_check_queue.push_back((local, remote));
            self.recompute_pair_priorities();

            log::info!("resolved ICE role conflict, now controlling={}", self.is_controlling);
        } else {
            self.pairs[pair_idx].state = CandidatePairState::Failed;
        }
    }

    fn receive_request(&mut self, pkt: &ReceivedPkt, message: Message, on_event: &mut dyn FnMut(IceEvent)) {
        if message.verify_integrity(&Credentials::short_term(self.local_credentials.pwd.clone())).is_err() {
            log::debug!("incoming STUN request failed integrity check, discarding");
            return;
        }

        let Some(Ok(priority)) = message.get_attribute::<Priority>() else {
            return;
        };
        let use_candidate = message.has_attribute(UseCandidate::TYPE);

        if let Some(response) = self.check_role_conflict(&message) {
            on_event(IceEvent::Transmit { data: response, target: pkt.source });
            return;
        }

        let Some((local_id, _)) = self
            .local_candidates
            .iter()
            .find(|(_, c)| c.kind != CandidateKind::PeerReflexive && c.addr == pkt.destination)
        else {
            log::warn!("no local candidate matches destination {}", pkt.destination);
            return;
        };

        let remote_id = match self.remote_candidates.iter().find(|(_, c)| c.addr == pkt.source) {
            Some((id, _)) => id,
            None => {
                let peer_reflexive = self.remote_candidates.insert(Candidate {
                    addr: pkt.source,
                    kind: CandidateKind::PeerReflexive,
                    priority: priority.0,
                    foundation: format!("prflx-{}", pkt.source),
                    base: pkt.source,
                });
                self.add_pair_if_new(local_id, peer_reflexive, false);
                self.triggered_check_queue.push_back((local_id, peer_reflexive));
                peer_reflexive
            }
        };

        if let Some(pair) = self.pairs.iter_mut().find(|p| p.local == local_id && p.remote == remote_id) {
            pair.received_use_candidate = use_candidate;

            match pair.state {
                CandidatePairState::Waiting | CandidatePairState::Frozen | CandidatePairState::Failed => {
                    pair.state = CandidatePairState::Waiting;
                    self.triggered_check_queue.push_back((local_id, remote_id));
                }
                CandidatePairState::InProgress { .. } => {
                    self.triggered_check_queue.push_back((local_id, remote_id));
                }
                CandidatePairState::Succeeded => {}
            }
        }

        let response = make_success_response(message.transaction_id(), &self.local_credentials.pwd, pkt.source);
        on_event(IceEvent::Transmit { data: response, target: pkt.source });

        if use_candidate {
            self.poll_nomination(on_event);
        }
    }

    fn check_role_conflict(&mut self, message: &Message) -> Option<Vec<u8>> {
        if self.is_controlling {
            let ice_controlling = message.get_attribute::<IceControlling>()?.ok()?;
            if self.tie_breaker >= ice_controlling.0 {
                return Some(make_role_conflict_response(message.transaction_id(), &self.local_credentials.pwd, self.tie_breaker, true));
            }
            self.is_controlling = false;
            self.recompute_pair_priorities();
        } else {
            let ice_controlled = message.get_attribute::<IceControlled>()?.ok()?;
            if self.tie_breaker >= ice_controlled.0 {
                self.is_controlling = true;
                self.recompute_pair_priorities();
            } else {
                return Some(make_role_conflict_response(message.transaction_id(), &self.local_credentials.pwd, self.tie_breaker, false));
            }
        }
        None
    }

    pub fn poll(&mut self, now: Instant, on_event: &mut dyn FnMut(IceEvent)) {
        if self.gathering_started_at.is_none() {
            self.gathering_started_at = Some(now);
        }

        for binding in &mut self.stun_servers {
            binding.poll(now, on_event);
        }

        let mut candidates_to_emit = Vec::new();
        for (idx, allocation) in self.turn_allocations.iter_mut().enumerate() {
            let server = allocation.server;
            allocation.client.allocate(now, &mut |event| {
                Self::forward_turn_event(event, server, on_event, &mut None);
            });
            allocation.client.poll(now, &mut |event| {
                if let TurnEvent::RelayedAddress(addr) = &event {
                    candidates_to_emit.push((idx, *addr));
                }
                Self::forward_turn_event(event, server, on_event, &mut None);
            });
        }
        for (idx, addr) in candidates_to_emit {
            if !self.turn_allocations[idx].announced {
                self.turn_allocations[idx].announced = true;
                self.promote_turn_candidate(addr, on_event);
            }
        }

        self.poll_gathering_state(now, on_event);
        self.poll_retransmits(now, on_event);
        self.poll_failure_deadline(now, on_event);
        self.poll_keepalive(now, on_event);

        if self.remote_credentials.is_none() {
            return;
        }

        if let Some(last) = self.last_ta_trigger {
            if now < last + TA_INTERVAL {
                return;
            }
        }
        self.last_ta_trigger = Some(now);

        self.poll_nomination(on_event);
        self.poll_next_check(now, on_event);
    }

    fn poll_gathering_state(&mut self, now: Instant, on_event: &mut dyn FnMut(IceEvent)) {
        let stun_done = self.stun_servers.iter().all(|b| b.completed());
        let turn_done = self.turn_allocations.iter().all(|a| a.client.is_failed() || a.announced);
        let cap_elapsed = self.gathering_started_at.is_some_and(|start| now >= start + GATHERING_CAP);

        let complete = (stun_done && turn_done) || cap_elapsed;

        if complete && self.gathering_state != GatheringState::Complete {
            self.gathering_state = GatheringState::Complete;
            on_event(IceEvent::GatheringDone);
        } else if !complete && self.gathering_state == GatheringState::New {
            self.gathering_state = GatheringState::Gathering;
            self.set_agent_state(AgentState::Gathering, on_event);
        }
    }

    fn poll_retransmits(&mut self, now: Instant, on_event: &mut dyn FnMut(IceEvent)) {
        for pair in &mut self.pairs {
            let CandidatePairState::InProgress { stun_request, retransmit_at, retransmits, target, .. } = &mut pair.state else {
                continue;
            };

            if now < *retransmit_at {
                continue;
            }

            if *retransmits >= MAX_RETRANSMITS {
                pair.state = CandidatePairState::Failed;
                pair.nominated = false;
                continue;
            }

            *retransmits += 1;
            *retransmit_at = now + INITIAL_RTO * 2u32.pow(*retransmits);

            on_event(IceEvent::Transmit { data: stun_request.clone(), target: *target });
        }
    }

    fn poll_failure_deadline(&mut self, now: Instant, on_event: &mut dyn FnMut(IceEvent)) {
        if matches!(self.agent_state, AgentState::Failed | AgentState::Completed) {
            return;
        }
        if self.pairs.is_empty() {
            return;
        }

        let all_failed = self.pairs.iter().all(|p| matches!(p.state, CandidatePairState::Failed));
        let any_succeeded = self.pairs.iter().any(|p| matches!(p.state, CandidatePairState::Succeeded));

        let deadline_elapsed = self
            .first_check_at
            .is_some_and(|first| !any_succeeded && now >= first + NO_SUCCESS_DEADLINE);

        if all_failed || deadline_elapsed {
            self.set_agent_state(AgentState::Failed, on_event);
        }
    }

    fn poll_keepalive(&mut self, now: Instant, on_event: &mut dyn FnMut(IceEvent)) {
        let Some((_, remote_id)) = self.selected_pair else {
            return;
        };

        let due = self.last_keepalive_at.map_or(true, |last| now >= last + KEEPALIVE_INTERVAL);
        if !due {
            return;
        }
        self.last_keepalive_at = Some(now);

        let indication = MessageBuilder::new(Method::Binding, Class::Indication, TransactionId::random()).build();
        on_event(IceEvent::Transmit {
            data: indication,
            target: self.remote_candidates[remote_id].addr,
        });
    }

    fn poll_nomination(&mut self, on_event: &mut dyn FnMut(IceEvent)) {
        if self.selected_pair.is_some() {
            return;
        }

        if self.is_controlling {
            let already_nominated = self.pairs.iter().any(|p| p.nominated);
            if already_nominated {
                return;
            }

            let Some(pair) = self
                .pairs
                .iter_mut()
                .filter(|p| matches!(p.state, CandidatePairState::Succeeded))
                .max_by_key(|p| p.priority)
            else {
                return;
            };

            pair.nominated = true;
            self.triggered_check_queue.push_front((pair.local, pair.remote));
        } else {
            let pair = self
                .pairs
                .iter_mut()
                .filter(|p| p.received_use_candidate && matches!(p.state, CandidatePairState::Succeeded))
                .max_by_key(|p| p.priority);

            let Some(pair) = pair else {
                return;
            };

            pair.nominated = true;
            self.selected_pair = Some((pair.local, pair.remote));
            self.set_agent_state(AgentState::Completed, on_event);
        }
    }

    fn poll_next_check(&mut self, now: Instant, on_event: &mut dyn FnMut(IceEvent)) {
        let next = self
            .triggered_check_queue
            .pop_front()
            .and_then(|(local_id, remote_id)| self.pairs.iter().position(|p| p.local == local_id && p.remote == remote_id))
            .or_else(|| self.pairs.iter().position(|p| matches!(p.state, CandidatePairState::Waiting)));

        let Some(idx) = next else {
            return;
        };

        let Some(remote_credentials) = self.remote_credentials.clone() else {
            return;
        };

        let local_id = self.pairs[idx].local;
        let remote_id = self.pairs[idx].remote;
        let nominate = self.pairs[idx].nominated || self.aggressive_nomination;

        let local = &self.local_candidates[local_id];
        let remote = &self.remote_candidates[remote_id];
        let transaction_id = TransactionId::random();

        let stun_request = make_connectivity_check(
            &self.local_credentials,
            &remote_credentials,
            self.is_controlling,
            self.tie_breaker,
            nominate,
            transaction_id,
        );

        let source = local.base.ip();
        let target = remote.addr;

        self.pairs[idx].state = CandidatePairState::InProgress {
            transaction_id,
            stun_request: stun_request.clone(),
            retransmit_at: now + INITIAL_RTO,
            retransmits: 0,
            source,
            target,
        };

        if self.first_check_at.is_none() {
            self.first_check_at = Some(now);
        }
        if self.agent_state == AgentState::Gathering || self.agent_state == AgentState::Disconnected {
            self.set_agent_state(AgentState::Connecting, on_event);
        }

        on_event(IceEvent::Transmit { data: stun_request, target });
    }

    fn set_agent_state(&mut self, new: AgentState, on_event: &mut dyn FnMut(IceEvent)) {
        if self.agent_state != new {
            let old = self.agent_state;
            self.agent_state = new;
            on_event(IceEvent::StateChanged { old, new });
        }
    }

    pub fn local_candidates(&self) -> Vec<WireCandidate> {
        self.local_candidates
            .values()
            .filter(|c| c.kind != CandidateKind::PeerReflexive)
            .map(to_wire_candidate)
            .collect()
    }
}

fn to_wire_candidate(c: &Candidate) -> WireCandidate {
    let rel = matches!(c.kind, CandidateKind::ServerReflexive | CandidateKind::Relayed).then_some(c.base);

    WireCandidate {
        foundation: c.foundation.clone(),
        component: 1,
        transport: "UDP".to_owned(),
        priority: c.priority.into(),
        address: UntaggedAddress::IpAddress(c.addr.ip()),
        port: c.addr.port(),
        typ: c.kind.as_wire_str().to_owned(),
        rel_addr: rel.map(|addr| UntaggedAddress::IpAddress(addr.ip())),
        rel_port: rel.map(|addr| addr.port()),
        unknown: Vec::new(),
    }
}

use stun_types::attributes::Attribute as _;

fn make_connectivity_check(
    local_credentials: &IceCredentials,
    remote_credentials: &IceCredentials,
    is_controlling: bool,
    tie_breaker: u64,
    use_candidate: bool,
    transaction_id: TransactionId,
) -> Vec<u8> {
    let username = format!("{}:{}", remote_credentials.ufrag, local_credentials.ufrag);
    let peer_reflexive_priority = compute_priority(CandidateKind::PeerReflexive, PEER_REFLEXIVE_LOCAL_PREF, 1);

    let mut builder = MessageBuilder::new(Method::Binding, Class::Request, transaction_id);
    builder.add_attribute(&Username(username));
    builder.add_attribute(&Priority(peer_reflexive_priority));

    if is_controlling {
        builder.add_attribute(&IceControlling(tie_breaker));
    } else {
        builder.add_attribute(&IceControlled(tie_breaker));
    }

    if use_candidate {
        builder.add_attribute(&UseCandidate);
    }

    builder.credentials(Credentials::short_term(remote_credentials.pwd.clone()));
    builder.build()
}

fn make_success_response(transaction_id: TransactionId, local_pwd: &str, mapped: SocketAddr) -> Vec<u8> {
    let mut builder = MessageBuilder::new(Method::Binding, Class::Success, transaction_id);
    builder.add_attribute(&XorMappedAddress(mapped));
    builder.credentials(Credentials::short_term(local_pwd.to_owned()));
    builder.build()
}

/// RFC 5389 §7.3.1: a 420 (Unknown Attribute) response listing every
/// comprehension-required attribute the decoder didn't recognize.
fn make_unknown_attributes_response(transaction_id: TransactionId, local_pwd: &str, types: Vec<u16>) -> Vec<u8> {
    let mut builder = MessageBuilder::new(Method::Binding, Class::Error, transaction_id);
    builder.add_attribute(&ErrorCode {
        code: 420,
        reason: "Unknown Attribute".to_owned(),
    });
    builder.add_attribute(&UnknownAttributes(types));
    builder.credentials(Credentials::short_term(local_pwd.to_owned()));
    builder.build()
}

fn make_role_conflict_response(transaction_id: TransactionId, local_pwd: &str, tie_breaker: u64, we_are_controlling: bool) -> Vec<u8> {
    let mut builder = MessageBuilder::new(Method::Binding, Class::Error, transaction_id);
    builder.add_attribute(&ErrorCode {
        code: 487,
        reason: "Role Conflict".to_owned(),
    });
    if we_are_controlling {
        builder.add_attribute(&IceControlling(tie_breaker));
    } else {
        builder.add_attribute(&IceControlled(tie_breaker));
    }
    builder.credentials(Credentials::short_term(local_pwd.to_owned()));
    builder.build()
}
