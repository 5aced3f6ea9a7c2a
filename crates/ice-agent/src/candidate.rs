//! Candidate types and the priority/foundation formulas (spec §3, RFC 8445 §5.1).

use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use slotmap::new_key_type;

new_key_type! {
    pub struct LocalCandidateId;
    pub struct RemoteCandidateId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    PeerReflexive,
    ServerReflexive,
    Relayed,
}

impl CandidateKind {
    fn type_preference(self) -> u32 {
        match self {
            CandidateKind::Host => 126,
            CandidateKind::PeerReflexive => 110,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relayed => 0,
        }
    }

    pub fn as_wire_str(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        }
    }
}

/// A transport address the agent proposes for the peer to send to (spec §3).
/// Component is fixed at 1 for this single-stream agent.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub addr: SocketAddr,
    pub kind: CandidateKind,
    pub priority: u32,
    pub foundation: String,
    /// Local source address packets for this candidate are sent from. For
    /// relayed candidates this is the relayed address itself.
    pub base: SocketAddr,
}

/// RFC 8445 §5.1.2.1: `(2^24)*type_pref + (2^8)*local_pref + (2^0)*(256-component)`.
pub(crate) fn compute_priority(kind: CandidateKind, local_pref: u16, component: u8) -> u32 {
    (kind.type_preference() << 24) | ((local_pref as u32) << 8) | (256 - component as u32)
}

/// An equivalence class of candidates sharing type + base IP + server,
/// used to stagger checks (spec GLOSSARY "Foundation").
pub(crate) fn compute_foundation(kind: CandidateKind, base: IpAddr, server: Option<SocketAddr>) -> String {
    let mut hasher = DefaultHasher::new();
    (kind, base, server, "udp").hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_candidate_priority_literal() {
        // spec §8: unique single-interface IPv4 host, component 1.
        let priority = compute_priority(CandidateKind::Host, 65535, 1);
        assert_eq!(priority, 2_130_706_431);
    }

    #[test]
    fn foundation_is_stable_for_same_inputs() {
        let base: IpAddr = "192.168.0.2".parse().unwrap();
        let a = compute_foundation(CandidateKind::Host, base, None);
        let b = compute_foundation(CandidateKind::Host, base, None);
        assert_eq!(a, b);
    }

    #[test]
    fn foundation_differs_across_kinds() {
        let base: IpAddr = "192.168.0.2".parse().unwrap();
        let host = compute_foundation(CandidateKind::Host, base, None);
        let srflx = compute_foundation(CandidateKind::ServerReflexive, base, None);
        assert_ne!(host, srflx);
    }
}
