//! Candidate pair type, state machine and the pair-priority formula (spec §3).

use std::cmp::{max, min};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use stun_types::TransactionId;

use crate::candidate::{LocalCandidateId, RemoteCandidateId};

#[derive(Debug, Clone, PartialEq)]
pub enum CandidatePairState {
    /// Never checked, not eligible to run yet (its foundation hasn't been unfrozen).
    Frozen,
    /// Eligible to run, no check sent yet.
    Waiting,
    /// A check is outstanding.
    InProgress {
        transaction_id: TransactionId,
        stun_request: Vec<u8>,
        retransmit_at: Instant,
        retransmits: u32,
        source: IpAddr,
        target: SocketAddr,
    },
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CandidatePair {
    pub local: LocalCandidateId,
    pub remote: RemoteCandidateId,
    pub priority: u64,
    pub state: CandidatePairState,
    pub foundation: String,

    /// Set when an incoming check from the peer carried USE-CANDIDATE.
    pub received_use_candidate: bool,
    /// Set once this agent has sent a nominating check and it succeeded.
    pub nominated: bool,

    /// First time a check was sent for this pair, used for the 30s global
    /// no-success deadline (spec §4.3 "Failure").
    pub first_check_at: Option<Instant>,
}

impl CandidatePair {
    pub fn new(local: LocalCandidateId, remote: RemoteCandidateId, priority: u64, foundation: String) -> Self {
        Self {
            local,
            remote,
            priority,
            state: CandidatePairState::Frozen,
            foundation,
            received_use_candidate: false,
            nominated: false,
            first_check_at: None,
        }
    }
}

/// RFC 8445 §6.1.2.3: `2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)`, `G` the
/// controlling candidate's priority, `D` the controlled's.
pub(crate) fn pair_priority(local_priority: u32, remote_priority: u32, is_controlling: bool) -> u64 {
    let (g, d) = if is_controlling {
        (local_priority as u64, remote_priority as u64)
    } else {
        (remote_priority as u64, local_priority as u64)
    };

    2u64.pow(32) * min(g, d) + 2 * max(g, d) + u64::from(g > d)
}
