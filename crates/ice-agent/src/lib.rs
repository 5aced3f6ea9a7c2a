#![deny(unreachable_pub, unsafe_code)]

//! Userspace ICE (RFC 8445) agent with an integrated STUN codec and an
//! optional TURN client, driven by a single-threaded dispatcher.
//!
//! The agent itself is sans-IO: [`IceAgent::receive`]/[`IceAgent::poll`] take
//! and produce plain data, never touching a socket directly. [`dispatcher`]
//! is the owning event loop that bridges the agent to real UDP sockets.

pub mod address;
mod agent;
mod candidate;
pub mod dispatcher;
mod error;
mod pair;
mod transport;
mod turn;

pub use agent::{
    AgentState, GatheringState, IceAgent, IceCredentials, IceEvent, ReceivedPkt,
};
pub use candidate::{Candidate, CandidateKind, LocalCandidateId, RemoteCandidateId};
pub use error::{IceError, TurnError};
pub use pair::{CandidatePair, CandidatePairState};
pub use transport::{BindConfig, UdpTransport};
pub use turn::{TurnClient, TurnEvent};
