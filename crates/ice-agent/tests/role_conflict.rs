//! spec.md §8 end-to-end scenarios 2 and 6: both agents start as
//! ICE-CONTROLLING. RFC 8445 §7.3.1.1 role-conflict resolution must pick a
//! winner by 64-bit tie-breaker without either side stalling in Connecting.

mod support;

use std::net::SocketAddr;
use std::time::Duration;

use ice_agent::{AgentState, IceAgent, IceCredentials, IceEvent};

#[test]
fn concurrent_controlling_agents_resolve_via_role_conflict_and_still_connect() {
    let addr_a: SocketAddr = "127.0.0.1:40010".parse().unwrap();
    let addr_b: SocketAddr = "127.0.0.1:40011".parse().unwrap();

    let mut agent_a = IceAgent::new(IceCredentials::random(), true, addr_a);
    let mut agent_b = IceAgent::new(IceCredentials::random(), true, addr_b);

    agent_a.set_remote_credentials(agent_b.credentials().clone());
    agent_b.set_remote_credentials(agent_a.credentials().clone());

    agent_a.add_host_candidate(addr_a.ip());
    agent_b.add_host_candidate(addr_b.ip());

    for candidate in agent_a.local_candidates() {
        agent_b.add_remote_candidate(&candidate);
    }
    for candidate in agent_b.local_candidates() {
        agent_a.add_remote_candidate(&candidate);
    }

    let mut a_connected = false;
    let mut b_connected = false;

    support::drive_until(
        &mut agent_a,
        addr_a,
        &mut agent_b,
        addr_b,
        Duration::from_secs(2),
        |event| {
            if matches!(event, IceEvent::StateChanged { new: AgentState::Completed, .. }) {
                a_connected = true;
            }
        },
        |event| {
            if matches!(event, IceEvent::StateChanged { new: AgentState::Completed, .. }) {
                b_connected = true;
            }
        },
        || a_connected && b_connected,
    );

    assert!(a_connected, "agent A stalled instead of resolving the role conflict");
    assert!(b_connected, "agent B stalled instead of resolving the role conflict");
}
