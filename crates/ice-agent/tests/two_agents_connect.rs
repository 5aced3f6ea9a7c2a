//! spec.md §8 end-to-end scenario 1: two in-process agents, host candidates
//! only, no STUN/TURN, exchange candidate lines and credentials directly
//! (bypassing signaling transport, which is out of scope for this crate).

mod support;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ice_agent::{AgentState, IceAgent, IceCredentials, IceEvent, ReceivedPkt};

#[test]
fn two_agents_connect_and_exchange_data() {
    let addr_a: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let addr_b: SocketAddr = "127.0.0.1:40001".parse().unwrap();

    let mut agent_a = IceAgent::new(IceCredentials::random(), true, addr_a);
    let mut agent_b = IceAgent::new(IceCredentials::random(), false, addr_b);

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

    assert!(a_connected, "agent A never reported a state change to Completed");
    assert!(b_connected, "agent B never reported a state change to Completed");
    assert_eq!(agent_a.agent_state(), AgentState::Completed);
    assert_eq!(agent_b.agent_state(), AgentState::Completed);

    let payload = vec![0x42u8; 1000];
    let mut received = None;
    let pkt = ReceivedPkt {
        data: payload.clone(),
        source: addr_a,
        destination: addr_b,
    };
    agent_b.receive(&pkt, Instant::now(), &mut |event| {
        if let IceEvent::Data(data) = event {
            received = Some(data);
        }
    });

    assert_eq!(received, Some(payload), "1000-byte application payload must arrive intact");
}
