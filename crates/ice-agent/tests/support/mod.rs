//! Shared harness for the two-agent end-to-end scenario tests. Wires two
//! in-process `IceAgent`s over a simulated loopback link (no real sockets):
//! `Transmit` events addressed to the other agent's candidate address are
//! fed straight into its `receive`, modeled on `ezk-ice/tests/self_test.rs`'s
//! "drive both agents until connected" harness shape.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ice_agent::{IceAgent, IceEvent, ReceivedPkt};

pub const STEP: Duration = Duration::from_millis(20);

#[allow(dead_code)]
pub fn drive_until(
    agent_a: &mut IceAgent,
    addr_a: SocketAddr,
    agent_b: &mut IceAgent,
    addr_b: SocketAddr,
    deadline: Duration,
    mut on_event_a: impl FnMut(&IceEvent),
    mut on_event_b: impl FnMut(&IceEvent),
    mut done: impl FnMut() -> bool,
) {
    let start = Instant::now();
    let end = start + deadline;
    let mut now = start;

    let mut to_a: VecDeque<Vec<u8>> = VecDeque::new();
    let mut to_b: VecDeque<Vec<u8>> = VecDeque::new();

    while now < end {
        agent_a.poll(now, &mut |event| {
            on_event_a(&event);
            route(event, addr_a, addr_b, &mut to_a, &mut to_b);
        });
        agent_b.poll(now, &mut |event| {
            on_event_b(&event);
            route(event, addr_a, addr_b, &mut to_a, &mut to_b);
        });

        let pending_b: Vec<Vec<u8>> = to_b.drain(..).collect();
        for data in pending_b {
            let pkt = ReceivedPkt { data, source: addr_a, destination: addr_b };
            agent_b.receive(&pkt, now, &mut |event| {
                on_event_b(&event);
                route(event, addr_a, addr_b, &mut to_a, &mut to_b);
            });
        }

        let pending_a: Vec<Vec<u8>> = to_a.drain(..).collect();
        for data in pending_a {
            let pkt = ReceivedPkt { data, source: addr_b, destination: addr_a };
            agent_a.receive(&pkt, now, &mut |event| {
                on_event_a(&event);
                route(event, addr_a, addr_b, &mut to_a, &mut to_b);
            });
        }

        if done() {
            return;
        }
        now += STEP;
    }
}

fn route(
    event: IceEvent,
    addr_a: SocketAddr,
    addr_b: SocketAddr,
    to_a: &mut VecDeque<Vec<u8>>,
    to_b: &mut VecDeque<Vec<u8>>,
) {
    if let IceEvent::Transmit { data, target } = event {
        if target == addr_a {
            to_a.push_back(data);
        } else if target == addr_b {
            to_b.push_back(data);
        }
    }
}
