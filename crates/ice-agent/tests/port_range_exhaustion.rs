//! spec.md §8 end-to-end scenario 5: binding more sockets than a port range
//! holds must fail with `IceError::SocketError`, not hang or panic, once every
//! port in range is already held by a live `UdpTransport`.

use ice_agent::{BindConfig, IceError, UdpTransport};

#[test]
fn exhausting_a_three_port_range_fails_the_fourth_bind() {
    let range = (51000u16, 51002u16);
    let bind_address = Some("127.0.0.1".parse().unwrap());

    let mut bound = Vec::new();
    for _ in 0..3 {
        let transport = UdpTransport::bind(BindConfig { bind_address, port_range: range }).unwrap();
        let port = transport.local_addr().port();
        assert!(
            (range.0..=range.1).contains(&port),
            "bound port {port} escaped the configured range {range:?}"
        );
        bound.push(transport);
    }

    let result = UdpTransport::bind(BindConfig { bind_address, port_range: range });
    assert!(
        matches!(result, Err(IceError::SocketError(_))),
        "expected the fourth bind in a fully-held 3-port range to fail"
    );

    // Keep the three bound sockets alive for the whole test so their ports
    // stay held while the fourth bind attempt runs.
    drop(bound);
}
