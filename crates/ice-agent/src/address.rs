//! Address classification and host-candidate address enumeration (spec §1, §4.4).

use std::net::{IpAddr, Ipv6Addr};

/// One address discovered on a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddress {
    pub ip: IpAddr,
    pub interface: String,
    /// Whether the OS marked this as an RFC 4941 temporary/privacy address.
    pub temporary: bool,
}

/// Abstracts host-OS interface enumeration (`getifaddrs`/Win32 equivalents are
/// explicitly out of scope), so the agent never calls into OS APIs directly.
pub trait HostInterfaceSource {
    fn host_addresses(&self) -> Vec<HostAddress>;
}

/// Default [`HostInterfaceSource`] backed by the `if-addrs` crate.
#[derive(Debug, Default)]
pub struct IfAddrsHostInterfaceSource;

impl HostInterfaceSource for IfAddrsHostInterfaceSource {
    fn host_addresses(&self) -> Vec<HostAddress> {
        let Ok(interfaces) = if_addrs::get_if_addrs() else {
            log::warn!("failed to enumerate local interfaces");
            return Vec::new();
        };

        interfaces
            .into_iter()
            .map(|iface| HostAddress {
                ip: iface.ip(),
                interface: iface.name,
                // if-addrs does not expose RFC 4941 temporary-address status;
                // callers that need it should supply their own HostInterfaceSource.
                temporary: false,
            })
            .collect()
    }
}

pub fn is_loopback(ip: IpAddr) -> bool {
    ip.is_loopback()
}

pub fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Unmaps a v4-in-v6 address (`::ffff:a.b.c.d`) to its IPv4 form.
pub fn unmap_v4_in_v6(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        other => other,
    }
}

/// Network-prefix key used to deduplicate host candidates: IPv4 addresses are
/// compared in full, IPv6 by their first 64 bits (spec §4.4).
fn dedup_key(ip: IpAddr) -> (IpAddr, Option<u64>) {
    match ip {
        IpAddr::V4(_) => (ip, None),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            let prefix = Ipv6Addr::new(segments[0], segments[1], segments[2], segments[3], 0, 0, 0, 0);
            (IpAddr::V6(prefix), Some(u64::from_be_bytes([
                segments[0].to_be_bytes()[0],
                segments[0].to_be_bytes()[1],
                segments[1].to_be_bytes()[0],
                segments[1].to_be_bytes()[1],
                segments[2].to_be_bytes()[0],
                segments[2].to_be_bytes()[1],
                segments[3].to_be_bytes()[0],
                segments[3].to_be_bytes()[1],
            ])))
        }
    }
}

/// Applies the host-candidate gathering rules from spec §1/§4.4/RFC 8445 §5.1.1.1:
/// skip loopback (unless `allow_loopback`), skip link-local, skip a "permanent"
/// IPv6 address when a temporary one exists on the same interface, dedup.
pub fn gather_host_candidates(source: &dyn HostInterfaceSource, allow_loopback: bool) -> Vec<IpAddr> {
    let addresses = source.host_addresses();

    let has_temporary_v6_on = |interface: &str| {
        addresses
            .iter()
            .any(|a| a.interface == interface && a.temporary && a.ip.is_ipv6())
    };

    let mut seen = Vec::new();
    let mut out = Vec::new();

    for addr in &addresses {
        let ip = unmap_v4_in_v6(addr.ip);

        if is_loopback(ip) && !allow_loopback {
            continue;
        }

        if is_link_local(ip) {
            continue;
        }

        // RFC 8445 §5.1.1.1: prefer the temporary address, drop the stable one.
        if ip.is_ipv6() && !addr.temporary && has_temporary_v6_on(&addr.interface) {
            continue;
        }

        let key = dedup_key(ip);
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(ip);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<HostAddress>);

    impl HostInterfaceSource for Fixed {
        fn host_addresses(&self) -> Vec<HostAddress> {
            self.0.clone()
        }
    }

    #[test]
    fn skips_loopback_and_link_local() {
        let source = Fixed(vec![
            HostAddress { ip: "127.0.0.1".parse().unwrap(), interface: "lo".into(), temporary: false },
            HostAddress { ip: "169.254.1.1".parse().unwrap(), interface: "eth0".into(), temporary: false },
            HostAddress { ip: "192.168.1.5".parse().unwrap(), interface: "eth0".into(), temporary: false },
        ]);

        let addrs = gather_host_candidates(&source, false);
        assert_eq!(addrs, vec!["192.168.1.5".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn allow_loopback_flag_includes_loopback() {
        let source = Fixed(vec![HostAddress {
            ip: "127.0.0.1".parse().unwrap(),
            interface: "lo".into(),
            temporary: false,
        }]);

        let addrs = gather_host_candidates(&source, true);
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn prefers_temporary_ipv6_over_stable_on_same_interface() {
        let stable: IpAddr = "2001:db8::1".parse().unwrap();
        let temporary: IpAddr = "2001:db8::dead:beef".parse().unwrap();

        let source = Fixed(vec![
            HostAddress { ip: stable, interface: "eth0".into(), temporary: false },
            HostAddress { ip: temporary, interface: "eth0".into(), temporary: true },
        ]);

        let addrs = gather_host_candidates(&source, false);
        assert_eq!(addrs, vec![temporary]);
    }

    #[test]
    fn dedups_ipv6_by_64_bit_prefix() {
        let a: IpAddr = "2001:db8::1".parse().unwrap();
        let b: IpAddr = "2001:db8::2".parse().unwrap();

        let source = Fixed(vec![
            HostAddress { ip: a, interface: "eth0".into(), temporary: false },
            HostAddress { ip: b, interface: "eth0".into(), temporary: false },
        ]);

        let addrs = gather_host_candidates(&source, false);
        assert_eq!(addrs.len(), 1);
    }
}
