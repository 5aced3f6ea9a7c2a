#![deny(unreachable_pub, unsafe_code)]

//! Wire format for the handful of fields this ICE agent exchanges via
//! external signaling: candidate lines and the `ice-ufrag`/`ice-pwd`/
//! candidates/`end-of-candidates` session description block.

use std::fmt;
use std::net::IpAddr;

use nom::bytes::complete::{tag_no_case, take_till1};
use nom::character::complete::multispace0;
use nom::combinator::{map, map_res, opt};
use nom::sequence::terminated;
use nom::IResult;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed candidate line: {0}")]
    Candidate(String),
    #[error("malformed session description line: {0}")]
    SessionDescription(String),
}

/// A socket address that may be a literal IP or (rarely, from some peers) a hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UntaggedAddress {
    IpAddress(IpAddr),
    Fqdn(String),
}

impl fmt::Display for UntaggedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UntaggedAddress::IpAddress(ip) => write!(f, "{ip}"),
            UntaggedAddress::Fqdn(name) => write!(f, "{name}"),
        }
    }
}

/// One ICE candidate, in the textual form exchanged via signaling (RFC 8839 §5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u32,
    pub transport: String,
    pub priority: u32,
    pub address: UntaggedAddress,
    pub port: u16,
    pub typ: String,
    pub rel_addr: Option<UntaggedAddress>,
    pub rel_port: Option<u16>,
    /// Trailing extension tokens (`key value` pairs) this parser doesn't
    /// interpret but preserves so a re-encoded line round-trips.
    pub unknown: Vec<String>,
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} typ {}",
            self.foundation, self.component, self.transport, self.priority, self.address, self.port, self.typ
        )?;

        if let (Some(addr), Some(port)) = (&self.rel_addr, self.rel_port) {
            write!(f, " raddr {addr} rport {port}")?;
        }

        for extra in &self.unknown {
            write!(f, " {extra}")?;
        }

        Ok(())
    }
}

impl IceCandidate {
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        match candidate_line(input.trim()) {
            Ok((_, candidate)) => Ok(candidate),
            Err(_) => Err(ParseError::Candidate(input.to_owned())),
        }
    }
}

fn token(input: &str) -> IResult<&str, &str> {
    terminated(take_till1(|c: char| c.is_whitespace()), multispace0)(input)
}

fn ip_or_fqdn(input: &str) -> IResult<&str, UntaggedAddress> {
    map(token, |s| match s.parse::<IpAddr>() {
        Ok(ip) => UntaggedAddress::IpAddress(ip),
        Err(_) => UntaggedAddress::Fqdn(s.to_owned()),
    })(input)
}

fn u32_token(input: &str) -> IResult<&str, u32> {
    map_res(token, str::parse)(input)
}

fn u16_token(input: &str) -> IResult<&str, u16> {
    map_res(token, str::parse)(input)
}

fn related(input: &str) -> IResult<&str, (UntaggedAddress, u16)> {
    let (input, _) = tag_no_case("raddr")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, addr) = ip_or_fqdn(input)?;
    let (input, _) = tag_no_case("rport")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, port) = u16_token(input)?;
    Ok((input, (addr, port)))
}

fn candidate_line(input: &str) -> IResult<&str, IceCandidate> {
    let (input, foundation) = map(token, str::to_owned)(input)?;
    let (input, component) = u32_token(input)?;
    let (input, transport) = map(token, str::to_owned)(input)?;
    let (input, priority) = u32_token(input)?;
    let (input, address) = ip_or_fqdn(input)?;
    let (input, port) = u16_token(input)?;
    let (input, _) = tag_no_case("typ")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, typ) = map(token, str::to_owned)(input)?;
    let (input, related) = opt(related)(input)?;
    let (rel_addr, rel_port) = match related {
        Some((addr, port)) => (Some(addr), Some(port)),
        None => (None, None),
    };

    let unknown = input
        .split_whitespace()
        .map(str::to_owned)
        .collect::<Vec<_>>();

    Ok((
        "",
        IceCandidate {
            foundation,
            component,
            transport,
            priority,
            address,
            port,
            typ,
            rel_addr,
            rel_port,
            unknown,
        },
    ))
}

/// Key/value fields of a session description exchanged over signaling,
/// scoped to exactly what ICE needs (no SDP media/origin/timing lines).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub candidates: Vec<IceCandidate>,
    pub end_of_candidates: bool,
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ice-ufrag:{}", self.ice_ufrag)?;
        writeln!(f, "ice-pwd:{}", self.ice_pwd)?;
        for candidate in &self.candidates {
            writeln!(f, "candidate:{candidate}")?;
        }
        if self.end_of_candidates {
            writeln!(f, "end-of-candidates")?;
        }
        Ok(())
    }
}

impl SessionDescription {
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let mut session = SessionDescription::default();

        for line in input.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("ice-ufrag:") {
                session.ice_ufrag = rest.to_owned();
            } else if let Some(rest) = line.strip_prefix("ice-pwd:") {
                session.ice_pwd = rest.to_owned();
            } else if let Some(rest) = line.strip_prefix("candidate:") {
                session.candidates.push(IceCandidate::parse(rest)?);
            } else if line == "end-of-candidates" {
                session.end_of_candidates = true;
            } else {
                return Err(ParseError::SessionDescription(line.to_owned()));
            }
        }

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_round_trips() {
        let line = "1 1 UDP 2130706431 192.0.2.1 54321 typ host";
        let candidate = IceCandidate::parse(line).unwrap();

        assert_eq!(candidate.foundation, "1");
        assert_eq!(candidate.component, 1);
        assert_eq!(candidate.transport, "UDP");
        assert_eq!(candidate.priority, 2130706431);
        assert_eq!(candidate.address, UntaggedAddress::IpAddress("192.0.2.1".parse().unwrap()));
        assert_eq!(candidate.port, 54321);
        assert_eq!(candidate.typ, "host");
        assert_eq!(candidate.rel_addr, None);

        assert_eq!(candidate.to_string(), line);
    }

    #[test]
    fn candidate_with_related_address_round_trips() {
        let line = "2 1 UDP 1694498815 203.0.113.1 4242 typ srflx raddr 192.0.2.1 rport 54321";
        let candidate = IceCandidate::parse(line).unwrap();

        assert_eq!(candidate.typ, "srflx");
        assert_eq!(
            candidate.rel_addr,
            Some(UntaggedAddress::IpAddress("192.0.2.1".parse().unwrap()))
        );
        assert_eq!(candidate.rel_port, Some(54321));
        assert_eq!(candidate.to_string(), line);
    }

    #[test]
    fn session_description_round_trips() {
        let input = "ice-ufrag:abcd\nice-pwd:0123456789abcdef01234567\ncandidate:1 1 UDP 2130706431 192.0.2.1 54321 typ host\nend-of-candidates\n";
        let session = SessionDescription::parse(input).unwrap();

        assert_eq!(session.ice_ufrag, "abcd");
        assert_eq!(session.ice_pwd, "0123456789abcdef01234567");
        assert_eq!(session.candidates.len(), 1);
        assert!(session.end_of_candidates);

        assert_eq!(session.to_string(), input);
    }

    #[test]
    fn rejects_garbage_candidate() {
        assert!(IceCandidate::parse("not a candidate line").is_err());
    }
}
