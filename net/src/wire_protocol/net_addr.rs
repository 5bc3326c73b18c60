use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;

use crate::error::{PeerError, PeerResult};
use crate::wire_protocol::buffer::{ByteBufferComposer, ByteBufferParser};

/// Marker placed in front of a 10-byte v2 onion identity inside the 16-byte
/// IP slot of a network address.
pub const ONION_PREFIX: [u8; 6] = [0xFD, 0x87, 0xD8, 0x7E, 0xEB, 0x43];

/// Remote host in one of the three forms the address codec can carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    /// 16-character base32 label plus the `.onion` suffix
    Onion(String),
}

impl Host {
    pub fn is_onion(&self) -> bool {
        matches!(self, Host::Onion(_))
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Host::Ipv4(ip),
            IpAddr::V6(ip) => Host::Ipv6(ip),
        }
    }
}

impl FromStr for Host {
    type Err = PeerError;

    /// Accepts IP literals and `.onion` hostnames. Name resolution is the
    /// stream factory's business, not the codec's.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower.ends_with(".onion") {
            return Ok(Host::Onion(lower));
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Host::from(ip));
        }
        Err(PeerError::Connection(format!(
            "{s} is neither an IP literal nor a .onion hostname"
        )))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ipv4(ip) => write!(f, "{ip}"),
            Host::Ipv6(ip) => write!(f, "{ip}"),
            Host::Onion(name) => write!(f, "{name}"),
        }
    }
}

/// Network address record
/// (https://en.bitcoin.it/wiki/Protocol_documentation#Network_address).
///
/// size | field     | type     | description
/// ---  | -----     | ----     | ------------
/// 4    | time      | u32      | `addr` entries only; absent inside `version`
/// 8    | services  | u64      | bitfield of enabled features
/// 16   | ip        | [u8; 16] | IPv6, IPv4-mapped IPv6, or onion prefix + identity
/// 2    | port      | u16      | big endian
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetAddr {
    pub timestamp: Option<u32>,
    pub services: u64,
    pub host: Host,
    pub port: u16,
}

impl NetAddr {
    pub fn new(services: u64, host: Host, port: u16) -> Self {
        NetAddr {
            timestamp: None,
            services,
            host,
            port,
        }
    }

    pub(super) fn append_to(
        &self,
        composer: &mut ByteBufferComposer,
        with_timestamp: bool,
    ) -> PeerResult<()> {
        if with_timestamp {
            composer.append(&self.timestamp.unwrap_or_default().to_le_bytes());
        }
        composer.append(&self.services.to_le_bytes());
        match &self.host {
            Host::Onion(name) => {
                let label = name.strip_suffix(".onion").unwrap_or(name);
                let identity = BASE32_NOPAD
                    .decode(label.to_ascii_uppercase().as_bytes())
                    .map_err(|err| PeerError::Read(format!("bad onion label {name}: {err}")))?;
                if identity.len() != 10 {
                    return Err(PeerError::Read(format!(
                        "onion identity must be 10 bytes, got {}",
                        identity.len()
                    )));
                }
                composer.append(&ONION_PREFIX);
                composer.append(&identity);
            }
            Host::Ipv4(ip) => composer.append(&ip.to_ipv6_mapped().octets()),
            Host::Ipv6(ip) => composer.append(&ip.octets()),
        }
        composer.append(&self.port.to_be_bytes());
        Ok(())
    }

    pub(super) fn parse(
        parser: &mut ByteBufferParser<'_>,
        with_timestamp: bool,
    ) -> PeerResult<Self> {
        let timestamp = if with_timestamp {
            Some(parser.read_u32_le()?)
        } else {
            None
        };
        let services = parser.read_u64_le()?;
        let ip: [u8; 16] = parser.read(16)?.try_into().unwrap();
        let port = parser.read_u16_be()?;

        let host = if ip[..6] == ONION_PREFIX {
            let label = BASE32_NOPAD.encode(&ip[6..]).to_ascii_lowercase();
            Host::Onion(format!("{label}.onion"))
        } else {
            let ip = Ipv6Addr::from(ip);
            match ip.to_ipv4_mapped() {
                Some(mapped) => Host::Ipv4(mapped),
                None => Host::Ipv6(ip),
            }
        };

        Ok(NetAddr {
            timestamp,
            services,
            host,
            port,
        })
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv6(ip) => write!(f, "[{ip}]:{}", self.port),
            host => write!(f, "{host}:{}", self.port),
        }
    }
}

#[cfg(test)]
mod test {
    use hex_literal::hex;
    use rstest::*;

    use super::*;

    fn roundtrip(addr: &NetAddr, with_timestamp: bool) -> NetAddr {
        let mut composer = ByteBufferComposer::new();
        addr.append_to(&mut composer, with_timestamp).unwrap();
        let bytes = composer.result();

        let mut parser = ByteBufferParser::new(&bytes);
        let decoded = NetAddr::parse(&mut parser, with_timestamp).unwrap();
        assert_eq!(parser.remaining(), 0);
        decoded
    }

    #[test]
    fn test_ipv4_wire_form_is_v4_mapped() {
        let addr = NetAddr::new(1, Host::Ipv4(Ipv4Addr::new(1, 2, 3, 4)), 8333);
        let mut composer = ByteBufferComposer::new();
        addr.append_to(&mut composer, false).unwrap();
        // services 1, then ::ffff:1.2.3.4, then port 8333 big endian
        assert_eq!(
            composer.result(),
            hex!("010000000000000000000000000000000000ffff01020304208d")
        );
    }

    #[rstest]
    #[case(Host::Ipv4(Ipv4Addr::new(1, 2, 3, 4)))]
    #[case(Host::Ipv6("2001:db8::1".parse().unwrap()))]
    #[case(Host::Onion("abcdefghij234567.onion".to_string()))]
    fn test_host_roundtrip(#[case] host: Host) {
        let addr = NetAddr::new(1, host, 8333);
        assert_eq!(roundtrip(&addr, false), addr);
    }

    #[test]
    fn test_addr_entry_carries_timestamp() {
        let mut addr = NetAddr::new(5, Host::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), 8333);
        addr.timestamp = Some(1414012889);
        assert_eq!(roundtrip(&addr, true), addr);
    }

    #[test]
    fn test_onion_wire_form_starts_with_prefix() {
        let addr = NetAddr::new(1, Host::Onion("abcdefghij234567.onion".to_string()), 8333);
        let mut composer = ByteBufferComposer::new();
        addr.append_to(&mut composer, false).unwrap();
        let bytes = composer.result();
        assert_eq!(bytes[8..14], ONION_PREFIX);
    }

    #[test]
    fn test_bad_onion_label_is_rejected() {
        let addr = NetAddr::new(1, Host::Onion("ab.onion".to_string()), 8333);
        let mut composer = ByteBufferComposer::new();
        assert!(addr.append_to(&mut composer, false).is_err());
    }

    #[test]
    fn test_plain_ipv6_stays_ipv6() {
        // ::1.2.3.4 is v4-compatible, not v4-mapped; it must not collapse
        let ip: Ipv6Addr = "::102:304".parse().unwrap();
        let addr = NetAddr::new(0, Host::Ipv6(ip), 8333);
        let decoded = roundtrip(&addr, false);
        assert_eq!(decoded.host, Host::Ipv6(ip));
    }

    #[test]
    fn test_host_from_str() {
        assert_eq!(
            "1.2.3.4".parse::<Host>().unwrap(),
            Host::Ipv4(Ipv4Addr::new(1, 2, 3, 4))
        );
        assert!(matches!("2001:db8::1".parse::<Host>(), Ok(Host::Ipv6(_))));
        assert_eq!(
            "ABCDEFGHIJ234567.ONION".parse::<Host>().unwrap(),
            Host::Onion("abcdefghij234567.onion".to_string())
        );
        assert!("example.com".parse::<Host>().is_err());
    }
}
