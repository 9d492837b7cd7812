//! Canonicalizes a client address into the 8-byte key used for rate limiting.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid client IP address")]
pub struct InvalidClientAddress;

/// Parses a client address that is either a bare IP or `host:port`, returning
/// its canonical IPv6 form (IPv4 addresses are mapped per RFC 4291 §2.5.5.2).
///
/// A `host:port` pair is only recognized when the whole string parses as a
/// `SocketAddr`, which for an IPv6 host requires brackets (`[::1]:8080`) —
/// the same requirement Go's `net.SplitHostPort` imposes. This matters
/// because a bare, unbracketed IPv6 address can itself contain many colons
/// (`2001:db8::8a2e:370:7334`); splitting on the last colon would wrongly
/// treat its final hextet as a port and silently parse a different, shorter
/// address.
pub fn parse_client_addr(client: &str) -> Result<Ipv6Addr, InvalidClientAddress> {
    if let Ok(addr) = client.parse::<SocketAddr>() {
        return Ok(to_ipv6(addr.ip()));
    }
    let candidate = if let Some(inner) = client.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        inner
    } else {
        client
    };
    let ip: IpAddr = candidate.parse().map_err(|_| InvalidClientAddress)?;
    Ok(to_ipv6(ip))
}

fn to_ipv6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Folds a canonicalized client IP into the 8-byte rate-limit key.
///
/// IPv4 (including IPv4-mapped) addresses collapse to 4 zero bytes followed
/// by the IPv4 octets. Teredo (`2000:0000::/32` — matched on the raw leading
/// bytes `0x20 0x00 0x00 0x00`, as the source does) XORs the embedded IPv4
/// with `0xFF`. 6to4 (`2002::/16`) copies the embedded IPv4 unmodified.
/// Anything else copies the first 8 raw bytes of the IPv6 address.
pub fn rl_key(ip: Ipv6Addr) -> [u8; 8] {
    let octets = ip.octets();
    let mut key = [0u8; 8];

    if let Some(v4) = ip.to_ipv4_mapped() {
        let o = v4.octets();
        key[4..8].copy_from_slice(&o);
        return key;
    }

    if octets[0] == 0x20 {
        match octets[1] {
            0x00 if octets[2] == 0x00 && octets[3] == 0x00 => {
                // Teredo: embedded IPv4 (XORed with 0xFF) sits at bytes 12..16.
                for i in 0..4 {
                    key[4 + i] = octets[12 + i] ^ 0xFF;
                }
                return key;
            }
            0x02 => {
                // 6to4: embedded IPv4 sits at bytes 2..6, unmodified.
                key[4..8].copy_from_slice(&octets[2..6]);
                return key;
            }
            _ => {}
        }
    }

    key.copy_from_slice(&octets[0..8]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn ipv4_distinct_keys() {
        let a = rl_key(Ipv4Addr::new(1, 2, 3, 4).to_ipv6_mapped());
        let b = rl_key(Ipv4Addr::new(1, 2, 3, 5).to_ipv6_mapped());
        assert_ne!(a, b);
        assert_eq!(&a[0..4], &[0, 0, 0, 0]);
        assert_eq!(&a[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn teredo_xors_embedded_ipv4() {
        // 2000:0000::/32 with embedded 1.2.3.4 XORed into the last 4 bytes.
        let ip: Ipv6Addr = "2000:0000:0000:0000:0000:0000:fefd:fcfb".parse().unwrap();
        let key = rl_key(ip);
        assert_eq!(&key[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn sixtofour_copies_embedded_ipv4() {
        let ip: Ipv6Addr = "2002:0102:0304::".parse().unwrap();
        let key = rl_key(ip);
        assert_eq!(&key[4..8], &[1, 2, 3, 4]);
    }

    #[test]
    fn parses_host_and_port() {
        let ip = parse_client_addr("203.0.113.5:1234").unwrap();
        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 5).to_ipv6_mapped());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_client_addr("not-an-address").is_err());
    }

    #[test]
    fn bare_ipv6_with_all_decimal_last_hextet_is_not_mistaken_for_host_port() {
        let ip: Ipv6Addr = "2001:db8:85a3::8a2e:370:7334".parse().unwrap();
        assert_eq!(parse_client_addr("2001:db8:85a3::8a2e:370:7334").unwrap(), ip);
    }

    #[test]
    fn bracketed_ipv6_with_port() {
        let ip: Ipv6Addr = "::1".parse().unwrap();
        assert_eq!(parse_client_addr("[::1]:8080").unwrap(), ip);
    }

    #[test]
    fn bracketed_ipv6_without_port() {
        let ip: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert_eq!(parse_client_addr("[2001:db8::1]").unwrap(), ip);
    }
}
