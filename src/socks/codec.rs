//! Stateless encode/decode of SOCKS5 control messages and the UDP request
//! header (RFC 1928, RFC 1929).
//!
//! All functions are pure and operate on byte buffers; the control-channel
//! I/O lives in the parent module. Version byte 5 only: any other version
//! observed from the peer is an [`InvalidVersion`] error.
//!
//! [`InvalidVersion`]: ../../enum.ErrorKind.html#variant.InvalidVersion

use crate::{
    endpoint::{Host, MAX_FIELD_SIZE},
    error::{Error, ErrorKind},
};

use byteorder::{BigEndian, ByteOrder};

use std::net::{Ipv4Addr, Ipv6Addr};

/// The protocol version this codec speaks.
pub const VERSION: u8 = 5;
/// The version byte of the RFC 1929 username/password sub-negotiation.
pub const AUTH_VERSION: u8 = 1;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_GSSAPI: u8 = 0x01;
pub const METHOD_USERNAME_PASSWORD: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const ATYP_IPV4: u8 = 1;
pub const ATYP_DOMAIN: u8 = 3;
pub const ATYP_IPV6: u8 = 4;

/// The methods offered to the proxy when none are specified.
pub const DEFAULT_METHODS: &[u8] =
    &[METHOD_NO_AUTH, METHOD_USERNAME_PASSWORD];

/// A SOCKS5 request command.
///
/// Only `UdpAssociate` is exercised by the query engine; the three
/// commands encode identically.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// The authentication method selected by the proxy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    NoAuth,
    Gssapi,
    UsernamePassword,
    Other(u8),
}

impl AuthMethod {
    pub fn code(self) -> u8 {
        match self {
            AuthMethod::NoAuth => METHOD_NO_AUTH,
            AuthMethod::Gssapi => METHOD_GSSAPI,
            AuthMethod::UsernamePassword => METHOD_USERNAME_PASSWORD,
            AuthMethod::Other(code) => code,
        }
    }
}

impl From<u8> for AuthMethod {
    fn from(code: u8) -> Self {
        match code {
            METHOD_NO_AUTH => AuthMethod::NoAuth,
            METHOD_GSSAPI => AuthMethod::Gssapi,
            METHOD_USERNAME_PASSWORD => AuthMethod::UsernamePassword,
            code => AuthMethod::Other(code),
        }
    }
}

/// Reject any version byte other than 5.
pub fn check_version(version: u8) -> Result<(), Error> {
    if version != VERSION {
        Err(Error::new(ErrorKind::InvalidVersion { version }))
    } else {
        Ok(())
    }
}

/// Encode the method negotiation request: `[VER][NMETHODS][METHODS…]`.
///
/// An empty method set collapses to `{NO_AUTH}`.
pub fn make_method_request(methods: &[u8]) -> Vec<u8> {
    let methods: &[u8] = if methods.is_empty() {
        &[METHOD_NO_AUTH]
    } else {
        methods
    };
    assert!(methods.len() <= MAX_FIELD_SIZE, "too many methods");

    let mut buf = Vec::with_capacity(2 + methods.len());
    buf.push(VERSION);
    buf.push(methods.len() as u8);
    buf.extend_from_slice(methods);

    buf
}

/// Decode the method selection reply: `[VER][METHOD]`.
pub fn parse_method_reply(buf: &[u8; 2]) -> Result<AuthMethod, Error> {
    check_version(buf[0])?;

    if buf[1] == METHOD_NO_ACCEPTABLE {
        Err(Error::new(ErrorKind::NoAcceptableAuthMethod))
    } else {
        Ok(AuthMethod::from(buf[1]))
    }
}

/// Encode the RFC 1929 sub-negotiation request:
/// `[VER=1][ULEN][UNAME][PLEN][PASSWD]`.
pub fn make_auth_request(
    username: &str,
    password: &str,
) -> Result<Vec<u8>, Error> {
    if username.len() > MAX_FIELD_SIZE {
        return Err(Error::new(ErrorKind::InvalidInput {
            msg: "username longer than 255 bytes",
        }));
    }
    if password.len() > MAX_FIELD_SIZE {
        return Err(Error::new(ErrorKind::InvalidInput {
            msg: "password longer than 255 bytes",
        }));
    }

    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(AUTH_VERSION);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username.as_bytes());
    buf.push(password.len() as u8);
    buf.extend_from_slice(password.as_bytes());

    Ok(buf)
}

/// Decode the RFC 1929 reply: `[VER=1][STATUS]`. A non-zero status is an
/// authentication failure and the caller must close the control
/// connection.
pub fn parse_auth_reply(buf: &[u8; 2]) -> Result<(), Error> {
    if buf[0] != AUTH_VERSION {
        return Err(Error::new(ErrorKind::InvalidVersion {
            version: buf[0],
        }));
    }

    match buf[1] {
        0 => Ok(()),
        status => Err(Error::new(ErrorKind::Authentication { status })),
    }
}

fn push_host(buf: &mut Vec<u8>, host: &Host) {
    match host {
        Host::Ipv4(ip) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Host::Ipv6(ip) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        Host::Domain(domain) => {
            assert!(domain.len() <= MAX_FIELD_SIZE, "domain too long");
            buf.push(ATYP_DOMAIN);
            buf.push(domain.len() as u8);
            buf.extend_from_slice(domain.as_bytes());
        }
    }
}

fn push_port(buf: &mut Vec<u8>, port: u16) {
    let mut bytes = [0u8; 2];
    BigEndian::write_u16(&mut bytes, port);
    buf.extend_from_slice(&bytes);
}

/// Encode a request: `[VER][CMD][RSV=0][ATYP][DST.ADDR][DST.PORT]`.
pub fn make_request(cmd: Command, host: &Host, port: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + MAX_FIELD_SIZE);
    buf.push(VERSION);
    buf.push(cmd as u8);
    buf.push(0);
    push_host(&mut buf, host);
    push_port(&mut buf, port);

    buf
}

/// Decode the fixed prefix of a reply, `[VER][REP][RSV][ATYP]`, returning
/// the address type so the caller knows how many address bytes follow.
///
/// REP 1..8 map to the fixed RFC 1928 texts; any other non-zero value is
/// an unknown reply code.
pub fn parse_reply_prefix(buf: &[u8; 4]) -> Result<u8, Error> {
    check_version(buf[0])?;

    match buf[1] {
        0 => Ok(buf[3]),
        code => Err(Error::new(ErrorKind::Reply { code })),
    }
}

/// Encode the UDP request header and payload:
/// `[RSV=0x0000][FRAG=0][ATYP][DST.ADDR][DST.PORT][DATA]`.
pub fn make_packet(host: &Host, port: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + MAX_FIELD_SIZE + data.len());
    buf.extend_from_slice(&[0, 0, 0]);
    push_host(&mut buf, host);
    push_port(&mut buf, port);
    buf.extend_from_slice(data);

    buf
}

/// Decode a tunneled UDP datagram into `(origin host, origin port,
/// payload)`.
///
/// Fragmented datagrams (FRAG ≠ 0) are refused; reassembly is obsolete in
/// practice and the receive path drops them.
pub fn parse_packet(buf: &[u8]) -> Result<(Host, u16, &[u8]), Error> {
    if buf.len() < 4 {
        return Err(Error::new(ErrorKind::WireFormat));
    }

    let frag = buf[2];
    if frag != 0 {
        return Err(Error::new(ErrorKind::Fragmented { frag }));
    }

    let atyp = buf[3];
    let mut pos = 4;

    let host = match atyp {
        ATYP_IPV4 => {
            if buf.len() < pos + 4 {
                return Err(Error::new(ErrorKind::WireFormat));
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[pos..pos + 4]);
            pos += 4;
            Host::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            if buf.len() < pos + 1 {
                return Err(Error::new(ErrorKind::WireFormat));
            }
            let len = buf[pos] as usize;
            pos += 1;
            if buf.len() < pos + len {
                return Err(Error::new(ErrorKind::WireFormat));
            }
            let domain =
                String::from_utf8_lossy(&buf[pos..pos + len]).into_owned();
            pos += len;
            Host::Domain(domain)
        }
        ATYP_IPV6 => {
            if buf.len() < pos + 16 {
                return Err(Error::new(ErrorKind::WireFormat));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[pos..pos + 16]);
            pos += 16;
            Host::Ipv6(Ipv6Addr::from(octets))
        }
        atyp => {
            return Err(Error::new(ErrorKind::UnsupportedAddressType {
                atyp,
            }));
        }
    };

    if buf.len() < pos + 2 {
        return Err(Error::new(ErrorKind::WireFormat));
    }
    let port = BigEndian::read_u16(&buf[pos..pos + 2]);
    pos += 2;

    Ok((host, port, &buf[pos..]))
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::quickcheck;

    #[test]
    fn test_make_method_request() {
        assert_eq!(vec![5, 2, 0, 2], make_method_request(DEFAULT_METHODS));
        assert_eq!(
            vec![5, 1, 2],
            make_method_request(&[METHOD_USERNAME_PASSWORD])
        );
        assert_eq!(vec![5, 1, 0], make_method_request(&[]));
    }

    #[test]
    fn test_parse_method_reply() {
        assert_eq!(
            AuthMethod::NoAuth,
            parse_method_reply(&[5, 0]).unwrap()
        );
        assert_eq!(
            AuthMethod::Gssapi,
            parse_method_reply(&[5, 1]).unwrap()
        );
        assert_eq!(
            AuthMethod::UsernamePassword,
            parse_method_reply(&[5, 2]).unwrap()
        );

        let err = parse_method_reply(&[4, 2]).unwrap_err();
        assert_eq!(ErrorKind::InvalidVersion { version: 4 }, err.kind());

        let err = parse_method_reply(&[5, 0xFF]).unwrap_err();
        assert_eq!(ErrorKind::NoAcceptableAuthMethod, err.kind());
    }

    #[test]
    fn test_auth_round() {
        assert_eq!(
            b"\x01\x04user\x04pass".to_vec(),
            make_auth_request("user", "pass").unwrap()
        );

        assert!(parse_auth_reply(&[1, 0]).is_ok());

        let err = parse_auth_reply(&[1, 1]).unwrap_err();
        assert_eq!(ErrorKind::Authentication { status: 1 }, err.kind());

        let err = parse_auth_reply(&[5, 0]).unwrap_err();
        assert_eq!(ErrorKind::InvalidVersion { version: 5 }, err.kind());
    }

    #[test]
    fn test_make_request() {
        let host = "127.0.0.1".parse().unwrap();
        assert_eq!(
            vec![0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90],
            make_request(Command::Connect, &host, 8080)
        );

        let host = "localhost".parse().unwrap();
        let mut expected = vec![0x05, 0x03, 0x00, 0x03, 0x09];
        expected.extend_from_slice(b"localhost");
        expected.extend_from_slice(&[0x1F, 0x90]);
        assert_eq!(
            expected,
            make_request(Command::UdpAssociate, &host, 8080)
        );
    }

    #[test]
    fn test_parse_reply_prefix() {
        assert_eq!(ATYP_IPV4, parse_reply_prefix(&[5, 0, 0, 1]).unwrap());

        let err = parse_reply_prefix(&[5, 1, 0, 1]).unwrap_err();
        assert_eq!(ErrorKind::Reply { code: 1 }, err.kind());
        assert_eq!("general SOCKS server failure", err.kind().to_string());

        let err = parse_reply_prefix(&[4, 0, 0, 1]).unwrap_err();
        assert_eq!(ErrorKind::InvalidVersion { version: 4 }, err.kind());
    }

    #[test]
    fn test_udp_packet_round_trip() {
        let host: Host = "127.0.0.1".parse().unwrap();
        let packet = make_packet(&host, 53, b"test");

        let mut expected =
            vec![0x00, 0x00, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x35];
        expected.extend_from_slice(b"test");
        assert_eq!(expected, packet);

        let (origin, port, data) = parse_packet(&packet).unwrap();
        assert_eq!(host, origin);
        assert_eq!(53, port);
        assert_eq!(b"test", data);
    }

    #[test]
    fn test_parse_packet_rejects_fragments() {
        let host: Host = "127.0.0.1".parse().unwrap();
        let mut packet = make_packet(&host, 53, b"test");
        packet[2] = 1;

        let err = parse_packet(&packet).unwrap_err();
        assert_eq!(ErrorKind::Fragmented { frag: 1 }, err.kind());
    }

    #[test]
    fn test_parse_packet_rejects_unknown_atyp() {
        let err = parse_packet(&[0, 0, 0, 9, 1, 2, 3, 4, 0, 53]).unwrap_err();
        assert_eq!(
            ErrorKind::UnsupportedAddressType { atyp: 9 },
            err.kind()
        );
    }

    quickcheck! {
        fn prop_ipv4_packet_round_trip(
            octets: (u8, u8, u8, u8),
            port: u16,
            data: Vec<u8>
        ) -> bool {
            let host = Host::Ipv4(Ipv4Addr::new(
                octets.0, octets.1, octets.2, octets.3,
            ));
            let packet = make_packet(&host, port, &data);

            parse_packet(&packet).unwrap()
                == (host, port, data.as_slice())
        }

        fn prop_domain_packet_round_trip(port: u16, data: Vec<u8>) -> bool {
            let host = Host::Domain("ns.example.com".to_owned());
            let packet = make_packet(&host, port, &data);

            parse_packet(&packet).unwrap()
                == (host, port, data.as_slice())
        }
    }
}
