//! A SOCKS5 proxy client for the UDP protocol.
//!
//! [`SocksProxy`] drives the control channel: method negotiation, the
//! optional RFC 1929 username/password sub-negotiation, and
//! `UDP_ASSOCIATE`. [`SocksUdpSocket`] then rewrites every send and
//! receive of a UDP socket to wrap and unwrap the SOCKS5 UDP request
//! header, tunneling the datagrams through the relay endpoint the proxy
//! assigned.
//!
//! * RFC 1928 - SOCKS Protocol Version 5
//! * RFC 1929 - Username/Password Authentication for SOCKS V5
//!
//! [`SocksProxy`]: struct.SocksProxy.html
//! [`SocksUdpSocket`]: struct.SocksUdpSocket.html

pub mod codec;

use crate::{
    endpoint::{Host, ProxyAddr},
    error::{Error, ErrorKind},
};

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info};
use mio::net::UdpSocket;

use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

/// The read/write deadline on the control channel handshake.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// A SOCKS5 control-channel session.
///
/// The TCP control connection must remain open while the associated UDP
/// relay is in use; dropping the session revokes the association. For this
/// reason [`wrap`] consumes the session and hands it to the returned
/// socket.
///
/// [`wrap`]: #method.wrap
#[derive(Debug)]
pub struct SocksProxy {
    control: TcpStream,
    auth_method: codec::AuthMethod,
    addr: ProxyAddr,
}

impl SocksProxy {
    /// Open the control connection and negotiate an authentication
    /// method, running the RFC 1929 sub-negotiation if the proxy asks
    /// for it.
    pub fn connect(addr: &ProxyAddr) -> Result<Self, Error> {
        debug!("connecting to proxy @ {}", addr);

        let control = TcpStream::connect(addr)?;
        control.set_read_timeout(Some(CONTROL_TIMEOUT))?;
        control.set_write_timeout(Some(CONTROL_TIMEOUT))?;

        info!("connected to proxy @ {}", addr);

        let mut proxy = Self {
            control,
            auth_method: codec::AuthMethod::NoAuth,
            addr: addr.clone(),
        };
        proxy.negotiate()?;

        Ok(proxy)
    }

    /// The method the proxy selected during negotiation.
    pub fn auth_method(&self) -> codec::AuthMethod {
        self.auth_method
    }

    fn negotiate(&mut self) -> Result<(), Error> {
        info!("sending a connect request to proxy @ {}", self.addr);

        self.control
            .write_all(&codec::make_method_request(codec::DEFAULT_METHODS))?;

        let mut reply = [0u8; 2];
        self.control.read_exact(&mut reply)?;
        let method = codec::parse_method_reply(&reply)?;

        info!(
            "received the connect reply with authentication method {}",
            method.code()
        );

        if let codec::AuthMethod::UsernamePassword = method {
            self.authenticate()?;
        }
        self.auth_method = method;

        Ok(())
    }

    fn authenticate(&mut self) -> Result<(), Error> {
        let username = self.addr.username().unwrap_or("");
        let password = self.addr.password().unwrap_or("");

        info!("sending a username/password request to proxy");

        let request = codec::make_auth_request(username, password)?;
        self.control.write_all(&request)?;

        let mut reply = [0u8; 2];
        self.control.read_exact(&mut reply)?;

        codec::parse_auth_reply(&reply).map_err(|err| {
            let _ = self.control.shutdown(Shutdown::Both);
            err
        })
    }

    /// Request `UDP_ASSOCIATE` for the given client UDP endpoint
    /// (`0.0.0.0:0` when unknown) and return the relay endpoint every
    /// tunneled datagram must be addressed to.
    pub fn associate(
        &mut self,
        local: SocketAddr,
    ) -> Result<SocketAddr, Error> {
        info!("sending a UDP associate request to proxy @ {}", self.addr);

        let request = codec::make_request(
            codec::Command::UdpAssociate,
            &Host::from(local.ip()),
            local.port(),
        );
        self.control.write_all(&request)?;

        let (host, port) = self.read_reply_addr()?;

        info!("associated the UDP relay @ {}:{}", host, port);

        match host.ip() {
            Some(ip) => Ok(SocketAddr::new(ip, port)),
            None => {
                // A domain name in BND.ADDR; left to us to resolve.
                let domain = host.to_string();
                (domain.as_str(), port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        Error::new(ErrorKind::InvalidInput {
                            msg: "relay domain resolved to no address",
                        })
                    })
            }
        }
    }

    /// Associate the given socket and rewire its send/receive through the
    /// relay.
    pub fn wrap(mut self, socket: UdpSocket) -> Result<SocksUdpSocket, Error> {
        let local = socket.local_addr()?;
        let relay = self.associate(local)?;

        Ok(SocksUdpSocket {
            inner: socket,
            relay,
            _proxy: self,
        })
    }

    fn read_reply_addr(&mut self) -> Result<(Host, u16), Error> {
        let mut prefix = [0u8; 4];
        self.control.read_exact(&mut prefix)?;
        let atyp = codec::parse_reply_prefix(&prefix)?;

        let host = match atyp {
            codec::ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                self.control.read_exact(&mut octets)?;
                Host::Ipv4(octets.into())
            }
            codec::ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                self.control.read_exact(&mut len)?;
                let mut domain = vec![0u8; len[0] as usize];
                self.control.read_exact(&mut domain)?;
                Host::Domain(String::from_utf8_lossy(&domain).into_owned())
            }
            codec::ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                self.control.read_exact(&mut octets)?;
                Host::Ipv6(octets.into())
            }
            atyp => {
                return Err(Error::new(
                    ErrorKind::UnsupportedAddressType { atyp },
                ));
            }
        };

        let mut port = [0u8; 2];
        self.control.read_exact(&mut port)?;

        Ok((host, BigEndian::read_u16(&port)))
    }
}

/// A UDP socket whose datagrams are tunneled through a SOCKS5 relay.
///
/// Every outbound datagram is prefixed with the UDP request header naming
/// its true destination and sent to the relay; every inbound datagram has
/// the header stripped and reports the true origin. The control session is
/// owned by the wrapper so the association outlives every datagram.
#[derive(Debug)]
pub struct SocksUdpSocket {
    inner: UdpSocket,
    relay: SocketAddr,
    _proxy: SocksProxy,
}

impl SocksUdpSocket {
    /// Wrap `data` in a UDP request header addressed to `target` and send
    /// it to the relay.
    ///
    /// Reports the number of bytes of original payload sent, excluding
    /// the header.
    pub fn send_to(
        &self,
        data: &[u8],
        target: SocketAddr,
    ) -> Result<usize, Error> {
        let packet = codec::make_packet(
            &Host::from(target.ip()),
            target.port(),
            data,
        );
        let sent = self.inner.send_to(&packet, &self.relay)?;

        Ok(sent.saturating_sub(packet.len() - data.len()))
    }

    /// Receive one datagram from the relay and unwrap it.
    ///
    /// The payload is moved to the front of `buf`; the returned host and
    /// port are the datagram's true origin.
    pub fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, Host, u16), Error> {
        let (received, _relay) = self.inner.recv_from(buf)?;

        let (host, port, header_len) = {
            let (host, port, data) = codec::parse_packet(&buf[..received])?;
            (host, port, received - data.len())
        };

        buf.copy_within(header_len..received, 0);

        Ok((received - header_len, host, port))
    }

    /// The relay endpoint assigned by the proxy.
    pub fn relay(&self) -> SocketAddr {
        self.relay
    }

    /// The wrapped socket, for readiness registration.
    pub fn get_ref(&self) -> &UdpSocket {
        &self.inner
    }
}
