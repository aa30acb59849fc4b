// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! TCP sockets
//!
//! A connected socket exposes its duplex handle as one [`Stream`], shared by
//! `read`, `receive`, `write` and `send`.

use crate::binary::{Binary, ByteString};
use crate::error::{CommonError, Result};
use crate::io::Stream;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4
    Inet,
    /// IPv6
    Inet6,
    /// Unix domain (not supported)
    Unix,
}

impl Family {
    fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            Family::Inet => addr.is_ipv4(),
            Family::Inet6 => addr.is_ipv6(),
            Family::Unix => false,
        }
    }

    fn socket(&self) -> Result<TcpSocket> {
        match self {
            Family::Inet => Ok(TcpSocket::new_v4()?),
            Family::Inet6 => Ok(TcpSocket::new_v6()?),
            Family::Unix => Err(CommonError::unsupported("unix domain sockets")),
        }
    }
}

/// Which half of a connection to shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Stop reading
    Read,
    /// Finish writing
    Write,
    /// Both halves
    Both,
}

enum State {
    /// Not connected yet, possibly bound
    Fresh(Option<TcpSocket>),
    Listening(TcpListener),
    Connected {
        stream: Stream,
        local: SocketAddr,
        peer: SocketAddr,
    },
    Closed,
}

/// A stream socket
pub struct Socket {
    family: Family,
    state: State,
}

impl Socket {
    /// A new, unconnected stream socket
    pub fn new(family: Family) -> Result<Self> {
        if family == Family::Unix {
            return Err(CommonError::unsupported("unix domain sockets"));
        }
        Ok(Self {
            family,
            state: State::Fresh(None),
        })
    }

    /// A datagram socket (not supported)
    pub fn datagram(_family: Family) -> Result<Self> {
        Err(CommonError::unsupported("datagram sockets"))
    }

    /// The address family
    pub fn family(&self) -> Family {
        self.family
    }

    /// Resolve `host` and bind to the first matching address
    pub async fn bind(&mut self, host: &str, port: u16) -> Result<()> {
        if !matches!(self.state, State::Fresh(None)) {
            return Err(CommonError::state("socket is already bound or connected"));
        }
        let addr = self.resolve(host, port).await?;
        let socket = self.family.socket()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        tracing::debug!(%addr, "bound socket");
        self.state = State::Fresh(Some(socket));
        Ok(())
    }

    /// Start accepting connections on the bound address
    pub fn listen(&mut self, backlog: u32) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Fresh(Some(socket)) => {
                self.state = State::Listening(socket.listen(backlog)?);
                Ok(())
            }
            other => {
                self.state = other;
                Err(CommonError::state("listen requires a bound socket"))
            }
        }
    }

    /// Suspend until a client connects
    pub async fn accept(&self) -> Result<Socket> {
        let State::Listening(listener) = &self.state else {
            return Err(CommonError::state("socket is not listening"));
        };
        let (tcp, peer) = listener.accept().await?;
        let local = tcp.local_addr()?;
        tracing::debug!(%local, %peer, "accepted connection");
        Ok(Socket {
            family: self.family,
            state: State::Connected {
                stream: Stream::from_duplex(tcp),
                local,
                peer,
            },
        })
    }

    /// Connect to `host:port`, failing with [`CommonError::Timeout`] if the
    /// connection is not established within `timeout`.
    ///
    /// Without a timeout the configured default applies, if any. A failed
    /// attempt closes the socket.
    pub async fn connect(&mut self, host: &str, port: u16, timeout: Option<Duration>) -> Result<()> {
        let socket = match std::mem::replace(&mut self.state, State::Closed) {
            State::Fresh(socket) => socket,
            other => {
                self.state = other;
                return Err(CommonError::state("socket is already connected or listening"));
            }
        };
        let addr = self.resolve(host, port).await?;
        let socket = match socket {
            Some(socket) => socket,
            None => self.family.socket()?,
        };

        let timeout = timeout.or_else(|| {
            crate::runtime::system::config()
                .connect_timeout_ms
                .map(Duration::from_millis)
        });
        let tcp = match timeout {
            Some(limit) => tokio::time::timeout(limit, socket.connect(addr))
                .await
                .map_err(|_| CommonError::Timeout)??,
            None => socket.connect(addr).await?,
        };

        let local = tcp.local_addr()?;
        tracing::debug!(%local, peer = %addr, "connected");
        self.state = State::Connected {
            stream: Stream::from_duplex(tcp),
            local,
            peer: addr,
        };
        Ok(())
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let family = self.family;
        tokio::net::lookup_host((host, port))
            .await?
            .find(|addr| family.matches(addr))
            .ok_or_else(|| {
                CommonError::io(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no {:?} address for {}", family, host),
                )
            })
    }

    /// The connection's stream. Every call returns the same stream.
    pub fn get_stream(&self) -> Result<Stream> {
        match &self.state {
            State::Connected { stream, .. } => Ok(stream.clone()),
            State::Closed => Err(CommonError::Closed),
            _ => Err(CommonError::state("socket is not connected")),
        }
    }

    /// Read exactly `n` bytes, or fewer at end of stream
    pub async fn read(&self, n: usize) -> Result<ByteString> {
        self.get_stream()?.read(n).await
    }

    /// Read whatever arrives next, at most `max` bytes
    pub async fn receive(&self, max: usize) -> Result<ByteString> {
        self.get_stream()?.receive(max).await
    }

    /// Queue `data` for sending
    pub fn write(&self, data: &dyn Binary) -> Result<()> {
        self.get_stream()?.write(data)
    }

    /// Send `data` and wait until it has been handed to the connection
    pub async fn send(&self, data: &dyn Binary) -> Result<()> {
        let stream = self.get_stream()?;
        stream.write(data)?;
        stream.flush().await
    }

    /// Shut down one or both halves of the connection
    pub async fn shutdown(&self, how: Shutdown) -> Result<()> {
        let stream = self.get_stream()?;
        if matches!(how, Shutdown::Read | Shutdown::Both) {
            stream.end_read();
        }
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            stream.end().await?;
        }
        Ok(())
    }

    /// Close the socket. A second close fails.
    pub async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Connected { stream, .. } => stream.close().await,
            State::Closed => Err(CommonError::Closed),
            State::Fresh(_) | State::Listening(_) => Ok(()),
        }
    }

    /// Local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.state {
            State::Fresh(Some(socket)) => Ok(socket.local_addr()?),
            State::Listening(listener) => Ok(listener.local_addr()?),
            State::Connected { local, .. } => Ok(*local),
            State::Fresh(None) => Err(CommonError::state("socket is not bound")),
            State::Closed => Err(CommonError::Closed),
        }
    }

    /// Remote address of a connected socket
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match &self.state {
            State::Connected { peer, .. } => Ok(*peer),
            State::Closed => Err(CommonError::Closed),
            _ => Err(CommonError::state("socket is not connected")),
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Fresh(None) => "fresh",
            State::Fresh(Some(_)) => "bound",
            State::Listening(_) => "listening",
            State::Connected { .. } => "connected",
            State::Closed => "closed",
        };
        f.debug_struct("Socket")
            .field("family", &self.family)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_kinds() {
        assert!(matches!(
            Socket::new(Family::Unix),
            Err(CommonError::Unsupported(_))
        ));
        assert!(matches!(
            Socket::datagram(Family::Inet),
            Err(CommonError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_state_checks() {
        let mut socket = Socket::new(Family::Inet).unwrap();
        assert!(socket.get_stream().is_err());
        assert!(socket.peer_addr().is_err());
        assert!(socket.listen(8).is_err());
        assert!(socket.accept().await.is_err());

        socket.bind("127.0.0.1", 0).await.unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
        assert!(socket.bind("127.0.0.1", 0).await.is_err());
        socket.listen(8).unwrap();
        assert!(socket.connect("127.0.0.1", 1, None).await.is_err());

        socket.close().await.unwrap();
        assert!(matches!(socket.close().await, Err(CommonError::Closed)));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut socket = Socket::new(Family::Inet).unwrap();
        let err = socket
            .connect("127.0.0.1", port, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::ConnectionRefused));
    }
}
