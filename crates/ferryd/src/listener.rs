//! Binds the listening socket and accepts connections from it.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage, bind, listen, setsockopt,
    socket, sockopt,
};
use thiserror::Error;
use tracing::{info, warn};

pub(crate) const LISTENER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::listener");

/// Errors raised while binding the listening socket.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The host name could not be resolved.
    #[error("failed to resolve '{host}:{port}': {source}")]
    Resolve {
        /// Configured host.
        host: String,
        /// Configured port.
        port: u16,
        /// Underlying resolver error.
        #[source]
        source: io::Error,
    },
    /// Resolution succeeded but produced no addresses.
    #[error("'{host}:{port}' resolved to no addresses")]
    NoAddress {
        /// Configured host.
        host: String,
        /// Configured port.
        port: u16,
    },
    /// Binding or listening failed.
    #[error("failed to listen on {address}: {source}")]
    Bind {
        /// Address that could not be bound.
        address: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },
}

/// Binds a non-blocking listener on the first usable address for
/// `host:port`.
pub fn bind_listener(host: &str, port: u16, backlog: i32) -> Result<TcpListener, ListenerError> {
    let addresses = (host, port)
        .to_socket_addrs()
        .map_err(|source| ListenerError::Resolve {
            host: host.to_owned(),
            port,
            source,
        })?;

    let mut last_error = None;
    for address in addresses {
        match bind_address(address, backlog) {
            Ok(listener) => {
                info!(
                    target: LISTENER_TARGET,
                    address = %address,
                    backlog,
                    "listening for connections"
                );
                return Ok(listener);
            }
            Err(source) => last_error = Some(ListenerError::Bind { address, source }),
        }
    }
    Err(last_error.unwrap_or_else(|| ListenerError::NoAddress {
        host: host.to_owned(),
        port,
    }))
}

fn bind_address(address: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let family = if address.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let fd = socket(family, SockType::Stream, SockFlag::empty(), None)?;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    bind(fd.as_raw_fd(), &SockaddrStorage::from(address))?;
    let queue = Backlog::new(backlog).unwrap_or_else(|_| {
        warn!(
            target: LISTENER_TARGET,
            backlog,
            "backlog exceeds the system limit; using the maximum"
        );
        Backlog::MAXCONN
    });
    listen(&fd, queue)?;
    let listener = TcpListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accepts one pending connection.
///
/// Interrupted calls are retried; `Ok(None)` means the queue is empty. The
/// returned stream is blocking, as the worker receiving it expects.
pub fn accept_connection(listener: &TcpListener) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                return Ok(Some((stream, peer)));
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(error) => return Err(error),
        }
    }
}
