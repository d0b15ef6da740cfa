use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::pool::{self, ReactorPool};
use crate::registration::Registration;

use super::stream::{as_socket_addr, TcpStream};

/// A suspending TCP listener.
///
/// Accepted connections are wired up as [`TcpStream`]s on the least-loaded
/// reactor of the listener's pool.
pub struct TcpListener {
    socket: Socket,
    registration: Arc<Registration>,
    pool: Arc<ReactorPool>,
    closed: AtomicBool,
}

impl TcpListener {
    /// Binds to `host:port` on the default reactor pool.
    ///
    /// An occupied address surfaces as [`Error::AddressInUse`].
    pub fn bind(host: &str, port: u16) -> Result<TcpListener> {
        let pool = pool::default_pool()?;
        TcpListener::bind_on(pool, host, port)
    }

    /// Binds on a caller-owned reactor pool.
    pub fn bind_on(pool: Arc<ReactorPool>, host: &str, port: u16) -> Result<TcpListener> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::from(io::Error::from(io::ErrorKind::AddrNotAvailable)))?;

        let socket = Socket::new(
            Domain::for_address(addr),
            Type::STREAM.nonblocking(),
            Some(Protocol::TCP),
        )?;
        // Mirrors what libstd does for listeners.
        socket.set_reuse_address(true)?;
        if let Err(err) = socket.bind(&addr.into()) {
            return Err(match err.raw_os_error() {
                Some(libc::EADDRINUSE) => Error::AddressInUse,
                _ => err.into(),
            });
        }
        socket.listen(1024)?;

        let reactor = pool.get_least_loaded();
        let registration = reactor.register(socket.as_raw_fd())?;
        debug!("listening on {}", addr);
        Ok(TcpListener {
            socket,
            registration,
            pool,
            closed: AtomicBool::new(false),
        })
    }

    /// Accepts the next inbound connection, suspending until one arrives.
    ///
    /// Resumes with [`Error::NormalClose`] if the listener is closed while
    /// suspended, and fails with [`Error::SocketClosed`] once closed.
    pub async fn accept(&self) -> Result<TcpStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SocketClosed);
        }
        loop {
            match self.socket.accept() {
                Ok((socket, _addr)) => {
                    socket.set_nonblocking(true)?;
                    let reactor = self.pool.get_least_loaded();
                    let registration = reactor.register(socket.as_raw_fd())?;
                    trace!("accepted connection as fd {}", socket.as_raw_fd());
                    return TcpStream::establish(socket, registration);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.registration.select_once(Interest::ACCEPT).await?;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                // The connection died between arriving and being accepted.
                Err(ref err) if err.raw_os_error() == Some(libc::ECONNABORTED) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        as_socket_addr(self.socket.local_addr()?)
    }

    /// Stops accepting. A suspended `accept` resumes with
    /// [`Error::NormalClose`]; closing again is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing listener");
        self.registration.close(Error::NormalClose);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TcpListener {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TcpListener")
            .field("fd", &self.socket.as_raw_fd())
            .finish()
    }
}
