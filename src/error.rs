use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by sockets, registrations and reactors.
///
/// The enum is `Clone` because a close reason fans out to every operation
/// suspended on the same connection; raw OS errors are therefore carried
/// behind an `Arc`.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// `connect` was refused by the peer, or the address did not resolve.
    #[error("connection refused")]
    ConnectionRefused,

    /// `bind` failed because the address is already in use.
    #[error("address in use")]
    AddressInUse,

    /// The remote end closed or reset the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    /// The local side closed the socket gracefully.
    #[error("socket closed")]
    NormalClose,

    /// The local side force-closed the socket.
    #[error("socket force-closed")]
    ForceClose,

    /// An I/O operation was invoked on an already-closed socket.
    #[error("operation on a closed socket")]
    SocketClosed,

    /// More than one read was in flight on the same connection.
    #[error("a read is already in progress")]
    ConcurrentRead,

    /// The buffer has no room for the requested operation.
    #[error("buffer overflow")]
    BufferOverflow,

    /// The buffer holds fewer bytes than the requested operation needs.
    #[error("buffer underflow")]
    BufferUnderflow,

    /// The socket option cannot be read or written on this platform.
    #[error("socket option not supported")]
    OptionNotSupported,

    /// An operation is already registered for this interest.
    #[error("interest already registered")]
    AlreadyRegistered,

    /// The owning reactor shut down while the operation was suspended.
    #[error("reactor closed")]
    ReactorClosed,

    /// An OS-level failure that maps to no more specific kind.
    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
