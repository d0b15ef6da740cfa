//! Suspending, buffer-oriented TCP sockets driven by a readiness reactor.
//!
//! asock exposes a small, uniform API — connect, accept, read, read-at-least,
//! bulk-read, write, close, force-close — whose operations suspend instead of
//! blocking. Under the hood every socket is registered with a [`Reactor`]: a
//! dedicated thread running an epoll selection loop that resumes suspended
//! operations when their readiness arrives. Reactors are grouped in a
//! [`ReactorPool`] and new sockets land on the least-loaded one; a default
//! pool is created lazily on first use.
//!
//! Reads and writes move through a [`Buffer`], a fixed-capacity byte store
//! with a cursor and a limit and big-endian accessors. A read fills
//! `cursor..limit`, a write drains it.
//!
//! Writes never interleave: each connection owns a writer task consuming a
//! FIFO of write requests, so concurrent `write` callers see their buffers
//! hit the wire atomically, in enqueue order. Reads are exclusive — a second
//! read while one is suspended fails with [`Error::ConcurrentRead`].
//!
//! # Example
//!
//! ```no_run
//! use asock::{Buffer, Result};
//! use asock::net::TcpStream;
//!
//! fn main() -> Result<()> {
//!     futures::executor::block_on(async {
//!         let stream = TcpStream::connect("127.0.0.1", 4567).await?;
//!
//!         let mut request = Buffer::from_vec(b"ping".to_vec());
//!         stream.write(&mut request).await?;
//!
//!         // Suspend until at least one byte arrived.
//!         let mut reply = Buffer::with_capacity(64);
//!         let n = stream.read(&mut reply).await?;
//!         println!("got {} bytes", n);
//!
//!         stream.close().await;
//!         Ok(())
//!     })
//! }
//! ```
//!
//! # Errors
//!
//! Every failure is an [`Error`] kind with defined semantics: refused
//! connects, occupied listen addresses, peer disconnects, local close and
//! force-close, operations on closed sockets, buffer over- and underflow.
//! A connection reports its *first* terminal reason — and only that one —
//! to the handler installed with
//! [`TcpStream::set_exception_handler`](net::TcpStream::set_exception_handler).

#![warn(missing_debug_implementations)]

mod buffer;
mod error;
mod executor;
mod interest;
mod pool;
mod reactor;
mod registration;
mod sys;
mod token;

pub mod net;

pub use crate::buffer::Buffer;
pub use crate::error::{Error, Result};
pub use crate::pool::{default_pool, set_default_pool, ReactorPool};
pub use crate::reactor::Reactor;
