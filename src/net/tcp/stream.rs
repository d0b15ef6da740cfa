use std::fmt;
use std::future::Future;
use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use log::{debug, trace};
use socket2::{Domain, Protocol, Socket, Type};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::executor;
use crate::interest::Interest;
use crate::pool::{self, ReactorPool};
use crate::registration::Registration;
use crate::sys;

use super::writer::{self, Request, RequestSender};

// Connection lifecycle. CLOSING is entered by a graceful close while the
// write queue drains; CLOSED is terminal.
const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// The socket options a [`TcpStream`] exposes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocketOption {
    /// `SO_RCVBUF`, a size hint in bytes.
    ReceiveBufferSize,
    /// `SO_SNDBUF`, a size hint in bytes.
    SendBufferSize,
    /// `SO_KEEPALIVE`.
    KeepAlive,
    /// `TCP_NODELAY`.
    NoDelay,
}

/// A typed socket option value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OptionValue {
    Int(usize),
    Bool(bool),
}

/// A suspending TCP connection.
///
/// Every entry point may be called from any thread. At most one read may be
/// in flight at a time; writes may be issued concurrently and are serialized
/// through a per-connection queue, in enqueue order, each buffer written
/// atomically. Dropping an open stream force-closes it.
///
/// A connection reports its terminal error (peer closed, local close, force
/// close, or an internal failure) at most once through the handler installed
/// with [`set_exception_handler`].
///
/// [`set_exception_handler`]: TcpStream::set_exception_handler
pub struct TcpStream {
    inner: Arc<Inner>,
}

impl TcpStream {
    /// Connects to `host:port` through the default reactor pool.
    pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
        let pool = pool::default_pool()?;
        TcpStream::connect_on(&pool, host, port).await
    }

    /// Connects through a caller-owned reactor pool.
    ///
    /// Address resolution failures and refused attempts both surface as
    /// [`Error::ConnectionRefused`]; when the name resolves to several
    /// addresses they are tried in order.
    pub async fn connect_on(pool: &ReactorPool, host: &str, port: u16) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::ConnectionRefused)?
            .collect();

        let mut last = Error::ConnectionRefused;
        for addr in addrs {
            match connect_addr(pool, addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    /// Wraps an accepted or connected non-blocking socket.
    pub(crate) fn establish(
        socket: Socket,
        registration: Arc<Registration>,
    ) -> Result<TcpStream> {
        let send_buffer_size = match socket.send_buffer_size() {
            Ok(size) => size,
            Err(err) => {
                registration.close(Error::SocketClosed);
                return Err(err.into());
            }
        };
        let (requests, receiver) = writer::request_queue();
        let inner = Arc::new(Inner {
            socket,
            registration,
            requests,
            state: AtomicU8::new(OPEN),
            reading: AtomicBool::new(false),
            close_reported: AtomicBool::new(false),
            send_buffer_size: AtomicUsize::new(send_buffer_size),
            exception_handler: Mutex::new(None),
        });
        executor::spawn(writer::write_loop(inner.clone(), receiver));
        Ok(TcpStream { inner })
    }

    /// Reads at least one byte into `buffer[cursor..limit]`, advancing the
    /// cursor, and returns the count.
    ///
    /// Requires room in the buffer ([`Error::BufferOverflow`] otherwise) and
    /// no other read in flight ([`Error::ConcurrentRead`]). End of stream
    /// surfaces as [`Error::PeerClosed`] and closes the connection.
    pub async fn read(&self, buffer: &mut Buffer) -> Result<usize> {
        self.inner.read(buffer).await
    }

    /// Like [`read`](TcpStream::read) but suspends until at least `min`
    /// bytes arrived, however the peer paces them.
    pub async fn read_at_least(&self, buffer: &mut Buffer, min: usize) -> Result<usize> {
        self.inner.clone().read_at_least(buffer, min).await
    }

    /// Drains the socket through `operator` until it returns `false`.
    ///
    /// The connection registers for readable readiness once and then, on each
    /// firing, reads into `buffer[0..limit]` repeatedly until the OS would
    /// block, invoking `operator(buffer, count)` for every chunk with the
    /// cursor rewound to zero. The operator may adjust the limit between
    /// chunks. Returns the total byte count once the operator asks to stop.
    ///
    /// An `Err` from the operator aborts the loop and propagates to the
    /// caller but leaves the connection open; only I/O failures close it.
    pub async fn bulk_read<F>(&self, buffer: &mut Buffer, operator: F) -> Result<usize>
    where
        F: FnMut(&mut Buffer, usize) -> Result<bool> + Send + 'static,
    {
        self.inner.clone().bulk_read(buffer, Box::new(operator)).await
    }

    /// Writes `buffer[cursor..limit]` and suspends until every byte is
    /// queued in the OS, advancing the cursor to the limit.
    ///
    /// Concurrent writers are serialized; the wire order is the order their
    /// requests entered the queue.
    pub async fn write(&self, buffer: &mut Buffer) -> Result<()> {
        let queued = mem::replace(buffer, Buffer::with_capacity(0));
        match self.inner.enqueue(queued) {
            Ok(wait) => match wait.await {
                Ok((returned, outcome)) => {
                    *buffer = returned;
                    outcome
                }
                Err(oneshot::Canceled) => Err(Error::SocketClosed),
            },
            Err((returned, err)) => {
                *buffer = returned;
                Err(err)
            }
        }
    }

    /// Enqueues a write without suspending and returns its completion.
    ///
    /// The buffer is consumed; the returned future resolves once the bytes
    /// are on the wire (or the write failed). The enqueue itself happens
    /// before `send` returns, so a later [`close`](TcpStream::close) drains
    /// this write.
    pub fn send(&self, buffer: Buffer) -> impl Future<Output = Result<()>> {
        let queued = self.inner.enqueue(buffer);
        async move {
            match queued {
                Ok(wait) => match wait.await {
                    Ok((_buffer, outcome)) => outcome,
                    Err(oneshot::Canceled) => Err(Error::SocketClosed),
                },
                Err((_buffer, err)) => Err(err),
            }
        }
    }

    /// Gracefully closes the connection.
    ///
    /// Suspends until every write enqueued before the close is on the wire,
    /// then cancels any suspended read with [`Error::NormalClose`] and shuts
    /// the socket down. Subsequent operations fail with
    /// [`Error::SocketClosed`]; closing again is a no-op.
    pub async fn close(&self) {
        self.inner.close().await
    }

    /// Tears the connection down immediately, without suspending.
    ///
    /// Pending and queued writes fail with [`Error::SocketClosed`], a
    /// suspended read is cancelled with [`Error::ForceClose`].
    pub fn force_close(&self) {
        self.inner.force_close()
    }

    /// Whether a close (graceful or forced) has been initiated.
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != OPEN
    }

    /// Installs the handler that receives the connection's single terminal
    /// error. Replaces any previously installed handler.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: FnOnce(Error) + Send + 'static,
    {
        *self.inner.exception_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        as_socket_addr(self.inner.socket.peer_addr()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        as_socket_addr(self.inner.socket.local_addr()?)
    }

    /// Reads a socket option as its typed value.
    pub fn get_option(&self, option: SocketOption) -> Result<OptionValue> {
        let socket = &self.inner.socket;
        let value = match option {
            SocketOption::ReceiveBufferSize => OptionValue::Int(socket.recv_buffer_size()?),
            SocketOption::SendBufferSize => OptionValue::Int(socket.send_buffer_size()?),
            SocketOption::KeepAlive => OptionValue::Bool(socket.keepalive()?),
            SocketOption::NoDelay => OptionValue::Bool(socket.nodelay()?),
        };
        Ok(value)
    }

    /// Sets a socket option; `false` when the value kind does not match the
    /// option or the OS refuses it.
    pub fn set_option(&self, option: SocketOption, value: OptionValue) -> bool {
        let socket = &self.inner.socket;
        let outcome = match (option, value) {
            (SocketOption::ReceiveBufferSize, OptionValue::Int(size)) => {
                socket.set_recv_buffer_size(size)
            }
            (SocketOption::SendBufferSize, OptionValue::Int(size)) => {
                let result = socket.set_send_buffer_size(size);
                if result.is_ok() {
                    // The write-strategy threshold follows the configured
                    // size (the OS may round it).
                    if let Ok(actual) = socket.send_buffer_size() {
                        self.inner.send_buffer_size.store(actual, Ordering::Release);
                    }
                }
                result
            }
            (SocketOption::KeepAlive, OptionValue::Bool(on)) => socket.set_keepalive(on),
            (SocketOption::NoDelay, OptionValue::Bool(on)) => socket.set_nodelay(on),
            _ => return false,
        };
        outcome.is_ok()
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        // Safety net: an abandoned stream is torn down like a force close.
        self.inner.force_close();
    }
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TcpStream")
            .field("fd", &self.inner.socket.as_raw_fd())
            .finish()
    }
}

async fn connect_addr(pool: &ReactorPool, addr: SocketAddr) -> Result<TcpStream> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM.nonblocking(),
        Some(Protocol::TCP),
    )?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
            return Err(Error::ConnectionRefused)
        }
        Err(err) => return Err(err.into()),
    }

    let reactor = pool.get_least_loaded();
    let registration = reactor.register(socket.as_raw_fd())?;
    if let Err(err) = registration.select_once(Interest::CONNECT).await {
        registration.close(err.clone());
        return Err(err);
    }
    // Writable readiness after a non-blocking connect only means the attempt
    // finished; SO_ERROR tells how it went.
    match socket.take_error() {
        Ok(None) => {}
        Ok(Some(err)) => {
            registration.close(Error::ConnectionRefused);
            return Err(match err.kind() {
                io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
                _ => err.into(),
            });
        }
        Err(err) => {
            registration.close(Error::ConnectionRefused);
            return Err(err.into());
        }
    }
    trace!("connected to {}", addr);
    TcpStream::establish(socket, registration)
}

pub(super) fn as_socket_addr(addr: socket2::SockAddr) -> Result<SocketAddr> {
    match addr.as_socket() {
        Some(addr) => Ok(addr),
        None => Err(io::Error::from(io::ErrorKind::AddrNotAvailable).into()),
    }
}

/// Maps an OS read/write failure to the error taxonomy: disconnect-class
/// errnos mean the peer is gone.
fn io_failure(err: io::Error) -> Error {
    match err.raw_os_error() {
        Some(libc::ECONNRESET) | Some(libc::ECONNABORTED) | Some(libc::EPIPE) => Error::PeerClosed,
        _ => err.into(),
    }
}

struct MinRead {
    buffer: Option<Buffer>,
    total: usize,
}

type BulkOperator = Box<dyn FnMut(&mut Buffer, usize) -> Result<bool> + Send>;

struct BulkRead {
    buffer: Option<Buffer>,
    total: usize,
    operator_error: Option<Error>,
    operator: BulkOperator,
}

/// Shared state behind a [`TcpStream`].
pub(crate) struct Inner {
    socket: Socket,
    registration: Arc<Registration>,
    requests: RequestSender,
    state: AtomicU8,
    reading: AtomicBool,
    close_reported: AtomicBool,
    /// `SO_SNDBUF` as last observed; the large/small write strategy split.
    send_buffer_size: AtomicUsize,
    exception_handler: Mutex<Option<Box<dyn FnOnce(Error) + Send>>>,
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) != OPEN {
            return Err(Error::SocketClosed);
        }
        Ok(())
    }

    /// Whether the connection reached its terminal state (force close, peer
    /// failure); a graceful close still draining does not count.
    pub(crate) fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    fn begin_read(&self) -> Result<ReadGuard<'_>> {
        if self.reading.swap(true, Ordering::AcqRel) {
            return Err(Error::ConcurrentRead);
        }
        Ok(ReadGuard { inner: self })
    }

    async fn read(&self, buffer: &mut Buffer) -> Result<usize> {
        if !buffer.has_remaining() {
            return Err(Error::BufferOverflow);
        }
        self.check_open()?;
        let _guard = self.begin_read()?;

        loop {
            match self.registration.select_once(Interest::READ).await {
                Ok(()) => {}
                Err(err) => return Err(self.fail(err)),
            }
            match sys::net::read(self.socket.as_raw_fd(), buffer.writable_slice()) {
                Ok(0) => return Err(self.fail(Error::PeerClosed)),
                Ok(count) => {
                    buffer.advance(count);
                    trace!("fd {}: read {} bytes", self.socket.as_raw_fd(), count);
                    return Ok(count);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.fail(io_failure(err))),
            }
        }
    }

    async fn read_at_least(self: Arc<Self>, buffer: &mut Buffer, min: usize) -> Result<usize> {
        if buffer.remaining() < min || !buffer.has_remaining() {
            return Err(Error::BufferOverflow);
        }
        self.check_open()?;
        let _guard = self.begin_read()?;

        let shared = Arc::new(Mutex::new(MinRead {
            buffer: Some(mem::replace(buffer, Buffer::with_capacity(0))),
            total: 0,
        }));

        let callback_state = shared.clone();
        let this = self.clone();
        let callback = Box::new(move || -> Result<bool> {
            let mut state = callback_state.lock().unwrap();
            let state = &mut *state;
            let Some(buf) = state.buffer.as_mut() else {
                return Ok(false);
            };
            loop {
                match sys::net::read(this.socket.as_raw_fd(), buf.writable_slice()) {
                    Ok(0) => return Err(Error::PeerClosed),
                    Ok(count) => {
                        buf.advance(count);
                        state.total += count;
                        if state.total >= min || !buf.has_remaining() {
                            return Ok(false);
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(io_failure(err)),
                }
            }
        });

        let outcome = self
            .registration
            .select_always(Interest::READ, callback)
            .await;

        let mut state = shared.lock().unwrap();
        if let Some(returned) = state.buffer.take() {
            *buffer = returned;
        }
        match outcome {
            Ok(()) => Ok(state.total),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn bulk_read(
        self: Arc<Self>,
        buffer: &mut Buffer,
        operator: BulkOperator,
    ) -> Result<usize> {
        if buffer.limit() == 0 {
            return Err(Error::BufferOverflow);
        }
        self.check_open()?;
        let _guard = self.begin_read()?;

        let shared = Arc::new(Mutex::new(BulkRead {
            buffer: Some(mem::replace(buffer, Buffer::with_capacity(0))),
            total: 0,
            operator_error: None,
            operator,
        }));

        let callback_state = shared.clone();
        let this = self.clone();
        let callback = Box::new(move || -> Result<bool> {
            let mut state = callback_state.lock().unwrap();
            let state = &mut *state;
            let Some(buf) = state.buffer.as_mut() else {
                return Ok(false);
            };
            loop {
                buf.rewind();
                match sys::net::read(this.socket.as_raw_fd(), buf.writable_slice()) {
                    Ok(0) => return Err(Error::PeerClosed),
                    Ok(count) => {
                        state.total += count;
                        buf.rewind();
                        match (state.operator)(buf, count) {
                            Ok(true) => {}
                            Ok(false) => return Ok(false),
                            Err(err) => {
                                // Operator failures are the caller's business;
                                // the connection stays up.
                                state.operator_error = Some(err);
                                return Ok(false);
                            }
                        }
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(io_failure(err)),
                }
            }
        });

        let outcome = self
            .registration
            .select_always(Interest::READ, callback)
            .await;

        let mut state = shared.lock().unwrap();
        if let Some(returned) = state.buffer.take() {
            *buffer = returned;
        }
        match outcome {
            Ok(()) => match state.operator_error.take() {
                Some(err) => Err(err),
                None => Ok(state.total),
            },
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Synchronous admission into the write queue.
    pub(crate) fn enqueue(
        &self,
        buffer: Buffer,
    ) -> std::result::Result<oneshot::Receiver<(Buffer, Result<()>)>, (Buffer, Error)> {
        if self.state.load(Ordering::Acquire) != OPEN {
            return Err((buffer, Error::SocketClosed));
        }
        let (done, wait) = oneshot::channel();
        match self.requests.unbounded_send(Request::Write { buffer, done }) {
            Ok(()) => Ok(wait),
            Err(refused) => match refused.into_inner() {
                Request::Write { buffer, .. } => Err((buffer, Error::SocketClosed)),
                Request::Close { .. } => Err((Buffer::with_capacity(0), Error::SocketClosed)),
            },
        }
    }

    /// Writes the whole of `buffer[cursor..limit]`, suspending as needed.
    /// Only ever called by the writer task.
    pub(crate) async fn write_buffer(self: Arc<Self>, buffer: &mut Buffer) -> Result<()> {
        if !buffer.has_remaining() {
            return Ok(());
        }
        let threshold = self.send_buffer_size.load(Ordering::Acquire);
        if buffer.limit() >= threshold {
            self.write_large(buffer).await
        } else {
            self.write_small(buffer).await
        }
    }

    /// Payloads at least one send-buffer large stay registered for WRITE
    /// until flushed, avoiding interest churn on every would-block.
    async fn write_large(self: Arc<Self>, buffer: &mut Buffer) -> Result<()> {
        let shared = Arc::new(Mutex::new(Some(mem::replace(
            buffer,
            Buffer::with_capacity(0),
        ))));

        let callback_state = shared.clone();
        let this = self.clone();
        let callback = Box::new(move || -> Result<bool> {
            let mut state = callback_state.lock().unwrap();
            let Some(buf) = state.as_mut() else {
                return Ok(false);
            };
            match sys::net::write(this.socket.as_raw_fd(), buf.readable_slice()) {
                Ok(count) => {
                    buf.advance(count);
                    Ok(buf.has_remaining())
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(true),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => Ok(true),
                Err(err) => Err(io_failure(err)),
            }
        });

        let outcome = self
            .registration
            .select_always(Interest::WRITE, callback)
            .await;
        if let Some(returned) = shared.lock().unwrap().take() {
            *buffer = returned;
        }
        outcome
    }

    async fn write_small(&self, buffer: &mut Buffer) -> Result<()> {
        loop {
            match sys::net::write(self.socket.as_raw_fd(), buffer.readable_slice()) {
                Ok(count) => {
                    buffer.advance(count);
                    if !buffer.has_remaining() {
                        return Ok(());
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.registration.select_once(Interest::WRITE).await?;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                // A fatal write ends the request immediately; no retrying.
                Err(err) => return Err(io_failure(err)),
            }
        }
    }

    async fn close(&self) {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!("fd {}: closing", self.socket.as_raw_fd());
        // Let writes issued just before the close reach the queue first.
        executor::yield_now().await;

        let (done, drained) = oneshot::channel();
        let sentinel = self.requests.unbounded_send(Request::Close { done });
        self.requests.close_channel();
        if sentinel.is_ok() {
            // The writer acknowledges once everything ahead of the sentinel
            // is on the wire.
            let _ = drained.await;
        }

        self.state.store(CLOSED, Ordering::Release);
        self.registration.close(Error::NormalClose);
        let _ = self.socket.shutdown(Shutdown::Both);
        self.report(Error::NormalClose);
    }

    pub(crate) fn force_close(&self) {
        if self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state != CLOSED).then_some(CLOSED)
            })
            .is_err()
        {
            return;
        }
        debug!("fd {}: force-closing", self.socket.as_raw_fd());
        self.requests.close_channel();
        self.registration.close(Error::ForceClose);
        let _ = self.socket.shutdown(Shutdown::Both);
        self.report(Error::ForceClose);
    }

    /// Terminal failure: tears the connection down (idempotently) and keeps
    /// the first close-class reason for the exception handler. Close reasons
    /// that were merely propagated into this operation pass through
    /// unchanged.
    pub(crate) fn fail(&self, err: Error) -> Error {
        match err {
            Error::NormalClose | Error::ForceClose => err,
            err => {
                self.state.store(CLOSED, Ordering::Release);
                self.requests.close_channel();
                self.registration.close(err.clone());
                let _ = self.socket.shutdown(Shutdown::Both);
                self.report(err.clone());
                err
            }
        }
    }

    fn report(&self, err: Error) {
        if self.close_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("fd {}: terminal: {}", self.socket.as_raw_fd(), err);
        let handler = self.exception_handler.lock().unwrap().take();
        if let Some(handler) = handler {
            handler(err);
        }
    }
}

/// Releases the single-reader slot on every exit path.
struct ReadGuard<'a> {
    inner: &'a Inner,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.inner.reading.store(false, Ordering::Release);
    }
}
