use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::executor;
use crate::interest::Interest;
use crate::registration::Registration;
use crate::sys::{self, Selector};
use crate::token::Token;

/// Token reserved for the reactor's own wakeup channel.
const WAKE_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 256;

/// A single-threaded selection loop owning one readiness selector.
///
/// Sockets register with a reactor and suspend on it through their
/// [`Registration`]; the loop dispatches fired events back into the
/// registrations. Interest-mask mutations may be requested from any thread:
/// they pause the loop's blocking wait through a two-phase counter protocol
/// so a mutation never sits behind an unbounded `epoll_wait`.
///
/// Reactors are usually managed by a [`ReactorPool`](crate::ReactorPool)
/// rather than created directly.
pub struct Reactor {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

pub(crate) struct Shared {
    selector: Selector,
    waker: sys::Waker,
    registrations: Mutex<HashMap<Token, Arc<Registration>>>,
    load: AtomicUsize,
    next_token: AtomicUsize,
    /// Two-phase mutation protocol: number of off-thread selector mutations
    /// currently in flight, and whether the loop should avoid blocking.
    mutations_in_flight: AtomicUsize,
    should_pause: AtomicBool,
    closed: AtomicBool,
}

impl Reactor {
    /// Creates the selector and starts the loop on a dedicated thread.
    pub fn new() -> io::Result<Reactor> {
        let selector = Selector::new()?;
        let waker = sys::Waker::new(&selector, WAKE_TOKEN)?;
        let shared = Arc::new(Shared {
            selector,
            waker,
            registrations: Mutex::new(HashMap::new()),
            load: AtomicUsize::new(0),
            next_token: AtomicUsize::new(0),
            mutations_in_flight: AtomicUsize::new(0),
            should_pause: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let loop_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("asock-reactor".to_owned())
            .spawn(move || run_loop(loop_shared))?;

        Ok(Reactor {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Number of sockets currently registered; the pool's load metric.
    pub fn load(&self) -> usize {
        self.shared.load.load(Ordering::Acquire)
    }

    /// Attaches `fd` to this reactor with an empty interest mask.
    pub(crate) fn register(&self, fd: RawFd) -> Result<Arc<Registration>> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::ReactorClosed);
        }
        let token = Token(shared.next_token.fetch_add(1, Ordering::Relaxed));
        let registration = Arc::new(Registration::new(fd, token, shared.clone()));
        shared
            .registrations
            .lock()
            .unwrap()
            .insert(token, registration.clone());
        shared.load.fetch_add(1, Ordering::AcqRel);

        if let Err(err) = shared.with_mutation(|| shared.selector.register(fd, token, None)) {
            shared.registrations.lock().unwrap().remove(&token);
            shared.load.fetch_sub(1, Ordering::AcqRel);
            return Err(err.into());
        }
        trace!("fd {}: registered as {:?}", fd, token);
        Ok(registration)
    }

    /// Stops the loop and cancels every outstanding selection with
    /// [`Error::ReactorClosed`].
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing reactor");
        if let Err(err) = self.shared.waker.wake() {
            warn!("failed to wake reactor for close: {}", err);
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        fail_all(&self.shared, Error::ReactorClosed);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Reactor").field("load", &self.load()).finish()
    }
}

impl Shared {
    /// Pushes a new interest mask for a registered fd.
    pub(crate) fn update_interest(
        &self,
        fd: RawFd,
        token: Token,
        interests: Option<Interest>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ReactorClosed);
        }
        self.with_mutation(|| self.selector.reregister(fd, token, interests))
            .map_err(Error::from)
    }

    /// Detaches a registration from the selector and the dispatch table.
    pub(crate) fn deregister(&self, fd: RawFd, token: Token) {
        if self
            .registrations
            .lock()
            .unwrap()
            .remove(&token)
            .is_none()
        {
            return;
        }
        self.load.fetch_sub(1, Ordering::AcqRel);
        if !self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.with_mutation(|| self.selector.deregister(fd)) {
                // The fd may already be gone; nothing to do about it here.
                trace!("fd {}: deregister: {}", fd, err);
            }
        }
    }

    /// Runs a selector mutation from off the loop thread.
    ///
    /// The first mutator in flips `should_pause` and wakes the loop out of
    /// its blocking wait; the last one out clears the flag. The loop keeps
    /// running with zero-timeout waits in between, so mutations never
    /// serialize behind it and the flag costs nothing when uncontended.
    fn with_mutation<T>(&self, mutation: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
        if self.mutations_in_flight.fetch_add(1, Ordering::AcqRel) == 0 {
            self.should_pause.store(true, Ordering::Release);
            if let Err(err) = self.waker.wake() {
                warn!("failed to wake reactor for mutation: {}", err);
            }
        }
        let result = mutation();
        if self.mutations_in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.should_pause.store(false, Ordering::Release);
        }
        result
    }
}

fn run_loop(shared: Arc<Shared>) {
    let mut events: sys::Events = Vec::with_capacity(EVENTS_CAPACITY);
    debug!("reactor loop started");

    loop {
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        // While off-thread mutations are in flight, poll without blocking so
        // the wait never holds up a registration.
        let timeout = if shared.should_pause.load(Ordering::Acquire) {
            Some(Duration::ZERO)
        } else {
            None
        };
        match shared.selector.select(&mut events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("selector failed, shutting the reactor down: {}", err);
                shared.closed.store(true, Ordering::Release);
                break;
            }
        }

        let latch = Latch::new();
        for event in events.iter() {
            let token = sys::event::token(event);
            if token == WAKE_TOKEN {
                shared.waker.ack();
                continue;
            }
            let registration = shared.registrations.lock().unwrap().get(&token).cloned();
            let Some(registration) = registration else {
                // Raced an unregister; the event is stale.
                continue;
            };

            // Failure readiness satisfies every registered slot.
            let failed = sys::event::is_failed(event);
            let readable = sys::event::is_inbound(event) || failed;
            let writable = sys::event::is_outbound(event) || failed;

            if readable {
                dispatch(&shared, &registration, Interest::READ, &latch);
                dispatch(&shared, &registration, Interest::ACCEPT, &latch);
            }
            if writable {
                dispatch(&shared, &registration, Interest::WRITE, &latch);
                dispatch(&shared, &registration, Interest::CONNECT, &latch);
            }
        }
        // Quiescence: every callback forked this cycle must have returned its
        // slot before the next wait, keeping slot state causal with it.
        latch.wait();

        if shared.should_pause.load(Ordering::Acquire) {
            thread::yield_now();
        }
    }

    debug!("reactor loop exited");
    fail_all(&shared, Error::ReactorClosed);
}

fn dispatch(
    shared: &Arc<Shared>,
    registration: &Arc<Registration>,
    interest: Interest,
    latch: &Latch,
) {
    if let Some(completion) = registration.take_oneshot(interest, &shared.selector) {
        // One-shot resumes are a cheap control transfer; run them inline.
        let _ = completion.send(Ok(()));
        return;
    }
    if let Some(mut callback) = registration.checkout_callback(interest) {
        let ticket = latch.ticket();
        let registration = registration.clone();
        executor::spawn(async move {
            let verdict = callback();
            registration.finish_always(interest, callback, verdict);
            drop(ticket);
        });
    }
}

fn fail_all(shared: &Shared, reason: Error) {
    let registrations: Vec<_> = {
        let mut map = shared.registrations.lock().unwrap();
        map.drain().map(|(_, registration)| registration).collect()
    };
    shared.load.store(0, Ordering::Release);
    for registration in registrations {
        registration.cancel_for_shutdown(reason.clone());
    }
}

/// Countdown latch joining the always-callbacks forked in one cycle.
struct Latch {
    inner: Arc<LatchInner>,
}

struct LatchInner {
    count: Mutex<usize>,
    zero: Condvar,
}

struct Ticket {
    inner: Arc<LatchInner>,
}

impl Latch {
    fn new() -> Latch {
        Latch {
            inner: Arc::new(LatchInner {
                count: Mutex::new(0),
                zero: Condvar::new(),
            }),
        }
    }

    fn ticket(&self) -> Ticket {
        *self.inner.count.lock().unwrap() += 1;
        Ticket {
            inner: self.inner.clone(),
        }
    }

    fn wait(&self) {
        let mut count = self.inner.count.lock().unwrap();
        while *count > 0 {
            count = self.inner.zero.wait(count).unwrap();
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut count = self.inner.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.inner.zero.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::executor::block_on;

    use crate::error::Error;
    use crate::interest::Interest;

    use super::Reactor;

    #[test]
    fn load_tracks_registrations() {
        let reactor = Reactor::new().unwrap();
        assert_eq!(reactor.load(), 0);

        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, _b_peer) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        let ra = reactor.register(a.as_raw_fd()).unwrap();
        let rb = reactor.register(b.as_raw_fd()).unwrap();
        assert_eq!(reactor.load(), 2);

        ra.close(Error::NormalClose);
        assert_eq!(reactor.load(), 1);
        rb.close(Error::NormalClose);
        assert_eq!(reactor.load(), 0);

        reactor.close();
    }

    #[test]
    fn always_selection_runs_until_told_to_stop() {
        let reactor = Reactor::new().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let registration = reactor.register(local.as_raw_fd()).unwrap();

        // Count three writable firings, then ask to unregister.
        let firings = Arc::new(AtomicUsize::new(0));
        let counter = firings.clone();
        block_on(async {
            registration
                .select_always(
                    Interest::WRITE,
                    Box::new(move || {
                        let fired = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        Ok(fired < 3)
                    }),
                )
                .await
        })
        .unwrap();

        assert_eq!(firings.load(Ordering::SeqCst), 3);
        registration.close(Error::NormalClose);
        reactor.close();
    }

    #[test]
    fn failing_callback_resumes_with_its_error() {
        let reactor = Reactor::new().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let registration = reactor.register(local.as_raw_fd()).unwrap();

        let outcome = block_on(async {
            registration
                .select_always(Interest::WRITE, Box::new(|| Err(Error::PeerClosed)))
                .await
        });
        match outcome {
            Err(Error::PeerClosed) => {}
            other => panic!("expected PeerClosed, got {:?}", other),
        }

        registration.close(Error::NormalClose);
        reactor.close();
    }

    #[test]
    fn reactor_close_cancels_outstanding_selections() {
        let reactor = Reactor::new().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let registration = reactor.register(local.as_raw_fd()).unwrap();

        let pending = registration.select_once(Interest::READ);
        futures::pin_mut!(pending);
        block_on(async {
            assert!(futures::poll!(pending.as_mut()).is_pending());
        });

        reactor.close();

        match block_on(pending) {
            Err(Error::ReactorClosed) => {}
            other => panic!("expected ReactorClosed, got {:?}", other),
        }
    }
}
