use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::interest::Interest;
use crate::token::Token;

/// Thin wrapper around an epoll instance.
///
/// The selector is level-triggered: interests are added and removed around
/// every suspension by the registration map, so a fired interest either gets
/// serviced or unregistered before the next wait.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let raw = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // `syscall!` already screened the failure case, so the fd is valid.
        Ok(Selector {
            ep: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    /// Waits for readiness, filling `events` up to its capacity. `None`
    /// blocks indefinitely; `Duration::ZERO` polls.
    pub(crate) fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        // epoll counts in whole milliseconds; fractions are rounded up so a
        // short wait does not degenerate into a busy poll. An explicit zero
        // stays zero (the pause protocol depends on it).
        let millis: libc::c_int = match timeout {
            None => -1,
            Some(timeout) => {
                let mut millis = timeout.as_millis();
                if timeout.subsec_nanos() % 1_000_000 != 0 {
                    millis += 1;
                }
                millis.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        events.clear();
        let fired = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.capacity() as libc::c_int,
            millis,
        ))?;
        // The kernel wrote exactly `fired` entries.
        unsafe { events.set_len(fired as usize) };
        Ok(())
    }

    pub(crate) fn register(
        &self,
        fd: RawFd,
        token: Token,
        interests: Option<Interest>,
    ) -> io::Result<()> {
        let mut event = epoll_event(token, interests);
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event,
        ))
        .map(drop)
    }

    pub(crate) fn reregister(
        &self,
        fd: RawFd,
        token: Token,
        interests: Option<Interest>,
    ) -> io::Result<()> {
        let mut event = epoll_event(token, interests);
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event,
        ))
        .map(drop)
    }

    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut(),
        ))
        .map(drop)
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn epoll_event(token: Token, interests: Option<Interest>) -> libc::epoll_event {
    libc::epoll_event {
        events: interests_to_epoll(interests),
        u64: usize::from(token) as u64,
    }
}

/// READ and ACCEPT wait on the inbound side, WRITE and CONNECT on the
/// outbound side. An empty mask leaves only failure readiness armed.
fn interests_to_epoll(interests: Option<Interest>) -> u32 {
    let mut bits = 0;
    if let Some(interests) = interests {
        if interests.is_read() || interests.is_accept() {
            bits |= libc::EPOLLIN | libc::EPOLLRDHUP;
        }
        if interests.is_write() || interests.is_connect() {
            bits |= libc::EPOLLOUT;
        }
    }
    bits as u32
}

pub(crate) type Event = libc::epoll_event;
pub(crate) type Events = Vec<Event>;

/// Decodes fired events into the three readiness classes the dispatcher
/// works in, mirroring the interest split of [`interests_to_epoll`].
pub(crate) mod event {
    use crate::sys::Event;
    use crate::token::Token;

    fn bits(event: &Event) -> libc::c_int {
        event.events as libc::c_int
    }

    pub(crate) fn token(event: &Event) -> Token {
        Token(event.u64 as usize)
    }

    /// Failure-class readiness. The dispatcher fires every registered slot
    /// for these, so the suspended operation meets the error in its own
    /// syscall rather than in the reactor.
    pub(crate) fn is_failed(event: &Event) -> bool {
        bits(event) & (libc::EPOLLERR | libc::EPOLLHUP) != 0
    }

    /// Readiness satisfying the READ and ACCEPT interests. A half-closed
    /// peer (`EPOLLRDHUP`) counts: the reader has an end of stream to
    /// observe.
    pub(crate) fn is_inbound(event: &Event) -> bool {
        bits(event) & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) != 0
    }

    /// Readiness satisfying the WRITE and CONNECT interests.
    pub(crate) fn is_outbound(event: &Event) -> bool {
        bits(event) & libc::EPOLLOUT != 0
    }
}
