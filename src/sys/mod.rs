//! Platform-specific readiness plumbing.
//!
//! Only the epoll back-end is currently implemented; the rest of the crate
//! talks to it exclusively through `Selector`, `Events` and `Waker`.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{event, net, Event, Events, Selector, Waker};
