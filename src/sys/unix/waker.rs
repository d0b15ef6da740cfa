use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use crate::interest::Interest;
use crate::sys::Selector;
use crate::token::Token;

/// Wakes the selection loop through an `eventfd`.
///
/// The eventfd sits in the selector under the reserved wakeup token; writing
/// to it makes it readable and pops the loop out of its wait. The kernel
/// object is a 64-bit counter and the selector is level-triggered, so the
/// loop [`ack`]s every wakeup event it sees to empty the counter again.
///
/// [`ack`]: Waker::ack
#[derive(Debug)]
pub(crate) struct Waker {
    fd: File,
}

impl Waker {
    pub(crate) fn new(selector: &Selector, token: Token) -> io::Result<Waker> {
        let raw = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        let fd = unsafe { File::from_raw_fd(raw) };
        selector.register(fd.as_raw_fd(), token, Some(Interest::READ))?;
        Ok(Waker { fd })
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        loop {
            match (&self.fd).write_all(&1u64.to_ne_bytes()) {
                Ok(()) => return Ok(()),
                // The counter only refuses a write when it is about to
                // overflow; empty it and try once more.
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => self.ack(),
                Err(err) => return Err(err),
            }
        }
    }

    /// Empties the counter after a wakeup event fired.
    pub(crate) fn ack(&self) {
        // An already-empty counter reports `WouldBlock`; either way there is
        // nothing left in it afterwards.
        let mut counter = [0u8; 8];
        let _ = (&self.fd).read(&mut counter);
    }
}
