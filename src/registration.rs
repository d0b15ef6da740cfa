use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use log::{trace, warn};

use crate::error::{Error, Result};
use crate::interest::Interest;
use crate::reactor;
use crate::sys::Selector;
use crate::token::Token;

/// A long-lived selection callback.
///
/// Invoked by the reactor (on the compute pool) every time its interest
/// fires. `Ok(true)` keeps the registration, `Ok(false)` unregisters and
/// resumes the suspended caller with success, `Err` unregisters and resumes
/// with the error. The callback must not block or suspend; the reactor joins
/// all callbacks of a cycle before its next wait.
pub(crate) type AlwaysCallback = Box<dyn FnMut() -> Result<bool> + Send>;

enum Slot {
    /// A suspended caller waiting for a single firing.
    OneShot(oneshot::Sender<Result<()>>),
    /// A callback invoked on every firing. `callback` is `None` while checked
    /// out to the compute pool.
    Always {
        callback: Option<AlwaysCallback>,
        done: oneshot::Sender<Result<()>>,
    },
}

impl Slot {
    fn into_sender(self) -> oneshot::Sender<Result<()>> {
        match self {
            Slot::OneShot(tx) => tx,
            Slot::Always { done, .. } => done,
        }
    }
}

struct Slots {
    entries: [Option<Slot>; 4],
    closed: Option<Error>,
}

impl Slots {
    /// Interest mask derived from slot occupancy; this is the only source of
    /// truth handed to the selector.
    fn mask(&self) -> Option<Interest> {
        let mut mask: Option<Interest> = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.is_some() {
                let interest = Interest::EACH[index];
                mask = Some(match mask {
                    Some(mask) => mask | interest,
                    None => interest,
                });
            }
        }
        mask
    }
}

/// Per-socket registration state, owned by exactly one reactor.
///
/// Holds at most one pending completion or always-callback per interest and
/// mediates suspension, cancellation and unregistration for the socket
/// front-ends. A fired slot is cleared, and the selector mask narrowed,
/// *before* the suspended caller is resumed, so the caller may re-register
/// from the resume path.
pub(crate) struct Registration {
    fd: RawFd,
    token: Token,
    reactor: Arc<reactor::Shared>,
    slots: Mutex<Slots>,
}

impl Registration {
    pub(crate) fn new(fd: RawFd, token: Token, reactor: Arc<reactor::Shared>) -> Registration {
        Registration {
            fd,
            token,
            reactor,
            slots: Mutex::new(Slots {
                entries: [None, None, None, None],
                closed: None,
            }),
        }
    }

    /// Suspends until `interest` fires once.
    pub(crate) async fn select_once(&self, interest: Interest) -> Result<()> {
        let rx = self.install(interest, None)?;
        self.suspend(interest, rx).await
    }

    /// Suspends until `callback` asks to unregister or fails.
    pub(crate) async fn select_always(
        &self,
        interest: Interest,
        callback: AlwaysCallback,
    ) -> Result<()> {
        let rx = self.install(interest, Some(callback))?;
        self.suspend(interest, rx).await
    }

    fn install(
        &self,
        interest: Interest,
        callback: Option<AlwaysCallback>,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(reason) = &slots.closed {
            return Err(reason.clone());
        }
        let index = interest.index();
        if slots.entries[index].is_some() {
            return Err(Error::AlreadyRegistered);
        }

        let (tx, rx) = oneshot::channel();
        slots.entries[index] = Some(match callback {
            None => Slot::OneShot(tx),
            Some(callback) => Slot::Always {
                callback: Some(callback),
                done: tx,
            },
        });

        trace!("fd {}: registering {:?}", self.fd, interest);
        // The mask is pushed while the table lock is held, keeping the
        // selector's view causal with the slot state.
        if let Err(err) = self
            .reactor
            .update_interest(self.fd, self.token, slots.mask())
        {
            slots.entries[index] = None;
            return Err(err);
        }
        Ok(rx)
    }

    async fn suspend(
        &self,
        interest: Interest,
        rx: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        let mut guard = SelectGuard {
            registration: self,
            interest,
            armed: true,
        };
        let outcome = rx.await;
        guard.armed = false;
        match outcome {
            Ok(outcome) => outcome,
            // The sender vanished without resuming us: the reactor is gone.
            Err(oneshot::Canceled) => Err(Error::ReactorClosed),
        }
    }

    /// One-shot dispatch: clears the slot and narrows the mask, returning the
    /// completion for the reactor to resume. Runs on the reactor thread, so
    /// the selector is driven directly.
    pub(crate) fn take_oneshot(
        &self,
        interest: Interest,
        selector: &Selector,
    ) -> Option<oneshot::Sender<Result<()>>> {
        let mut slots = self.slots.lock().unwrap();
        let index = interest.index();
        match slots.entries[index].take() {
            Some(Slot::OneShot(tx)) => {
                if let Err(err) = selector.reregister(self.fd, self.token, slots.mask()) {
                    warn!("fd {}: failed to narrow interests: {}", self.fd, err);
                }
                Some(tx)
            }
            other => {
                slots.entries[index] = other;
                None
            }
        }
    }

    /// Borrows the always-callback of `interest` for one invocation.
    pub(crate) fn checkout_callback(&self, interest: Interest) -> Option<AlwaysCallback> {
        let mut slots = self.slots.lock().unwrap();
        match slots.entries[interest.index()].as_mut() {
            Some(Slot::Always { callback, .. }) => callback.take(),
            _ => None,
        }
    }

    /// Returns a checked-out callback together with its verdict. Runs on the
    /// compute pool, so mask updates go through the reactor's mutation
    /// protocol.
    pub(crate) fn finish_always(
        &self,
        interest: Interest,
        callback: AlwaysCallback,
        verdict: Result<bool>,
    ) {
        let index = interest.index();
        let resume = {
            let mut slots = self.slots.lock().unwrap();
            match verdict {
                Ok(true) => {
                    // Keep selecting. The slot may have been cancelled or
                    // closed while the callback ran; then the callback simply
                    // retires.
                    if let Some(Slot::Always { callback: parked, .. }) =
                        slots.entries[index].as_mut()
                    {
                        *parked = Some(callback);
                    }
                    None
                }
                verdict => {
                    drop(callback);
                    match slots.entries[index].take() {
                        Some(Slot::Always { done, .. }) => {
                            let mask = slots.mask();
                            if let Err(err) =
                                self.reactor.update_interest(self.fd, self.token, mask)
                            {
                                warn!("fd {}: failed to narrow interests: {}", self.fd, err);
                            }
                            Some((done, verdict.map(|_| ())))
                        }
                        other => {
                            slots.entries[index] = other;
                            None
                        }
                    }
                }
            }
        };
        if let Some((done, outcome)) = resume {
            let _ = done.send(outcome);
        }
    }

    /// Cancels every pending selection with `reason`, detaches the fd from
    /// the selector and refuses all further registrations.
    pub(crate) fn close(&self, reason: Error) {
        let Some(cancelled) = self.drain_slots(&reason) else {
            return;
        };
        trace!("fd {}: closing registration: {}", self.fd, reason);
        self.reactor.deregister(self.fd, self.token);
        for tx in cancelled {
            let _ = tx.send(Err(reason.clone()));
        }
    }

    /// Like [`close`](Registration::close) but without touching the selector;
    /// used when the owning reactor is shutting down and the selector itself
    /// is going away.
    pub(crate) fn cancel_for_shutdown(&self, reason: Error) {
        let Some(cancelled) = self.drain_slots(&reason) else {
            return;
        };
        for tx in cancelled {
            let _ = tx.send(Err(reason.clone()));
        }
    }

    fn drain_slots(&self, reason: &Error) -> Option<Vec<oneshot::Sender<Result<()>>>> {
        let mut slots = self.slots.lock().unwrap();
        if slots.closed.is_some() {
            return None;
        }
        slots.closed = Some(reason.clone());
        Some(
            slots
                .entries
                .iter_mut()
                .filter_map(|entry| entry.take())
                .map(Slot::into_sender)
                .collect(),
        )
    }
}

/// Withdraws a selection whose caller was cancelled mid-suspension.
struct SelectGuard<'a> {
    registration: &'a Registration,
    interest: Interest,
    armed: bool,
}

impl Drop for SelectGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registration = self.registration;
        let mut slots = registration.slots.lock().unwrap();
        if slots.closed.is_some() {
            return;
        }
        if slots.entries[self.interest.index()].take().is_some() {
            trace!(
                "fd {}: selection of {:?} cancelled",
                registration.fd,
                self.interest
            );
            if let Err(err) = registration.reactor.update_interest(
                registration.fd,
                registration.token,
                slots.mask(),
            ) {
                warn!(
                    "fd {}: failed to narrow interests after cancellation: {}",
                    registration.fd, err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::task::Poll;

    use futures::executor::block_on;
    use futures::{pin_mut, poll};

    use crate::error::Error;
    use crate::interest::Interest;
    use crate::reactor::Reactor;

    #[test]
    fn oneshot_selection_clears_its_slot() {
        let reactor = Reactor::new().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let registration = reactor.register(local.as_raw_fd()).unwrap();

        // The socket is writable immediately; the second selection only
        // succeeds if the first one left its slot empty on resume.
        block_on(async {
            registration.select_once(Interest::WRITE).await.unwrap();
            registration.select_once(Interest::WRITE).await.unwrap();
        });

        registration.close(Error::NormalClose);
        reactor.close();
    }

    #[test]
    fn double_registration_is_refused() {
        let reactor = Reactor::new().unwrap();
        let (local, mut peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let registration = reactor.register(local.as_raw_fd()).unwrap();

        block_on(async {
            let first = registration.select_once(Interest::READ);
            pin_mut!(first);
            assert!(poll!(first.as_mut()).is_pending());

            let second = registration.select_once(Interest::READ);
            pin_mut!(second);
            match poll!(second) {
                Poll::Ready(Err(Error::AlreadyRegistered)) => {}
                other => panic!("expected AlreadyRegistered, got {:?}", other),
            }

            peer.write_all(&[1]).unwrap();
            first.await.unwrap();
        });

        registration.close(Error::NormalClose);
        reactor.close();
    }

    #[test]
    fn close_cancels_pending_selections() {
        let reactor = Reactor::new().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let registration = reactor.register(local.as_raw_fd()).unwrap();

        block_on(async {
            let pending = registration.select_once(Interest::READ);
            pin_mut!(pending);
            assert!(poll!(pending.as_mut()).is_pending());

            registration.close(Error::ForceClose);
            match pending.await {
                Err(Error::ForceClose) => {}
                other => panic!("expected ForceClose, got {:?}", other),
            }
        });

        reactor.close();
    }

    #[test]
    fn registration_after_close_is_refused() {
        let reactor = Reactor::new().unwrap();
        let (local, _peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let registration = reactor.register(local.as_raw_fd()).unwrap();

        registration.close(Error::NormalClose);
        block_on(async {
            match registration.select_once(Interest::WRITE).await {
                Err(Error::NormalClose) => {}
                other => panic!("expected NormalClose, got {:?}", other),
            }
        });

        reactor.close();
    }
}
