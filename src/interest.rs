use std::num::NonZeroU8;
use std::{fmt, ops};

/// Interests used in registering a socket with a reactor.
///
/// An interest names the class of readiness a suspended operation is waiting
/// for. `READ` and `WRITE` are valid on connected sockets, `ACCEPT` only on
/// listening sockets and `CONNECT` only on sockets with a connect in
/// progress.
///
/// The size of `Option<Interest>` is identical to `Interest` itself, which
/// lets an empty interest mask be represented without a sentinel bit.
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
#[repr(transparent)]
pub(crate) struct Interest(NonZeroU8);

// These must be unique.
const READ: u8 = 0b0001;
const WRITE: u8 = 0b0010;
const ACCEPT: u8 = 0b0100;
const CONNECT: u8 = 0b1000;

impl Interest {
    /// Readable readiness on a connected socket.
    pub(crate) const READ: Interest = Interest(unsafe { NonZeroU8::new_unchecked(READ) });

    /// Writable readiness on a connected socket.
    pub(crate) const WRITE: Interest = Interest(unsafe { NonZeroU8::new_unchecked(WRITE) });

    /// A pending inbound connection on a listening socket.
    pub(crate) const ACCEPT: Interest = Interest(unsafe { NonZeroU8::new_unchecked(ACCEPT) });

    /// Completion of a non-blocking connect.
    pub(crate) const CONNECT: Interest = Interest(unsafe { NonZeroU8::new_unchecked(CONNECT) });

    /// Every single interest, in slot order.
    pub(crate) const EACH: [Interest; 4] = [
        Interest::READ,
        Interest::WRITE,
        Interest::ACCEPT,
        Interest::CONNECT,
    ];

    /// Add together two `Interest`s.
    ///
    /// This does the same thing as the `BitOr` implementation, but is a
    /// constant function.
    #[allow(clippy::should_implement_trait)]
    pub(crate) const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    pub(crate) const fn is_read(self) -> bool {
        (self.0.get() & READ) != 0
    }

    pub(crate) const fn is_write(self) -> bool {
        (self.0.get() & WRITE) != 0
    }

    pub(crate) const fn is_accept(self) -> bool {
        (self.0.get() & ACCEPT) != 0
    }

    pub(crate) const fn is_connect(self) -> bool {
        (self.0.get() & CONNECT) != 0
    }

    /// Slot index of a single interest.
    pub(crate) const fn index(self) -> usize {
        self.0.get().trailing_zeros() as usize
    }
}

impl ops::BitOr for Interest {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        self.add(other)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        if self.is_read() {
            write!(fmt, "READ")?;
            one = true
        }
        if self.is_write() {
            if one {
                write!(fmt, " | ")?
            }
            write!(fmt, "WRITE")?;
            one = true
        }
        if self.is_accept() {
            if one {
                write!(fmt, " | ")?
            }
            write!(fmt, "ACCEPT")?;
            one = true
        }
        if self.is_connect() {
            if one {
                write!(fmt, " | ")?
            }
            write!(fmt, "CONNECT")?;
            one = true
        }
        debug_assert!(one, "printing empty interests");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Interest;

    #[test]
    fn slot_indices_are_distinct() {
        let indices: Vec<usize> = Interest::EACH.iter().map(|i| i.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn combined_interests() {
        let both = Interest::READ | Interest::WRITE;
        assert!(both.is_read());
        assert!(both.is_write());
        assert!(!both.is_accept());
        assert_eq!(format!("{:?}", both), "READ | WRITE");
    }
}
