use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{Error, Result};
use crate::reactor::Reactor;

/// A fixed set of reactors with size-based load balancing.
///
/// Connections and listeners land on the least-loaded reactor of their pool,
/// where load is the number of registered sockets. A pool never rebalances
/// existing registrations; a registration stays on its reactor for its whole
/// life.
pub struct ReactorPool {
    reactors: Vec<Arc<Reactor>>,
    broker: Mutex<()>,
}

impl ReactorPool {
    /// Starts `size` reactors (at least one).
    pub fn new(size: usize) -> io::Result<ReactorPool> {
        let size = size.max(1);
        let mut reactors = Vec::with_capacity(size);
        for _ in 0..size {
            reactors.push(Arc::new(Reactor::new()?));
        }
        Ok(ReactorPool {
            reactors,
            broker: Mutex::new(()),
        })
    }

    /// Picks the reactor with the fewest registered sockets.
    ///
    /// Lookups are serialized through a broker lock so concurrent callers do
    /// not race each other to the same momentarily-idle reactor.
    pub fn get_least_loaded(&self) -> Arc<Reactor> {
        let _serialized = self.broker.lock().unwrap();
        let mut choice = &self.reactors[0];
        for reactor in &self.reactors[1..] {
            if reactor.load() < choice.load() {
                choice = reactor;
            }
        }
        choice.clone()
    }

    pub fn size(&self) -> usize {
        self.reactors.len()
    }

    /// Sum of the loads of all reactors in the pool.
    pub fn total_load(&self) -> usize {
        self.reactors.iter().map(|reactor| reactor.load()).sum()
    }

    /// Closes every reactor, cancelling all outstanding selections.
    pub fn close(&self) {
        for reactor in &self.reactors {
            reactor.close();
        }
    }
}

impl fmt::Debug for ReactorPool {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ReactorPool")
            .field("size", &self.size())
            .field("load", &self.total_load())
            .finish()
    }
}

static DEFAULT_POOL: Mutex<Option<Arc<ReactorPool>>> = Mutex::new(None);

/// The process-wide pool, lazily created with a single reactor on first use.
pub fn default_pool() -> io::Result<Arc<ReactorPool>> {
    let mut slot = DEFAULT_POOL.lock().unwrap();
    match &*slot {
        Some(pool) => Ok(pool.clone()),
        None => {
            let pool = Arc::new(ReactorPool::new(1)?);
            debug!("created default reactor pool");
            *slot = Some(pool.clone());
            Ok(pool)
        }
    }
}

/// Replaces the default pool.
///
/// Fails with [`Error::AlreadyRegistered`] while any socket is still
/// registered on the current default; singletons may only be swapped while
/// idle.
pub fn set_default_pool(pool: Arc<ReactorPool>) -> Result<()> {
    let mut slot = DEFAULT_POOL.lock().unwrap();
    if let Some(current) = &*slot {
        if current.total_load() > 0 {
            return Err(Error::AlreadyRegistered);
        }
    }
    *slot = Some(pool);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use crate::error::Error;

    use super::ReactorPool;

    #[test]
    fn least_loaded_reactor_wins() {
        let pool = ReactorPool::new(2).unwrap();

        let (a, _a_peer) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let first = pool.get_least_loaded();
        let registration = first.register(a.as_raw_fd()).unwrap();

        // The empty reactor must now be preferred over the loaded one.
        let second = pool.get_least_loaded();
        assert_eq!(second.load(), 0);

        registration.close(Error::NormalClose);
        pool.close();
    }
}
