//! The process-wide compute pool.
//!
//! Always-select callbacks and per-connection writer tasks run here, off the
//! reactor threads, so a slow callback cannot stall a selection loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::thread;

use futures::executor::ThreadPool;

static POOL: OnceLock<ThreadPool> = OnceLock::new();

fn compute_pool() -> &'static ThreadPool {
    POOL.get_or_init(|| {
        let size = thread::available_parallelism()
            .map(|n| n.get().min(4))
            .unwrap_or(2);
        ThreadPool::builder()
            .pool_size(size)
            .name_prefix("asock-compute-")
            .create()
            .expect("failed to start the compute pool")
    })
}

/// Spawns a detached task on the compute pool.
pub(crate) fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    compute_pool().spawn_ok(future);
}

/// Suspends exactly once, letting already-scheduled tasks run first.
pub(crate) fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub(crate) struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
