//! The single-threaded event loop.

use crate::error::{CoreError, CoreResult};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::LocalSet;

/// A single-threaded reactor.
///
/// All job, session and task activity runs on one `EventLoop`. Work is
/// queued with [`post`](EventLoop::post) and executed in FIFO order the
/// next time the loop is pumped by [`block_on`](EventLoop::block_on).
///
/// Cloning an `EventLoop` yields another handle to the same loop.
///
/// # Re-entrancy
///
/// `block_on` must not be called from code that is itself running on the
/// loop (a posted closure or a task continuation): the nested call panics.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

struct Inner {
    runtime: Runtime,
    local: LocalSet,
}

impl EventLoop {
    /// Creates a new event loop.
    pub fn new() -> CoreResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| CoreError::unknown(format!("cannot create event loop: {e}")))?;

        Ok(Self {
            inner: Rc::new(Inner {
                runtime,
                local: LocalSet::new(),
            }),
        })
    }

    /// Queues `f` to run on a later tick of the loop.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.spawn(async move { f() });
    }

    /// Queues `f` to run once `delay` has elapsed.
    pub fn post_delayed<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
    }

    /// Runs a local future on the loop.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        drop(self.inner.local.spawn_local(future));
    }

    /// Pumps the loop until `future` completes and returns its output.
    ///
    /// # Panics
    ///
    /// Panics when called from inside the loop.
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        self.inner.local.block_on(&self.inner.runtime, future)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn posted_work_runs_in_fifo_order() {
        let event_loop = EventLoop::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        for i in 0..5 {
            let log = Rc::clone(&log);
            event_loop.post(move || log.borrow_mut().push(i));
        }
        assert!(log.borrow().is_empty());

        event_loop.block_on(async {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        });
        assert_eq!(*log.borrow(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn delayed_work_runs_after_delay() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(RefCell::new(false));

        let flag = Rc::clone(&fired);
        event_loop.post_delayed(Duration::from_millis(5), move || *flag.borrow_mut() = true);

        event_loop.block_on(async { tokio::time::sleep(Duration::from_millis(30)).await });
        assert!(*fired.borrow());
    }

    #[test]
    fn block_on_returns_future_output() {
        let event_loop = EventLoop::new().unwrap();
        assert_eq!(event_loop.block_on(async { 40 + 2 }), 42);
    }
}
