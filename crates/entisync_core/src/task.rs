//! Single-threaded, single-assignment tasks.

use crate::error::{CoreError, CoreResult};
use crate::event_loop::EventLoop;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

type Continuation<T> = Box<dyn FnOnce(CoreResult<T>)>;
type Observer = Box<dyn FnOnce(&CoreResult<()>)>;

enum Slot<T> {
    Pending,
    Ready(CoreResult<T>),
    Taken,
}

struct Shared<T> {
    slot: Slot<T>,
    /// Value-less copy of the outcome, kept for late observers.
    outcome: Option<CoreResult<()>>,
    continuation: Option<Continuation<T>>,
    has_consumer: bool,
    observers: Vec<Observer>,
    waker: Option<Waker>,
}

/// The eventual result of an asynchronous step.
///
/// A `Task` is a cell that is pending until a producer calls
/// [`set_result`](Task::set_result) or [`set_error`](Task::set_error),
/// which may happen exactly once. Clones share the same cell, so the
/// producer keeps one handle and hands another to the consumer.
///
/// The value has a single consumer: one continuation (`then`, `then_else`,
/// `then_result`, `and_then`, `map`, `or_else`) or one `.await`/`wait`.
/// Any number of value-less observers may be attached with
/// [`on_settled`](Task::on_settled).
///
/// A continuation registered on a settled task runs before the registering
/// call returns. One registered on a pending task runs exactly once, when
/// the task settles.
pub struct Task<T> {
    shared: Rc<RefCell<Shared<T>>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: 'static> Default for Task<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Task<T> {
    /// Creates a pending task.
    pub fn new() -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                slot: Slot::Pending,
                outcome: None,
                continuation: None,
                has_consumer: false,
                observers: Vec::new(),
                waker: None,
            })),
        }
    }

    /// Creates a task that already holds `value`.
    pub fn ready(value: T) -> Self {
        let task = Self::new();
        task.set_result(value);
        task
    }

    /// Creates a task that already failed with `error`.
    pub fn failed(error: CoreError) -> Self {
        let task = Self::new();
        task.set_error(error);
        task
    }

    /// Resolves the task with a value.
    ///
    /// # Panics
    ///
    /// Panics if the task was already settled.
    pub fn set_result(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Resolves the task with an error.
    ///
    /// # Panics
    ///
    /// Panics if the task was already settled.
    pub fn set_error(&self, error: CoreError) {
        self.settle(Err(error));
    }

    /// Resolves the task with `result`.
    ///
    /// # Panics
    ///
    /// Panics if the task was already settled.
    pub fn settle(&self, result: CoreResult<T>) {
        let (observers, waker, outcome) = {
            let mut shared = self.shared.borrow_mut();
            assert!(
                shared.outcome.is_none(),
                "Task::settle called on an already settled task"
            );
            let outcome = match &result {
                Ok(_) => Ok(()),
                Err(e) => Err(e.clone()),
            };
            shared.outcome = Some(outcome.clone());
            shared.slot = Slot::Ready(result);
            (
                std::mem::take(&mut shared.observers),
                shared.waker.take(),
                outcome,
            )
        };

        for observer in observers {
            observer(&outcome);
        }
        if let Some(waker) = waker {
            waker.wake();
        }
        self.fire();
    }

    /// Returns true while no result has been set.
    pub fn is_pending(&self) -> bool {
        self.shared.borrow().outcome.is_none()
    }

    /// Returns the error the task settled with, if any.
    pub fn error(&self) -> Option<CoreError> {
        match &self.shared.borrow().outcome {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Registers a value-less observer.
    ///
    /// Runs immediately when the task is already settled.
    pub fn on_settled<F>(&self, observer: F)
    where
        F: FnOnce(&CoreResult<()>) + 'static,
    {
        let outcome = {
            let mut shared = self.shared.borrow_mut();
            match &shared.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    shared.observers.push(Box::new(observer));
                    return;
                }
            }
        };
        observer(&outcome);
    }

    /// Terminal continuation receiving the whole result.
    pub fn then_result<F>(self, f: F)
    where
        F: FnOnce(CoreResult<T>) + 'static,
    {
        self.register(Box::new(f));
    }

    /// Terminal continuation for the success case.
    ///
    /// An error is logged and dropped.
    pub fn then<F>(self, on_success: F)
    where
        F: FnOnce(T) + 'static,
    {
        self.then_result(move |result| match result {
            Ok(value) => on_success(value),
            Err(e) => tracing::debug!(error = %e, "unobserved task error"),
        });
    }

    /// Terminal continuation with an error handler that consumes the error.
    pub fn then_else<F, E>(self, on_success: F, on_error: E)
    where
        F: FnOnce(T) + 'static,
        E: FnOnce(CoreError) + 'static,
    {
        self.then_result(move |result| match result {
            Ok(value) => on_success(value),
            Err(e) => on_error(e),
        });
    }

    /// Chains a step that itself returns a task.
    ///
    /// The returned task resolves with the inner task's outcome. If this
    /// task fails, `f` is never called and the error is forwarded.
    pub fn and_then<U, F>(self, f: F) -> Task<U>
    where
        U: 'static,
        F: FnOnce(T) -> Task<U> + 'static,
    {
        let chained = Task::new();
        let out = chained.clone();
        self.then_result(move |result| match result {
            Ok(value) => f(value).then_result(move |inner| out.settle(inner)),
            Err(e) => out.set_error(e),
        });
        chained
    }

    /// Maps the value, forwarding errors untouched.
    pub fn map<U, F>(self, f: F) -> Task<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let mapped = Task::new();
        let out = mapped.clone();
        self.then_result(move |result| out.settle(result.map(f)));
        mapped
    }

    /// Recovers from an error with a step returning a task.
    ///
    /// Values pass through untouched.
    pub fn or_else<F>(self, f: F) -> Task<T>
    where
        F: FnOnce(CoreError) -> Task<T> + 'static,
    {
        let recovered = Task::new();
        let out = recovered.clone();
        self.then_result(move |result| match result {
            Ok(value) => out.set_result(value),
            Err(e) => f(e).then_result(move |inner| out.settle(inner)),
        });
        recovered
    }

    /// Blocks until the task settles by pumping `event_loop`.
    ///
    /// # Panics
    ///
    /// Panics when called from code already running on `event_loop`, for
    /// example from inside another task's continuation.
    pub fn wait(self, event_loop: &EventLoop) -> CoreResult<T> {
        event_loop.block_on(self)
    }

    fn register(&self, continuation: Continuation<T>) {
        {
            let mut shared = self.shared.borrow_mut();
            assert!(
                !shared.has_consumer,
                "a continuation is already registered on this task"
            );
            assert!(
                !matches!(shared.slot, Slot::Taken),
                "task result already consumed"
            );
            shared.has_consumer = true;
            shared.continuation = Some(continuation);
        }
        self.fire();
    }

    /// Hands a ready result to the stored continuation, if both exist.
    fn fire(&self) {
        let (continuation, result) = {
            let mut shared = self.shared.borrow_mut();
            if shared.continuation.is_none() || !matches!(shared.slot, Slot::Ready(_)) {
                return;
            }
            let result = match std::mem::replace(&mut shared.slot, Slot::Taken) {
                Slot::Ready(result) => result,
                _ => return,
            };
            match shared.continuation.take() {
                Some(continuation) => (continuation, result),
                None => return,
            }
        };
        continuation(result);
    }
}

impl<T: 'static> Future for Task<T> {
    type Output = CoreResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();
        match std::mem::replace(&mut shared.slot, Slot::Taken) {
            Slot::Ready(result) => Poll::Ready(result),
            Slot::Pending => {
                assert!(
                    !shared.has_consumer,
                    "awaiting a task that already has a continuation"
                );
                shared.slot = Slot::Pending;
                shared.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Slot::Taken => panic!("task result already consumed"),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.borrow();
        let state = match &shared.outcome {
            None => "pending",
            Some(Ok(())) => "ok",
            Some(Err(_)) => "error",
        };
        f.debug_struct("Task").field("state", &state).finish()
    }
}
