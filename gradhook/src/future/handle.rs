use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Notify;

use crate::error::{HookError, Result};
use crate::future::HookValue;

/// Observable lifecycle of an [`AsyncHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Work outstanding, no payload yet.
    Pending,
    /// Resolved with a value.
    Completed,
    /// Resolved with an error.
    Failed,
    /// The payload was moved out by [`AsyncHandle::take_value`].
    Consumed,
}

type Continuation<T> = Box<dyn FnOnce(Result<T>) + Send>;

enum Slot<T> {
    Pending(Vec<Continuation<T>>),
    Ready(Result<T>),
    Consumed,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    notify: Notify,
}

/// A pending result of asynchronous communication.
///
/// The payload slot is written exactly once. Clones share the slot, so the
/// handle can be waited on from several places; each waiter receives a clone
/// of the value or error. Continuations attached with [`then`](Self::then)
/// run on the thread that completes the handle, or immediately if it has
/// already resolved.
///
/// Dropping a handle never cancels the underlying work: once issued, a
/// collective runs to completion.
pub struct AsyncHandle<T = HookValue> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AsyncHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> AsyncHandle<T> {
    fn with_slot(slot: Slot<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(slot),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// An unresolved handle, to be resolved with [`complete`](Self::complete).
    pub fn pending() -> Self {
        Self::with_slot(Slot::Pending(Vec::new()))
    }

    /// A handle that has already resolved to `value`.
    pub fn completed(value: T) -> Self {
        Self::with_slot(Slot::Ready(Ok(value)))
    }

    /// A handle that has already resolved to `error`.
    pub fn failed(error: HookError) -> Self {
        Self::with_slot(Slot::Ready(Err(error)))
    }

    /// Run `fut` on the current tokio runtime and resolve the handle with its
    /// output.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime; use
    /// [`spawn_on`](Self::spawn_on) from foreign threads.
    pub fn spawn(fut: impl Future<Output = Result<T>> + Send + 'static) -> Self {
        Self::spawn_on(&tokio::runtime::Handle::current(), fut)
    }

    /// Run `fut` on `runtime` and resolve the handle with its output. A
    /// panicking task resolves the handle to an error instead of leaving it
    /// pending forever.
    pub fn spawn_on(
        runtime: &tokio::runtime::Handle,
        fut: impl Future<Output = Result<T>> + Send + 'static,
    ) -> Self {
        let handle = Self::pending();
        let completer = handle.clone();
        runtime.spawn(async move {
            let result = AssertUnwindSafe(fut)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(HookError::transport("communication task panicked")));
            let _ = completer.complete(result);
        });
        handle
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slot<T>>> {
        self.shared
            .slot
            .lock()
            .map_err(|_| HookError::LockPoisoned("async handle"))
    }

    /// Resolve the handle. Fails with `AlreadyCompleted` if it already
    /// resolved; the first result wins.
    pub fn complete(&self, result: Result<T>) -> Result<()> {
        let continuations = {
            let mut slot = self.lock()?;
            match std::mem::replace(&mut *slot, Slot::Ready(result.clone())) {
                Slot::Pending(continuations) => continuations,
                previous => {
                    *slot = previous;
                    tracing::warn!("async handle completed twice; keeping the first result");
                    return Err(HookError::AlreadyCompleted);
                }
            }
        };
        self.shared.ready.notify_all();
        self.shared.notify.notify_waiters();
        for continuation in continuations {
            continuation(result.clone());
        }
        Ok(())
    }

    /// Resolve the handle with a value.
    pub fn mark_completed(&self, value: T) -> Result<()> {
        self.complete(Ok(value))
    }

    /// Resolve the handle with an error.
    pub fn set_error(&self, error: HookError) -> Result<()> {
        self.complete(Err(error))
    }

    pub fn state(&self) -> HandleState {
        match self.lock() {
            Ok(slot) => match &*slot {
                Slot::Pending(_) => HandleState::Pending,
                Slot::Ready(Ok(_)) => HandleState::Completed,
                Slot::Ready(Err(_)) => HandleState::Failed,
                Slot::Consumed => HandleState::Consumed,
            },
            Err(_) => HandleState::Failed,
        }
    }

    /// Whether the handle has resolved (successfully or not).
    pub fn is_completed(&self) -> bool {
        self.state() != HandleState::Pending
    }

    pub fn has_error(&self) -> bool {
        self.state() == HandleState::Failed
    }

    /// The error the handle resolved to, if any.
    pub fn error(&self) -> Option<HookError> {
        match &*self.lock().ok()? {
            Slot::Ready(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Non-blocking read of the payload.
    ///
    /// Returns `NotCompleted` while pending and `AlreadyConsumed` once the
    /// payload has been taken.
    pub fn value(&self) -> Result<T> {
        match &*self.lock()? {
            Slot::Pending(_) => Err(HookError::NotCompleted),
            Slot::Ready(result) => result.clone(),
            Slot::Consumed => Err(HookError::AlreadyConsumed),
        }
    }

    /// Move the payload out, leaving the handle `Consumed`.
    ///
    /// A failed handle keeps its error and reports it on every call.
    pub fn take_value(&self) -> Result<T> {
        let mut slot = self.lock()?;
        match &*slot {
            Slot::Pending(_) => return Err(HookError::NotCompleted),
            Slot::Consumed => return Err(HookError::AlreadyConsumed),
            Slot::Ready(Err(e)) => return Err(e.clone()),
            Slot::Ready(Ok(_)) => {}
        }
        match std::mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Ready(result) => result,
            _ => unreachable!("slot checked above"),
        }
    }

    /// The resolved result, or `None` while pending.
    fn peek(&self) -> Option<Result<T>> {
        match self.lock() {
            Ok(slot) => match &*slot {
                Slot::Pending(_) => None,
                Slot::Ready(result) => Some(result.clone()),
                Slot::Consumed => Some(Err(HookError::AlreadyConsumed)),
            },
            Err(e) => Some(Err(e)),
        }
    }

    /// Wait asynchronously for the handle to resolve.
    pub async fn wait(&self) -> Result<T> {
        loop {
            // Registered before the check so a completion in between is not missed.
            let notified = self.shared.notify.notified();
            if let Some(resolved) = self.peek() {
                return resolved;
            }
            notified.await;
        }
    }

    /// Block the current thread until the handle resolves.
    ///
    /// Must not be called from inside an async task; use [`wait`](Self::wait).
    pub fn wait_blocking(&self) -> Result<T> {
        let slot = self.lock()?;
        let slot = self
            .shared
            .ready
            .wait_while(slot, |s| matches!(s, Slot::Pending(_)))
            .map_err(|_| HookError::LockPoisoned("async handle"))?;
        match &*slot {
            Slot::Ready(result) => result.clone(),
            Slot::Consumed => Err(HookError::AlreadyConsumed),
            Slot::Pending(_) => Err(HookError::NotCompleted),
        }
    }

    /// Block for at most `timeout`; returns `NotCompleted` if still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        let slot = self.lock()?;
        let (slot, _) = self
            .shared
            .ready
            .wait_timeout_while(slot, timeout, |s| matches!(s, Slot::Pending(_)))
            .map_err(|_| HookError::LockPoisoned("async handle"))?;
        match &*slot {
            Slot::Pending(_) => Err(HookError::NotCompleted),
            Slot::Ready(result) => result.clone(),
            Slot::Consumed => Err(HookError::AlreadyConsumed),
        }
    }

    /// Attach a continuation and return a handle for its result.
    ///
    /// `f` receives the resolved value or error. A panic inside `f` resolves
    /// the returned handle to a contract violation.
    pub fn then<U, F>(&self, f: F) -> AsyncHandle<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T>) -> Result<U> + Send + 'static,
    {
        let next = AsyncHandle::<U>::pending();
        let completer = next.clone();
        let continuation: Continuation<T> = Box::new(move |result| {
            let out = std::panic::catch_unwind(AssertUnwindSafe(|| f(result)))
                .unwrap_or_else(|_| Err(HookError::contract("continuation panicked")));
            let _ = completer.complete(out);
        });

        let resolved = match self.lock() {
            Ok(mut slot) => match &mut *slot {
                Slot::Pending(continuations) => {
                    continuations.push(continuation);
                    return next;
                }
                Slot::Ready(result) => result.clone(),
                Slot::Consumed => Err(HookError::AlreadyConsumed),
            },
            Err(e) => Err(e),
        };
        continuation(resolved);
        next
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for AsyncHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("state", &self.state())
            .finish()
    }
}
