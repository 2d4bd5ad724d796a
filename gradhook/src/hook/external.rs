//! Hooks whose logic lives outside the crate, typically in an embedding
//! scripting runtime.
//!
//! The strategy is an opaque callable plus an opaque state object. Both are
//! owned through [`OpaqueRef`]s and only touched while the hook's
//! [`ExecutionContext`] is entered.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;

use super::CommHook;
use crate::bucket::GradBucket;
use crate::error::{HookError, Result};
use crate::future::{AsyncHandle, HookValue};
use crate::tensor::Tensor;

/// An owned reference to an externally managed object.
///
/// Acquired once, released at most once. After release every access fails
/// with [`HookError::Released`].
pub struct OpaqueRef<T: ?Sized> {
    label: &'static str,
    inner: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> OpaqueRef<T> {
    /// Take one reference to `value`.
    pub fn acquire(label: &'static str, value: Arc<T>) -> Self {
        Self {
            label,
            inner: Mutex::new(Some(value)),
        }
    }

    pub fn get(&self) -> Result<Arc<T>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| HookError::LockPoisoned("opaque reference"))?;
        inner.clone().ok_or(HookError::Released(self.label))
    }

    /// Give the reference up. Returns `true` only for the call that actually
    /// released it.
    pub fn release(&self) -> bool {
        let taken = match self.inner.lock() {
            Ok(mut inner) => inner.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        taken.is_some()
    }

    pub fn is_released(&self) -> bool {
        match self.inner.lock() {
            Ok(inner) => inner.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for OpaqueRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaqueRef")
            .field("label", &self.label)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Exclusive execution context an external strategy must run under.
///
/// Clones share the same context, so handing one context to several hooks
/// serializes all of them against each other.
///
/// Not reentrant. A hook that finds the context already held by the current
/// thread (a callable invoking a hook that shares its context) fails the
/// call instead of blocking. Teardown and drop on that thread release
/// directly, since the context is already held.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    lock: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
}

/// Proof that the current thread holds an [`ExecutionContext`].
pub struct ContextGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    owner: &'a Mutex<Option<ThreadId>>,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        *lock_ignoring_poison(self.owner) = None;
    }
}

// Panics from callables are caught while the context is held, so a poisoned
// lock carries no broken invariant.
fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the context, blocking until no one else holds it.
    ///
    /// Blocks forever if the current thread already holds it; check
    /// [`is_held_by_current_thread`](Self::is_held_by_current_thread) first.
    pub fn enter(&self) -> ContextGuard<'_> {
        let lock = lock_ignoring_poison(&self.inner.lock);
        *lock_ignoring_poison(&self.inner.owner) = Some(std::thread::current().id());
        ContextGuard {
            _lock: lock,
            owner: &self.inner.owner,
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        *lock_ignoring_poison(&self.inner.owner) == Some(std::thread::current().id())
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("held_here", &self.is_held_by_current_thread())
            .finish()
    }
}

/// The external strategy: `(state, bucket) -> handle`.
///
/// Implemented for every matching closure.
pub trait HookCallable: Send + Sync {
    fn call(
        &self,
        state: &(dyn Any + Send + Sync),
        bucket: &GradBucket,
    ) -> Result<AsyncHandle<HookValue>>;
}

impl<F> HookCallable for F
where
    F: Fn(&(dyn Any + Send + Sync), &GradBucket) -> Result<AsyncHandle<HookValue>> + Send + Sync,
{
    fn call(
        &self,
        state: &(dyn Any + Send + Sync),
        bucket: &GradBucket,
    ) -> Result<AsyncHandle<HookValue>> {
        self(state, bucket)
    }
}

/// A [`CommHook`] delegating to an external callable and state.
///
/// # Example
///
/// ```no_run
/// use gradhook::{AsyncHandle, CommHook, ExternalCallableHook, GradBucket, HookValue};
///
/// // A strategy that hands the gradients back untouched.
/// let hook = ExternalCallableHook::from_fn("noop", (), |_: &(), bucket: &GradBucket| {
///     Ok(AsyncHandle::completed(HookValue::TensorList(bucket.tensors().to_vec())))
/// });
/// assert_eq!(hook.name(), "noop");
/// ```
pub struct ExternalCallableHook {
    name: String,
    state: OpaqueRef<dyn Any + Send + Sync>,
    hook: OpaqueRef<dyn HookCallable>,
    context: ExecutionContext,
}

impl ExternalCallableHook {
    pub fn new(
        name: impl Into<String>,
        state: Arc<dyn Any + Send + Sync>,
        hook: Arc<dyn HookCallable>,
    ) -> Self {
        Self {
            name: name.into(),
            state: OpaqueRef::acquire("state", state),
            hook: OpaqueRef::acquire("hook", hook),
            context: ExecutionContext::new(),
        }
    }

    /// Build a hook from a typed state and a closure over it.
    pub fn from_fn<S, F>(name: impl Into<String>, state: S, f: F) -> Self
    where
        S: Any + Send + Sync,
        F: Fn(&S, &GradBucket) -> Result<AsyncHandle<HookValue>> + Send + Sync + 'static,
    {
        let hook = move |state: &(dyn Any + Send + Sync), bucket: &GradBucket| {
            let state = state.downcast_ref::<S>().ok_or_else(|| {
                HookError::contract(format!(
                    "hook state is not a {}",
                    std::any::type_name::<S>()
                ))
            })?;
            f(state, bucket)
        };
        Self::new(name, Arc::new(state), Arc::new(hook))
    }

    /// Run under `context` instead of a private one.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Release the callable and the state under the execution context.
    ///
    /// Safe to call any number of times; only the first call releases. Safe
    /// to call from inside a callable running under the same context.
    pub fn teardown(&self) {
        let _entered = if self.context.is_held_by_current_thread() {
            None
        } else {
            Some(self.context.enter())
        };
        let released_hook = self.hook.release();
        let released_state = self.state.release();
        if released_hook || released_state {
            tracing::debug!(hook = %self.name, "external hook released");
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.hook.is_released() && self.state.is_released()
    }

    fn wrap_error(&self, error: HookError) -> HookError {
        match error {
            HookError::ExternalHook { .. } => error,
            other => HookError::external(&self.name, other.to_string()),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

impl CommHook for ExternalCallableHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn run_hook(&self, bucket: &GradBucket) -> AsyncHandle<HookValue> {
        if self.context.is_held_by_current_thread() {
            return AsyncHandle::failed(HookError::external(
                &self.name,
                "called while its execution context is held by this thread",
            ));
        }
        let _entered = self.context.enter();
        let (state, hook) = match (self.state.get(), self.hook.get()) {
            (Ok(state), Ok(hook)) => (state, hook),
            (Err(e), _) | (_, Err(e)) => return AsyncHandle::failed(e),
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| hook.call(&*state, bucket))) {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                tracing::warn!(
                    hook = %self.name,
                    bucket = bucket.index(),
                    error = %e,
                    "external hook failed"
                );
                AsyncHandle::failed(self.wrap_error(e))
            }
            Err(payload) => {
                let reason = panic_message(&*payload);
                tracing::warn!(
                    hook = %self.name,
                    bucket = bucket.index(),
                    %reason,
                    "external hook panicked"
                );
                AsyncHandle::failed(HookError::external(&self.name, reason))
            }
        }
    }

    fn process_future(&self, value: HookValue) -> Result<Vec<Tensor>> {
        value.into_tensor_list()
    }
}

impl Drop for ExternalCallableHook {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for ExternalCallableHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalCallableHook")
            .field("name", &self.name)
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}
