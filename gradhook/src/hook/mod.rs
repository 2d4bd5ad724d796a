//! Communication hooks: strategies that turn a ready gradient bucket into
//! synchronized gradients.
//!
//! The reducer hands every ready [`GradBucket`] to the registered
//! [`CommHook`], gets back an [`AsyncHandle`], and once that handle resolves
//! asks the same hook to turn the payload into tensors:
//!
//! ```text
//! run_hook(bucket) -> handle   (Pending)
//! handle resolves              (Completed | Failed)
//! process_future(payload)      (Consumed) -> Vec<Tensor>
//! ```

mod allreduce;
mod external;

pub use allreduce::AllreduceHook;
pub use external::{ContextGuard, ExecutionContext, ExternalCallableHook, HookCallable, OpaqueRef};

use std::sync::{Arc, OnceLock};

use crate::bucket::GradBucket;
use crate::error::{HookError, Result};
use crate::future::{AsyncHandle, HookValue};
use crate::process_group::ProcessGroup;
use crate::tensor::Tensor;

/// A gradient-communication strategy.
///
/// One instance serves a whole training run and is invoked once per bucket,
/// possibly with buckets of different backward passes in flight at once.
///
/// Callers must invoke [`run_hook`](Self::run_hook) exactly once per bucket,
/// in the order buckets become ready, and must invoke
/// [`process_future`](Self::process_future) only on the payload of a handle
/// that has resolved.
pub trait CommHook: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Start communicating `bucket` and return without waiting for it.
    fn run_hook(&self, bucket: &GradBucket) -> AsyncHandle<HookValue>;

    /// Unwrap a resolved payload into the bucket's final tensors.
    ///
    /// Synchronous and free of communication.
    fn process_future(&self, value: HookValue) -> Result<Vec<Tensor>>;

    /// Consume a resolved handle through [`process_future`](Self::process_future).
    ///
    /// Rejects a handle that has not resolved (`NotCompleted`) or was
    /// already consumed (`AlreadyConsumed`), and surfaces the error of a
    /// failed one.
    fn process_handle(&self, handle: &AsyncHandle<HookValue>) -> Result<Vec<Tensor>> {
        let value = handle.take_value()?;
        self.process_future(value)
    }
}

/// Check that a hook produced one tensor per bucket entry, shape for shape.
pub fn check_outputs(bucket: &GradBucket, outputs: &[Tensor]) -> Result<()> {
    if outputs.len() != bucket.len() {
        return Err(HookError::CountMismatch {
            expected: bucket.len(),
            actual: outputs.len(),
        });
    }
    for (index, (input, output)) in bucket.tensors().iter().zip(outputs).enumerate() {
        if input.shape() != output.shape() {
            return Err(HookError::ShapeMismatch {
                index,
                expected: input.shape().to_vec(),
                actual: output.shape().to_vec(),
            });
        }
    }
    Ok(())
}

/// Run one bucket through `hook` end to end: issue, await, unwrap, validate.
pub async fn communicate<H>(hook: &H, bucket: &GradBucket) -> Result<Vec<Tensor>>
where
    H: CommHook + ?Sized,
{
    let handle = hook.run_hook(bucket);
    handle.wait().await?;
    let outputs = hook.process_handle(&handle)?;
    check_outputs(bucket, &outputs)?;
    Ok(outputs)
}

/// [`communicate`] for threads outside the async runtime.
pub fn communicate_blocking<H>(hook: &H, bucket: &GradBucket) -> Result<Vec<Tensor>>
where
    H: CommHook + ?Sized,
{
    let handle = hook.run_hook(bucket);
    handle.wait_blocking()?;
    let outputs = hook.process_handle(&handle)?;
    check_outputs(bucket, &outputs)?;
    Ok(outputs)
}

/// Holds the single hook registered for a training run.
///
/// Until a hook is registered the slot hands out an [`AllreduceHook`] over
/// its process group.
pub struct CommHookSlot {
    registered: OnceLock<Arc<dyn CommHook>>,
    fallback: Arc<dyn CommHook>,
}

impl CommHookSlot {
    pub fn new(process_group: Arc<dyn ProcessGroup>) -> Self {
        Self {
            registered: OnceLock::new(),
            fallback: Arc::new(AllreduceHook::new(process_group)),
        }
    }

    /// Register the run's hook. Only the first registration succeeds.
    pub fn register(&self, hook: Arc<dyn CommHook>) -> Result<()> {
        let name = hook.name().to_string();
        self.registered
            .set(hook)
            .map_err(|_| HookError::HookAlreadyRegistered)?;
        tracing::debug!(hook = %name, "communication hook registered");
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.registered.get().is_some()
    }

    /// The registered hook, or the default allreduce hook.
    pub fn hook(&self) -> Arc<dyn CommHook> {
        match self.registered.get() {
            Some(hook) => Arc::clone(hook),
            None => Arc::clone(&self.fallback),
        }
    }
}
