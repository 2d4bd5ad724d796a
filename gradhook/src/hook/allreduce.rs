use std::sync::Arc;

use super::CommHook;
use crate::bucket::GradBucket;
use crate::error::{HookError, Result};
use crate::future::{AsyncHandle, HookValue};
use crate::process_group::ProcessGroup;
use crate::tensor::Tensor;
use crate::types::ReduceOp;

/// The default strategy: average every gradient across all ranks.
///
/// The average is computed by the collective itself ([`ReduceOp::Avg`]), so
/// the payload is already final and [`process_future`](CommHook::process_future)
/// only unwraps it.
pub struct AllreduceHook {
    process_group: Arc<dyn ProcessGroup>,
}

impl AllreduceHook {
    pub fn new(process_group: Arc<dyn ProcessGroup>) -> Self {
        Self { process_group }
    }

    pub fn process_group(&self) -> &Arc<dyn ProcessGroup> {
        &self.process_group
    }
}

impl CommHook for AllreduceHook {
    fn name(&self) -> &str {
        "allreduce"
    }

    fn run_hook(&self, bucket: &GradBucket) -> AsyncHandle<HookValue> {
        tracing::debug!(
            rank = self.process_group.rank(),
            bucket = bucket.index(),
            tensors = bucket.len(),
            bytes = bucket.total_bytes(),
            backend = self.process_group.backend_name(),
            "allreduce hook"
        );
        self.process_group
            .allreduce(bucket.tensors(), ReduceOp::Avg)
            .then(|result| result.map(HookValue::TensorList))
    }

    fn process_future(&self, value: HookValue) -> Result<Vec<Tensor>> {
        match value {
            HookValue::TensorList(tensors) => Ok(tensors),
            other => Err(HookError::contract(format!(
                "allreduce hook expects a TensorList payload, got {}",
                other.kind()
            ))),
        }
    }
}
