pub mod bucket;
pub mod collective;
pub mod config;
pub mod error;
pub mod future;
pub mod hook;
pub mod process_group;
mod reduce;
pub mod tensor;
pub mod types;

pub use bucket::GradBucket;
pub use collective::{
    broadcast_coalesced, broadcast_coalesced_from, broadcast_coalesced_with_config, partition_runs,
};
pub use config::HookConfig;
pub use error::{HookError, Result};
pub use future::{AsyncHandle, HandleState, HookValue};
pub use hook::{
    AllreduceHook, CommHook, CommHookSlot, ContextGuard, ExecutionContext, ExternalCallableHook,
    HookCallable, OpaqueRef, check_outputs, communicate, communicate_blocking,
};
pub use process_group::{LocalProcessGroup, ProcessGroup};
pub use tensor::{Element, Tensor, flatten_dense, unflatten_into};
pub use types::{DataType, Device, Rank, ReduceOp};
