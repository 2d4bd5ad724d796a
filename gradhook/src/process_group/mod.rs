//! The transport boundary the hooks communicate through.

mod local;
mod mailbox;

pub use local::LocalProcessGroup;

use crate::future::AsyncHandle;
use crate::tensor::Tensor;
use crate::types::{Rank, ReduceOp};

/// A group of cooperating processes and the transport connecting them.
///
/// Both operations are collective: every rank must issue the same sequence
/// of calls in the same order. That order is fixed when a call is *issued*,
/// not when its handle completes, so callers must issue collectives from a
/// single ordered event stream. Implementations do not enforce this.
///
/// Neither operation blocks the calling thread; the returned handle resolves
/// once the communication has finished on this rank.
pub trait ProcessGroup: Send + Sync {
    /// This process's rank within the group (0-indexed).
    fn rank(&self) -> Rank;

    /// Total number of ranks in the group.
    fn world_size(&self) -> u32;

    /// Reduce `tensors` element-wise across all ranks.
    ///
    /// The handle resolves to new tensors with the same order, shapes, dtypes
    /// and devices as the inputs; the inputs are left untouched.
    /// [`ReduceOp::Avg`] yields the mean over all [`world_size`](Self::world_size)
    /// contributions.
    fn allreduce(&self, tensors: &[Tensor], op: ReduceOp) -> AsyncHandle<Vec<Tensor>>;

    /// Copy `tensor` from `root` to every other rank, overwriting it in place
    /// on non-root ranks.
    fn broadcast(&self, tensor: &Tensor, root: Rank) -> AsyncHandle<()>;

    /// Name used in logs.
    fn backend_name(&self) -> &'static str {
        "custom"
    }
}
