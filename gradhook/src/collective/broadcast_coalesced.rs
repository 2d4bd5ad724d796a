//! Coalesced broadcast: fuse runs of small tensors into one broadcast each.
//!
//! Broadcasting hundreds of small parameter tensors one by one pays the
//! per-collective latency hundreds of times. Tensors are instead grouped into
//! runs of roughly `buffer_size` bytes, each run is flattened into one
//! contiguous tensor, broadcast once, and scattered back in place.

use std::collections::VecDeque;
use std::ops::Range;

use crate::config::HookConfig;
use crate::error::{HookError, Result};
use crate::future::AsyncHandle;
use crate::process_group::ProcessGroup;
use crate::tensor::{Tensor, flatten_dense, unflatten_into};
use crate::types::Rank;

/// Runs allowed in flight when no config is given.
const DEFAULT_PIPELINE_DEPTH: usize = 2;

/// Split `tensors` into runs of consecutive indices.
///
/// A run closes as soon as its byte size reaches `buffer_size`, and before a
/// tensor whose dtype or device differs from the run's. Every run without its
/// last tensor is therefore strictly smaller than `buffer_size`; a tensor of
/// `buffer_size` bytes or more always ends its run.
pub fn partition_runs(tensors: &[Tensor], buffer_size: usize) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut run_bytes = 0;
    for (i, t) in tensors.iter().enumerate() {
        if i > start {
            let head = &tensors[start];
            if t.dtype() != head.dtype() || t.device() != head.device() {
                runs.push(start..i);
                start = i;
                run_bytes = 0;
            }
        }
        run_bytes += t.size_in_bytes();
        if run_bytes >= buffer_size {
            runs.push(start..i + 1);
            start = i + 1;
            run_bytes = 0;
        }
    }
    if start < tensors.len() {
        runs.push(start..tensors.len());
    }
    runs
}

/// Broadcast `tensors` from rank 0 to every rank, coalescing runs of up to
/// `buffer_size` bytes into a single broadcast.
///
/// On return every rank's tensors hold rank 0's values. The tensors are
/// overwritten in place: storage and shapes are unchanged.
pub async fn broadcast_coalesced<P>(
    process_group: &P,
    tensors: &[Tensor],
    buffer_size: usize,
) -> Result<()>
where
    P: ProcessGroup + ?Sized,
{
    broadcast_runs(process_group, tensors, buffer_size, 0, DEFAULT_PIPELINE_DEPTH).await
}

/// [`broadcast_coalesced`] from an arbitrary root rank.
pub async fn broadcast_coalesced_from<P>(
    process_group: &P,
    tensors: &[Tensor],
    buffer_size: usize,
    root: Rank,
) -> Result<()>
where
    P: ProcessGroup + ?Sized,
{
    broadcast_runs(process_group, tensors, buffer_size, root, DEFAULT_PIPELINE_DEPTH).await
}

/// [`broadcast_coalesced_from`] with the threshold and pipeline depth taken
/// from `config`.
pub async fn broadcast_coalesced_with_config<P>(
    process_group: &P,
    tensors: &[Tensor],
    root: Rank,
    config: &HookConfig,
) -> Result<()>
where
    P: ProcessGroup + ?Sized,
{
    broadcast_runs(
        process_group,
        tensors,
        config.broadcast_bucket_bytes,
        root,
        config.broadcast_pipeline_depth,
    )
    .await
}

struct InFlight {
    run: Range<usize>,
    flat: Tensor,
    handle: AsyncHandle<()>,
}

async fn broadcast_runs<P>(
    process_group: &P,
    tensors: &[Tensor],
    buffer_size: usize,
    root: Rank,
    pipeline_depth: usize,
) -> Result<()>
where
    P: ProcessGroup + ?Sized,
{
    if buffer_size == 0 {
        return Err(HookError::InvalidArgument(
            "broadcast buffer size must be > 0".into(),
        ));
    }
    let world_size = process_group.world_size();
    if root >= world_size {
        return Err(HookError::InvalidRank {
            rank: root,
            world_size,
        });
    }
    if tensors.is_empty() {
        return Ok(());
    }

    let runs = partition_runs(tensors, buffer_size);
    let is_root = process_group.rank() == root;
    tracing::debug!(
        rank = process_group.rank(),
        root,
        tensors = tensors.len(),
        runs = runs.len(),
        buffer_size,
        "broadcast_coalesced"
    );

    // Run k+1 is issued before run k is waited on and scattered back.
    let depth = pipeline_depth.max(1);
    let mut in_flight: VecDeque<InFlight> = VecDeque::with_capacity(depth);
    for run in runs {
        let flat = flatten_dense(&tensors[run.clone()])?;
        let handle = process_group.broadcast(&flat, root);
        in_flight.push_back(InFlight { run, flat, handle });
        if in_flight.len() >= depth
            && let Some(done) = in_flight.pop_front()
        {
            finish(done, tensors, is_root).await?;
        }
    }
    while let Some(done) = in_flight.pop_front() {
        finish(done, tensors, is_root).await?;
    }
    Ok(())
}

async fn finish(done: InFlight, tensors: &[Tensor], is_root: bool) -> Result<()> {
    done.handle.wait().await?;
    if !is_root {
        unflatten_into(&done.flat, &tensors[done.run])?;
    }
    Ok(())
}
