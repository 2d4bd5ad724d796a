use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::try_join_all;

use super::ProcessGroup;
use super::mailbox::Mailbox;
use crate::config::HookConfig;
use crate::error::{HookError, Result};
use crate::future::AsyncHandle;
use crate::reduce::{average_slices, reduce_slice};
use crate::tensor::Tensor;
use crate::types::{Rank, ReduceOp};

/// The inboxes of every rank in one local group.
struct Fabric {
    mailboxes: Vec<Mailbox>,
}

/// What a spawned collective needs from its group.
#[derive(Clone)]
struct Endpoint {
    rank: Rank,
    world_size: u32,
    fabric: Arc<Fabric>,
    config: HookConfig,
}

impl Endpoint {
    fn send(&self, dest: Rank, tag: u64, data: Vec<u8>) -> Result<()> {
        let mailbox = self
            .fabric
            .mailboxes
            .get(dest as usize)
            .ok_or(HookError::InvalidRank {
                rank: dest,
                world_size: self.world_size,
            })?;
        mailbox.deliver(self.rank, tag, data)
    }

    /// Receive from a peer with timeout, wrapping errors as `CollectiveFailed`.
    async fn recv(&self, src: Rank, tag: u64, operation: &'static str) -> Result<Vec<u8>> {
        let mailbox = &self.fabric.mailboxes[self.rank as usize];
        let timeout = self.config.collective_timeout;
        match tokio::time::timeout(timeout, mailbox.recv(src, tag)).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(HookError::CollectiveFailed {
                operation,
                rank: src,
                reason: e.to_string(),
            }),
            Err(_) => Err(HookError::Timeout {
                operation,
                rank: src,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Flat allreduce: every rank sends its contribution to every other rank,
    /// then folds all contributions in rank order so that every rank computes
    /// bit-identical results. `Avg` takes the mean of all contributions at
    /// once instead of dividing a folded sum.
    async fn allreduce(
        self,
        tag: u64,
        inputs: Vec<Tensor>,
        local: Vec<u8>,
        op: ReduceOp,
    ) -> Result<Vec<Tensor>> {
        let total = local.len();
        for dest in (0..self.world_size).filter(|&r| r != self.rank) {
            self.send(dest, tag, local.clone())?;
        }

        let peers: Vec<Rank> = (0..self.world_size).filter(|&r| r != self.rank).collect();
        let received =
            try_join_all(peers.iter().map(|&src| self.recv(src, tag, "allreduce"))).await?;

        let mut contributions: Vec<Vec<u8>> = Vec::with_capacity(self.world_size as usize);
        let mut received = received.into_iter();
        for r in 0..self.world_size {
            let data = if r == self.rank {
                local.clone()
            } else {
                received
                    .next()
                    .ok_or_else(|| HookError::transport("missing allreduce contribution"))?
            };
            if data.len() != total {
                return Err(HookError::BufferSizeMismatch {
                    expected: total,
                    actual: data.len(),
                });
            }
            contributions.push(data);
        }

        let mut outputs = Vec::with_capacity(inputs.len());
        let mut offset = 0;
        for t in &inputs {
            let segment = offset..offset + t.size_in_bytes();
            let parts: Vec<&[u8]> = contributions.iter().map(|c| &c[segment.clone()]).collect();
            let mut bytes = vec![0u8; segment.len()];
            if op == ReduceOp::Avg {
                average_slices(&mut bytes, &parts, t.dtype())?;
            } else {
                bytes.copy_from_slice(parts[0]);
                for part in &parts[1..] {
                    reduce_slice(&mut bytes, part, t.dtype(), op)?;
                }
            }
            outputs.push(t.like_with_bytes(bytes)?);
            offset = segment.end;
        }
        Ok(outputs)
    }

    /// Flat broadcast: root sends to every other rank directly.
    async fn broadcast(self, tag: u64, tensor: Tensor, root: Rank, data: Vec<u8>) -> Result<()> {
        if self.rank == root {
            for dest in (0..self.world_size).filter(|&r| r != root) {
                self.send(dest, tag, data.clone())?;
            }
            return Ok(());
        }
        let received = self.recv(root, tag, "broadcast").await?;
        if received.len() != tensor.size_in_bytes() {
            return Err(HookError::BufferSizeMismatch {
                expected: tensor.size_in_bytes(),
                actual: received.len(),
            });
        }
        tensor.write_bytes(&received)
    }
}

/// An in-process [`ProcessGroup`]: every rank lives in this process and
/// exchanges data through shared mailboxes.
///
/// Use it to run several simulated ranks (one tokio task or thread each)
/// against the real hook machinery.
///
/// # Example
///
/// ```no_run
/// use gradhook::LocalProcessGroup;
///
/// # async fn example() -> gradhook::Result<()> {
/// let groups = LocalProcessGroup::bootstrap(4)?;
/// assert_eq!(groups[0].rank(), 0);
/// assert_eq!(groups[0].world_size(), 4);
/// # Ok(())
/// # }
/// ```
pub struct LocalProcessGroup {
    endpoint: Endpoint,
    /// Sequence tag of the next collective. All ranks advance it in lockstep
    /// as long as they issue collectives in the same order.
    next_tag: AtomicU64,
    runtime: tokio::runtime::Handle,
}

impl LocalProcessGroup {
    /// Create `world_size` connected ranks on the current tokio runtime.
    pub fn bootstrap(world_size: u32) -> Result<Vec<Arc<Self>>> {
        Self::bootstrap_with_config(world_size, HookConfig::from_env())
    }

    /// Create `world_size` connected ranks with explicit tuning.
    pub fn bootstrap_with_config(world_size: u32, config: HookConfig) -> Result<Vec<Arc<Self>>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| HookError::transport(format!("no tokio runtime: {e}")))?;
        Self::bootstrap_on(runtime, world_size, config)
    }

    /// Create `world_size` connected ranks whose collectives run on `runtime`.
    ///
    /// Collectives can then be issued from any thread, including threads
    /// that are not part of the runtime.
    pub fn bootstrap_on(
        runtime: tokio::runtime::Handle,
        world_size: u32,
        config: HookConfig,
    ) -> Result<Vec<Arc<Self>>> {
        if world_size == 0 {
            return Err(HookError::InvalidArgument(
                "world size must be at least 1".into(),
            ));
        }
        let fabric = Arc::new(Fabric {
            mailboxes: (0..world_size).map(|_| Mailbox::default()).collect(),
        });
        tracing::debug!(world_size, "local process group formed");
        Ok((0..world_size)
            .map(|rank| {
                Arc::new(Self {
                    endpoint: Endpoint {
                        rank,
                        world_size,
                        fabric: Arc::clone(&fabric),
                        config: config.clone(),
                    },
                    next_tag: AtomicU64::new(1),
                    runtime: runtime.clone(),
                })
            })
            .collect())
    }

    pub fn rank(&self) -> Rank {
        self.endpoint.rank
    }

    pub fn world_size(&self) -> u32 {
        self.endpoint.world_size
    }

    pub fn config(&self) -> &HookConfig {
        &self.endpoint.config
    }

    fn next_collective_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> Rank {
        self.endpoint.rank
    }

    fn world_size(&self) -> u32 {
        self.endpoint.world_size
    }

    fn allreduce(&self, tensors: &[Tensor], op: ReduceOp) -> AsyncHandle<Vec<Tensor>> {
        let tag = self.next_collective_tag();
        let inputs = tensors.to_vec();
        // Snapshot at issue time so later writes to the caller's tensors
        // cannot leak into this round.
        let mut local = Vec::with_capacity(inputs.iter().map(Tensor::size_in_bytes).sum());
        for t in &inputs {
            match t.to_bytes() {
                Ok(bytes) => local.extend_from_slice(&bytes),
                Err(e) => return AsyncHandle::failed(e),
            }
        }
        tracing::debug!(
            rank = self.endpoint.rank,
            tag,
            tensors = inputs.len(),
            bytes = local.len(),
            %op,
            "allreduce issued"
        );
        let endpoint = self.endpoint.clone();
        AsyncHandle::spawn_on(&self.runtime, endpoint.allreduce(tag, inputs, local, op))
    }

    fn broadcast(&self, tensor: &Tensor, root: Rank) -> AsyncHandle<()> {
        if root >= self.endpoint.world_size {
            return AsyncHandle::failed(HookError::InvalidRank {
                rank: root,
                world_size: self.endpoint.world_size,
            });
        }
        let tag = self.next_collective_tag();
        let data = if self.endpoint.rank == root {
            match tensor.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => return AsyncHandle::failed(e),
            }
        } else {
            Vec::new()
        };
        tracing::trace!(
            rank = self.endpoint.rank,
            tag,
            root,
            bytes = tensor.size_in_bytes(),
            "broadcast issued"
        );
        let endpoint = self.endpoint.clone();
        AsyncHandle::spawn_on(
            &self.runtime,
            endpoint.broadcast(tag, tensor.clone(), root, data),
        )
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
