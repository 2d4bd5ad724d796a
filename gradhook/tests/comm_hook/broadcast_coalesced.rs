use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gradhook::{
    AsyncHandle, HookConfig, HookError, LocalProcessGroup, ProcessGroup, Rank, ReduceOp, Tensor,
    broadcast_coalesced, broadcast_coalesced_from, broadcast_coalesced_with_config,
    partition_runs,
};

use super::helpers::run_ranks;

/// Parameters as seen by `rank` before synchronization.
fn params(rank: u32) -> Vec<Tensor> {
    let r = rank as f32;
    vec![
        Tensor::from_slice(&[r; 25], &[5, 5]).unwrap(),
        Tensor::from_values(&[r; 12]),
        Tensor::from_slice(&[r as i64; 25], &[25, 1]).unwrap(),
        Tensor::from_values(&[r + 0.5; 3]),
    ]
}

#[tokio::test]
async fn test_broadcast_coalesced_from_rank_0() {
    run_ranks(3, |pg| async move {
        let tensors = params(pg.rank());
        let before: Vec<Tensor> = tensors.clone();

        broadcast_coalesced(&*pg, &tensors, 120).await.unwrap();

        assert_eq!(tensors.len(), 4);
        for (t, b) in tensors.iter().zip(&before) {
            assert!(t.same_storage(b), "tensors must be updated in place");
        }
        assert_eq!(tensors[0].shape(), &[5, 5]);
        assert_eq!(tensors[0].to_vec::<f32>().unwrap(), vec![0.0; 25]);
        assert_eq!(tensors[1].to_vec::<f32>().unwrap(), vec![0.0; 12]);
        assert_eq!(tensors[2].shape(), &[25, 1]);
        assert_eq!(tensors[2].to_vec::<i64>().unwrap(), vec![0; 25]);
        assert_eq!(tensors[3].to_vec::<f32>().unwrap(), vec![0.5; 3]);
    })
    .await;
}

#[tokio::test]
async fn test_broadcast_coalesced_from_nonzero_root() {
    run_ranks(4, |pg| async move {
        let tensors = params(pg.rank());
        broadcast_coalesced_from(&*pg, &tensors, 64, 2).await.unwrap();
        assert_eq!(tensors[0].to_vec::<f32>().unwrap(), vec![2.0; 25]);
        assert_eq!(tensors[2].to_vec::<i64>().unwrap(), vec![2; 25]);
        assert_eq!(tensors[3].to_vec::<f32>().unwrap(), vec![2.5; 3]);
    })
    .await;
}

#[tokio::test]
async fn test_broadcast_coalesced_one_tensor_per_run() {
    // A threshold of one byte closes a run after every tensor.
    let config = HookConfig {
        broadcast_bucket_bytes: 1,
        broadcast_pipeline_depth: 3,
        ..HookConfig::default()
    };
    run_ranks(2, move |pg| {
        let config = config.clone();
        async move {
            let tensors = params(pg.rank());
            broadcast_coalesced_with_config(&*pg, &tensors, 0, &config)
                .await
                .unwrap();
            assert_eq!(tensors[1].to_vec::<f32>().unwrap(), vec![0.0; 12]);
            assert_eq!(tensors[3].to_vec::<f32>().unwrap(), vec![0.5; 3]);
        }
    })
    .await;
}

#[test]
fn test_partition_threshold_example() {
    let tensors = [
        Tensor::from_values(&[0u8; 100]),
        Tensor::from_values(&[0u8; 50]),
        Tensor::from_values(&[0u8; 200]),
    ];
    assert_eq!(partition_runs(&tensors, 120), vec![0..2, 2..3]);
}

#[tokio::test]
async fn test_broadcast_coalesced_empty_is_noop() {
    let groups = LocalProcessGroup::bootstrap(2).unwrap();
    broadcast_coalesced(&*groups[1], &[], 1024).await.unwrap();
}

#[tokio::test]
async fn test_broadcast_coalesced_rejects_bad_arguments() {
    let groups = LocalProcessGroup::bootstrap(2).unwrap();
    let tensors = params(0);
    assert!(matches!(
        broadcast_coalesced(&*groups[0], &tensors, 0).await,
        Err(HookError::InvalidArgument(_))
    ));
    assert_eq!(
        broadcast_coalesced_from(&*groups[0], &tensors, 64, 5).await,
        Err(HookError::InvalidRank {
            rank: 5,
            world_size: 2
        })
    );
}

/// Records every broadcast it is asked for and fills the buffer with `fill`
/// as if it came from the root. Each broadcast completes after a short delay.
struct RecordingGroup {
    rank: Rank,
    fill: u8,
    issued: Mutex<Vec<usize>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
}

impl RecordingGroup {
    fn new(rank: Rank, fill: u8) -> Self {
        Self {
            rank,
            fill,
            issued: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn issued(&self) -> Vec<usize> {
        self.issued.lock().unwrap().clone()
    }
}

impl ProcessGroup for RecordingGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        2
    }

    fn allreduce(&self, _tensors: &[Tensor], _op: ReduceOp) -> AsyncHandle<Vec<Tensor>> {
        AsyncHandle::failed(HookError::transport("allreduce not recorded"))
    }

    fn broadcast(&self, tensor: &Tensor, root: Rank) -> AsyncHandle<()> {
        assert_eq!(root, 0);
        self.issued.lock().unwrap().push(tensor.size_in_bytes());
        if self.rank != root
            && let Err(e) = tensor.write_bytes(&vec![self.fill; tensor.size_in_bytes()])
        {
            return AsyncHandle::failed(e);
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let in_flight = Arc::clone(&self.in_flight);
        AsyncHandle::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_broadcast_issues_one_collective_per_run() {
    let pg = RecordingGroup::new(0, 0);
    let tensors = [
        Tensor::from_values(&[1u8; 100]),
        Tensor::from_values(&[2u8; 50]),
        Tensor::from_values(&[3u8; 200]),
    ];
    broadcast_coalesced(&pg, &tensors, 120).await.unwrap();

    assert_eq!(pg.issued(), vec![150, 200]);
    // The root keeps its own values.
    assert_eq!(tensors[1].to_vec::<u8>().unwrap(), vec![2; 50]);
}

#[tokio::test]
async fn test_broadcast_in_flight_is_bounded_by_depth() {
    let tensors: Vec<Tensor> = (0..9).map(|_| Tensor::from_values(&[0u8; 16])).collect();
    for depth in [1, 2, 3] {
        let pg = RecordingGroup::new(1, 9);
        let config = HookConfig {
            broadcast_bucket_bytes: 16,
            broadcast_pipeline_depth: depth,
            ..HookConfig::default()
        };
        broadcast_coalesced_with_config(&pg, &tensors, 0, &config)
            .await
            .unwrap();

        assert_eq!(pg.issued(), vec![16; 9]);
        let max = pg.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= depth, "depth {depth}: {max} broadcasts in flight");
        // Issuing does not yield, so the window fills up before the first wait.
        assert_eq!(max, depth);
        for t in &tensors {
            assert_eq!(t.to_vec::<u8>().unwrap(), vec![9; 16]);
        }
    }
}
