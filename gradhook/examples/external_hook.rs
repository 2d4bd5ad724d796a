//! A user-supplied strategy with private state.
//!
//! The strategy counts the buckets it has seen and averages gradients with a
//! sum-allreduce followed by a local rescale. Two ranks run it over three
//! buckets, then the hooks are torn down.
//!
//! ```bash
//! cargo run --example external_hook
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gradhook::{
    AsyncHandle, CommHook, ExternalCallableHook, GradBucket, HookValue, LocalProcessGroup,
    ProcessGroup, ReduceOp, Tensor, communicate,
};

struct State {
    process_group: Arc<dyn ProcessGroup>,
    buckets_seen: AtomicUsize,
}

fn sum_then_rescale(state: &State, bucket: &GradBucket) -> gradhook::Result<AsyncHandle> {
    state.buckets_seen.fetch_add(1, Ordering::Relaxed);
    let world = state.process_group.world_size() as f64;
    Ok(state
        .process_group
        .allreduce(bucket.tensors(), ReduceOp::Sum)
        .then(move |summed| {
            let mut out = Vec::new();
            for t in summed? {
                let scaled: Vec<f64> = t.to_vec::<f64>()?.iter().map(|v| v / world).collect();
                out.push(Tensor::from_slice(&scaled, t.shape())?);
            }
            Ok(HookValue::TensorList(out))
        }))
}

#[tokio::main]
async fn main() -> gradhook::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let groups = LocalProcessGroup::bootstrap(2)?;

    let mut handles = Vec::new();
    for pg in &groups {
        let pg = Arc::clone(pg);
        handles.push(tokio::spawn(async move {
            let rank = pg.rank();
            let hook = ExternalCallableHook::from_fn(
                "sum_then_rescale",
                State {
                    process_group: pg,
                    buckets_seen: AtomicUsize::new(0),
                },
                sum_then_rescale,
            );

            for index in 0..3 {
                let v = (rank + 1) as f64 * (index + 1) as f64;
                let bucket = GradBucket::with_index(
                    index,
                    index == 2,
                    vec![Tensor::from_values(&[v, -v])],
                );
                let grads = communicate(&hook, &bucket).await?;
                println!("rank {rank} bucket {index}: {:?}", grads[0].to_vec::<f64>()?);
            }

            hook.teardown();
            gradhook::Result::Ok(())
        }));
    }

    for h in handles {
        h.await.expect("rank task panicked")?;
    }
    Ok(())
}
