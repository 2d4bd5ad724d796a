//! Default gradient averaging across 4 ranks.
//!
//! Each rank produces a bucket of gradients filled with its own rank value.
//! The allreduce hook averages them, so every rank ends with the mean.
//!
//! ```bash
//! cargo run --example allreduce_hook
//! ```

use gradhook::{AllreduceHook, CommHook, GradBucket, LocalProcessGroup, Tensor};
use std::sync::Arc;

#[tokio::main]
async fn main() -> gradhook::Result<()> {
    let world_size = 4u32;
    let groups = LocalProcessGroup::bootstrap(world_size)?;

    let mut handles = Vec::new();
    for pg in &groups {
        let pg = Arc::clone(pg);
        let rank = pg.rank();
        handles.push(tokio::spawn(async move {
            let hook = AllreduceHook::new(pg);
            let bucket = GradBucket::new(vec![
                Tensor::from_slice(&[rank as f32; 4], &[2, 2])?,
                Tensor::from_values(&[rank as f32 * 10.0]),
            ]);

            // Issue, then pick up the result once it has landed.
            let handle = hook.run_hook(&bucket);
            handle.wait().await?;
            let grads = hook.process_handle(&handle)?;

            let mut out = Vec::new();
            for g in &grads {
                out.push(g.to_vec::<f32>()?);
            }
            gradhook::Result::Ok((rank, out))
        }));
    }

    for h in handles {
        let (rank, grads) = h.await.expect("rank task panicked")?;
        println!("rank {rank}: {grads:?}");
    }
    // Output (all ranks identical):
    // rank 0: [[1.5, 1.5, 1.5, 1.5], [15.0]]

    Ok(())
}
