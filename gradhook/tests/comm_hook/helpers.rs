use gradhook::LocalProcessGroup;
use std::sync::Arc;

/// Run `f` once per rank of a fresh local group, concurrently.
/// Returns each rank's output in rank order.
pub async fn run_ranks<F, Fut, T>(world_size: u32, f: F) -> Vec<T>
where
    F: Fn(Arc<LocalProcessGroup>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    init_tracing();
    let groups = LocalProcessGroup::bootstrap(world_size).unwrap();

    let f = Arc::new(f);
    let mut handles = Vec::new();
    for g in &groups {
        let g = Arc::clone(g);
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move { f(g).await }));
    }
    let mut outputs = Vec::with_capacity(handles.len());
    for h in handles {
        outputs.push(h.await.unwrap());
    }
    outputs
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
