use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gradhook::{
    AsyncHandle, CommHook, ExternalCallableHook, GradBucket, HookCallable, HookError, HookValue,
    ProcessGroup, ReduceOp, Result, Tensor, communicate,
};

use super::helpers::run_ranks;

struct Counter {
    calls: AtomicUsize,
}

fn counting_hook() -> (Arc<Counter>, ExternalCallableHook) {
    let counter = Arc::new(Counter {
        calls: AtomicUsize::new(0),
    });
    let callable = |state: &(dyn Any + Send + Sync), bucket: &GradBucket| -> Result<AsyncHandle> {
        let counter = state
            .downcast_ref::<Counter>()
            .ok_or_else(|| HookError::contract("unexpected state"))?;
        counter.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AsyncHandle::completed(HookValue::TensorList(
            bucket.tensors().to_vec(),
        )))
    };
    let hook = ExternalCallableHook::new("counting", counter.clone(), Arc::new(callable));
    (counter, hook)
}

#[tokio::test]
async fn test_counter_over_five_buckets() {
    let (counter, hook) = counting_hook();
    for i in 0..5 {
        let values: Vec<f32> = (0..=i).map(|v| v as f32 * 1.5).collect();
        let bucket = GradBucket::with_index(i, i == 4, vec![Tensor::from_values(&values)]);
        let out = communicate(&hook, &bucket).await.unwrap();
        assert_eq!(out[0].to_vec::<f32>().unwrap(), values);
        assert!(out[0].same_storage(&bucket.tensors()[0]));
    }
    assert_eq!(counter.calls.load(Ordering::SeqCst), 5);
}

/// Counts how often the callable itself is dropped.
struct DropProbe {
    drops: Arc<AtomicUsize>,
}

impl Drop for DropProbe {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl HookCallable for DropProbe {
    fn call(
        &self,
        _state: &(dyn Any + Send + Sync),
        bucket: &GradBucket,
    ) -> Result<AsyncHandle<HookValue>> {
        Ok(AsyncHandle::completed(HookValue::List(
            bucket
                .tensors()
                .iter()
                .cloned()
                .map(HookValue::Tensor)
                .collect(),
        )))
    }
}

#[test]
fn test_teardown_releases_exactly_once() {
    let state: Arc<dyn Any + Send + Sync> = Arc::new(String::from("optimizer state"));
    let drops = Arc::new(AtomicUsize::new(0));
    let hook = ExternalCallableHook::new(
        "inspect",
        Arc::clone(&state),
        Arc::new(DropProbe {
            drops: Arc::clone(&drops),
        }),
    );
    assert_eq!(Arc::strong_count(&state), 2);

    hook.teardown();
    assert_eq!(Arc::strong_count(&state), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);

    hook.teardown();
    drop(hook);
    assert_eq!(Arc::strong_count(&state), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn test_drop_releases_without_teardown() {
    let state: Arc<dyn Any + Send + Sync> = Arc::new(7u64);
    let drops = Arc::new(AtomicUsize::new(0));
    let hook = ExternalCallableHook::new(
        "inspect",
        Arc::clone(&state),
        Arc::new(DropProbe {
            drops: Arc::clone(&drops),
        }),
    );
    let bucket = GradBucket::new(vec![Tensor::from_values(&[1i32, 2])]);
    let handle = hook.run_hook(&bucket);
    assert_eq!(hook.process_handle(&handle).unwrap().len(), 1);

    drop(hook);
    assert_eq!(Arc::strong_count(&state), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_callable_surfaces_as_failed_handle() {
    let hook = ExternalCallableHook::from_fn("failing", (), |_: &(), _: &GradBucket| {
        Err(HookError::transport("peer vanished"))
    });
    let bucket = GradBucket::new(vec![Tensor::from_values(&[1.0f32])]);
    let handle = hook.run_hook(&bucket);
    assert!(handle.has_error());

    let err = communicate(&hook, &bucket).await.unwrap_err();
    assert!(matches!(
        err,
        HookError::ExternalHook { ref hook, .. } if hook == "failing"
    ));
}

#[tokio::test]
async fn test_panicking_callable_surfaces_as_failed_handle() {
    let fail = true;
    let hook = ExternalCallableHook::from_fn("panicking", (), move |_: &(), bucket: &GradBucket| {
        if fail {
            panic!("index out of range");
        }
        Ok(AsyncHandle::completed(HookValue::from(bucket.tensors().to_vec())))
    });
    let bucket = GradBucket::new(vec![Tensor::from_values(&[1.0f32])]);
    let err = communicate(&hook, &bucket).await.unwrap_err();
    assert!(matches!(err, HookError::ExternalHook { .. }));
    assert!(err.to_string().contains("index out of range"));
}

#[tokio::test]
async fn test_external_hook_wrong_payload_is_rejected() {
    let hook = ExternalCallableHook::from_fn("ints", (), |_: &(), _: &GradBucket| {
        Ok(AsyncHandle::completed(HookValue::Int(1)))
    });
    let bucket = GradBucket::new(vec![Tensor::from_values(&[1.0f32])]);
    let err = communicate(&hook, &bucket).await.unwrap_err();
    assert!(err.is_contract_violation());
}

#[tokio::test]
async fn test_external_hook_driving_the_process_group() {
    // Sum, then scale by 1/world_size in a continuation.
    let outputs = run_ranks(2, |pg| async move {
        let world = pg.world_size() as f32;
        let pg: Arc<dyn ProcessGroup> = pg;
        let hook = ExternalCallableHook::from_fn(
            "sum_then_scale",
            pg,
            move |pg: &Arc<dyn ProcessGroup>, bucket: &GradBucket| {
                Ok(pg
                    .allreduce(bucket.tensors(), ReduceOp::Sum)
                    .then(move |summed| {
                        let scaled = summed?
                            .into_iter()
                            .map(|t| {
                                let values: Vec<f32> =
                                    t.to_vec::<f32>()?.into_iter().map(|v| v / world).collect();
                                Tensor::from_slice(&values, t.shape())
                            })
                            .collect::<Result<Vec<_>>>()?;
                        Ok(HookValue::TensorList(scaled))
                    }))
            },
        );
        let bucket = GradBucket::new(vec![
            Tensor::from_slice(&[1.0f32, 3.0, 5.0, 7.0], &[2, 2]).unwrap(),
        ]);
        let out = communicate(&hook, &bucket).await.unwrap();
        assert_eq!(out[0].shape(), &[2, 2]);
        out[0].to_vec::<f32>().unwrap()
    })
    .await;

    for out in outputs {
        assert_eq!(out, vec![1.0, 3.0, 5.0, 7.0]);
    }
}
