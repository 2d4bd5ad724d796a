use std::sync::Arc;

use gradhook::{
    AsyncHandle, CommHook, CommHookSlot, ExternalCallableHook, GradBucket, HookError, HookValue,
    Tensor, communicate,
};

use super::helpers::run_ranks;

#[tokio::test]
async fn test_slot_defaults_to_allreduce() {
    let outputs = run_ranks(2, |pg| async move {
        let slot = CommHookSlot::new(pg.clone());
        let v = pg.rank() as f64 * 4.0;
        let bucket = GradBucket::new(vec![Tensor::from_values(&[v, v + 2.0])]);
        let hook = slot.hook();
        assert_eq!(hook.name(), "allreduce");
        communicate(&*hook, &bucket).await.unwrap()[0]
            .to_vec::<f64>()
            .unwrap()
    })
    .await;
    for out in outputs {
        assert_eq!(out, vec![2.0, 4.0]);
    }
}

#[tokio::test]
async fn test_slot_uses_registered_hook() {
    run_ranks(1, |pg| async move {
        let slot = CommHookSlot::new(pg);
        let identity = ExternalCallableHook::from_fn("identity", (), |_: &(), bucket: &GradBucket| {
            Ok(AsyncHandle::completed(HookValue::from(bucket.tensors().to_vec())))
        });
        slot.register(Arc::new(identity)).unwrap();

        let again = ExternalCallableHook::from_fn("late", (), |_: &(), bucket: &GradBucket| {
            Ok(AsyncHandle::completed(HookValue::from(bucket.tensors().to_vec())))
        });
        assert_eq!(
            slot.register(Arc::new(again)),
            Err(HookError::HookAlreadyRegistered)
        );

        let hook = slot.hook();
        assert_eq!(hook.name(), "identity");
        let grad = Tensor::from_values(&[9i8, -9]);
        let out = communicate(&*hook, &GradBucket::new(vec![grad.clone()]))
            .await
            .unwrap();
        assert!(out[0].same_storage(&grad));
    })
    .await;
}
