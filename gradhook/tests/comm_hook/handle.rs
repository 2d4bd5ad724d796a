use std::time::Duration;

use gradhook::{AsyncHandle, HandleState, HookValue, Tensor};

#[tokio::test]
async fn test_handle_resolved_from_another_thread() {
    let handle: AsyncHandle = AsyncHandle::pending();
    let completer = handle.clone();
    let t = Tensor::from_values(&[3u32, 4]);
    let sent = t.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        completer
            .mark_completed(HookValue::TensorList(vec![sent]))
            .unwrap();
    });

    let value = handle.wait().await.unwrap();
    assert!(value.as_tensor_list().unwrap()[0].same_storage(&t));
    assert_eq!(handle.state(), HandleState::Completed);
}

#[tokio::test]
async fn test_dropping_handle_does_not_cancel() {
    let handle = AsyncHandle::<u32>::pending();
    let seen = handle.then(|r| r.map(|v| v * 10));
    drop(handle.clone());

    let completer = handle.clone();
    drop(handle);
    tokio::spawn(async move {
        completer.mark_completed(4).unwrap();
    });
    assert_eq!(seen.wait().await, Ok(40));
}
