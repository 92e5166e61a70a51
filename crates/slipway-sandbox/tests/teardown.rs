//! Builder sandboxes never outlive their build, even when the owning task dies

use std::sync::Arc;
use std::time::Duration;

use slipway_core::{BuildId, CancelToken, ProjectId, SandboxRole};
use slipway_sandbox::IsolatedBuilder;
use slipway_test_utils::{eventually, source_dir, test_config, FakeRuntime, Script};

fn builder(script: Script) -> (Arc<FakeRuntime>, Arc<IsolatedBuilder>) {
    let runtime = Arc::new(FakeRuntime::with_script(script));
    let builder = IsolatedBuilder::new(runtime.clone(), test_config().build);
    (runtime, Arc::new(builder))
}

#[tokio::test]
async fn panicking_build_task_still_removes_sandbox() {
    let (runtime, builder) = builder(Script {
        panic_on_wait: true,
        ..Script::default()
    });
    let source = source_dir();

    let task = tokio::spawn({
        let builder = Arc::clone(&builder);
        let path = source.path().to_path_buf();
        async move {
            builder
                .build(BuildId::new(), ProjectId::new(), &path, &CancelToken::never())
                .await
        }
    });

    let joined = task.await;
    assert!(joined.unwrap_err().is_panic());
    assert!(eventually(Duration::from_secs(2), || runtime.live_count() == 0).await);
}

#[tokio::test]
async fn aborted_build_task_still_removes_sandbox() {
    let (runtime, builder) = builder(Script {
        build_hangs: true,
        ..Script::default()
    });
    let source = source_dir();

    let task = tokio::spawn({
        let builder = Arc::clone(&builder);
        let path = source.path().to_path_buf();
        async move {
            builder
                .build(BuildId::new(), ProjectId::new(), &path, &CancelToken::never())
                .await
        }
    });

    let watched = runtime.clone();
    assert!(
        eventually(Duration::from_secs(2), || {
            watched.live_count_of(SandboxRole::Builder) == 1
        })
        .await
    );

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert!(eventually(Duration::from_secs(2), || runtime.live_count() == 0).await);
}
