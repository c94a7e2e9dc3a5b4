//! Tests for graceful exit and forced shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use phantom_host::bridge::{BridgeError, InstanceState, LifecycleError};

use super::{start, wait_until_dead};

#[tokio::test]
async fn start_and_exit() {
    let interpreter = start();
    assert!(interpreter.pid().is_some());
    assert_eq!(interpreter.state().await, InstanceState::Live);

    interpreter.exit().await.unwrap();
    assert_eq!(interpreter.state().await, InstanceState::Dead);
    assert!(interpreter.is_dead());
}

#[tokio::test]
async fn exit_is_idempotent() {
    let interpreter = start();

    interpreter.exit().await.unwrap();
    interpreter.exit().await.unwrap();
    interpreter.force_shutdown().await.unwrap();
}

#[tokio::test]
async fn run_after_exit_fails_fast() {
    let interpreter = start();
    interpreter.exit().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(1), interpreter.run::<i64>("echo 1"))
        .await
        .expect("run blocked after exit")
        .unwrap_err();
    assert!(matches!(err, BridgeError::DeadInstance));
}

#[tokio::test]
async fn run_after_force_shutdown_fails_fast() {
    let interpreter = start();
    let value: i64 = interpreter.run("echo 75025").await.unwrap();
    assert_eq!(value, 75025);

    interpreter.force_shutdown().await.unwrap();

    for _ in 0..3 {
        let err = tokio::time::timeout(Duration::from_secs(1), interpreter.run::<i64>("echo 1"))
            .await
            .expect("run blocked after force shutdown")
            .unwrap_err();
        assert!(matches!(err, BridgeError::DeadInstance));
    }
}

#[tokio::test]
async fn force_shutdown_kills_hung_process_within_timeout() {
    let interpreter = start();

    // Replace the companion with a process that never reads stdin again.
    interpreter.load("exec sleep 30").await.unwrap();

    let begin = Instant::now();
    tokio::time::timeout(Duration::from_secs(5), interpreter.force_shutdown())
        .await
        .expect("force shutdown hung")
        .unwrap();
    assert!(begin.elapsed() < Duration::from_secs(3));
    assert_eq!(interpreter.state().await, InstanceState::Dead);
}

#[tokio::test]
async fn force_shutdown_unblocks_pending_run() {
    let interpreter = Arc::new(start());

    let pending = {
        let interpreter = Arc::clone(&interpreter);
        tokio::spawn(async move { interpreter.run::<i64>("sleep 5; echo 1").await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), interpreter.force_shutdown())
        .await
        .expect("force shutdown hung")
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("pending run was not released")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, BridgeError::DeadInstance));
}

#[tokio::test]
async fn force_shutdown_escalates_pending_exit() {
    let interpreter = Arc::new(start());
    interpreter.load("exec sleep 30").await.unwrap();

    let exit = {
        let interpreter = Arc::clone(&interpreter);
        tokio::spawn(async move { interpreter.exit().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), interpreter.force_shutdown())
        .await
        .expect("force shutdown hung behind exit")
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), exit)
        .await
        .expect("exit never finished")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn force_shutdown_of_exited_process_is_cheap() {
    let interpreter = start();
    interpreter.load("exit 0").await.unwrap();
    wait_until_dead(&interpreter).await;

    let begin = Instant::now();
    interpreter.force_shutdown().await.unwrap();
    assert!(begin.elapsed() < Duration::from_millis(300));
}

#[tokio::test]
async fn exit_reports_abnormal_status() {
    let interpreter = start();
    interpreter.load("exit 3").await.unwrap();
    wait_until_dead(&interpreter).await;
    assert_eq!(interpreter.state().await, InstanceState::Dead);

    let err = interpreter.exit().await.unwrap_err();
    match err {
        BridgeError::Lifecycle(LifecycleError::AbnormalExit(status)) => {
            assert_eq!(status.code(), Some(3));
        }
        other => panic!("Expected AbnormalExit, got {other:?}"),
    }

    // Later calls replay the first outcome.
    let again = interpreter.force_shutdown().await.unwrap_err();
    assert!(matches!(
        again,
        BridgeError::Lifecycle(LifecycleError::AbnormalExit(_))
    ));
}

#[tokio::test]
async fn concurrent_exit_and_force_shutdown_tear_down_once() {
    let interpreter = Arc::new(start());

    let a = {
        let interpreter = Arc::clone(&interpreter);
        tokio::spawn(async move { interpreter.exit().await })
    };
    let b = {
        let interpreter = Arc::clone(&interpreter);
        tokio::spawn(async move { interpreter.force_shutdown().await })
    };

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert_eq!(interpreter.state().await, InstanceState::Dead);
}
