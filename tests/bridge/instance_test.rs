//! Tests for running and loading code in an interpreter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use phantom_host::bridge::BridgeError;
use serde::Deserialize;
use tokio_test::{assert_err, assert_ok};

use super::{launcher, start, wait_until_dead};

#[tokio::test]
async fn run_returns_decoded_number() {
    let interpreter = start();

    let value: i64 = assert_ok!(interpreter.run("echo $((2 + 2))").await);
    assert_eq!(value, 4);

    assert_ok!(interpreter.exit().await);
}

#[tokio::test]
async fn run_multiline_code() {
    let interpreter = start();

    let value: f64 = interpreter
        .run("a=3\nb=4\necho $((a + b))\n")
        .await
        .unwrap();
    assert!((value - 7.0).abs() < f64::EPSILON);

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn run_multiple_commands_in_sequence() {
    let interpreter = start();

    for _ in 0..3 {
        let value: i64 = interpreter.run("echo 1").await.unwrap();
        assert_eq!(value, 1);
    }

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn run_decodes_structured_values() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    let interpreter = start();

    let point: Point = interpreter
        .run(r#"echo '{"x": 1, "y": -2}'"#)
        .await
        .unwrap();
    assert_eq!(point, Point { x: 1, y: -2 });

    let value: serde_json::Value = interpreter.run(r#"echo '[1, "two", null]'"#).await.unwrap();
    assert_eq!(value, serde_json::json!([1, "two", null]));

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn load_defines_globals_for_later_runs() {
    let interpreter = start();

    interpreter.load("a=2").await.unwrap();
    let value: i64 = interpreter.run("echo $a").await.unwrap();
    assert_eq!(value, 2);

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn thrown_string_becomes_runtime_error() {
    let interpreter = start();

    let err = interpreter
        .run::<serde_json::Value>(r#"printf '"Ooops"'; false"#)
        .await
        .unwrap_err();
    match err {
        BridgeError::Runtime(message) => assert_eq!(message, "Ooops"),
        other => panic!("Expected Runtime error, got {other:?}"),
    }

    // The instance stays usable after a failed call.
    let value: i64 = interpreter.run("echo 9").await.unwrap();
    assert_eq!(value, 9);

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn log_lines_do_not_complete_a_run() {
    let interpreter = start();

    let value: i64 = interpreter
        .run("echo noise >&3; echo 'RESULTS pending' >&3; echo 5")
        .await
        .unwrap();
    assert_eq!(value, 5);

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn undecodable_payload_is_protocol_error() {
    let interpreter = start();

    let err = assert_err!(interpreter.run::<i64>("echo '{bad'").await);
    match err {
        BridgeError::Protocol { payload, .. } => assert_eq!(payload, "{bad"),
        other => panic!("Expected Protocol error, got {other:?}"),
    }
    assert!(!interpreter.is_dead());

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn bare_end_line_is_rejected_before_sending() {
    let interpreter = start();

    let err = interpreter
        .run::<i64>("echo 1\nEND\necho 2")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidCommand(_)));

    let value: i64 = interpreter.run("echo 3").await.unwrap();
    assert_eq!(value, 3);

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn concurrent_runs_are_serialized() {
    let interpreter = Arc::new(start());

    let mut handles = Vec::new();
    for i in 0..5_i64 {
        let interpreter = Arc::clone(&interpreter);
        handles.push(tokio::spawn(async move {
            let value: i64 = interpreter.run(&format!("echo {i}")).await.unwrap();
            (i, value)
        }));
    }
    for handle in handles {
        let (sent, received) = handle.await.unwrap();
        assert_eq!(sent, received);
    }

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn run_timeout_leaves_instance_alive() {
    let interpreter = launcher()
        .run_timeout(Duration::from_millis(200))
        .start(Vec::<String>::new())
        .unwrap();

    let err = interpreter.run::<i64>("sleep 1; echo 1").await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(_)));
    assert!(!err.is_fatal());
    assert!(!interpreter.is_dead());

    interpreter.force_shutdown().await.unwrap();
}

#[tokio::test]
async fn late_reply_is_not_attributed_to_next_run() {
    let interpreter = launcher()
        .run_timeout(Duration::from_millis(1500))
        .start(Vec::<String>::new())
        .unwrap();

    let err = interpreter.run::<i64>("sleep 2; echo 1").await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(_)));

    // The answer to the first call arrives while this one is waiting.
    let value: i64 = assert_ok!(interpreter.run("echo 2").await);
    assert_eq!(value, 2);
    let value: i64 = assert_ok!(interpreter.run("echo 3").await);
    assert_eq!(value, 3);

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn late_reply_arriving_between_runs_is_discarded() {
    let interpreter = launcher()
        .run_timeout(Duration::from_millis(200))
        .start(Vec::<String>::new())
        .unwrap();

    let err = interpreter.run::<i64>("sleep 1; echo 1").await.unwrap_err();
    assert!(matches!(err, BridgeError::Timeout(_)));
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let value: i64 = assert_ok!(interpreter.run("echo 2").await);
    assert_eq!(value, 2);

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn cancelled_run_does_not_leak_its_reply() {
    let interpreter = start();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(200), interpreter.run::<i64>("sleep 1; echo 1"))
            .await;
    assert!(abandoned.is_err());

    let value: i64 = assert_ok!(interpreter.run("echo 2").await);
    assert_eq!(value, 2);

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn working_dir_applies_to_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let interpreter = launcher()
        .working_dir(dir.path())
        .start(Vec::<String>::new())
        .unwrap();

    let reported: String = interpreter
        .run(r#"printf '"%s"' "$(pwd -P)""#)
        .await
        .unwrap();
    assert_eq!(PathBuf::from(reported), dir.path().canonicalize().unwrap());

    interpreter.exit().await.unwrap();
}

#[tokio::test]
async fn run_after_process_exit_is_dead_instance() {
    let interpreter = start();

    interpreter.load("exit 3").await.unwrap();
    wait_until_dead(&interpreter).await;

    let err = tokio::time::timeout(Duration::from_secs(1), interpreter.run::<i64>("echo 1"))
        .await
        .expect("run blocked on a dead instance")
        .unwrap_err();
    assert!(matches!(err, BridgeError::DeadInstance));

    let err = interpreter.load("a=1").await.unwrap_err();
    assert!(matches!(err, BridgeError::DeadInstance));

    interpreter.force_shutdown().await.unwrap();
}

#[tokio::test]
async fn launch_args_reach_the_process() {
    // `-u` makes unset variables an error, so the run fails on stderr.
    let interpreter = launcher().start(["-u"]).unwrap();

    let err = interpreter
        .run::<i64>("echo $undefined_variable")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Runtime(_)));

    interpreter.force_shutdown().await.unwrap();
}
