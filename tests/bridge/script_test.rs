//! Tests for the companion script shared between instances.

use phantom_host::bridge::{BridgeError, Launcher, SharedScript};

use super::{launcher_with, FAKE_COMPANION};

#[tokio::test]
async fn script_lives_until_last_instance_exits() {
    let script = SharedScript::new(FAKE_COMPANION);
    let launcher = launcher_with(script.clone());

    let instances: Vec<_> = (0..4)
        .map(|_| launcher.start(Vec::<String>::new()).unwrap())
        .collect();
    assert_eq!(script.live_instances(), 4);
    let path = script.path().expect("script file should exist");
    assert!(path.exists());

    let (last, rest) = instances.split_last().unwrap();
    for interpreter in rest {
        let value: i64 = interpreter.run("echo 1").await.unwrap();
        assert_eq!(value, 1);
        interpreter.exit().await.unwrap();
        assert!(path.exists(), "script removed while an instance was alive");
    }
    assert_eq!(script.live_instances(), 1);

    last.force_shutdown().await.unwrap();
    assert_eq!(script.live_instances(), 0);
    assert!(!path.exists());
    assert!(script.path().is_none());
}

#[tokio::test]
async fn concurrent_instances_share_one_file() {
    let script = SharedScript::new(FAKE_COMPANION);
    let launcher = launcher_with(script.clone());

    let mut handles = Vec::new();
    for i in 0..5_i64 {
        let launcher = launcher.clone();
        handles.push(tokio::spawn(async move {
            let interpreter = launcher.start(Vec::<String>::new()).unwrap();
            let value: i64 = interpreter.run(&format!("echo {i}")).await.unwrap();
            interpreter.exit().await.unwrap();
            (i, value)
        }));
    }
    for handle in handles {
        let (sent, received) = handle.await.unwrap();
        assert_eq!(sent, received);
    }

    assert_eq!(script.live_instances(), 0);
    assert!(script.path().is_none());
}

#[tokio::test]
async fn dropped_instance_releases_script() {
    let script = SharedScript::new(FAKE_COMPANION);
    let interpreter = launcher_with(script.clone())
        .start(Vec::<String>::new())
        .unwrap();
    let path = script.path().unwrap();

    drop(interpreter);
    assert_eq!(script.live_instances(), 0);
    assert!(!path.exists());
}

#[tokio::test]
async fn failed_start_does_not_leak_script() {
    let script = SharedScript::new(FAKE_COMPANION);
    let launcher = Launcher::new("definitely-not-a-real-binary-4242", script.clone());

    let err = launcher.start(Vec::<String>::new()).unwrap_err();
    assert!(matches!(err, BridgeError::Spawn(_)));
    assert!(err.is_fatal());
    assert_eq!(script.live_instances(), 0);
    assert!(script.path().is_none());
}

#[tokio::test]
async fn script_path_is_last_argument() {
    let script = SharedScript::new(FAKE_COMPANION);
    let interpreter = launcher_with(script.clone())
        .start(Vec::<String>::new())
        .unwrap();

    // `$0` is the script path when sh runs a file.
    let reported: String = interpreter
        .run(r#"printf '"%s"' "$0""#)
        .await
        .unwrap();
    assert_eq!(std::path::PathBuf::from(reported), script.path().unwrap());

    interpreter.exit().await.unwrap();
}
