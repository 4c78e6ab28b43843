use std::path::Path;
use std::process::{Command, Output};

fn queuectl(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_queuectl"))
        .args(args)
        .env("QUEUECTL_HOME", home)
        .env_remove("QUEUECTL_DB_PATH")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run queuectl")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn enqueue_list_and_status() {
    let home = tempfile::tempdir().unwrap();

    let out = queuectl(
        home.path(),
        &["enqueue", r#"{"id":"job1","command":"echo hi","priority":2}"#],
    );
    assert!(out.status.success(), "{out:?}");
    assert!(stdout(&out).contains("\"id\": \"job1\""));

    let out = queuectl(home.path(), &["list", "--state", "pending", "--json"]);
    assert!(out.status.success(), "{out:?}");
    let jobs: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(jobs[0]["id"], "job1");
    assert_eq!(jobs[0]["state"], "pending");
    assert_eq!(jobs[0]["priority"], 2);

    let out = queuectl(home.path(), &["status"]);
    assert!(out.status.success(), "{out:?}");
    let text = stdout(&out);
    assert!(text.contains("pending"));
    assert!(text.contains("none registered"));
    assert!(text.contains("max_retries = 3"));

    assert!(home.path().join("jobs.db").exists());
}

#[test]
fn enqueue_from_file() {
    let home = tempfile::tempdir().unwrap();
    let file = home.path().join("job.json");
    std::fs::write(&file, r#"{"id":"from-file","command":"true"}"#).unwrap();

    let out = queuectl(home.path(), &["enqueue", "--file", file.to_str().unwrap()]);
    assert!(out.status.success(), "{out:?}");
    assert!(stdout(&out).contains("from-file"));
}

#[test]
fn core_errors_exit_non_zero() {
    let home = tempfile::tempdir().unwrap();
    let job = r#"{"id":"dup","command":"true"}"#;

    assert!(queuectl(home.path(), &["enqueue", job]).status.success());
    assert!(!queuectl(home.path(), &["enqueue", job]).status.success());
    assert!(!queuectl(home.path(), &["enqueue", r#"{"id":"x"}"#]).status.success());
    assert!(!queuectl(home.path(), &["enqueue", "not json"]).status.success());
    assert!(!queuectl(home.path(), &["enqueue"]).status.success());
    assert!(!queuectl(home.path(), &["dlq", "retry", "dup"]).status.success());
    assert!(!queuectl(home.path(), &["list", "--state", "sleeping"]).status.success());
}

#[test]
fn config_get_and_set() {
    let home = tempfile::tempdir().unwrap();

    let out = queuectl(home.path(), &["config", "set", "max-retries", "5"]);
    assert!(out.status.success(), "{out:?}");

    let out = queuectl(home.path(), &["config", "get", "max_retries"]);
    assert_eq!(stdout(&out).trim(), "max_retries = 5");

    let out = queuectl(home.path(), &["config", "get"]);
    let text = stdout(&out);
    assert!(text.contains("backoff_base = 2"));
    assert!(text.contains("poll_interval = 1"));

    assert!(!queuectl(home.path(), &["config", "set", "backoff_base", "zero"]).status.success());
    assert!(!queuectl(home.path(), &["config", "set", "colour", "blue"]).status.success());
    assert!(!queuectl(home.path(), &["config", "get", "colour"]).status.success());

    // enqueue picks up the new default
    let out = queuectl(home.path(), &["enqueue", r#"{"id":"j","command":"true"}"#]);
    assert!(stdout(&out).contains("\"max_retries\": 5"));
}

#[test]
fn empty_dlq_and_no_workers() {
    let home = tempfile::tempdir().unwrap();

    let out = queuectl(home.path(), &["dlq", "list"]);
    assert!(out.status.success(), "{out:?}");
    assert!(stdout(&out).contains("empty"));

    let out = queuectl(home.path(), &["worker", "stop"]);
    assert!(out.status.success(), "{out:?}");
    assert!(stdout(&out).contains("No registered workers"));
}
