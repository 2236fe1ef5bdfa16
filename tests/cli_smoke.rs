use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

mod helpers;
use helpers::unique_test_temp_dir;

fn fixture_path(rel: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(rel)
}

fn write_temp_inventory(prefix: &str, yaml: &str) -> PathBuf {
    let p = unique_test_temp_dir(prefix).join("inventory.yaml");
    fs::write(&p, yaml).expect("write temp inventory");
    p
}

fn fixture_inventory() -> PathBuf {
    let yaml = fs::read_to_string(fixture_path("tests/fixtures/inventory.yaml"))
        .expect("read inventory fixture");
    write_temp_inventory("cli-smoke", &yaml)
}

fn fleet(inventory: &Path, args: &[&str], local_worker: bool) -> Output {
    let exe = env!("CARGO_BIN_EXE_fleet");
    let mut cmd = Command::new(exe);
    cmd.arg("--inventory")
        .arg(inventory)
        .arg("--no-ansi")
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("FLEET_INVENTORY")
        .env("CI", "1");
    if local_worker {
        cmd.env("FLEET_LOCAL_WORKER", "true");
    } else {
        cmd.env_remove("FLEET_LOCAL_WORKER");
    }
    cmd.output().expect("run fleet binary")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn assert_success(out: &Output) {
    assert!(
        out.status.success(),
        "expected success, stdout:\n{}\nstderr:\n{}",
        stdout(out),
        stderr(out)
    );
}

const UNHEALTHY: &str = r#"
hosts:
  - alias: a
  - alias: b
    config: { healthy: false }
  - alias: c
"#;

#[test]
fn schema_command_prints_inventory_schema() {
    let out = fleet(&fixture_inventory(), &["schema"], false);
    assert_success(&out);
    let schema: serde_json::Value =
        serde_json::from_slice(&out.stdout).expect("schema output is JSON");
    assert!(schema["properties"]["hosts"].is_object(), "{schema}");
}

#[test]
fn list_shows_tasks_and_policies() {
    let out = fleet(&fixture_inventory(), &["list"], false);
    assert_success(&out);
    let text = stdout(&out);
    assert!(text.contains("parallel (limit 2)"), "{text}");
    assert!(text.contains("once per node"), "{text}");
    assert!(text.lines().any(|l| l.starts_with("lock")), "{text}");
}

#[test]
fn plan_prints_chunks_without_running() {
    let out = fleet(&fixture_inventory(), &["run", "lock", "deploy", "unlock", "--plan"], false);
    assert_success(&out);
    assert_eq!(
        stdout(&out),
        "  0. lock    web1\n  1. deploy  web1, web2\n  2. deploy  web3\n  3. unlock  web1\n"
    );
}

#[test]
fn deploy_runs_every_host_in_worker_processes() {
    let out = fleet(&fixture_inventory(), &["run", "deploy"], false);
    assert_success(&out);
    let text = stdout(&out);
    for (alias, ip) in [("web1", "10.0.0.1"), ("web2", "10.0.0.2"), ("web3", "10.0.0.3")] {
        assert!(
            text.contains(&format!("[{alias}] deploying {alias} to {ip}")),
            "missing deploy line for {alias}:\n{text}"
        );
        assert!(text.contains(&format!("[{alias}] done")), "{text}");
    }
    assert!(text.starts_with("task deploy\n"), "{text}");
}

#[test]
fn deploy_runs_in_process_when_requested() {
    let out = fleet(&fixture_inventory(), &["run", "deploy"], true);
    assert_success(&out);
    let text = stdout(&out);
    let done: Vec<&str> = text.lines().filter(|l| l.ends_with("] done")).collect();
    assert_eq!(done, vec!["[web1] done", "[web2] done", "[web3] done"], "{text}");
}

#[test]
fn proxy_calls_reach_the_master() {
    let out = fleet(&fixture_inventory(), &["run", "release", "lock", "unlock"], false);
    assert_success(&out);
    let text = stdout(&out);
    assert!(text.contains("[web1] release 1"), "{text}");
    assert!(text.contains("[web3] release 1"), "{text}");
    assert!(!text.contains("[web2] release"), "{text}");
    assert!(text.contains("[web1] lock acquired"), "{text}");
    assert!(text.contains("[web1] lock released"), "{text}");
}

#[test]
fn failing_host_sets_exit_code_and_stops_the_run() {
    for local_worker in [false, true] {
        let inventory = write_temp_inventory("cli-unhealthy", UNHEALTHY);
        let out = fleet(&inventory, &["run", "check", "info"], local_worker);
        assert_eq!(
            out.status.code(),
            Some(3),
            "local_worker={local_worker}\nstdout:\n{}\nstderr:\n{}",
            stdout(&out),
            stderr(&out)
        );
        let text = stdout(&out);
        assert!(text.contains("task check failed"), "{text}");
        assert!(!text.contains("task info"), "{text}");
    }
}

#[test]
fn select_limits_the_hosts() {
    let out = fleet(&fixture_inventory(), &["run", "info", "--select", "node=n2"], true);
    assert_success(&out);
    let text = stdout(&out);
    assert!(text.contains("[web3] hostname=10.0.0.3 node=n2"), "{text}");
    assert!(!text.contains("[web1]"), "{text}");
}

#[test]
fn unknown_task_is_an_error() {
    let out = fleet(&fixture_inventory(), &["run", "nope"], false);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("unknown task 'nope'"), "{err}");
}

#[test]
fn invalid_inventory_is_reported() {
    let inventory = write_temp_inventory("cli-invalid", "hosts:\n  - alias: a\n    port: 22\n");
    let out = fleet(&inventory, &["run", "info"], false);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("schema validation failed"), "{err}");
}
