//! Integration tests driving the compiled agent binary over real pipes

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

fn agent(cache_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("buildstash").unwrap();
    cmd.arg("--cache-dir")
        .arg(cache_dir.path())
        .arg("--no-stats")
        .arg("--level")
        .arg("error");
    cmd
}

fn stdout_lines(output: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| serde_json::from_str(line).expect("every output line is JSON"))
        .collect()
}

#[test]
fn handshake_then_eof() {
    let cache = TempDir::new().unwrap();
    let output = agent(&cache).write_stdin("").assert().success();
    let stdout = String::from_utf8_lossy(&output.get_output().stdout).into_owned();
    assert_eq!(
        stdout,
        "{\"ID\":0,\"KnownCommands\":[\"put\",\"get\",\"close\"]}\n"
    );
}

#[test]
fn get_miss_then_close() {
    let cache = TempDir::new().unwrap();
    let script = concat!(
        "{\"ID\":1,\"Command\":\"get\",\"ActionID\":\"AAAA\"}\n",
        "{\"ID\":2,\"Command\":\"close\"}\n",
    );
    let output = agent(&cache).write_stdin(script).assert().success();
    let lines = stdout_lines(&output.get_output().stdout);

    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["ID"], 0);
    assert_eq!(lines[1]["ID"], 1);
    assert_eq!(lines[1]["Miss"], true);
    assert_eq!(lines[2]["ID"], 2);
    assert!(lines[2].get("Err").is_none());
}

#[test]
fn put_materializes_the_body_before_close() {
    let cache = TempDir::new().unwrap();
    let script = concat!(
        "{\"ID\":2,\"Command\":\"put\",\"ActionID\":\"AAAA\",\"OutputID\":\"BBBB\",\"BodySize\":5}\n",
        "\"aGVsbG8=\"\n",
        "{\"ID\":3,\"Command\":\"close\"}\n",
    );
    let output = agent(&cache).write_stdin(script).assert().success();
    let lines = stdout_lines(&output.get_output().stdout);

    // close drains, so the put response always precedes the close response.
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[1]["ID"], 2);
    let disk_path = lines[1]["DiskPath"].as_str().expect("put returns a path");
    assert!(disk_path.starts_with('/'));
    assert_eq!(std::fs::read(disk_path).unwrap(), b"hello");
    assert_eq!(lines[2]["ID"], 3);
}

#[test]
fn stored_entries_survive_for_the_next_build() {
    let cache = TempDir::new().unwrap();

    let store = concat!(
        "{\"ID\":1,\"Command\":\"put\",\"ActionID\":\"AAAA\",\"OutputID\":\"BBBB\",\"BodySize\":5}\n",
        "\"aGVsbG8=\"\n",
    );
    agent(&cache).write_stdin(store).assert().success();

    // A second agent over the same cache root sees the entry.
    let lookup = "{\"ID\":1,\"Command\":\"get\",\"ActionID\":\"AAAA\"}\n";
    let output = agent(&cache).write_stdin(lookup).assert().success();
    let lines = stdout_lines(&output.get_output().stdout);

    assert_eq!(lines[1]["ID"], 1);
    assert!(lines[1].get("Miss").is_none());
    assert_eq!(lines[1]["OutputID"], "BBBB");
    assert_eq!(lines[1]["Size"], 5);
    assert!(lines[1]["Time"].as_str().is_some());
}

#[test]
fn clear_empties_the_cache_root() {
    let cache = TempDir::new().unwrap();
    std::fs::write(cache.path().join("00ff"), b"body").unwrap();
    std::fs::write(cache.path().join("00ff.meta"), b"outputID:aa\nsize:4\n").unwrap();

    agent(&cache)
        .arg("clear")
        .assert()
        .success()
        .stdout("Cache cleared successfully\n");

    assert!(cache.path().exists());
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
}

#[test]
fn malformed_requests_exit_nonzero() {
    let cache = TempDir::new().unwrap();
    agent(&cache).write_stdin("{not json}\n").assert().failure();
}
