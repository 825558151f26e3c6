use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn airq_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("airq");
    path
}

fn setup_test_env(api_url: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let inbox = root.join("inbox").join("dev1");
    fs::create_dir_all(&inbox).unwrap();
    write_with_mtime(
        &inbox.join("newer.csv"),
        "Timestamp,PM2.5,Humidity\n2024-01-02T00:00:00Z,8.0,40\n",
        2_000,
    );
    write_with_mtime(
        &inbox.join("older.csv"),
        "Timestamp,PM2.5\n2024-01-01T00:00:00Z,12.3\nbad,x\n",
        1_000,
    );
    fs::write(inbox.join("notes.txt"), "not a csv").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/airq.sqlite"

[storage]
kind = "local"

[storage.local]
root = "{root}/inbox"

[api]
base_url = "{api_url}"
timeout_secs = 5

[pipeline]
batch_size = 10

[sensors]
dev1 = 7

[logging]
level = "warn"
"#,
        root = root.display(),
        api_url = api_url
    );

    let config_path = config_dir.join("airq.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

/// Write a file and backdate its modification time by `age_secs`.
fn write_with_mtime(path: &Path, body: &str, age_secs: u64) {
    fs::write(path, body).unwrap();
    let mtime = SystemTime::now() - Duration::from_secs(age_secs);
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(mtime)
        .unwrap();
}

fn run_airq(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = airq_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run airq binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

async fn run_airq_async(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let config_path = config_path.to_path_buf();
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    tokio::task::spawn_blocking(move || {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_airq(&config_path, &args)
    })
    .await
    .unwrap()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (stdout, stderr, success) = run_airq(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/airq.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (_, _, success1) = run_airq(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_airq(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_list_oldest_first() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (stdout, stderr, success) = run_airq(&config_path, &["list"]);
    assert!(success, "list failed: stdout={}, stderr={}", stdout, stderr);
    let older = stdout.find("dev1/older.csv").expect("older.csv listed");
    let newer = stdout.find("dev1/newer.csv").expect("newer.csv listed");
    assert!(older < newer, "files not oldest first:\n{}", stdout);
    assert!(!stdout.contains("notes.txt"));
    assert!(stdout.contains("2 candidate file(s)"));
}

#[test]
fn test_run_dry_run() {
    let (tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (stdout, stderr, success) = run_airq(&config_path, &["run", "--dry-run"]);
    assert!(success, "dry run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("(dry-run)"));
    assert!(stdout.contains("files processed: 2"));
    assert!(stdout.contains("rows to send: 2"));
    assert!(stdout.contains("rows dropped: 1"));
    assert!(stdout.contains("ok"));
    assert!(!tmp.path().join("data/airq.sqlite").exists());
}

#[test]
fn test_run_rejects_bad_dates() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9");

    let (_, stderr, success) = run_airq(&config_path, &["run", "--since", "yesterday"]);
    assert!(!success);
    assert!(stderr.contains("YYYY-MM-DD"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_airq(&tmp.path().join("absent.toml"), &["list"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_delivers_once_then_skips() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payloads"))
        .and(header("Idempotency-Key", "dev1|mission-7|2024-01-01T00:00:00.000Z"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/payloads"))
        .and(header("Idempotency-Key", "dev1|mission-7|2024-01-02T00:00:00.000Z"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let (_tmp, config_path) = setup_test_env(&server.uri());

    let (stdout, stderr, success) = run_airq_async(&config_path, &["run"]).await;
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("rows sent: 2"), "{}", stdout);
    assert!(stdout.contains("rows dropped: 1"));

    let (stdout, stderr, success) = run_airq_async(&config_path, &["run"]).await;
    assert!(success, "rerun failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("rows sent: 0"), "{}", stdout);
    assert!(stdout.contains("rows skipped: 2"));

    let (stdout, _, success) = run_airq_async(&config_path, &["stats"]).await;
    assert!(success);
    assert!(stdout.contains("success"));
    assert!(stdout.contains("dev1/older.csv"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_records_api_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payloads"))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({"error": "down"})))
        .mount(&server)
        .await;

    let (_tmp, config_path) = setup_test_env(&server.uri());

    let (stdout, stderr, success) = run_airq_async(&config_path, &["run"]).await;
    assert!(success, "a failed send must not fail the run: {}", stderr);
    assert!(stdout.contains("rows failed: 2"), "{}", stdout);
    assert!(stdout.contains("files failed: 0"));
}
