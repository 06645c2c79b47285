use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn zerag_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("zerag");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha\n\nRefunds are issued within 30 days of delivery.\n\nShipping is free above 50 euros.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.txt"),
        "Support is open on weekdays.\n\nGift cards never expire.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/zerag.sqlite"

[chunking]
max_chars = 80
overlap_chars = 0
min_chars = 0
file_strategy = "paragraph"

[embedding]
provider = "hash"
dims = 64

[llm]
provider = "disabled"
"#,
        root = root.display()
    );
    let config_path = config_dir.join("zerag.toml");
    fs::write(&config_path, config_content).unwrap();

    let source_def = format!(
        r#"{{"name": "handbook", "kind": "file", "connection": {{"files": [{{"path": "{}"}}]}}}}"#,
        files_dir.display()
    );
    fs::write(root.join("handbook.json"), source_def).unwrap();

    (tmp, config_path)
}

fn run_zerag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = zerag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run zerag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_is_idempotent() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_zerag(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized"));
    assert!(tmp.path().join("data/zerag.sqlite").exists());

    let (_, stderr, success) = run_zerag(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_add_sync_and_inspect_source() {
    let (tmp, config_path) = setup_test_env();
    run_zerag(&config_path, &["init"]);

    let def = tmp.path().join("handbook.json");
    let (stdout, stderr, success) =
        run_zerag(&config_path, &["sources", "add", def.to_str().unwrap()]);
    assert!(success, "sources add failed: {}", stderr);
    assert!(stdout.contains("created data source 1"));

    let (stdout, _, success) = run_zerag(&config_path, &["sources", "test", "1"]);
    assert!(success);
    assert!(stdout.contains("connection ok"));

    let (stdout, stderr, success) = run_zerag(&config_path, &["sync", "1"]);
    assert!(success, "sync failed: {}", stderr);
    assert!(stdout.contains("status: synced"));
    assert!(!stdout.contains("chunks: 0"));

    let (stdout, _, success) = run_zerag(&config_path, &["sources", "list"]);
    assert!(success);
    assert!(stdout.contains("handbook"));
    assert!(stdout.contains("synced"));

    let (stdout, _, success) = run_zerag(&config_path, &["chunks", "1", "--q", "refund"]);
    assert!(success);
    assert!(stdout.contains("Refunds are issued"));
    assert!(!stdout.contains("Gift cards"));

    let (stdout, _, success) = run_zerag(&config_path, &["status", "1"]);
    assert!(success);
    assert!(stdout.contains("progress: 100%"));
}

#[test]
fn test_unknown_source_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_zerag(&config_path, &["init"]);

    let (_, stderr, success) = run_zerag(&config_path, &["sync", "42"]);
    assert!(!success);
    assert!(stderr.contains("data source 42 not found"));

    let (_, _, success) = run_zerag(&config_path, &["sources", "remove", "42"]);
    assert!(!success);
}

#[test]
fn test_ask_without_model_fails_cleanly() {
    let (_tmp, config_path) = setup_test_env();
    run_zerag(&config_path, &["init"]);

    let (_, _, success) = run_zerag(&config_path, &["ask", "What is the refund policy?"]);
    assert!(!success);

    let (_, stderr, success) = run_zerag(&config_path, &["ask", "   "]);
    assert!(!success);
    assert!(stderr.contains("question must not be empty"));
}

#[test]
fn test_missing_config_reports_path() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (_, stderr, success) = run_zerag(&missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("nope.toml"));
}
