use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn sitebrain_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("sitebrain");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // The api keys are placeholders: these tests never reach a provider
    // (zero-chunk documents skip embedding entirely).
    let config_content = format!(
        r#"[db]
path = "{}/data/sitebrain.sqlite"

[embedding]
api_key = "test-key"

[completion]
api_key = "test-key"

[server]
bind = "127.0.0.1:8787"
"#,
        root.display()
    );

    let config_path = config_dir.join("sitebrain.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_sitebrain(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = sitebrain_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run sitebrain binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_sitebrain(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_sitebrain(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_sitebrain(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_tiny_document_is_ready_with_zero_chunks() {
    let (tmp, config_path) = setup_test_env();

    // Under the minimum chunk length: the document completes without a
    // single embedding call, so no provider is needed.
    let file = tmp.path().join("note.txt");
    fs::write(&file, "tiny note").unwrap();

    run_sitebrain(&config_path, &["init"]);
    let (stdout, stderr, success) =
        run_sitebrain(&config_path, &["ingest", "site-1", file.to_str().unwrap()]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("status: ready"));
    assert!(stdout.contains("chunks: 0"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_ingest_rejects_unsupported_extension() {
    let (tmp, config_path) = setup_test_env();

    let file = tmp.path().join("image.png");
    fs::write(&file, [0x89u8, 0x50, 0x4e, 0x47]).unwrap();

    run_sitebrain(&config_path, &["init"]);
    let (_, stderr, success) =
        run_sitebrain(&config_path, &["ingest", "site-1", file.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("unsupported file type"));
}

#[test]
fn test_ingest_rejects_empty_file() {
    let (tmp, config_path) = setup_test_env();

    let file = tmp.path().join("empty.txt");
    fs::write(&file, "").unwrap();

    run_sitebrain(&config_path, &["init"]);
    let (_, stderr, success) =
        run_sitebrain(&config_path, &["ingest", "site-1", file.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("empty"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _) = setup_test_env();

    let bad_config = tmp.path().join("bad.toml");
    fs::write(
        &bad_config,
        "[db]\npath = \"/tmp/x.sqlite\"\n[retrieval]\nsimilarity_threshold = 3.0\n",
    )
    .unwrap();

    let (_, stderr, success) = run_sitebrain(&bad_config, &["init"]);
    assert!(!success);
    assert!(stderr.contains("similarity_threshold"));
}

#[test]
fn test_missing_config_file_fails_with_path() {
    let (tmp, _) = setup_test_env();

    let missing = tmp.path().join("nope.toml");
    let (_, stderr, success) = run_sitebrain(&missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("nope.toml"));
}
