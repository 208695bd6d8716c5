mod common;

use assert_cmd::Command;
use predicates::prelude::*;

use common::*;

fn ironpress(cache_dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("ironpress").unwrap();
    cmd.env("RUST_LOG", "error").arg("--cache-dir").arg(cache_dir);
    cmd
}

#[test]
fn optimize_writes_optimized_copies() {
    let images = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_photos(images.path(), 2, 320, 240);

    ironpress(cache.path())
        .args(["optimize", "--format", "webp", "--resize", "hd"])
        .arg(images.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Processing Summary"));

    assert!(images.path().join("photo-0-optimized.webp").exists());
    assert!(images.path().join("photo-1-optimized.webp").exists());
}

#[test]
fn dry_run_lists_numbered_outputs_for_shared_stems() {
    let images = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write(images.path(), "a.jpg", &jpeg_bytes(&photo(40, 30), 90));
    write(images.path(), "a.png", &png_bytes(&photo(40, 30)));

    ironpress(cache.path())
        .args(["optimize", "--dry-run", "--format", "webp"])
        .arg(images.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("a-optimized.webp"))
        .stdout(predicate::str::contains("a-optimized-1.webp"));

    assert_eq!(std::fs::read_dir(images.path()).unwrap().count(), 2);
}

#[test]
fn optimize_json_streams_events() {
    let images = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    write_photos(images.path(), 3, 100, 100);

    let output = ironpress(cache.path())
        .args(["--json", "optimize", "--format", "jpeg", "--output-dir"])
        .arg(out.path())
        .arg(images.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let lines: Vec<serde_json::Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(lines.first().unwrap()["event"], "started");
    assert_eq!(lines.last().unwrap()["event"], "finished");
    let completed = lines.iter().filter(|l| l["event"] == "task_completed").count();
    assert_eq!(completed, 3);
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 3);
}

#[test]
fn optimize_reports_failures_with_exit_code() {
    let images = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_photos(images.path(), 1, 64, 64);
    write(images.path(), "broken.jpg", &corrupt_jpeg());

    ironpress(cache.path())
        .arg("optimize")
        .arg(images.path())
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Failed"));

    assert!(images.path().join("photo-0-optimized.webp").exists());
}

#[test]
fn lossless_jpeg_is_a_configuration_error() {
    let images = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_photos(images.path(), 1, 64, 64);

    ironpress(cache.path())
        .args(["optimize", "--format", "jpeg", "--compression", "lossless"])
        .arg(images.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Lossless"));

    assert!(!images.path().join("photo-0-optimized.jpg").exists());
}

#[test]
fn scan_emits_metadata_and_previews() {
    let images = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_photos(images.path(), 2, 400, 300);

    let output = ironpress(cache.path())
        .args(["--json", "scan"])
        .arg(images.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let events: Vec<serde_json::Value> = stdout.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(events.len(), 2);
    for event in &events {
        assert_eq!(event["event"], "scanned");
        assert_eq!(event["file"]["task"]["detected_mimetype"], "image/jpeg");
        assert!(event["file"]["preview_path"].is_string());
    }

    ironpress(cache.path())
        .args(["--json", "cache", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"entries\":2"));
}

#[test]
fn cache_clear_empties_the_directory() {
    let images = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    let source = write(images.path(), "one.png", &png_bytes(&photo(200, 200)));

    ironpress(cache.path()).arg("thumbnail").arg(&source).assert().success();

    ironpress(cache.path())
        .args(["cache", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 thumbnails"));
}

#[test]
fn profiles_and_example_config() {
    let cache = tempfile::tempdir().unwrap();
    ironpress(cache.path())
        .args(["profiles", "--detailed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("web").and(predicate::str::contains("archive")));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ironpress.toml");
    ironpress(cache.path())
        .args(["example-config", "--output"])
        .arg(&path)
        .assert()
        .success();

    let config = ironpress::Config::from_file(&path).unwrap();
    assert!(config.validate().is_ok());
    assert!(config.profiles.contains_key("email"));
}

#[test]
fn info_as_json() {
    let cache = tempfile::tempdir().unwrap();
    ironpress(cache.path())
        .args(["--json", "info"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cpu_cores"));
}
