use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use octlens_core::logging::{crash_dir, install_crash_reporter};
use tempfile::tempdir;

const CHILD_MODE_ENV: &str = "OCTLENS_PANIC_CHILD_MODE";
const CHILD_DATA_DIR_ENV: &str = "OCTLENS_PANIC_CHILD_DATA_DIR";

/// Re-run this test binary, executing only the child entrypoint in `mode`.
fn run_panic_child(mode: &str, data_dir: &Path) -> Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .args(["panic_hook_child_entrypoint", "--exact", "--nocapture"])
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(CHILD_MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(CHILD_DATA_DIR_ENV).expect("child data dir"));
    let crash_dir = crash_dir(&data_dir);

    assert!(install_crash_reporter(crash_dir.clone()));
    assert!(!install_crash_reporter(data_dir.join("elsewhere")));
    assert!(!crash_dir.exists(), "crash dir is created lazily");

    match mode.as_str() {
        "write_success" => panic!("saliency worker panicked"),
        "write_failure" => {
            fs::create_dir_all(crash_dir.parent().expect("log dir")).expect("create log dir");
            fs::write(&crash_dir, b"not-a-directory").expect("block crash directory");
            panic!("annotation worker panicked");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn panic_writes_json_crash_report_under_data_dir() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_success", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let reports: Vec<PathBuf> = fs::read_dir(crash_dir(data_dir.path()))
        .expect("read crash directory")
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    assert_eq!(reports.len(), 1, "expected one crash report");
    assert!(!data_dir.path().join("elsewhere").exists());

    let report: serde_json::Value =
        serde_json::from_slice(&fs::read(&reports[0]).expect("read crash report"))
            .expect("crash report is json");
    assert_eq!(report["message"], "saliency worker panicked");
    assert!(report["location"].as_str().is_some_and(|loc| loc.contains("crash_hook.rs")));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Crash report written to"));
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn unwritable_crash_dir_warns_without_repanicking() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("write_failure", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("annotation worker panicked"));
    assert!(stderr.contains("Warning: could not write crash report under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
