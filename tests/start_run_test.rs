use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn build_takeout_fixture(input: &Path) {
    let album = input.join("Trip to Rome");
    let year_bucket = input.join("Photos from 2021");
    fs::create_dir_all(&album).expect("mkdir album");
    fs::create_dir_all(&year_bucket).expect("mkdir year bucket");

    // dated by sidecar: 2021-06-15 00:00:00 UTC
    fs::write(album.join("IMG_001.jpg"), vec![10u8; 120]).expect("img 1");
    fs::write(
        album.join("IMG_001.jpg.json"),
        r#"{"photoTakenTime":{"timestamp":"1623715200"}}"#,
    )
    .expect("sidecar 1");
    fs::write(
        album.join("metadata.json"),
        r#"{"title":"Trip to Rome"}"#,
    )
    .expect("album metadata");

    // byte-identical duplicate of IMG_001 under the year bucket
    fs::write(year_bucket.join("IMG_dup.jpg"), vec![10u8; 120]).expect("dup");

    // dated only by filename
    fs::write(year_bucket.join("VID_20210320_101500.mp4"), vec![20u8; 300]).expect("vid");

    // nothing to date it but the folder bucket
    fs::write(year_bucket.join("scan.png"), vec![30u8; 77]).expect("scan");
}

#[test]
fn start_organizes_a_takeout_tree_end_to_end() {
    let tmp = tempdir().expect("tempdir");
    let state_home = tmp.path().join("state");
    let input = tmp.path().join("takeout");
    let output = tmp.path().join("library");
    build_takeout_fixture(&input);

    assert_cmd::cargo::cargo_bin_cmd!("mediatidy")
        .current_dir(tmp.path())
        .env("MEDIATIDY_HOME", &state_home)
        .env("MEDIATIDY_EXIFTOOL_BIN", "/nonexistent/exiftool")
        .env("MEDIATIDY_UPDATE_TIMESTAMPS", "false")
        .arg("start")
        .arg(&input)
        .arg(&output)
        .assert()
        .success()
        .stdout(predicate::str::contains("outcome=completed"));

    // sidecar date wins for the representative
    assert!(output.join("2021/06/IMG_001.jpg").exists());
    // filename-dated video
    assert!(output.join("2021/03/VID_20210320_101500.mp4").exists());
    // folder bucket dates the scan to Jan 1
    assert!(output.join("2021/01/scan.png").exists());
    // the superseded duplicate is left in place, not organized
    assert!(input.join("Photos from 2021/IMG_dup.jpg").exists());
    assert!(!output.join("2021/06/IMG_dup.jpg").exists());

    // album manifest references the organized representative path
    let manifest = fs::read_to_string(output.join("albums.json")).expect("manifest");
    assert!(manifest.contains("Trip to Rome"));
    assert!(manifest.contains("2021/06/IMG_001.jpg"));

    // durable state: run record, one stage record per stage, audit log
    let runs_dir = state_home.join("runs");
    let run_files: Vec<_> = fs::read_dir(&runs_dir)
        .expect("runs dir")
        .map(|e| e.expect("entry").path())
        .collect();
    assert_eq!(run_files.len(), 1);
    let run_raw = fs::read_to_string(&run_files[0]).expect("run record");
    assert!(run_raw.contains("\"status\": \"completed\""));
    assert!(state_home.join("logs/audit.log").exists());
}

#[test]
fn status_and_list_report_the_finished_run() {
    let tmp = tempdir().expect("tempdir");
    let state_home = tmp.path().join("state");
    let input = tmp.path().join("takeout");
    let output = tmp.path().join("library");
    build_takeout_fixture(&input);

    assert_cmd::cargo::cargo_bin_cmd!("mediatidy")
        .current_dir(tmp.path())
        .env("MEDIATIDY_HOME", &state_home)
        .env("MEDIATIDY_EXIFTOOL_BIN", "/nonexistent/exiftool")
        .env("MEDIATIDY_UPDATE_TIMESTAMPS", "false")
        .arg("start")
        .arg(&input)
        .arg(&output)
        .assert()
        .success();

    let list_output = assert_cmd::cargo::cargo_bin_cmd!("mediatidy")
        .current_dir(tmp.path())
        .env("MEDIATIDY_HOME", &state_home)
        .arg("list")
        .arg("--status")
        .arg("completed")
        .output()
        .expect("list output");
    assert!(list_output.status.success());
    let stdout = String::from_utf8_lossy(&list_output.stdout).to_string();
    assert!(stdout.contains("runs=1"));

    let run_id = stdout
        .lines()
        .find(|line| line.contains("status=completed"))
        .and_then(|line| line.split_whitespace().next())
        .expect("run id in listing")
        .to_string();

    assert_cmd::cargo::cargo_bin_cmd!("mediatidy")
        .current_dir(tmp.path())
        .env("MEDIATIDY_HOME", &state_home)
        .arg("status")
        .arg(&run_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("progress=7/7"))
        .stdout(predicate::str::contains("stage[2] dedup status=completed"));
}

#[test]
fn rerunning_a_completed_stage_is_a_cached_noop() {
    let tmp = tempdir().expect("tempdir");
    let state_home = tmp.path().join("state");
    let input = tmp.path().join("takeout");
    let output = tmp.path().join("library");
    build_takeout_fixture(&input);

    assert_cmd::cargo::cargo_bin_cmd!("mediatidy")
        .current_dir(tmp.path())
        .env("MEDIATIDY_HOME", &state_home)
        .env("MEDIATIDY_EXIFTOOL_BIN", "/nonexistent/exiftool")
        .env("MEDIATIDY_UPDATE_TIMESTAMPS", "false")
        .arg("start")
        .arg(&input)
        .arg(&output)
        .assert()
        .success();

    let run_id = fs::read_dir(state_home.join("runs"))
        .expect("runs dir")
        .map(|e| e.expect("entry").path())
        .next()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .expect("run id");

    let stage_file = state_home
        .join("stages")
        .join(&run_id)
        .join("stage_0_discover.json");
    let before = fs::read_to_string(&stage_file).expect("stage record before");

    assert_cmd::cargo::cargo_bin_cmd!("mediatidy")
        .current_dir(tmp.path())
        .env("MEDIATIDY_HOME", &state_home)
        .arg("run-stage")
        .arg(&run_id)
        .arg("discover")
        .assert()
        .success()
        .stdout(predicate::str::contains("status=completed"));

    let after = fs::read_to_string(&stage_file).expect("stage record after");
    assert_eq!(before, after, "unforced re-run must not rewrite the record");
}

#[test]
fn start_fails_cleanly_on_missing_input_root() {
    let tmp = tempdir().expect("tempdir");
    let state_home = tmp.path().join("state");

    assert_cmd::cargo::cargo_bin_cmd!("mediatidy")
        .current_dir(tmp.path())
        .env("MEDIATIDY_HOME", &state_home)
        .arg("start")
        .arg(tmp.path().join("does-not-exist"))
        .arg(tmp.path().join("library"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("input root"));
}
