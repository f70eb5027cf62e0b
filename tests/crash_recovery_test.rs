use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn build_input(input: &Path) {
    fs::create_dir_all(input).expect("mkdir input");
    fs::write(input.join("IMG_20230615.jpg"), vec![1u8; 100]).expect("a");
    fs::write(input.join("IMG_other.jpg"), vec![2u8; 150]).expect("b");
}

/// A pid that is effectively never alive on Linux (beyond pid_max).
const DEAD_PID: u32 = 4_999_999;

fn mediatidy(state_home: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("mediatidy");
    cmd.env("MEDIATIDY_HOME", state_home)
        .env("MEDIATIDY_EXIFTOOL_BIN", "/nonexistent/exiftool")
        .env("MEDIATIDY_UPDATE_TIMESTAMPS", "false");
    cmd
}

fn single_run_id(state_home: &Path) -> String {
    fs::read_dir(state_home.join("runs"))
        .expect("runs dir")
        .map(|e| e.expect("entry").path())
        .next()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .expect("run id")
}

/// Rewrite the durable state the way a crash leaves it: run `running`,
/// one stage record stuck in `running`, and a liveness record whose
/// holder pid is gone.
fn simulate_crash_after_stage_zero(state_home: &Path, run_id: &str) {
    let run_file = state_home.join("runs").join(format!("{run_id}.json"));
    let raw = fs::read_to_string(&run_file).expect("run record");
    fs::write(&run_file, raw.replace("\"completed\"", "\"running\"")).expect("rewrite run");

    let stage_file = state_home
        .join("stages")
        .join(run_id)
        .join("stage_1_resolve-dates.json");
    fs::write(
        &stage_file,
        r#"{
  "stage_index": 1,
  "stage_name": "resolve-dates",
  "status": "running",
  "started_at_epoch_secs": 1700000000,
  "completed_at_epoch_secs": null,
  "input_items": 0,
  "output_items": 0,
  "error_count": 0,
  "attempts": 1,
  "error": null,
  "payload": null
}
"#,
    )
    .expect("write interrupted stage record");

    let process_file = state_home.join("processes").join(format!("{run_id}.json"));
    fs::create_dir_all(state_home.join("processes")).expect("mkdir processes");
    fs::write(
        &process_file,
        format!(
            r#"{{
  "run_id": "{run_id}",
  "pid": {DEAD_PID},
  "hostname": "test-host",
  "started_at_epoch_secs": 1700000000,
  "heartbeat_epoch_secs": 1700000000
}}
"#
        ),
    )
    .expect("write stale process record");
}

#[test]
fn orphan_scan_then_resume_reexecutes_only_the_interrupted_stage() {
    let tmp = tempdir().expect("tempdir");
    let state_home = tmp.path().join("state");
    let input = tmp.path().join("takeout");
    let output = tmp.path().join("library");
    build_input(&input);

    // dry-run keeps the filesystem untouched so the crash simulation only
    // has durable state to rewind
    mediatidy(&state_home)
        .current_dir(tmp.path())
        .arg("start")
        .arg("--dry-run")
        .arg(&input)
        .arg(&output)
        .assert()
        .success();

    // rebuild a pristine pre-crash state: keep stage 0, drop everything after
    let run_id = single_run_id(&state_home);
    let stages_dir = state_home.join("stages").join(&run_id);
    for entry in fs::read_dir(&stages_dir).expect("stages dir") {
        let path = entry.expect("entry").path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if !name.starts_with("stage_0_") {
            fs::remove_file(&path).expect("drop later stage record");
        }
    }
    simulate_crash_after_stage_zero(&state_home, &run_id);

    // the orphan scan must fail the run, not leave it stuck in running
    mediatidy(&state_home)
        .current_dir(tmp.path())
        .arg("cancel-orphans")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("marked failed: {run_id}")));

    mediatidy(&state_home)
        .current_dir(tmp.path())
        .arg("status")
        .arg(&run_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("status=failed"))
        .stdout(predicate::str::contains("orphaned"));

    let stage0_file = stages_dir.join("stage_0_discover.json");
    let stage0_before = fs::read_to_string(&stage0_file).expect("stage 0 before");

    // resume continues at the interrupted stage; completed work is untouched
    mediatidy(&state_home)
        .current_dir(tmp.path())
        .arg("resume")
        .arg(&run_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("outcome=completed"));

    let stage0_after = fs::read_to_string(&stage0_file).expect("stage 0 after");
    assert_eq!(stage0_before, stage0_after);

    mediatidy(&state_home)
        .current_dir(tmp.path())
        .arg("status")
        .arg(&run_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("status=completed"))
        .stdout(predicate::str::contains("progress=7/7"));
}

#[test]
fn resume_refuses_a_run_still_marked_running() {
    let tmp = tempdir().expect("tempdir");
    let state_home = tmp.path().join("state");
    let input = tmp.path().join("takeout");
    let output = tmp.path().join("library");
    build_input(&input);

    mediatidy(&state_home)
        .current_dir(tmp.path())
        .arg("start")
        .arg(&input)
        .arg(&output)
        .assert()
        .success();

    let run_id = single_run_id(&state_home);
    let run_file = state_home.join("runs").join(format!("{run_id}.json"));
    let raw = fs::read_to_string(&run_file).expect("run record");
    fs::write(&run_file, raw.replace("\"completed\"", "\"running\"")).expect("rewrite");

    mediatidy(&state_home)
        .current_dir(tmp.path())
        .arg("resume")
        .arg(&run_id)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cancel-orphans"));
}

#[test]
fn pause_request_is_recorded_for_the_next_boundary() {
    let tmp = tempdir().expect("tempdir");
    let state_home = tmp.path().join("state");
    let input = tmp.path().join("takeout");
    let output = tmp.path().join("library");
    build_input(&input);

    mediatidy(&state_home)
        .current_dir(tmp.path())
        .arg("start")
        .arg(&input)
        .arg(&output)
        .assert()
        .success();

    let run_id = single_run_id(&state_home);
    mediatidy(&state_home)
        .current_dir(tmp.path())
        .arg("pause")
        .arg(&run_id)
        .assert()
        .success()
        .stdout(predicate::str::contains("next stage boundary"));

    let control = fs::read_to_string(state_home.join("control").join(format!("{run_id}.json")))
        .expect("control file");
    assert!(control.contains("\"pause_requested\": true"));
}
