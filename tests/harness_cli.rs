use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;

fn harness() -> Command {
    Command::cargo_bin("bc-harness").expect("bc-harness binary")
}

fn script_file(name: &str, body: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("bc-harness-{}-{}.bcs", std::process::id(), name));
    fs::write(&path, body).expect("write script");
    path
}

const SETUP: &str = "\
init --unpaced
create-datablock 1 --capacity 32
create-message 1 rt-bc 1 1 1 32
create-opcode 1 xeq 1
create-opcode 2 cal 1
create-frame 1 minor --opcodes 1
create-frame 2 major --opcodes 2 --period 10
install-buffer 16
";

#[test]
fn demo_decodes_first_message() {
    let output = harness().arg("demo").assert().success().get_output().clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("started major frame 2"));
    assert!(stdout.contains("message 1 RT->BC Bus A cmd 0C20"));
    assert!(stdout.contains("words 32 [0840 0841"));
    assert!(stdout.contains("freed"));
}

#[test]
fn script_from_stdin() {
    let script = format!("{}validate\nrun 2 3\nstatus\nfree\n", SETUP);
    let output = harness()
        .arg("run")
        .write_stdin(script)
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ran 3 cycles: 0 overruns, 3 transfers"));
    assert!(stdout.contains("state Stopped major 2 cycles 3"));
}

#[test]
fn start_without_validation_is_not_ready() {
    let path = script_file("not-ready", &format!("{}start 2 -1\n", SETUP));
    let output = harness()
        .arg("run")
        .arg(&path)
        .assert()
        .code(1)
        .get_output()
        .clone();
    let _ = fs::remove_file(&path);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("error: NotReady: line 9"), "{}", stderr);
}

#[test]
fn deleting_referenced_block_is_resource_in_use() {
    let output = harness()
        .arg("run")
        .write_stdin(format!("{}delete-datablock 1\n", SETUP))
        .assert()
        .code(1)
        .get_output()
        .clone();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error: ResourceInUse:"), "{}", stderr);
}

#[test]
fn recursive_frames_are_a_cycle() {
    let script = "\
init
create-opcode 1 cal 1
create-frame 1 minor --opcodes 1
validate
";
    let output = harness()
        .arg("run")
        .write_stdin(script)
        .assert()
        .code(1)
        .get_output()
        .clone();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error: Cycle:"), "{}", stderr);
}

#[test]
fn malformed_line_is_a_usage_error() {
    harness()
        .arg("run")
        .write_stdin("init\nstart two\n")
        .assert()
        .code(2);
}

#[test]
fn missing_script_file() {
    harness()
        .arg("run")
        .arg("/nonexistent/bc-harness.bcs")
        .assert()
        .code(1);
}

#[test]
fn background_fault_is_reported_by_stop() {
    let script = format!(
        "{}validate\nstart 2 -1\nwait-cycles 1\ndelete-message 1\nsleep 100\nstop\nfree\n",
        SETUP
    );
    let output = harness()
        .arg("run")
        .write_stdin(script)
        .assert()
        .code(1)
        .get_output()
        .clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stdout.contains("stopped"), "{}", stdout);
    assert!(stderr.starts_with("error: NotFound: line 14"), "{}", stderr);
}
