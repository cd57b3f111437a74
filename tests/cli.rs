// Command-line behaviour of the ptxverify binary.

use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

const CLEAN: &str = r#"
.visible .entry clean()
.maxntid 32, 1, 1
{
    .shared .align 4 .b8 buf[128];
    mov.u32 %r1, %tid.x;
    shl.b32 %r2, %r1, 2;
    mov.u32 %r3, buf;
    add.u32 %r4, %r3, %r2;
    st.shared.u32 [%r4], %r1;
    bar.sync 0;
    ld.shared.u32 %r5, [buf];
    ret;
}
"#;

fn ptx_file(source: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(source.as_bytes()).unwrap();
    file
}

fn ptxverify(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ptxverify"))
        .args(args)
        .env_remove("PTXVERIFY_THREADS")
        .env_remove("PTXVERIFY_POOL")
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_clean_kernel_passes() {
    let file = ptx_file(CLEAN);
    let out = ptxverify(&[file.path().to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(0));
    assert!(stdout(&out).contains("Verification PASSED"));
}

#[test]
fn test_race_exits_with_failure() {
    let file = ptx_file(&CLEAN.replace("bar.sync 0;", ""));
    let out = ptxverify(&[file.path().to_str().unwrap(), "--max-races", "2"]);
    assert_eq!(out.status.code(), Some(3));
    let text = stdout(&out);
    assert_eq!(text.matches("ERROR: race").count(), 2);
    assert!(text.contains("Verification FAILED"));
}

#[test]
fn test_json_report() {
    let file = ptx_file(CLEAN);
    let out = ptxverify(&[file.path().to_str().unwrap(), "--json", "--instrument", "--pool", "2"]);
    assert_eq!(out.status.code(), Some(0));
    let value: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(value["kernel"], "clean");
    assert_eq!(value["threads"], 32);
    assert_eq!(value["verdict"], "pass");
    assert_eq!(value["timings"].as_array().map(Vec::len), Some(6));
}

#[test]
fn test_verbose_prints_statistics() {
    let file = ptx_file(CLEAN);
    let out = ptxverify(&[file.path().to_str().unwrap(), "--verbose"]);
    assert_eq!(out.status.code(), Some(0));
    let text = stdout(&out);
    assert!(text.contains("Static instructions"));
    assert!(text.contains("bar.sync"));
}

#[test]
fn test_thread_count_from_env() {
    let file = ptx_file(&CLEAN.replace(".maxntid 32, 1, 1", ""));
    let out = Command::new(env!("CARGO_BIN_EXE_ptxverify"))
        .arg(file.path())
        .env("PTXVERIFY_THREADS", "8x4")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(0));
    assert!(stdout(&out).contains("threads=32"));
}

#[test]
fn test_usage_errors() {
    assert_eq!(ptxverify(&[]).status.code(), Some(1));
    assert_eq!(ptxverify(&["/nonexistent/k.ptx"]).status.code(), Some(1));
    assert_eq!(ptxverify(&["--bogus-flag"]).status.code(), Some(1));

    let file = ptx_file(&CLEAN.replace(".maxntid 32, 1, 1", ""));
    let out = ptxverify(&[file.path().to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("no thread count"));

    let out = ptxverify(&[file.path().to_str().unwrap(), "-n", "70000x70000"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn test_structural_errors() {
    let file = ptx_file(CLEAN);
    let out = ptxverify(&[file.path().to_str().unwrap(), "--threads", "64"]);
    assert_eq!(out.status.code(), Some(2));

    let file = ptx_file(".entry k()\n{\nbra NOWHERE;\n}\n");
    let out = ptxverify(&[file.path().to_str().unwrap(), "-n", "4"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("NOWHERE"));
}

#[test]
fn test_live_snapshot_written() {
    let file = ptx_file(CLEAN);
    let dir = tempfile::tempdir().unwrap();
    let live = dir.path().join("live.json");
    let out = ptxverify(&[
        file.path().to_str().unwrap(),
        "--live",
        live.to_str().unwrap(),
    ]);
    assert_eq!(out.status.code(), Some(0));
    let metrics = ptxverify::metrics::read_metrics(&live).unwrap();
    assert_eq!(metrics.status, "complete");
    assert_eq!(metrics.threads, 32);
}
