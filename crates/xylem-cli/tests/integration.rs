//! Integration tests for the xylem CLI.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn xylem_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_xylem"))
}

/// Run the CLI with an empty config so user settings don't leak in.
fn xylem(dir: &Path, args: &[&str]) -> Output {
    Command::new(xylem_bin())
        .arg("--config")
        .arg(dir.join("no-config.toml"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute command")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn copy_workflow(dir: &Path, text: &str, out: &Path) -> PathBuf {
    let path = dir.join("copy.yaml");
    let yaml = format!(
        r#"
name: copy
root:
  module: source.text
  name: input
  options:
    text: "{text}"
  children:
    - module: passthrough
      children:
        - module: sink.file
          name: output
          options:
            path: "{}"
"#,
        out.display()
    );
    fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_help() {
    let dir = tempfile::tempdir().unwrap();
    let output = xylem(dir.path(), &["--help"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("Concurrent module pipelines"));
}

#[test]
fn test_list() {
    let dir = tempfile::tempdir().unwrap();
    let output = xylem(dir.path(), &["list"]);

    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("Available modules"));
    assert!(out.contains("passthrough"));
    assert!(out.contains("analysis.minkowski-distance-matrix"));
}

#[test]
fn test_describe() {
    let dir = tempfile::tempdir().unwrap();
    let output = xylem(dir.path(), &["describe", "source.file"]);

    assert!(output.status.success(), "{}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("\"chunk size\""));
    assert!(out.contains("required"));
    assert!(out.contains("output"));
}

#[test]
fn test_describe_suggests_module() {
    let dir = tempfile::tempdir().unwrap();
    let output = xylem(dir.path(), &["describe", "sink.fil"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("Did you mean 'sink.file'?"));
}

#[test]
fn test_show_tree() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = copy_workflow(dir.path(), "abc", &dir.path().join("out.txt"));

    let output = xylem(dir.path(), &["show", workflow.to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr(&output));

    let out = stdout(&output);
    assert!(out.contains("Workflow: copy"));
    assert!(out.contains("input [I/O]"));
    assert!(out.contains("Passthrough"));
    assert!(out.contains("(output -> input, char)"));
    assert!(out.contains("3 modules"));
    // Show builds but never runs.
    assert!(!dir.path().join("out.txt").exists());
}

#[test]
fn test_run_copies_text() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let workflow = copy_workflow(dir.path(), "hello xylem", &out);

    let output = xylem(dir.path(), &["run", workflow.to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(fs::read_to_string(&out).unwrap(), "hello xylem");
    assert!(stderr(&output).contains("Completed"));
}

#[test]
fn test_run_with_set_and_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.txt");
    let workflow = copy_workflow(dir.path(), "ignored", &out);

    let output = xylem(
        dir.path(),
        &[
            "run",
            workflow.to_str().unwrap(),
            "--set",
            "input.text=overridden",
            "--pipe-capacity",
            "1",
        ],
    );
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(fs::read_to_string(&out).unwrap(), "overridden");
}

#[test]
fn test_run_set_unknown_node() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = copy_workflow(dir.path(), "x", &dir.path().join("out.txt"));

    let output = xylem(
        dir.path(),
        &["run", workflow.to_str().unwrap(), "--set", "inptu.text=y"],
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Did you mean 'input'?"));
}

#[test]
fn test_run_reports_module_failure() {
    let dir = tempfile::tempdir().unwrap();
    let workflow = dir.path().join("broken.yaml");
    fs::write(
        &workflow,
        format!(
            r#"
root:
  module: source.file
  options:
    path: "{}"
  children:
    - module: sink.file
      options:
        path: "{}"
"#,
            dir.path().join("missing.txt").display(),
            dir.path().join("out.txt").display()
        ),
    )
    .unwrap();

    let output = xylem(dir.path(), &["run", workflow.to_str().unwrap()]);
    assert!(!output.status.success());

    let err = stderr(&output);
    assert!(err.contains("Workflow failed"), "{err}");
    assert!(err.contains("FAILED"), "{err}");
    // The sink still drains and completes.
    assert!(err.contains("File Sink"), "{err}");
}

#[test]
fn test_run_minkowski_toml() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("vectors.csv");
    let out = dir.path().join("matrix.json");
    fs::write(&input, "a;b\na;0;0\nb;3;4\n").unwrap();

    let workflow = dir.path().join("matrix.toml");
    fs::write(
        &workflow,
        format!(
            r#"
name = "matrix"

[root]
module = "source.file"
options = {{ path = "{}" }}

[[root.children]]
module = "analysis.minkowski-distance-matrix"
name = "distances"

[[root.children.children]]
module = "sink.file"
options = {{ path = "{}" }}
"#,
            input.display(),
            out.display()
        ),
    )
    .unwrap();

    let output = xylem(
        dir.path(),
        &["run", workflow.to_str().unwrap(), "--preset", "manhattan"],
    );
    assert!(output.status.success(), "{}", stderr(&output));

    let text = fs::read_to_string(&out).unwrap();
    assert!(text.contains("\"a\""), "{text}");
    assert!(text.contains("7.0"), "{text}");
}

#[test]
fn test_run_missing_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let output = xylem(dir.path(), &["run", dir.path().join("nope.yaml").to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("file not found"));
}

#[test]
fn test_presets() {
    let dir = tempfile::tempdir().unwrap();
    let output = xylem(dir.path(), &["presets"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("manhattan"));
}

#[test]
fn test_completions() {
    let dir = tempfile::tempdir().unwrap();
    let output = xylem(dir.path(), &["completions", "bash"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("xylem"));
}
