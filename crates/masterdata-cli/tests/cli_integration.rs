use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{json, Value};
use tempfile::TempDir;

fn run_mdctl<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_mdctl"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute mdctl binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_mdctl(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "mdctl command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str()
        .unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn temp_dir() -> TempDir {
    TempDir::new().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"))
}

fn write_store(path: &Path, entries: &[(&str, &str)]) {
    let map: BTreeMap<&str, &str> = entries.iter().copied().collect();
    let body = serde_json::to_string_pretty(&map)
        .unwrap_or_else(|err| panic!("failed to encode store: {err}"));
    fs::write(path, body).unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn read_store(path: &Path) -> BTreeMap<String, String> {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body).unwrap_or_else(|err| panic!("store is not a JSON map: {err}"))
}

#[test]
fn every_payload_carries_the_contract_version() {
    let dir = temp_dir();
    let store = dir.path().join("storage.json");

    let shown = run_json(["--store", path_str(&store), "mode", "show"]);
    assert_eq!(shown["contract_version"], json!("mdctl.v1"));
    assert_eq!(shown["mode"], json!("mixed"));
    assert_eq!(shown["flag_is_sane"], json!(true));

    let listed = run_json(["--store", path_str(&store), "category", "list"]);
    assert_eq!(listed["contract_version"], json!("mdctl.v1"));
    let names: Vec<&str> = listed["categories"]
        .as_array()
        .unwrap_or_else(|| panic!("categories should be an array: {listed}"))
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert!(names.contains(&"entity_types"));
}

#[test]
fn mode_switch_persists_to_the_store_file() {
    let dir = temp_dir();
    let store = dir.path().join("storage.json");

    let switched = run_json(["--store", path_str(&store), "mode", "custom-only"]);
    assert_eq!(switched["mode"], json!("custom_only"));
    assert_eq!(switched["changed"], json!(true));
    assert_eq!(
        read_store(&store).get("master_data_mode").map(String::as_str),
        Some("custom_only")
    );

    let again = run_json(["--store", path_str(&store), "mode", "custom-only"]);
    assert_eq!(again["changed"], json!(false));

    let reset = run_json(["--store", path_str(&store), "mode", "reset"]);
    assert_eq!(reset["mode"], json!("mixed"));
}

#[test]
fn category_load_heals_corrupt_entity_types() {
    let dir = temp_dir();
    let store = dir.path().join("storage.json");
    write_store(&store, &[("master_data_entity_types", "not-json")]);

    let loaded = run_json([
        "--store",
        path_str(&store),
        "category",
        "load",
        "entity_types",
    ]);
    assert_eq!(loaded["source"], json!("local"));
    assert_eq!(
        loaded["items"],
        json!(["Commercial", "Non-Profit Organization", "Society", "Trust"])
    );
    assert!(!loaded["issues"]
        .as_array()
        .unwrap_or_else(|| panic!("issues should be an array: {loaded}"))
        .is_empty());
}

#[test]
fn unknown_category_exits_with_failure() {
    let dir = temp_dir();
    let store = dir.path().join("storage.json");
    let output = run_mdctl([
        "--store",
        path_str(&store),
        "category",
        "load",
        "planets",
    ]);
    assert!(!output.status.success());
}

#[test]
fn health_repairs_envelope_and_reports_fix() {
    let dir = temp_dir();
    let store = dir.path().join("storage.json");
    write_store(
        &store,
        &[(
            "master_data_countries",
            r#"{"data":["India","Japan"],"version":1}"#,
        )],
    );

    let report = run_json(["--store", path_str(&store), "health"]);
    assert!(!report["fixedIssues"]
        .as_array()
        .unwrap_or_else(|| panic!("fixedIssues should be an array: {report}"))
        .is_empty());
    assert_eq!(
        read_store(&store)
            .get("master_data_countries")
            .map(String::as_str)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok()),
        Some(json!(["India", "Japan"]))
    );

    let quick = run_json(["--store", path_str(&store), "health", "--quick"]);
    assert_eq!(quick["healthy"], json!(true));
}

#[test]
fn migrate_requires_a_canonical_store() {
    let dir = temp_dir();
    let store = dir.path().join("storage.json");
    let output = run_mdctl(["--store", path_str(&store), "migrate"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--canonical"), "stderr: {stderr}");
}

#[test]
fn migrate_runs_once_then_reads_back_from_canonical() {
    let dir = temp_dir();
    let store = dir.path().join("storage.json");
    let canonical = dir.path().join("canonical.sqlite3");
    write_store(
        &store,
        &[("master_data_reward_types", r#"["Monetary","Recognition"]"#)],
    );
    let base = ["--store", path_str(&store), "--canonical", path_str(&canonical)];

    let first = run_json(base.iter().chain(&["migrate"]));
    assert_eq!(first["migrated"].as_array().map(Vec::len), Some(1));
    assert_eq!(first["completion_flag_set"], json!(true));

    let second = run_json(base.iter().chain(&["migrate"]));
    assert_eq!(second["already_completed"], json!(true));

    let loaded = run_json(base.iter().chain(&["category", "load", "reward_types"]));
    assert_eq!(loaded["source"], json!("canonical"));
    assert_eq!(loaded["items"], json!(["Monetary", "Recognition"]));
}

#[test]
fn cleanup_stale_keeps_primary_keys() {
    let dir = temp_dir();
    let store = dir.path().join("storage.json");
    write_store(
        &store,
        &[
            ("master_data_countries", r#"["India"]"#),
            ("master_data_countries_backup", r#"["Old"]"#),
            ("unrelated_setting", "on"),
        ],
    );

    let cleaned = run_json(["--store", path_str(&store), "cleanup", "stale"]);
    assert_eq!(cleaned["target"], json!("stale"));
    assert_eq!(
        cleaned["report"]["removed"],
        json!(["master_data_countries_backup"])
    );

    let remaining = read_store(&store);
    assert!(remaining.contains_key("master_data_countries"));
    assert!(remaining.contains_key("unrelated_setting"));
    assert!(!remaining.contains_key("master_data_countries_backup"));
}

#[test]
fn session_status_on_empty_store() {
    let dir = temp_dir();
    let store = dir.path().join("storage.json");
    let status = run_json(["--store", path_str(&store), "session", "status"]);
    assert_eq!(status["hasSession"], json!(false));
    assert_eq!(status["hasRememberMe"], json!(false));
    assert_eq!(status["organizationCount"], json!(0));
}
