use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_covmatch<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_covmatch"))
        .args(args)
        .env_remove("COVMATCH_DB")
        .env_remove("COVMATCH_CONFIG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute covmatch binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_covmatch(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "covmatch command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(value.get("contract_version").and_then(Value::as_str), Some("cli.v1"));
    value
}

fn as_i64(value: &Value, pointer: &str) -> i64 {
    value
        .pointer(pointer)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer at `{pointer}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at `{pointer}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_ndjson(path: &Path, rows: &[Value]) {
    let body = rows.iter().map(Value::to_string).collect::<Vec<_>>().join("\n");
    fs::write(path, body).unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

fn square(x: f64) -> Value {
    serde_json::json!({
        "type": "Polygon",
        "coordinates": [[[x, 0.0], [x + 1.0, 0.0], [x + 1.0, 1.0], [x, 1.0], [x, 0.0]]]
    })
}

fn parcel_rows() -> Vec<Value> {
    (1..=4)
        .map(|lot| {
            serde_json::json!({
                "pin_primary": format!("P-{lot}"),
                "plat_name": "Jane's Addition",
                "block": "1",
                "lot": lot.to_string(),
                "street_address": format!("{lot}0 Oak St"),
                "city": "Minneapolis",
                "geometry": square(f64::from(lot))
            })
        })
        .collect()
}

fn subject_row(zoon_subject_id: i64, lot: &str) -> Value {
    serde_json::json!({
        "zoon_subject_id": zoon_subject_id,
        "raw": {
            "bool_covenant": true,
            "covenant_text": "shall never be occupied by",
            "addition": "Janes Addition",
            "block": "1",
            "lot": lot,
            "seller": "A. Seller",
            "buyer": "B. Buyer",
            "deed_date": "1925-04-01"
        }
    })
}

struct Sandbox {
    dir: PathBuf,
    db: PathBuf,
}

impl Sandbox {
    fn new(prefix: &str) -> Self {
        let dir = unique_temp_dir(prefix);
        let db = dir.join("covenants.sqlite3");
        Self { dir, db }
    }

    fn run(&self, args: &[&str]) -> Value {
        let mut full = vec!["--db", path_str(&self.db)];
        full.extend_from_slice(args);
        run_json(full)
    }

    fn load(&self, kind: &str, workflow: &str, rows: &[Value]) -> Value {
        let file = self.dir.join(format!("{kind}.ndjson"));
        write_ndjson(&file, rows);
        self.run(&["load", kind, "--workflow", workflow, "--in", path_str(&file)])
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn db_commands_report_schema_and_integrity() {
    let sandbox = Sandbox::new("covmatch-cli-db");

    let before = sandbox.run(&["db", "schema-version"]);
    assert_eq!(as_i64(&before, "/current_version"), 0);

    let dry_run = sandbox.run(&["db", "migrate", "--dry-run"]);
    assert_eq!(
        dry_run.get("would_apply_versions").and_then(Value::as_array).map(Vec::len),
        Some(2)
    );
    assert_eq!(as_i64(&sandbox.run(&["db", "schema-version"]), "/current_version"), 0);

    let migrate = sandbox.run(&["db", "migrate"]);
    assert_eq!(as_i64(&migrate, "/after_version"), 2);

    let integrity = sandbox.run(&["db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok").and_then(Value::as_bool), Some(true));
}

#[test]
fn end_to_end_load_rebuild_match_and_correct() {
    let sandbox = Sandbox::new("covmatch-cli-e2e");
    let created = sandbox.run(&["workflow", "create", "--name", "Test County"]);
    assert_eq!(as_str(&created, "/name"), "Test County");

    assert_eq!(as_i64(&sandbox.load("parcels", "Test County", &parcel_rows()), "/totals/loaded"), 4);
    let rebuilt = sandbox.run(&["index", "rebuild", "--workflow", "Test County"]);
    assert_eq!(as_i64(&rebuilt, "/summary/candidates"), 4);

    let loaded = sandbox.load("subjects", "Test County", &[subject_row(501, "1-2"), subject_row(502, "4")]);
    assert_eq!(as_i64(&loaded, "/totals/loaded"), 2);

    let report_dir = sandbox.dir.join("reports");
    let run = sandbox.run(&[
        "--report-dir",
        path_str(&report_dir),
        "match",
        "run",
        "--workflow",
        "Test County",
        "--report",
    ]);
    assert_eq!(as_i64(&run, "/summary/subjects"), 2);
    assert_eq!(as_i64(&run, "/summary/matched_records"), 2);
    assert_eq!(as_i64(&run, "/summary/join_hits"), 3);
    assert_eq!(as_i64(&run, "/report_file/entries"), 3);
    assert!(Path::new(as_str(&run, "/report_file/path")).exists());

    let corrections = sandbox.load(
        "corrections",
        "Test County",
        &[serde_json::json!({ "zoon_subject_id": 502, "fields": { "lot": "3" } })],
    );
    assert_eq!(as_i64(&corrections, "/totals/join_hits"), 1);

    let shown = sandbox.run(&["subject", "show", "--workflow", "Test County", "--zoon-subject-id", "502"]);
    assert_eq!(as_str(&shown, "/subject/final_values/lot"), "3");
    assert_eq!(shown.pointer("/subject/has_manual_correction").and_then(Value::as_bool), Some(true));
    assert_eq!(
        shown.pointer("/subject/matches/parcel_addresses").cloned(),
        Some(serde_json::json!(["30 Oak St"]))
    );

    let correction_id = as_i64(&shown, "/manual_corrections/0/id");
    let deleted = sandbox.run(&["correction", "delete", "--correction-id", &correction_id.to_string()]);
    assert_eq!(as_i64(&deleted, "/join_hits"), 1);
    let reverted = sandbox.run(&["subject", "show", "--workflow", "Test County", "--zoon-subject-id", "502"]);
    assert_eq!(as_str(&reverted, "/subject/final_values/lot"), "4");
}

#[test]
fn pin_links_report_unknown_pins_without_failing() {
    let sandbox = Sandbox::new("covmatch-cli-pins");
    sandbox.run(&["workflow", "create", "--name", "Test County"]);
    sandbox.load("parcels", "Test County", &parcel_rows());
    sandbox.run(&["index", "rebuild", "--workflow", "Test County"]);
    sandbox.load("subjects", "Test County", &[subject_row(501, "1")]);

    let linked = sandbox.load(
        "pin-links",
        "Test County",
        &[
            serde_json::json!({ "parcel_pin": "P-4", "zoon_subject_id": 501 }),
            serde_json::json!({ "parcel_pin": "NO-SUCH-PIN", "zoon_subject_id": 501 }),
        ],
    );
    assert_eq!(as_i64(&linked, "/totals/loaded"), 2);

    let shown = sandbox.run(&["subject", "show", "--workflow", "Test County", "--zoon-subject-id", "501"]);
    assert_eq!(
        shown.pointer("/subject/matches/parcel_addresses").cloned(),
        Some(serde_json::json!(["10 Oak St", "40 Oak St"]))
    );

    let subject_id = as_i64(&shown, "/subject/id");
    let rematch = sandbox.run(&["match", "record", "--subject-id", &subject_id.to_string()]);
    let entries = rematch
        .pointer("/report/entries")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("report entries should be an array: {rematch}"));
    assert!(entries.iter().any(|entry| {
        entry.get("join_key").and_then(Value::as_str) == Some("pin:NO-SUCH-PIN")
            && entry.get("matched").and_then(Value::as_bool) == Some(false)
    }));
}

#[test]
fn unknown_workflow_exits_non_zero() {
    let sandbox = Sandbox::new("covmatch-cli-missing");
    let output = run_covmatch([
        "--db",
        path_str(&sandbox.db),
        "match",
        "run",
        "--workflow",
        "Nowhere County",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("workflow not found: Nowhere County"), "stderr was: {stderr}");
}

#[test]
fn normalize_prints_keys_without_a_database() {
    let dir = unique_temp_dir("covmatch-cli-normalize");
    let db = dir.join("never-created.sqlite3");
    let normalized = run_json([
        "--db",
        path_str(&db),
        "normalize",
        "--addition",
        "Jane's Addition to Minneapolis",
        "--block",
        "One",
        "--lot",
        "1 thru 3",
    ]);

    assert_eq!(as_str(&normalized, "/addition"), "janes");
    assert_eq!(as_str(&normalized, "/lot/style"), "range");
    assert_eq!(
        normalized.get("join_keys").cloned(),
        Some(serde_json::json!([]))
    );
    assert!(!db.exists());

    let keyed = run_json(["normalize", "--addition", "Janes Addition", "--block", "2", "--lot", "5,6"]);
    assert_eq!(
        keyed.get("join_keys").cloned(),
        Some(serde_json::json!(["janes block 2 lot 5", "janes block 2 lot 6"]))
    );
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn config_file_supplies_database_path() {
    let sandbox = Sandbox::new("covmatch-cli-config");
    let config = sandbox.dir.join("covmatch.yaml");
    fs::write(&config, format!("db: {}\nworkers: 2\n", path_str(&sandbox.db)))
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", config.display()));

    let created = run_json(["--config", path_str(&config), "workflow", "create", "--name", "From Config"]);
    assert_eq!(as_str(&created, "/name"), "From Config");
    assert!(sandbox.db.exists());

    let listed = sandbox.run(&["workflow", "list"]);
    assert_eq!(as_str(&listed, "/workflows/0/name"), "From Config");

    fs::write(&config, "database: nope.sqlite3\n")
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", config.display()));
    let rejected = run_covmatch(["--config", path_str(&config), "workflow", "list"]);
    assert!(!rejected.status.success());
}
