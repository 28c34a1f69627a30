use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;

struct TempDb {
    path: PathBuf,
}

impl TempDb {
    fn new() -> Self {
        let name = format!("metadata-manager-cli-{}.sqlite3", ulid::Ulid::new());
        Self { path: std::env::temp_dir().join(name) }
    }

    fn path_str(&self) -> &str {
        self.path
            .to_str()
            .unwrap_or_else(|| panic!("path should be valid UTF-8: {}", self.path.display()))
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{suffix}", self.path.display()));
        }
    }
}

fn run_mm<I, S>(db: &TempDb, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_mm"))
        .arg("--db")
        .arg(db.path_str())
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute mm binary: {err}"))
}

fn run_json<I, S>(db: &TempDb, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_mm(db, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "mm command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

/// Run a command expected to fail; returns the exit code and the stderr JSON body.
fn run_failure<I, S>(db: &TempDb, args: I) -> (i32, Value)
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_mm(db, args);
    assert!(!output.status.success(), "command unexpectedly succeeded");
    let code = output.status.code().unwrap_or_else(|| panic!("mm was terminated by a signal"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    let start = stderr
        .find("{\n")
        .unwrap_or_else(|| panic!("stderr has no JSON error body:\n{stderr}"));
    let body = serde_json::from_str(&stderr[start..])
        .unwrap_or_else(|err| panic!("stderr is not valid JSON: {err}\nstderr:\n{stderr}"));
    validate_schema("error.schema.json", &body);
    (code, body)
}

/// CSV file in the temp dir, removed on drop.
struct TempCsv {
    path: PathBuf,
}

impl TempCsv {
    fn new(contents: &str) -> Self {
        let name = format!("metadata-manager-import-{}.csv", ulid::Ulid::new());
        let path = std::env::temp_dir().join(name);
        fs::write(&path, contents)
            .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
        Self { path }
    }

    fn path_str(&self) -> &str {
        self.path
            .to_str()
            .unwrap_or_else(|| panic!("path should be valid UTF-8: {}", self.path.display()))
    }
}

impl Drop for TempCsv {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn as_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string at `{pointer}` in payload: {value}"))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn add_record(db: &TempDb, kind: &str, fields: &[&str]) -> String {
    let mut args = vec!["record", "add", "--kind", kind];
    for field in fields {
        args.push("--field");
        args.push(*field);
    }
    let payload = run_json(db, args);
    validate_schema("record.schema.json", &payload);
    as_str(&payload, "/record/id").to_string()
}

#[test]
fn schema_version_reports_pending_migrations_until_migrate() {
    let db = TempDb::new();

    let before = run_json(&db, ["db", "schema-version"]);
    validate_schema("schema-version.schema.json", &before);
    assert_eq!(before["up_to_date"], Value::Bool(false));

    let dry_run = run_json(&db, ["db", "migrate", "--dry-run"]);
    assert_eq!(dry_run["would_apply_versions"], serde_json::json!([1, 2, 3]));
    assert_eq!(dry_run["after_version"], Value::Null);

    let migrated = run_json(&db, ["db", "migrate"]);
    assert_eq!(migrated["up_to_date"], Value::Bool(true));

    let after = run_json(&db, ["db", "schema-version"]);
    validate_schema("schema-version.schema.json", &after);
    assert_eq!(after["pending_versions"], serde_json::json!([]));

    let integrity = run_json(&db, ["db", "integrity-check"]);
    assert_eq!(integrity["quick_check_ok"], Value::Bool(true));
    assert_eq!(integrity["history_gaps"], serde_json::json!([]));
}

#[test]
fn update_then_diff_prints_changes_in_field_order() {
    let db = TempDb::new();
    let id = add_record(&db, "project", &["project_id=PO", "name=Alpha"]);

    let mut args = vec!["record", "update", "--id", id.as_str()];
    args.extend(["--field", "name=Beta", "--field", "description=X"]);
    let updated = run_json(&db, args);
    validate_schema("record.schema.json", &updated);

    let history = run_json(&db, ["history", "list", "--id", id.as_str()]);
    validate_schema("history-list.schema.json", &history);
    let positions = history["entries"]
        .as_array()
        .unwrap_or_else(|| panic!("entries should be an array: {history}"))
        .iter()
        .map(|entry| entry["position"].as_i64().unwrap_or_default())
        .collect::<Vec<_>>();
    assert_eq!(positions, vec![2, 1]);

    let delta = run_json(&db, ["history", "diff", "--id", id.as_str()]);
    validate_schema("history-diff.schema.json", &delta);
    assert_eq!(
        delta["summary"],
        serde_json::json!(["name changed from Alpha to Beta", "description changed from None to X"])
    );

    let text = run_mm(&db, ["history", "diff", "--id", id.as_str(), "--format", "text"]);
    assert!(text.status.success());
    assert_eq!(
        String::from_utf8_lossy(&text.stdout),
        "name changed from Alpha to Beta\ndescription changed from None to X\n"
    );
}

#[test]
fn diff_of_a_single_entry_needs_the_initial_flag() {
    let db = TempDb::new();
    let id = add_record(&db, "subject", &["subject_id=SBJ00001"]);

    let (code, body) = run_failure(&db, ["history", "diff", "--id", id.as_str()]);
    assert_eq!(code, 4);
    assert_eq!(as_str(&body, "/error/kind"), "not_found");

    let initial = run_json(&db, ["history", "diff", "--id", id.as_str(), "--initial"]);
    validate_schema("history-diff.schema.json", &initial);
    assert_eq!(initial["older_position"], Value::Null);
    assert_eq!(initial["summary"], serde_json::json!(["subject_id changed from None to SBJ00001"]));
}

#[test]
fn list_filters_by_keyword_and_ignores_unknown_keys() {
    let db = TempDb::new();
    let alpha = add_record(&db, "project", &["project_id=P1", "name=Alpha"]);
    add_record(&db, "project", &["project_id=P2", "name=Beta"]);

    let listed = run_json(
        &db,
        ["record", "list", "--kind", "project", "--keyword", "name=alpha", "--keyword", "page=2"],
    );
    validate_schema("record-list.schema.json", &listed);
    assert_eq!(listed["count"], serde_json::json!(1));
    assert_eq!(listed["scanned"], serde_json::json!(2));
    assert_eq!(as_str(&listed, "/records/0/id"), alpha);
    assert_eq!(listed["ignored_keys"], serde_json::json!(["page"]));

    let mut args = vec!["record", "list", "--kind", "project"];
    args.extend(["--keyword", "projectId=P1", "--keyword", "projectId=P2"]);
    let either = run_json(&db, args);
    assert_eq!(either["count"], serde_json::json!(2));

    let limited = run_json(&db, ["record", "list", "--kind", "project", "--limit", "1"]);
    assert_eq!(limited["count"], serde_json::json!(1));
    assert_eq!(limited["scanned"], serde_json::json!(1));

    let acronym = format!("orcabusID={alpha}");
    let by_id = run_json(&db, ["record", "list", "--kind", "project", "--keyword", &acronym]);
    assert_eq!(by_id["ignored_keys"], serde_json::json!([]));
    assert_eq!(as_str(&by_id, "/records/0/id"), alpha);
}

#[test]
fn malformed_typed_keyword_is_a_validation_error() {
    let db = TempDb::new();
    add_record(&db, "library", &["library_id=L2400001", "coverage=40"]);

    let (code, body) =
        run_failure(&db, ["record", "list", "--kind", "library", "--keyword", "coverage=deep"]);
    assert_eq!(code, 3);
    assert_eq!(as_str(&body, "/error/kind"), "validation");
}

#[test]
fn unlink_contact_updates_project_view_and_reports_missing_association() {
    let db = TempDb::new();
    let project = add_record(&db, "project", &["project_id=PO"]);
    let contact = add_record(&db, "contact", &["contact_id=C1", "name=Ann"]);

    let pair = ["--project", project.as_str(), "--contact", contact.as_str()];
    let command = |action: &'static str| {
        let mut args = vec!["project", action];
        args.extend(pair);
        args
    };

    let linked = run_json(&db, command("link-contact"));
    validate_schema("project-detail.schema.json", &linked);
    assert_eq!(as_str(&linked, "/contacts/0/id"), contact);

    let unlinked = run_json(&db, command("unlink-contact"));
    validate_schema("project-detail.schema.json", &unlinked);
    assert_eq!(unlinked["contacts"], serde_json::json!([]));

    let (code, body) = run_failure(&db, command("unlink-contact"));
    assert_eq!(code, 4);
    assert_eq!(as_str(&body, "/error/detail"), "Contact not found.");

    let shown = run_json(&db, ["record", "show", "--id", contact.as_str()]);
    assert_eq!(as_str(&shown, "/record/fields/name/value"), "Ann");
}

#[test]
fn bad_identifiers_and_unknown_records_map_to_distinct_exit_codes() {
    let db = TempDb::new();

    let (code, body) = run_failure(&db, ["record", "show", "--id", "prj.not-a-ulid"]);
    assert_eq!(code, 3);
    assert_eq!(as_str(&body, "/error/kind"), "validation");

    let (code, body) = run_failure(&db, ["record", "show", "--id", "01JAAGKRBCX0FESK9SZNHTG3CD"]);
    assert_eq!(code, 4);
    assert_eq!(as_str(&body, "/error/kind"), "not_found");

    let (code, _) = run_failure(&db, ["record", "add", "--kind", "project", "--field", "owner=X"]);
    assert_eq!(code, 3);
}

#[test]
fn csv_import_upserts_and_publishes_state_changes() {
    let db = TempDb::new();
    let first = TempCsv::new("project_id,name\nP1,Alpha\nP2,Beta\n");
    let imported =
        run_json(&db, ["record", "import", "--kind", "project", "--csv", first.path_str()]);
    validate_schema("import.schema.json", &imported);
    assert_eq!(imported["rows"], serde_json::json!(2));
    let alpha = as_str(&imported, "/created/0").to_string();

    let second = TempCsv::new("project_id,name\nP1,Gamma\nP2,Beta\n");
    let merged =
        run_json(&db, ["record", "import", "--kind", "project", "--csv", second.path_str()]);
    validate_schema("import.schema.json", &merged);
    assert_eq!(merged["created"], serde_json::json!([]));
    assert_eq!(merged["updated"], serde_json::json!([alpha]));

    let events = run_json(&db, ["events", "list"]);
    validate_schema("state-changes.schema.json", &events);
    let actions = events["events"]
        .as_array()
        .unwrap_or_else(|| panic!("events should be an array: {events}"))
        .iter()
        .map(|event| event["action"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(actions, vec!["CREATE", "CREATE", "UPDATE"]);
    assert_eq!(as_str(&events, "/events/2/record_id"), alpha);
    assert_eq!(as_str(&events, "/events/2/fields/name/value"), "Gamma");

    let cursor = events["cursor"].to_string();
    let drained = run_json(&db, ["events", "list", "--after", cursor.as_str()]);
    validate_schema("state-changes.schema.json", &drained);
    assert_eq!(drained["count"], serde_json::json!(0));
    assert_eq!(drained["cursor"], events["cursor"]);
}

#[test]
fn csv_import_with_a_bad_row_writes_nothing() {
    let db = TempDb::new();
    let bad = TempCsv::new("library_id,coverage\nL1,40\nL2,deep\n");

    let (code, body) =
        run_failure(&db, ["record", "import", "--kind", "library", "--csv", bad.path_str()]);
    assert_eq!(code, 3);
    assert!(as_str(&body, "/error/detail").contains("line 3"));

    let listed = run_json(&db, ["record", "list", "--kind", "library"]);
    assert_eq!(listed["count"], serde_json::json!(0));
    let events = run_json(&db, ["events", "list"]);
    assert_eq!(events["cursor"], Value::Null);
}
