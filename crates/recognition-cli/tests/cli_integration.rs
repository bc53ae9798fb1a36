use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::Value;

const T0: &str = "2025-01-06T00:00:00Z";
const T0_PLUS_52_WEEKS: &str = "2026-01-05T00:00:00Z";
const T0_PLUS_53_WEEKS: &str = "2026-01-12T00:00:00Z";

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

fn run_recog<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_recog"))
        .args(args)
        .env_remove("RECOGNITION_DB")
        .env_remove("RECOGNITION_WEIGHTS")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute recog binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_recog(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "recog command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    parse_stdout(&output)
}

fn run_failure<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_recog(args);
    assert!(
        !output.status.success(),
        "recog command should fail; stdout:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_f64(value: &Value, key: &str) -> f64 {
    value
        .get(key)
        .and_then(Value::as_f64)
        .unwrap_or_else(|| panic!("missing number field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn field<'a>(value: &'a Value, key: &str) -> &'a Value {
    value.get(key).unwrap_or_else(|| panic!("missing field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
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

fn approx(left: f64, right: f64) -> bool {
    (left - right).abs() < 1e-9
}

fn add_user(db: &Path, role: &str, verification: &str) -> String {
    let user = run_json([
        "--db",
        path_str(db),
        "user",
        "add",
        "--display-name",
        &format!("{role} fixture"),
        "--role",
        role,
        "--verification",
        verification,
    ]);
    as_str(&user, "user_id").to_string()
}

fn add_profile(db: &Path) -> String {
    let profile = run_json(["--db", path_str(db), "profile", "add", "--display-name", "Asha K."]);
    as_str(&profile, "profile_id").to_string()
}

// Test IDs: TCLI-001
#[test]
fn db_commands_cover_migrate_integrity_and_backup() {
    let sandbox = unique_temp_dir("recognition-cli-db");
    let db = sandbox.join("ledger.sqlite3");
    let backup_file = sandbox.join("backup.sqlite3");

    let schema_before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    validate_schema("schema-version.schema.json", &schema_before);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(
        dry_run
            .get("would_apply_versions")
            .and_then(Value::as_array)
            .map(std::vec::Vec::len)
            .unwrap_or_default(),
        2
    );

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);

    let schema_after = run_json(["--db", path_str(&db), "db", "schema-version"]);
    validate_schema("schema-version.schema.json", &schema_after);
    assert_eq!(schema_after.get("up_to_date").and_then(Value::as_bool), Some(true));

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert!(integrity.get("quick_check_ok").and_then(Value::as_bool).unwrap_or(false));

    let backup = run_json(["--db", path_str(&db), "db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(backup_file.exists());

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-002
#[allow(clippy::too_many_lines)]
#[test]
fn recognition_scenario_scores_decay_and_chain() {
    let sandbox = unique_temp_dir("recognition-cli-scenario");
    let db = sandbox.join("ledger.sqlite3");

    let elder = add_user(&db, "elder", "verified");
    let admin = add_user(&db, "admin", "verified");
    let profile = add_profile(&db);

    let first = run_json([
        "--db",
        path_str(&db),
        "recognition",
        "add",
        "--profile-id",
        &profile,
        "--recognizer-id",
        &elder,
        "--type",
        "know_family",
        "--relationship",
        "neighbour",
        "--at",
        T0,
    ]);
    validate_schema("recognition-add.schema.json", &first);
    validate_schema("recognition-entry.schema.json", field(&first, "entry"));
    validate_schema("aggregate.schema.json", field(&first, "aggregate"));
    assert!(approx(as_f64(field(&first, "aggregate"), "score"), 10.4));
    assert_eq!(as_str(field(&first, "aggregate"), "level"), "low");
    assert!(field(&first, "entry").get("previous_entry_hash").is_some_and(Value::is_null));

    let year_later = run_json([
        "--db",
        path_str(&db),
        "recognition",
        "aggregate",
        "--profile-id",
        &profile,
        "--as-of",
        T0_PLUS_52_WEEKS,
    ]);
    validate_schema("aggregate.schema.json", &year_later);
    assert!(approx(as_f64(&year_later, "score"), 5.2));

    let second = run_json([
        "--db",
        path_str(&db),
        "recognition",
        "add",
        "--profile-id",
        &profile,
        "--recognizer-id",
        &admin,
        "--type",
        "verified_documents",
        "--at",
        T0_PLUS_52_WEEKS,
    ]);
    assert_eq!(
        as_str(field(&second, "entry"), "previous_entry_hash"),
        as_str(field(&first, "entry"), "entry_hash")
    );

    let later = run_json([
        "--db",
        path_str(&db),
        "recognition",
        "aggregate",
        "--profile-id",
        &profile,
        "--as-of",
        T0_PLUS_53_WEEKS,
    ]);
    assert!(approx(as_f64(&later, "score"), 17.0));
    assert_eq!(as_str(&later, "level"), "low");
    assert_eq!(as_i64(&later, "recognizer_count"), 2);

    let listed =
        run_json(["--db", path_str(&db), "recognition", "list", "--profile-id", &profile]);
    let recognitions = listed
        .get("recognitions")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("list should include recognitions: {listed}"));
    assert_eq!(recognitions.len(), 2);
    for recognition in recognitions {
        validate_schema("recognition-entry.schema.json", recognition);
    }
    assert_eq!(as_str(&recognitions[0], "recognizer_id"), admin);

    let chain = run_json([
        "--db",
        path_str(&db),
        "recognition",
        "verify-chain",
        "--profile-id",
        &profile,
    ]);
    validate_schema("chain-verification.schema.json", &chain);
    assert_eq!(chain.get("valid").and_then(Value::as_bool), Some(true));
    assert_eq!(as_i64(&chain, "entries_checked"), 2);

    let all = run_json(["--db", path_str(&db), "recognition", "verify-chain"]);
    assert_eq!(all.get("all_valid").and_then(Value::as_bool), Some(true));

    let shown = run_json(["--db", path_str(&db), "profile", "show", "--profile-id", &profile]);
    assert_eq!(as_i64(field(&shown, "recognition"), "recognizer_count"), 2);

    let audit =
        run_json(["--db", path_str(&db), "recognition", "audit", "--target", &profile]);
    let events = audit
        .get("events")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("audit should include events: {audit}"));
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|event| as_str(event, "action") == "recognition_add"));

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-003
#[test]
fn rejected_recognitions_fail_without_writing() {
    let sandbox = unique_temp_dir("recognition-cli-rejections");
    let db = sandbox.join("ledger.sqlite3");

    let elder = add_user(&db, "elder", "verified");
    let newcomer = add_user(&db, "member", "unverified");
    let profile = add_profile(&db);

    let add_args = |recognizer: &str| {
        vec![
            "--db".to_string(),
            path_str(&db).to_string(),
            "recognition".to_string(),
            "add".to_string(),
            "--profile-id".to_string(),
            profile.clone(),
            "--recognizer-id".to_string(),
            recognizer.to_string(),
            "--type".to_string(),
            "know_personally".to_string(),
        ]
    };

    let stderr = run_failure(add_args(&newcomer));
    assert!(stderr.contains("unverified recognizer"), "stderr:\n{stderr}");

    let _ = run_json(add_args(&elder));
    let stderr = run_failure(add_args(&elder));
    assert!(
        stderr.contains("You have already provided this type of recognition for this profile"),
        "stderr:\n{stderr}"
    );

    let stderr = run_failure([
        "--db",
        path_str(&db),
        "recognition",
        "list",
        "--profile-id",
        "not-a-ulid",
    ]);
    assert!(stderr.contains("profile_id MUST be a valid ULID"), "stderr:\n{stderr}");

    let listed =
        run_json(["--db", path_str(&db), "recognition", "list", "--profile-id", &profile]);
    assert_eq!(
        listed.get("recognitions").and_then(Value::as_array).map(std::vec::Vec::len),
        Some(1)
    );

    let deleted = run_json([
        "--db",
        path_str(&db),
        "profile",
        "status",
        "--profile-id",
        &profile,
        "--status",
        "deleted",
    ]);
    assert_eq!(as_str(&deleted, "status"), "deleted");

    let _ = run_json(["--db", path_str(&db), "user", "verify", "--user-id", &newcomer]);
    let stderr = run_failure(add_args(&newcomer));
    assert!(stderr.contains("deleted profile"), "stderr:\n{stderr}");

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-004
#[test]
fn weight_file_overrides_defaults() {
    let sandbox = unique_temp_dir("recognition-cli-weights");
    let db = sandbox.join("ledger.sqlite3");
    let weights = sandbox.join("weights.yaml");
    fs::write(&weights, "role_weights:\n  elder: 9.0\n  guide: 4.0\nhalf_life_weeks: 26\n")
        .unwrap_or_else(|err| panic!("failed to write weights file {}: {err}", weights.display()));

    let defaults = run_json(["--db", path_str(&db), "weights", "show"]);
    assert!(approx(as_f64(field(&defaults, "role_weights"), "elder"), 8.0));

    let shown = run_json([
        "--db",
        path_str(&db),
        "--weights",
        path_str(&weights),
        "weights",
        "show",
    ]);
    assert!(approx(as_f64(field(&shown, "role_weights"), "guide"), 4.0));
    assert!(approx(as_f64(field(&shown, "role_weights"), "admin"), 10.0));
    assert!(approx(as_f64(&shown, "half_life_weeks"), 26.0));
    assert!(approx(as_f64(field(&shown, "type_multipliers"), "know_family"), 1.3));

    fs::write(&weights, "half_life_weeks: 0\n")
        .unwrap_or_else(|err| panic!("failed to write weights file {}: {err}", weights.display()));
    let stderr = run_failure([
        "--db",
        path_str(&db),
        "--weights",
        path_str(&weights),
        "weights",
        "show",
    ]);
    assert!(stderr.contains("half_life_weeks"), "stderr:\n{stderr}");

    let _ = fs::remove_dir_all(&sandbox);
}
