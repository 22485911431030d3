use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_casedeskd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn casedeskd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn absent_teacher_is_never_assigned() {
    let workspace = temp_dir("casedesk-absent-excluded");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.upsert",
        json!({ "id": "t-absent", "name": "Adler" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.upsert",
        json!({ "id": "t-present", "name": "Pohl" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.setDayFlags",
        json!({ "teacherId": "t-absent", "day": "2025-02-03", "absent": true }),
    );

    // The absent teacher would win every load comparison; it still never
    // receives a case that day.
    for i in 0..4 {
        let assigned = request_ok(
            &mut stdin,
            &mut reader,
            &format!("assign-{}", i),
            "cases.assign",
            json!({
                "case": {
                    "caseType": "referral",
                    "createdAt": format!("2025-02-03T09:{:02}:00", i)
                }
            }),
        );
        assert_eq!(
            assigned.pointer("/teacher/id").and_then(|v| v.as_str()),
            Some("t-present"),
            "round {}: {}",
            i,
            assigned
        );
    }

    // Next day the flag no longer applies.
    let next_day = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "cases.assign",
        json!({
            "case": { "caseType": "referral", "createdAt": "2025-02-04T09:00:00" }
        }),
    );
    assert_eq!(
        next_day.pointer("/teacher/id").and_then(|v| v.as_str()),
        Some("t-absent")
    );
}

#[test]
fn daily_limit_caps_assignments() {
    let workspace = temp_dir("casedesk-daily-limit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.upsert",
        json!({ "id": "t-y", "name": "Yilmaz" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.upsert",
        json!({ "id": "t-z", "name": "Zorn" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "settings.update",
        json!({ "settings": { "dailyCaseLimit": 4 } }),
    );
    // Z has far more yearly load than Y.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "archive.upsertEntry",
        json!({
            "day": "2025-02-01",
            "entry": { "id": "seed-z", "assignedTo": "t-z", "score": 50 }
        }),
    );

    // Y takes four cases directly on the day.
    for i in 0..4 {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("confirm-{}", i),
            "cases.confirm",
            json!({
                "case": {
                    "caseType": "support",
                    "createdAt": format!("2025-02-10T08:{:02}:00", i)
                },
                "teacherId": "t-y"
            }),
        );
    }

    // A fifth case skips Y despite the lowest yearly load.
    let fifth = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "cases.assign",
        json!({
            "case": { "caseType": "support", "createdAt": "2025-02-10T12:00:00" }
        }),
    );
    assert_eq!(
        fifth.pointer("/teacher/id").and_then(|v| v.as_str()),
        Some("t-z")
    );

    // With Z excluded as well the pool is empty; terminal outcome.
    let none = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "cases.assign",
        json!({
            "case": { "caseType": "support", "createdAt": "2025-02-10T12:30:00" },
            "excludeTeacherIds": ["t-z"]
        }),
    );
    assert_eq!(
        none.get("outcome").and_then(|v| v.as_str()),
        Some("noCandidate")
    );
}
