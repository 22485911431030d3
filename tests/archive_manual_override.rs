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
fn backfill_merges_by_id_and_removes_cleanly() {
    let workspace = temp_dir("casedesk-archive-override");
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
        json!({ "id": "t-a", "name": "Ahrens" }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "archive.upsertEntry",
        json!({
            "day": "2024-11-05",
            "entry": {
                "id": "legacy-1",
                "assignedTo": "t-a",
                "caseType": "referral",
                "score": 4,
                "reason": "imported from the paper ledger"
            }
        }),
    );
    // Re-upserting the same id updates in place instead of duplicating.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "archive.upsertEntry",
        json!({
            "day": "2024-11-05",
            "entry": { "id": "legacy-1", "assignedTo": "t-a", "caseType": "referral", "score": 6 }
        }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "archive.list",
        json!({ "day": "2024-11-05" }),
    );
    let entries = listed
        .get("entries")
        .and_then(|v| v.as_array())
        .expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].get("score").and_then(|v| v.as_i64()), Some(6));

    // Backfilled history is visible to the ledger.
    let load = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "ledger.load",
        json!({ "teacherId": "t-a", "year": 2024, "month": 11 }),
    );
    assert_eq!(load.get("total").and_then(|v| v.as_i64()), Some(6));

    // A contradictory synthetic entry is rejected.
    let bad = request(
        &mut stdin,
        &mut reader,
        "7",
        "archive.upsertEntry",
        json!({
            "day": "2024-11-05",
            "entry": {
                "id": "legacy-2",
                "assignedTo": "t-a",
                "isAbsencePenalty": true,
                "isBackupBonus": true
            }
        }),
    );
    assert_eq!(bad.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        bad.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "archive.removeEntry",
        json!({ "day": "2024-11-05", "caseId": "legacy-1" }),
    );
    assert_eq!(removed.get("removed").and_then(|v| v.as_bool()), Some(true));

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "archive.list",
        json!({ "day": "2024-11-05" }),
    );
    assert_eq!(
        empty
            .get("entries")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    // Removing a day that never archived reports false, not an error.
    let missing = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "archive.removeEntry",
        json!({ "day": "2024-11-06", "caseId": "legacy-1" }),
    );
    assert_eq!(missing.get("removed").and_then(|v| v.as_bool()), Some(false));
}
