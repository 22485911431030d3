use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, CaseFile, CaseType};
use chrono::NaiveTime;
use serde_json::json;

fn parse_day_param(params: &serde_json::Value) -> Result<chrono::NaiveDate, String> {
    let Some(raw) = params.get("day").and_then(|v| v.as_str()) else {
        return Err("missing day".to_string());
    };
    store::parse_day(raw).map_err(|e| e.to_string())
}

fn handle_archive_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let day = match parse_day_param(&req.params) {
        Ok(d) => d,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let entries: Vec<serde_json::Value> = snapshot
        .book
        .archive
        .get(&day)
        .map(|list| list.iter().map(|c| c.to_json()).collect())
        .unwrap_or_default();
    ok(
        &req.id,
        json!({
            "day": day.format(store::DAY_FORMAT).to_string(),
            "entries": entries,
        }),
    )
}

/// Manual override surface: external tooling merges entries by id for
/// backfill or duplicate cleanup. No invariant checks beyond the id key;
/// settlement's own writes are where uniqueness is enforced.
fn handle_archive_upsert_entry(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let day = match parse_day_param(&req.params) {
        Ok(d) => d,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let Some(entry) = req.params.get("entry") else {
        return err(&req.id, "bad_params", "missing entry", None);
    };

    let Some(case_id) = entry.get("id").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing entry.id", None);
    };
    let case_type = match entry.get("caseType").and_then(|v| v.as_str()) {
        Some(raw) => match CaseType::parse(raw) {
            Some(t) => t,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "entry.caseType must be referral, support or both",
                    None,
                )
            }
        },
        None => CaseType::Support,
    };
    let created_at = match entry.get("createdAt").and_then(|v| v.as_str()) {
        Some(raw) => match store::parse_timestamp(raw) {
            Ok(t) => t,
            Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
        },
        None => day.and_time(NaiveTime::default()),
    };

    let case = CaseFile {
        id: case_id.to_string(),
        day,
        created_at,
        case_type,
        is_new: entry.get("isNew").and_then(|v| v.as_bool()).unwrap_or(false),
        diagnosis_count: entry
            .get("diagnosisCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        is_test: entry.get("isTest").and_then(|v| v.as_bool()).unwrap_or(false),
        assigned_to: entry
            .get("assignedTo")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        score: entry.get("score").and_then(|v| v.as_i64()).unwrap_or(0),
        is_absence_penalty: entry
            .get("isAbsencePenalty")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        is_backup_bonus: entry
            .get("isBackupBonus")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        reason: entry
            .get("reason")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    };
    if case.is_absence_penalty && case.is_backup_bonus {
        return err(
            &req.id,
            "bad_params",
            "entry cannot be both penalty and bonus",
            None,
        );
    }

    if let Err(e) = store::upsert_case(conn, &case, Some(day)) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "entry": case.to_json() }))
}

fn handle_archive_remove_entry(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let day = match parse_day_param(&req.params) {
        Ok(d) => d,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let Some(case_id) = req.params.get("caseId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing caseId", None);
    };

    let removed = conn.execute(
        "DELETE FROM case_files WHERE id = ? AND archived_day = ?",
        (case_id, day.format(store::DAY_FORMAT).to_string()),
    );
    match removed {
        Ok(n) => ok(&req.id, json!({ "removed": n > 0 })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "archive.list" => Some(handle_archive_list(state, req)),
        "archive.upsertEntry" => Some(handle_archive_upsert_entry(state, req)),
        "archive.removeEntry" => Some(handle_archive_remove_entry(state, req)),
        _ => None,
    }
}
