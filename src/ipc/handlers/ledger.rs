use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, Period};
use crate::store;
use serde_json::json;

fn get_year(params: &serde_json::Value) -> Result<i32, String> {
    params
        .get("year")
        .and_then(|v| v.as_i64())
        .map(|y| y as i32)
        .ok_or_else(|| "missing year".to_string())
}

fn handle_ledger_load(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(teacher_id) = req.params.get("teacherId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing teacherId", None);
    };
    let year = match get_year(&req.params) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let month = match req.params.get("month") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_i64() {
            Some(m) if (1..=12).contains(&m) => Some(m as u32),
            _ => return err(&req.id, "bad_params", "month must be between 1 and 12", None),
        },
    };

    let snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let period = match month {
        Some(m) => Period::Month(year, m),
        None => Period::Year(year),
    };
    let total = ledger::load_for(&snapshot.book, teacher_id, period);

    ok(
        &req.id,
        json!({
            "teacherId": teacher_id,
            "year": year,
            "month": month,
            "total": total,
        }),
    )
}

fn handle_ledger_reconcile(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let year = match get_year(&req.params) {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let mut snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let drifts = ledger::reconcile(&mut snapshot.teachers, &snapshot.book, year);
    for drift in &drifts {
        eprintln!(
            "ledger cache drift: teacher {} {} cached {} recomputed {}",
            drift.teacher_id, drift.scope, drift.cached, drift.recomputed
        );
    }

    // Corrected caches are persisted before reporting.
    let corrected: std::collections::HashSet<&str> =
        drifts.iter().map(|d| d.teacher_id.as_str()).collect();
    for teacher in snapshot.teachers.iter().filter(|t| corrected.contains(t.id.as_str())) {
        if let Err(e) = store::upsert_teacher(conn, teacher) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }

    let drifts: Vec<serde_json::Value> = drifts
        .iter()
        .map(|d| {
            json!({
                "teacherId": d.teacher_id,
                "scope": d.scope,
                "cached": d.cached,
                "recomputed": d.recomputed,
            })
        })
        .collect();
    ok(&req.id, json!({ "year": year, "drifts": drifts }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "ledger.load" => Some(handle_ledger_load(state, req)),
        "ledger.reconcile" => Some(handle_ledger_reconcile(state, req)),
        _ => None,
    }
}
