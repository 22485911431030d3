use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::settlement::{self, SettleError, SettlementReport};
use crate::store;
use chrono::Local;
use serde_json::json;

fn report_json(report: &SettlementReport, settled_through: chrono::NaiveDate) -> serde_json::Value {
    let adjustments = |list: &[settlement::SyntheticAdjustment]| -> Vec<serde_json::Value> {
        list.iter()
            .map(|a| {
                json!({
                    "teacherId": a.teacher_id,
                    "entryId": a.entry_id,
                    "score": a.score,
                    "previous": a.previous,
                })
            })
            .collect()
    };
    json!({
        "day": report.day.format(store::DAY_FORMAT).to_string(),
        "penalties": adjustments(&report.penalties),
        "bonuses": adjustments(&report.bonuses),
        "archived": report.archived,
        "flagsReset": report.flags_reset,
        "settledThrough": settled_through.format(store::DAY_FORMAT).to_string(),
        "remainingDays": report
            .remaining_days
            .iter()
            .map(|d| d.format(store::DAY_FORMAT).to_string())
            .collect::<Vec<_>>(),
        "moreDays": !report.remaining_days.is_empty(),
    })
}

fn handle_settlement_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let explicit = match req.params.get("day").and_then(|v| v.as_str()) {
        Some(raw) => match store::parse_day(raw) {
            Ok(d) => Some(d),
            Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
        },
        None => None,
    };

    let mut snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let day = match settlement::resolve_day(&snapshot.book, snapshot.settled_through, explicit) {
        Ok(d) => d,
        Err(e @ SettleError::AmbiguousDay) => {
            return err(&req.id, "ambiguous_settlement_day", e.to_string(), None)
        }
    };

    let today = Local::now().date_naive();
    let report = settlement::settle_day(
        &mut snapshot.teachers,
        &mut snapshot.book,
        &snapshot.settings,
        day,
        today,
    );
    let settled_through = snapshot.settled_through.map_or(day, |m| m.max(day));

    // One transaction for the whole pass: if any write fails, the marker
    // does not advance and the next run restarts from observed state.
    let persist = || -> anyhow::Result<()> {
        let tx = conn.unchecked_transaction()?;
        for teacher in &snapshot.teachers {
            store::upsert_teacher(&tx, teacher)?;
        }
        if let Some(entries) = snapshot.book.archive.get(&day) {
            for case in entries {
                store::upsert_case(&tx, case, Some(day))?;
            }
        }
        store::set_settled_through(&tx, settled_through)?;
        tx.commit()?;
        Ok(())
    };
    if let Err(e) = persist() {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    ok(&req.id, report_json(&report, settled_through))
}

fn handle_settlement_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "settledThrough": snapshot
                .settled_through
                .map(|d| d.format(store::DAY_FORMAT).to_string()),
            "openDays": snapshot
                .book
                .open_days()
                .iter()
                .map(|d| d.format(store::DAY_FORMAT).to_string())
                .collect::<Vec<_>>(),
            "openCount": snapshot.book.open.len(),
            "today": Local::now().date_naive().format(store::DAY_FORMAT).to_string(),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settlement.run" => Some(handle_settlement_run(state, req)),
        "settlement.status" => Some(handle_settlement_status(state, req)),
        _ => None,
    }
}
