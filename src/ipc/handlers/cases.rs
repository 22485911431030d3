use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::notify::{Notifier, OutboxNotifier};
use crate::selector::{self, CaseDraft, Decision};
use crate::store::{self, CaseType, Snapshot};
use chrono::Local;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }
}

fn parse_draft(params: &serde_json::Value) -> Result<(CaseDraft, Option<String>), HandlerErr> {
    let Some(case) = params.get("case") else {
        return Err(HandlerErr::new("bad_params", "missing params.case"));
    };
    if !case.is_object() {
        return Err(HandlerErr::new("bad_params", "params.case must be an object"));
    }

    let case_type = case
        .get("caseType")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing case.caseType"))?;
    let case_type = CaseType::parse(case_type).ok_or_else(|| {
        HandlerErr::new(
            "bad_params",
            "case.caseType must be referral, support or both",
        )
    })?;

    let created_at = match case.get("createdAt").and_then(|v| v.as_str()) {
        Some(raw) => store::parse_timestamp(raw)
            .map_err(|e| HandlerErr::new("bad_params", e.to_string()))?,
        None => Local::now().naive_local(),
    };

    let diagnosis_count = case
        .get("diagnosisCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if !(0..=6).contains(&diagnosis_count) {
        return Err(HandlerErr::new(
            "bad_params",
            "case.diagnosisCount must be between 0 and 6",
        ));
    }

    let draft = CaseDraft {
        created_at,
        case_type,
        is_new: case.get("isNew").and_then(|v| v.as_bool()).unwrap_or(false),
        diagnosis_count,
        is_test: case.get("isTest").and_then(|v| v.as_bool()).unwrap_or(false),
        reason: case
            .get("reason")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .filter(|s| !s.trim().is_empty()),
    };
    let explicit_id = case
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Ok((draft, explicit_id))
}

fn parse_exclusions(params: &serde_json::Value) -> Result<Vec<String>, HandlerErr> {
    match params.get("excludeTeacherIds") {
        None => Ok(Vec::new()),
        Some(v) if v.is_null() => Ok(Vec::new()),
        Some(v) => {
            let Some(arr) = v.as_array() else {
                return Err(HandlerErr::new(
                    "bad_params",
                    "excludeTeacherIds must be an array of ids",
                ));
            };
            arr.iter()
                .map(|item| {
                    item.as_str().map(|s| s.to_string()).ok_or_else(|| {
                        HandlerErr::new("bad_params", "excludeTeacherIds must be an array of ids")
                    })
                })
                .collect()
        }
    }
}

/// Intake guard: a committed day is closed; nothing may be created inside it.
fn check_day_open(snapshot: &Snapshot, draft: &CaseDraft) -> Result<(), HandlerErr> {
    if let Some(marker) = snapshot.settled_through {
        if draft.day() <= marker {
            return Err(HandlerErr::new(
                "day_already_settled",
                format!("{} is already settled", draft.day().format("%Y-%m-%d")),
            ));
        }
    }
    Ok(())
}

fn check_id_free(snapshot: &Snapshot, explicit_id: &Option<String>) -> Result<(), HandlerErr> {
    if let Some(id) = explicit_id {
        if snapshot.book.iter_all().any(|c| &c.id == id) {
            return Err(HandlerErr::new(
                "bad_params",
                format!("case id {} already exists", id),
            ));
        }
    }
    Ok(())
}

fn commit_and_persist(
    conn: &Connection,
    snapshot: &mut Snapshot,
    draft: &CaseDraft,
    teacher_id: &str,
    case_id: String,
) -> Result<serde_json::Value, HandlerErr> {
    let committed = selector::commit(
        &mut snapshot.teachers,
        &mut snapshot.book,
        &snapshot.settings,
        draft,
        teacher_id,
        case_id,
    );

    store::upsert_case(conn, &committed, None)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let teacher = snapshot
        .teacher(teacher_id)
        .ok_or_else(|| HandlerErr::new("not_found", "teacher not found"))?;
    store::upsert_teacher(conn, teacher)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    // Fire-and-forget; a dropped notification never unwinds the commit.
    let mut notifier = OutboxNotifier { conn };
    notifier.notify(
        teacher_id,
        "New case assigned",
        &format!(
            "{} case for {} (score {})",
            committed.case_type.as_str(),
            committed.day.format("%Y-%m-%d"),
            committed.score
        ),
        if committed.is_test { 1 } else { 0 },
    );

    Ok(json!({
        "outcome": "assigned",
        "case": committed.to_json(),
        "teacher": teacher.to_json(),
    }))
}

fn select_and_respond(
    conn: &Connection,
    snapshot: &mut Snapshot,
    draft: &CaseDraft,
    explicit_id: Option<String>,
    excluded: &[String],
) -> Result<serde_json::Value, HandlerErr> {
    let decision = selector::decide(
        draft,
        &snapshot.teachers,
        &snapshot.book,
        &snapshot.settings,
        excluded,
        &mut rand::thread_rng(),
    );

    match decision {
        Decision::NoCandidate => Ok(json!({ "outcome": "noCandidate" })),
        Decision::PendingConfirm { teacher_id, reason } => Ok(json!({
            "outcome": "pendingConfirm",
            "teacherId": teacher_id,
            "reason": reason.as_str(),
        })),
        Decision::Chosen { teacher_id } => {
            let case_id = explicit_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            commit_and_persist(conn, snapshot, draft, &teacher_id, case_id)
        }
    }
}

fn handle_cases_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let (draft, explicit_id) = match parse_draft(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let excluded = match parse_exclusions(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = check_day_open(&snapshot, &draft) {
        return e.response(&req.id);
    }
    if let Err(e) = check_id_free(&snapshot, &explicit_id) {
        return e.response(&req.id);
    }

    match select_and_respond(conn, &mut snapshot, &draft, explicit_id, &excluded) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_cases_confirm(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let (draft, explicit_id) = match parse_draft(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(teacher_id) = req.params.get("teacherId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing teacherId", None);
    };

    let mut snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = check_day_open(&snapshot, &draft) {
        return e.response(&req.id);
    }
    if let Err(e) = check_id_free(&snapshot, &explicit_id) {
        return e.response(&req.id);
    }
    if snapshot.teacher(teacher_id).is_none() {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    // A confirmation commits exactly the deferred candidate; no re-ranking.
    let case_id = explicit_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    match commit_and_persist(conn, &mut snapshot, &draft, teacher_id, case_id) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_cases_reject(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let (draft, explicit_id) = match parse_draft(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(rejected) = req.params.get("teacherId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing teacherId", None);
    };
    let mut excluded = match parse_exclusions(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if !excluded.iter().any(|id| id == rejected) {
        excluded.push(rejected.to_string());
    }

    let mut snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = check_day_open(&snapshot, &draft) {
        return e.response(&req.id);
    }
    if let Err(e) = check_id_free(&snapshot, &explicit_id) {
        return e.response(&req.id);
    }

    // A rejection re-runs the whole selection; ledger state may have moved
    // since the deferral, so the prior ranking is not resumed.
    match select_and_respond(conn, &mut snapshot, &draft, explicit_id, &excluded) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_cases_list_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let day = match req.params.get("day").and_then(|v| v.as_str()) {
        Some(raw) => match store::parse_day(raw) {
            Ok(d) => Some(d),
            Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
        },
        None => None,
    };

    let snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut cases: Vec<&store::CaseFile> = snapshot
        .book
        .open
        .iter()
        .filter(|c| day.map(|d| c.day == d).unwrap_or(true))
        .collect();
    cases.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let cases: Vec<serde_json::Value> = cases.iter().map(|c| c.to_json()).collect();
    ok(&req.id, json!({ "cases": cases }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "cases.assign" => Some(handle_cases_assign(state, req)),
        "cases.confirm" => Some(handle_cases_confirm(state, req)),
        "cases.reject" => Some(handle_cases_reject(state, req)),
        "cases.listOpen" => Some(handle_cases_list_open(state, req)),
        _ => None,
    }
}
