use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store;
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

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn get_opt_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::new("bad_params", format!("{} must be a boolean", key))),
    }
}

fn handle_teachers_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let teacher_id = req
        .params
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let role = req
        .params
        .get("role")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let active = match get_opt_bool(&req.params, "active") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Day flags and load caches survive a roster edit.
    let teacher = match snapshot.teacher(&teacher_id) {
        Some(existing) => {
            let mut t = existing.clone();
            t.name = name;
            t.role = role;
            if let Some(active) = active {
                t.active = active;
            }
            t
        }
        None => store::Teacher {
            id: teacher_id,
            name,
            role,
            active: active.unwrap_or(true),
            absent_on: None,
            backup_on: None,
            tester_on: None,
            yearly_load: 0,
            monthly_loads: Default::default(),
        },
    };

    if let Err(e) = store::upsert_teacher(conn, &teacher) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "teacher": teacher.to_json() }))
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let teachers: Vec<serde_json::Value> = snapshot.teachers.iter().map(|t| t.to_json()).collect();
    ok(&req.id, json!({ "teachers": teachers }))
}

fn handle_teachers_set_day_flags(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let day = match get_required_str(&req.params, "day") {
        Ok(v) => match store::parse_day(&v) {
            Ok(d) => d,
            Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
        },
        Err(e) => return e.response(&req.id),
    };
    let absent = match get_opt_bool(&req.params, "absent") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let backup = match get_opt_bool(&req.params, "backup") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let tester = match get_opt_bool(&req.params, "tester") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let snapshot = match store::load_snapshot(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(existing) = snapshot.teacher(&teacher_id) else {
        return err(&req.id, "not_found", "teacher not found", None);
    };

    let mut teacher = existing.clone();
    if let Some(on) = absent {
        teacher.absent_on = if on { Some(day) } else { None };
    }
    if let Some(on) = backup {
        teacher.backup_on = if on { Some(day) } else { None };
    }
    if let Some(on) = tester {
        teacher.tester_on = if on { Some(day) } else { None };
    }

    if let Err(e) = store::upsert_teacher(conn, &teacher) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "teacher": teacher.to_json() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.upsert" => Some(handle_teachers_upsert(state, req)),
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.setDayFlags" => Some(handle_teachers_set_day_flags(state, req)),
        _ => None,
    }
}
