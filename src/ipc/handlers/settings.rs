use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::{self, Settings};
use serde_json::json;

/// Score weights may be negative; everything else must not be.
const SIGNED_KEYS: &[&str] = &[
    "scoreTypeReferral",
    "scoreTypeSupport",
    "scoreTypeBoth",
    "scoreDiagnosisWeight",
];

const RECOGNIZED_KEYS: &[&str] = &[
    "dailyCaseLimit",
    "scoreTest",
    "scoreNewBonus",
    "scoreTypeReferral",
    "scoreTypeSupport",
    "scoreTypeBoth",
    "scoreDiagnosisWeight",
    "backupBonusAmount",
    "absencePenaltyAmount",
];

fn settings_json(settings: &Settings) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for (key, value) in settings.to_pairs() {
        out.insert(key.to_string(), json!(value));
    }
    serde_json::Value::Object(out)
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let map = match db::settings_all(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({ "settings": settings_json(&Settings::from_map(&map)) }),
    )
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(partial) = req.params.get("settings").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing settings object", None);
    };

    let mut updates: Vec<(&'static str, i64)> = Vec::new();
    for (key, value) in partial {
        let Some(&known) = RECOGNIZED_KEYS.iter().find(|k| **k == key.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                format!("unrecognized setting: {}", key),
                None,
            );
        };
        let Some(v) = value.as_i64() else {
            return err(
                &req.id,
                "bad_params",
                format!("{} must be an integer", key),
                None,
            );
        };
        if v < 0 && !SIGNED_KEYS.contains(&known) {
            return err(
                &req.id,
                "bad_params",
                format!("{} must be non-negative", key),
                None,
            );
        }
        updates.push((known, v));
    }

    for (key, value) in updates {
        if let Err(e) = db::settings_set(conn, key, value) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }

    let map = match db::settings_all(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({ "settings": settings_json(&store::Settings::from_map(&map)) }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
