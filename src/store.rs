use anyhow::{anyhow, Context};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use rusqlite::Connection;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

pub const DAY_FORMAT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const META_SETTLED_THROUGH: &str = "settledThrough";

pub fn parse_day(s: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DAY_FORMAT)
        .map_err(|_| anyhow!("invalid day (expected YYYY-MM-DD): {}", s))
}

pub fn parse_timestamp(s: &str) -> anyhow::Result<NaiveDateTime> {
    let t = s.trim();
    if let Ok(v) = NaiveDateTime::parse_from_str(t, TIMESTAMP_FORMAT) {
        return Ok(v);
    }
    // Date-only timestamps land at midnight.
    parse_day(t)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| anyhow!("invalid timestamp (expected YYYY-MM-DDTHH:MM:SS): {}", s))
}

pub fn month_key(day: NaiveDate) -> String {
    format!("{:04}-{:02}", day.year(), day.month())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseType {
    Referral,
    Support,
    Both,
}

impl CaseType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "referral" => Some(Self::Referral),
            "support" => Some(Self::Support),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Referral => "referral",
            Self::Support => "support",
            Self::Both => "both",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Teacher {
    pub id: String,
    pub name: String,
    pub role: Option<String>,
    pub active: bool,
    pub absent_on: Option<NaiveDate>,
    pub backup_on: Option<NaiveDate>,
    pub tester_on: Option<NaiveDate>,
    pub yearly_load: i64,
    pub monthly_loads: HashMap<String, i64>,
}

impl Teacher {
    pub fn monthly_load(&self, key: &str) -> i64 {
        self.monthly_loads.get(key).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.name,
            "role": self.role,
            "active": self.active,
            "absentOn": self.absent_on.map(|d| d.format(DAY_FORMAT).to_string()),
            "backupOn": self.backup_on.map(|d| d.format(DAY_FORMAT).to_string()),
            "testerOn": self.tester_on.map(|d| d.format(DAY_FORMAT).to_string()),
            "yearlyLoad": self.yearly_load,
            "monthlyLoads": self.monthly_loads,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CaseFile {
    pub id: String,
    pub day: NaiveDate,
    pub created_at: NaiveDateTime,
    pub case_type: CaseType,
    pub is_new: bool,
    pub diagnosis_count: i64,
    pub is_test: bool,
    pub assigned_to: Option<String>,
    pub score: i64,
    pub is_absence_penalty: bool,
    pub is_backup_bonus: bool,
    pub reason: Option<String>,
}

impl CaseFile {
    pub fn is_synthetic(&self) -> bool {
        self.is_absence_penalty || self.is_backup_bonus
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "day": self.day.format(DAY_FORMAT).to_string(),
            "createdAt": self.created_at.format(TIMESTAMP_FORMAT).to_string(),
            "caseType": self.case_type.as_str(),
            "isNew": self.is_new,
            "diagnosisCount": self.diagnosis_count,
            "isTest": self.is_test,
            "assignedTo": self.assigned_to,
            "score": self.score,
            "isAbsencePenalty": self.is_absence_penalty,
            "isBackupBonus": self.is_backup_bonus,
            "reason": self.reason,
        })
    }
}

/// The full case log: the live "open" set plus settled days. The two sides
/// partition the log by day; an id never counts twice (the ledger
/// de-duplicates when summing).
#[derive(Debug, Clone, Default)]
pub struct CaseBook {
    pub open: Vec<CaseFile>,
    pub archive: BTreeMap<NaiveDate, Vec<CaseFile>>,
}

impl CaseBook {
    pub fn iter_all(&self) -> impl Iterator<Item = &CaseFile> {
        self.open
            .iter()
            .chain(self.archive.values().flat_map(|v| v.iter()))
    }

    /// Every entry dated `day`, open or archived.
    pub fn day_entries(&self, day: NaiveDate) -> Vec<&CaseFile> {
        let mut out: Vec<&CaseFile> = self.open.iter().filter(|c| c.day == day).collect();
        if let Some(entries) = self.archive.get(&day) {
            out.extend(entries.iter());
        }
        out
    }

    pub fn earliest_open_day(&self) -> Option<NaiveDate> {
        self.open.iter().map(|c| c.day).min()
    }

    pub fn open_days(&self) -> Vec<NaiveDate> {
        let mut days: Vec<NaiveDate> = self.open.iter().map(|c| c.day).collect();
        days.sort();
        days.dedup();
        days
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub daily_case_limit: i64,
    pub score_test: i64,
    pub score_new_bonus: i64,
    pub score_type_referral: i64,
    pub score_type_support: i64,
    pub score_type_both: i64,
    pub score_diagnosis_weight: i64,
    pub backup_bonus_amount: i64,
    pub absence_penalty_amount: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            daily_case_limit: 6,
            score_test: 1,
            score_new_bonus: 1,
            score_type_referral: 3,
            score_type_support: 2,
            score_type_both: 4,
            score_diagnosis_weight: 0,
            backup_bonus_amount: 2,
            absence_penalty_amount: 2,
        }
    }
}

impl Settings {
    pub fn type_weight(&self, case_type: CaseType) -> i64 {
        match case_type {
            CaseType::Referral => self.score_type_referral,
            CaseType::Support => self.score_type_support,
            CaseType::Both => self.score_type_both,
        }
    }

    pub fn from_map(map: &HashMap<String, i64>) -> Self {
        let mut s = Self::default();
        let get = |key: &str, fallback: i64| map.get(key).copied().unwrap_or(fallback);
        s.daily_case_limit = get("dailyCaseLimit", s.daily_case_limit);
        s.score_test = get("scoreTest", s.score_test);
        s.score_new_bonus = get("scoreNewBonus", s.score_new_bonus);
        s.score_type_referral = get("scoreTypeReferral", s.score_type_referral);
        s.score_type_support = get("scoreTypeSupport", s.score_type_support);
        s.score_type_both = get("scoreTypeBoth", s.score_type_both);
        s.score_diagnosis_weight = get("scoreDiagnosisWeight", s.score_diagnosis_weight);
        s.backup_bonus_amount = get("backupBonusAmount", s.backup_bonus_amount);
        s.absence_penalty_amount = get("absencePenaltyAmount", s.absence_penalty_amount);
        s
    }

    pub fn to_pairs(&self) -> Vec<(&'static str, i64)> {
        vec![
            ("dailyCaseLimit", self.daily_case_limit),
            ("scoreTest", self.score_test),
            ("scoreNewBonus", self.score_new_bonus),
            ("scoreTypeReferral", self.score_type_referral),
            ("scoreTypeSupport", self.score_type_support),
            ("scoreTypeBoth", self.score_type_both),
            ("scoreDiagnosisWeight", self.score_diagnosis_weight),
            ("backupBonusAmount", self.backup_bonus_amount),
            ("absencePenaltyAmount", self.absence_penalty_amount),
        ]
    }
}

#[derive(Debug)]
pub struct Snapshot {
    pub teachers: Vec<Teacher>,
    pub book: CaseBook,
    pub settings: Settings,
    pub settled_through: Option<NaiveDate>,
}

impl Snapshot {
    pub fn teacher(&self, id: &str) -> Option<&Teacher> {
        self.teachers.iter().find(|t| t.id == id)
    }

}

pub fn load_snapshot(conn: &Connection) -> anyhow::Result<Snapshot> {
    let teachers = load_teachers(conn)?;
    let book = load_case_book(conn)?;
    let settings = Settings::from_map(&crate::db::settings_all(conn)?);
    let settled_through = match crate::db::meta_get(conn, META_SETTLED_THROUGH)? {
        Some(v) => Some(parse_day(&v)?),
        None => None,
    };
    Ok(Snapshot {
        teachers,
        book,
        settings,
        settled_through,
    })
}

fn load_teachers(conn: &Connection) -> anyhow::Result<Vec<Teacher>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, role, active, absent_on, backup_on, tester_on, yearly_load, monthly_loads
         FROM teachers
         ORDER BY name, id",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, Option<String>>(2)?,
            r.get::<_, i64>(3)?,
            r.get::<_, Option<String>>(4)?,
            r.get::<_, Option<String>>(5)?,
            r.get::<_, Option<String>>(6)?,
            r.get::<_, i64>(7)?,
            r.get::<_, String>(8)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (id, name, role, active, absent_on, backup_on, tester_on, yearly_load, monthly_raw) =
            row?;
        let monthly_loads: HashMap<String, i64> = serde_json::from_str(&monthly_raw)
            .with_context(|| format!("teacher {} has malformed monthly_loads", id))?;
        out.push(Teacher {
            id,
            name,
            role,
            active: active != 0,
            absent_on: parse_opt_day(absent_on)?,
            backup_on: parse_opt_day(backup_on)?,
            tester_on: parse_opt_day(tester_on)?,
            yearly_load,
            monthly_loads,
        });
    }
    Ok(out)
}

fn parse_opt_day(v: Option<String>) -> anyhow::Result<Option<NaiveDate>> {
    match v {
        Some(s) if !s.trim().is_empty() => Ok(Some(parse_day(&s)?)),
        _ => Ok(None),
    }
}

fn load_case_book(conn: &Connection) -> anyhow::Result<CaseBook> {
    let mut stmt = conn.prepare(
        "SELECT id, day, created_at, case_type, is_new, diagnosis_count, is_test,
                assigned_to, score, is_absence_penalty, is_backup_bonus, reason, archived_day
         FROM case_files
         ORDER BY created_at, id",
    )?;
    let rows = stmt.query_map([], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, i64>(4)?,
            r.get::<_, i64>(5)?,
            r.get::<_, i64>(6)?,
            r.get::<_, Option<String>>(7)?,
            r.get::<_, i64>(8)?,
            r.get::<_, i64>(9)?,
            r.get::<_, i64>(10)?,
            r.get::<_, Option<String>>(11)?,
            r.get::<_, Option<String>>(12)?,
        ))
    })?;

    let mut book = CaseBook::default();
    for row in rows {
        let (
            id,
            day,
            created_at,
            case_type,
            is_new,
            diagnosis_count,
            is_test,
            assigned_to,
            score,
            is_absence_penalty,
            is_backup_bonus,
            reason,
            archived_day,
        ) = row?;
        let case_type = CaseType::parse(&case_type)
            .ok_or_else(|| anyhow!("case {} has unknown case_type {}", id, case_type))?;
        let case = CaseFile {
            id,
            day: parse_day(&day)?,
            created_at: parse_timestamp(&created_at)?,
            case_type,
            is_new: is_new != 0,
            diagnosis_count,
            is_test: is_test != 0,
            assigned_to,
            score,
            is_absence_penalty: is_absence_penalty != 0,
            is_backup_bonus: is_backup_bonus != 0,
            reason,
        };
        match archived_day {
            Some(d) if !d.trim().is_empty() => {
                book.archive.entry(parse_day(&d)?).or_default().push(case);
            }
            _ => book.open.push(case),
        }
    }
    Ok(book)
}

pub fn upsert_teacher(conn: &Connection, teacher: &Teacher) -> anyhow::Result<()> {
    let monthly = serde_json::to_string(&teacher.monthly_loads)?;
    conn.execute(
        "INSERT INTO teachers(id, name, role, active, absent_on, backup_on, tester_on, yearly_load, monthly_loads)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            role = excluded.role,
            active = excluded.active,
            absent_on = excluded.absent_on,
            backup_on = excluded.backup_on,
            tester_on = excluded.tester_on,
            yearly_load = excluded.yearly_load,
            monthly_loads = excluded.monthly_loads",
        (
            &teacher.id,
            &teacher.name,
            &teacher.role,
            teacher.active as i64,
            teacher.absent_on.map(|d| d.format(DAY_FORMAT).to_string()),
            teacher.backup_on.map(|d| d.format(DAY_FORMAT).to_string()),
            teacher.tester_on.map(|d| d.format(DAY_FORMAT).to_string()),
            teacher.yearly_load,
            monthly,
        ),
    )?;
    Ok(())
}

pub fn upsert_case(
    conn: &Connection,
    case: &CaseFile,
    archived_day: Option<NaiveDate>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO case_files(id, day, created_at, case_type, is_new, diagnosis_count, is_test,
                                assigned_to, score, is_absence_penalty, is_backup_bonus, reason, archived_day)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            day = excluded.day,
            created_at = excluded.created_at,
            case_type = excluded.case_type,
            is_new = excluded.is_new,
            diagnosis_count = excluded.diagnosis_count,
            is_test = excluded.is_test,
            assigned_to = excluded.assigned_to,
            score = excluded.score,
            is_absence_penalty = excluded.is_absence_penalty,
            is_backup_bonus = excluded.is_backup_bonus,
            reason = excluded.reason,
            archived_day = excluded.archived_day",
        rusqlite::params![
            &case.id,
            case.day.format(DAY_FORMAT).to_string(),
            case.created_at.format(TIMESTAMP_FORMAT).to_string(),
            case.case_type.as_str(),
            case.is_new as i64,
            case.diagnosis_count,
            case.is_test as i64,
            &case.assigned_to,
            case.score,
            case.is_absence_penalty as i64,
            case.is_backup_bonus as i64,
            &case.reason,
            archived_day.map(|d| d.format(DAY_FORMAT).to_string()),
        ],
    )?;
    Ok(())
}

pub fn set_settled_through(conn: &Connection, day: NaiveDate) -> anyhow::Result<()> {
    crate::db::meta_set(
        conn,
        META_SETTLED_THROUGH,
        &day.format(DAY_FORMAT).to_string(),
    )
}
