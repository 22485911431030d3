use chrono::{Duration, NaiveDate, NaiveTime};
use uuid::Uuid;

use crate::ledger;
use crate::store::{month_key, CaseBook, CaseFile, CaseType, Settings, Teacher};

/// The day to settle could not be determined; nothing was mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleError {
    AmbiguousDay,
}

impl std::fmt::Display for SettleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AmbiguousDay => write!(
                f,
                "cannot infer the day to settle; no open cases and no settled-date marker"
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticAdjustment {
    pub teacher_id: String,
    pub entry_id: String,
    pub score: i64,
    pub previous: i64,
}

impl SyntheticAdjustment {
    pub fn delta(&self) -> i64 {
        self.score - self.previous
    }
}

#[derive(Debug, Clone)]
pub struct SettlementReport {
    pub day: NaiveDate,
    pub penalties: Vec<SyntheticAdjustment>,
    pub bonuses: Vec<SyntheticAdjustment>,
    pub archived: usize,
    pub flags_reset: bool,
    pub remaining_days: Vec<NaiveDate>,
}

/// Day resolution: explicit wins; else the earliest open day; else the day
/// after the marker. Guessing from the wall clock is unsupported.
pub fn resolve_day(
    book: &CaseBook,
    settled_through: Option<NaiveDate>,
    explicit: Option<NaiveDate>,
) -> Result<NaiveDate, SettleError> {
    if let Some(day) = explicit {
        return Ok(day);
    }
    if let Some(day) = book.earliest_open_day() {
        return Ok(day);
    }
    settled_through
        .map(|d| d + Duration::days(1))
        .ok_or(SettleError::AmbiguousDay)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyntheticKind {
    Penalty,
    Bonus,
}

/// One settlement pass over `day`. Every step is an id-keyed upsert, so the
/// whole pass can be re-run against the same day without duplicating
/// entries or drifting totals. The caller persists the outcome and advances
/// the settled-date marker.
pub fn settle_day(
    teachers: &mut [Teacher],
    book: &mut CaseBook,
    settings: &Settings,
    day: NaiveDate,
    today: NaiveDate,
) -> SettlementReport {
    // Absence penalty: the floor is the lowest day total among teachers who
    // actually worked the day (not absent, not on backup).
    let floor = teachers
        .iter()
        .filter(|t| t.absent_on != Some(day) && t.backup_on != Some(day))
        .filter(|t| ledger::assignment_count(book, &t.id, day) > 0)
        .map(|t| ledger::day_total(book, &t.id, day, false))
        .min()
        .unwrap_or(0);
    let penalty_score = (floor - settings.absence_penalty_amount).max(0);

    let absent_ids: Vec<String> = teachers
        .iter()
        .filter(|t| t.absent_on == Some(day))
        .map(|t| t.id.clone())
        .collect();
    let mut penalties = Vec::new();
    for teacher_id in absent_ids {
        let adjustment = upsert_synthetic(
            book,
            &teacher_id,
            day,
            SyntheticKind::Penalty,
            penalty_score,
        );
        apply_cache_delta(teachers, &adjustment, day);
        penalties.push(adjustment);
    }

    // Backup bonus: symmetric, against the highest day total of the others.
    let backup_ids: Vec<String> = teachers
        .iter()
        .filter(|t| t.backup_on == Some(day))
        .map(|t| t.id.clone())
        .collect();
    let mut bonuses = Vec::new();
    for teacher_id in backup_ids {
        let ceiling = teachers
            .iter()
            .filter(|t| t.id != teacher_id)
            .map(|t| ledger::day_total(book, &t.id, day, false))
            .max()
            .unwrap_or(0);
        let bonus_score = ceiling + settings.backup_bonus_amount;
        let adjustment =
            upsert_synthetic(book, &teacher_id, day, SyntheticKind::Bonus, bonus_score);
        apply_cache_delta(teachers, &adjustment, day);
        bonuses.push(adjustment);
    }

    // Archive: move the day's open entries, merging by id.
    let (to_archive, rest): (Vec<CaseFile>, Vec<CaseFile>) =
        std::mem::take(&mut book.open).into_iter().partition(|c| c.day == day);
    book.open = rest;
    let slot = book.archive.entry(day).or_default();
    let mut archived = 0;
    for case in to_archive {
        if slot.iter().any(|e| e.id == case.id) {
            continue;
        }
        slot.push(case);
        archived += 1;
    }
    slot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    // Reset day-scoped flags only when settling the real current day;
    // catch-up passes leave today's live flags alone. Future-dated flags
    // always survive.
    let flags_reset = day == today;
    if flags_reset {
        for teacher in teachers.iter_mut() {
            clear_past_flag(&mut teacher.absent_on, day);
            clear_past_flag(&mut teacher.backup_on, day);
            clear_past_flag(&mut teacher.tester_on, day);
        }
    }

    SettlementReport {
        day,
        penalties,
        bonuses,
        archived,
        flags_reset,
        remaining_days: book.open_days(),
    }
}

fn clear_past_flag(flag: &mut Option<NaiveDate>, day: NaiveDate) {
    if flag.map_or(false, |d| d <= day) {
        *flag = None;
    }
}

/// Upsert keyed by (teacher, day, kind): re-running updates the existing
/// entry in place, wherever it sits, instead of writing a second one.
fn upsert_synthetic(
    book: &mut CaseBook,
    teacher_id: &str,
    day: NaiveDate,
    kind: SyntheticKind,
    score: i64,
) -> SyntheticAdjustment {
    let matches = |c: &CaseFile| {
        c.day == day
            && c.assigned_to.as_deref() == Some(teacher_id)
            && match kind {
                SyntheticKind::Penalty => c.is_absence_penalty,
                SyntheticKind::Bonus => c.is_backup_bonus,
            }
    };

    let existing = book
        .open
        .iter_mut()
        .find(|c| matches(c))
        .or_else(|| {
            book.archive
                .get_mut(&day)
                .and_then(|entries| entries.iter_mut().find(|c| matches(c)))
        });

    if let Some(entry) = existing {
        let previous = entry.score;
        entry.score = score;
        return SyntheticAdjustment {
            teacher_id: teacher_id.to_string(),
            entry_id: entry.id.clone(),
            score,
            previous,
        };
    }

    let reason = match kind {
        SyntheticKind::Penalty => "Absence day compensation",
        SyntheticKind::Bonus => "Backup day compensation",
    };
    let entry = CaseFile {
        id: Uuid::new_v4().to_string(),
        day,
        // End-of-day timestamp keeps synthetics behind the real cases.
        created_at: day.and_time(NaiveTime::from_hms_opt(23, 59, 0).unwrap_or_default()),
        case_type: CaseType::Support,
        is_new: false,
        diagnosis_count: 0,
        is_test: false,
        assigned_to: Some(teacher_id.to_string()),
        score,
        is_absence_penalty: kind == SyntheticKind::Penalty,
        is_backup_bonus: kind == SyntheticKind::Bonus,
        reason: Some(reason.to_string()),
    };
    let adjustment = SyntheticAdjustment {
        teacher_id: teacher_id.to_string(),
        entry_id: entry.id.clone(),
        score,
        previous: 0,
    };
    book.open.push(entry);
    adjustment
}

fn apply_cache_delta(teachers: &mut [Teacher], adjustment: &SyntheticAdjustment, day: NaiveDate) {
    let delta = adjustment.delta();
    if delta == 0 {
        return;
    }
    let Some(teacher) = teachers.iter_mut().find(|t| t.id == adjustment.teacher_id) else {
        return;
    };
    teacher.yearly_load += delta;
    let key = month_key(day);
    let entry = teacher.monthly_loads.entry(key.clone()).or_insert(0);
    *entry += delta;
    if *entry == 0 {
        teacher.monthly_loads.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{self, Period};
    use std::collections::HashMap;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn teacher(id: &str) -> Teacher {
        Teacher {
            id: id.to_string(),
            name: id.to_string(),
            role: None,
            active: true,
            absent_on: None,
            backup_on: None,
            tester_on: None,
            yearly_load: 0,
            monthly_loads: HashMap::new(),
        }
    }

    fn seed_case(book: &mut CaseBook, id: &str, d: &str, teacher: &str, score: i64) {
        book.open.push(CaseFile {
            id: id.to_string(),
            day: day(d),
            created_at: day(d).and_hms_opt(9, 0, 0).expect("time"),
            case_type: CaseType::Support,
            is_new: false,
            diagnosis_count: 0,
            is_test: false,
            assigned_to: Some(teacher.to_string()),
            score,
            is_absence_penalty: false,
            is_backup_bonus: false,
            reason: None,
        });
    }

    fn settings() -> Settings {
        Settings {
            absence_penalty_amount: 3,
            backup_bonus_amount: 3,
            ..Settings::default()
        }
    }

    #[test]
    fn resolve_day_prefers_explicit_then_open_then_marker() {
        let mut book = CaseBook::default();
        seed_case(&mut book, "a", "2025-01-08", "t", 1);
        seed_case(&mut book, "b", "2025-01-10", "t", 1);

        assert_eq!(
            resolve_day(&book, None, Some(day("2025-01-09"))),
            Ok(day("2025-01-09"))
        );
        assert_eq!(resolve_day(&book, None, None), Ok(day("2025-01-08")));

        let empty = CaseBook::default();
        assert_eq!(
            resolve_day(&empty, Some(day("2025-01-08")), None),
            Ok(day("2025-01-09"))
        );
        assert_eq!(resolve_day(&empty, None, None), Err(SettleError::AmbiguousDay));
    }

    #[test]
    fn absence_penalty_uses_floor_minus_amount() {
        // A absent; working totals B=8, C=5; penalty = max(0, 5-3) = 2.
        let d = day("2025-01-10");
        let mut roster = vec![teacher("a"), teacher("b"), teacher("c")];
        roster[0].absent_on = Some(d);

        let mut book = CaseBook::default();
        seed_case(&mut book, "b1", "2025-01-10", "b", 8);
        seed_case(&mut book, "c1", "2025-01-10", "c", 5);

        let report = settle_day(&mut roster, &mut book, &settings(), d, day("2025-01-11"));
        assert_eq!(report.penalties.len(), 1);
        assert_eq!(report.penalties[0].teacher_id, "a");
        assert_eq!(report.penalties[0].score, 2);
        assert_eq!(report.penalties[0].previous, 0);
        assert_eq!(ledger::load_for(&book, "a", Period::Year(2025)), 2);
        assert_eq!(roster[0].yearly_load, 2);
    }

    #[test]
    fn penalty_never_goes_negative() {
        let d = day("2025-01-10");
        let mut roster = vec![teacher("a"), teacher("b")];
        roster[0].absent_on = Some(d);

        let mut book = CaseBook::default();
        seed_case(&mut book, "b1", "2025-01-10", "b", 2);

        let mut s = settings();
        s.absence_penalty_amount = 5;
        let report = settle_day(&mut roster, &mut book, &s, d, day("2025-01-11"));
        assert_eq!(report.penalties[0].score, 0);
        // The zero-score entry still exists as an explicit record.
        let archived = book.archive.get(&d).expect("archived day");
        assert!(archived.iter().any(|c| c.is_absence_penalty));
    }

    #[test]
    fn backup_bonus_uses_ceiling_plus_amount() {
        // B on backup; others A=8, C=12; bonus = 12+3 = 15.
        let d = day("2025-01-10");
        let mut roster = vec![teacher("a"), teacher("b"), teacher("c")];
        roster[1].backup_on = Some(d);

        let mut book = CaseBook::default();
        seed_case(&mut book, "a1", "2025-01-10", "a", 8);
        seed_case(&mut book, "c1", "2025-01-10", "c", 12);

        let report = settle_day(&mut roster, &mut book, &settings(), d, day("2025-01-11"));
        assert_eq!(report.bonuses.len(), 1);
        assert_eq!(report.bonuses[0].teacher_id, "b");
        assert_eq!(report.bonuses[0].score, 15);
        assert_eq!(roster[1].yearly_load, 15);
    }

    #[test]
    fn settle_twice_is_idempotent() {
        let d = day("2025-01-10");
        let mut roster = vec![teacher("a"), teacher("b"), teacher("c")];
        roster[0].absent_on = Some(d);
        roster[1].backup_on = Some(d);

        let mut book = CaseBook::default();
        seed_case(&mut book, "c1", "2025-01-10", "c", 5);

        let today = day("2025-01-12");
        let first = settle_day(&mut roster, &mut book, &settings(), d, today);
        let after_first: Vec<(String, i64)> = book
            .archive
            .get(&d)
            .expect("archived day")
            .iter()
            .map(|c| (c.id.clone(), c.score))
            .collect();
        let loads_first: Vec<i64> = roster.iter().map(|t| t.yearly_load).collect();

        // Flags survive a catch-up pass, so the same day settles again
        // against identical inputs.
        let second = settle_day(&mut roster, &mut book, &settings(), d, today);

        let archived = book.archive.get(&d).expect("archived day");
        let after_second: Vec<(String, i64)> = archived
            .iter()
            .map(|c| (c.id.clone(), c.score))
            .collect();
        assert_eq!(after_first, after_second);
        assert_eq!(loads_first, roster.iter().map(|t| t.yearly_load).collect::<Vec<_>>());
        assert_eq!(second.archived, 0);
        assert_eq!(first.penalties[0].entry_id, second.penalties[0].entry_id);
        assert_eq!(second.penalties[0].delta(), 0);

        // Uniqueness: exactly one penalty and one bonus for the day.
        assert_eq!(archived.iter().filter(|c| c.is_absence_penalty).count(), 1);
        assert_eq!(archived.iter().filter(|c| c.is_backup_bonus).count(), 1);
    }

    #[test]
    fn archive_merge_skips_existing_ids() {
        let d = day("2025-01-10");
        let mut roster = vec![teacher("a")];
        let mut book = CaseBook::default();
        seed_case(&mut book, "x", "2025-01-10", "a", 4);
        // Same id already archived by an external backfill.
        book.archive.entry(d).or_default().push(CaseFile {
            id: "x".to_string(),
            day: d,
            created_at: d.and_hms_opt(9, 0, 0).expect("time"),
            case_type: CaseType::Support,
            is_new: false,
            diagnosis_count: 0,
            is_test: false,
            assigned_to: Some("a".to_string()),
            score: 4,
            is_absence_penalty: false,
            is_backup_bonus: false,
            reason: None,
        });

        let report = settle_day(&mut roster, &mut book, &settings(), d, day("2025-01-11"));
        assert_eq!(report.archived, 0);
        assert_eq!(book.archive.get(&d).expect("archived day").len(), 1);
        assert!(book.open.is_empty());
    }

    #[test]
    fn reset_applies_only_when_settling_today() {
        let today = day("2025-01-10");
        let mut roster = vec![teacher("a"), teacher("b")];
        roster[0].absent_on = Some(day("2025-01-09"));
        roster[1].absent_on = Some(today);
        roster[1].tester_on = Some(today);

        let mut book = CaseBook::default();
        seed_case(&mut book, "old", "2025-01-09", "b", 3);

        // Catch-up pass over yesterday: marker-only semantics, flags stay.
        let report = settle_day(&mut roster, &mut book, &settings(), day("2025-01-09"), today);
        assert!(!report.flags_reset);
        assert_eq!(roster[1].absent_on, Some(today));

        // Settling the real current day clears flags dated up to it.
        seed_case(&mut book, "new", "2025-01-10", "a", 3);
        let report = settle_day(&mut roster, &mut book, &settings(), today, today);
        assert!(report.flags_reset);
        assert_eq!(roster[0].absent_on, None);
        assert_eq!(roster[1].absent_on, None);
        assert_eq!(roster[1].tester_on, None);
    }

    #[test]
    fn future_dated_flags_survive_reset() {
        let today = day("2025-01-10");
        let mut roster = vec![teacher("a")];
        roster[0].absent_on = Some(day("2025-01-11"));

        let mut book = CaseBook::default();
        seed_case(&mut book, "c", "2025-01-10", "a", 1);

        let report = settle_day(&mut roster, &mut book, &settings(), today, today);
        assert!(report.flags_reset);
        assert_eq!(roster[0].absent_on, Some(day("2025-01-11")));
    }

    #[test]
    fn remaining_days_reported_for_catch_up() {
        let mut roster = vec![teacher("a")];
        let mut book = CaseBook::default();
        seed_case(&mut book, "c1", "2025-01-08", "a", 1);
        seed_case(&mut book, "c2", "2025-01-09", "a", 1);

        let report = settle_day(
            &mut roster,
            &mut book,
            &settings(),
            day("2025-01-08"),
            day("2025-01-10"),
        );
        assert_eq!(report.remaining_days, vec![day("2025-01-09")]);
    }
}
