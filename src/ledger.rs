use chrono::{Datelike, NaiveDate};
use std::collections::HashSet;

use crate::store::{month_key, CaseBook, Teacher};

/// Accounting period for load totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Year(i32),
    Month(i32, u32),
}

impl Period {
    pub fn contains(self, day: NaiveDate) -> bool {
        match self {
            Period::Year(y) => day.year() == y,
            Period::Month(y, m) => day.year() == y && day.month() == m,
        }
    }
}

/// Sum of `score` over all entries assigned to `teacher_id` within the
/// period, open and archived alike. An id that somehow appears on both sides
/// of the book counts once. Unknown teachers total 0.
pub fn load_for(book: &CaseBook, teacher_id: &str, period: Period) -> i64 {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut total = 0_i64;
    for case in book.iter_all() {
        if case.assigned_to.as_deref() != Some(teacher_id) || !period.contains(case.day) {
            continue;
        }
        if seen.insert(case.id.as_str()) {
            total += case.score;
        }
    }
    total
}

/// A teacher's score total for one day, optionally including the synthetic
/// penalty/bonus entries.
pub fn day_total(
    book: &CaseBook,
    teacher_id: &str,
    day: NaiveDate,
    include_synthetic: bool,
) -> i64 {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut total = 0_i64;
    for case in book.day_entries(day) {
        if case.assigned_to.as_deref() != Some(teacher_id) {
            continue;
        }
        if !include_synthetic && case.is_synthetic() {
            continue;
        }
        if seen.insert(case.id.as_str()) {
            total += case.score;
        }
    }
    total
}

/// Number of non-synthetic assignments a teacher holds on a day. Drives the
/// daily-limit eligibility check.
pub fn assignment_count(book: &CaseBook, teacher_id: &str, day: NaiveDate) -> usize {
    let mut seen: HashSet<&str> = HashSet::new();
    book.day_entries(day)
        .into_iter()
        .filter(|c| c.assigned_to.as_deref() == Some(teacher_id) && !c.is_synthetic())
        .filter(|c| seen.insert(c.id.as_str()))
        .count()
}

/// Number of non-synthetic assignments a teacher holds within a month.
pub fn month_assignment_count(book: &CaseBook, teacher_id: &str, year: i32, month: u32) -> usize {
    let period = Period::Month(year, month);
    let mut seen: HashSet<&str> = HashSet::new();
    book.iter_all()
        .filter(|c| {
            c.assigned_to.as_deref() == Some(teacher_id)
                && !c.is_synthetic()
                && period.contains(c.day)
        })
        .filter(|c| seen.insert(c.id.as_str()))
        .count()
}

pub fn had_test_case_on(book: &CaseBook, teacher_id: &str, day: NaiveDate) -> bool {
    book.day_entries(day)
        .into_iter()
        .any(|c| c.assigned_to.as_deref() == Some(teacher_id) && c.is_test && !c.is_synthetic())
}

/// Teacher holding the most recent non-synthetic assignment of the day.
pub fn last_assignee(book: &CaseBook, day: NaiveDate) -> Option<String> {
    book.day_entries(day)
        .into_iter()
        .filter(|c| !c.is_synthetic() && c.assigned_to.is_some())
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        })
        .and_then(|c| c.assigned_to.clone())
}

#[derive(Debug, Clone)]
pub struct LedgerDrift {
    pub teacher_id: String,
    pub scope: String,
    pub cached: i64,
    pub recomputed: i64,
}

/// Compares each teacher's cached totals against the recomputed ones for the
/// given year. The cache is overwritten on mismatch; the drift records are
/// returned so the caller can log them.
pub fn reconcile(teachers: &mut [Teacher], book: &CaseBook, year: i32) -> Vec<LedgerDrift> {
    let mut drifts = Vec::new();

    for teacher in teachers.iter_mut() {
        let yearly = load_for(book, &teacher.id, Period::Year(year));
        if teacher.yearly_load != yearly {
            drifts.push(LedgerDrift {
                teacher_id: teacher.id.clone(),
                scope: "yearly".to_string(),
                cached: teacher.yearly_load,
                recomputed: yearly,
            });
            teacher.yearly_load = yearly;
        }

        // Every month the cache knows about, plus every month the log holds
        // entries for this teacher.
        let mut keys: HashSet<String> = teacher.monthly_loads.keys().cloned().collect();
        for case in book.iter_all() {
            if case.assigned_to.as_deref() == Some(teacher.id.as_str()) {
                keys.insert(month_key(case.day));
            }
        }

        for key in keys {
            let Some((y, m)) = parse_month_key(&key) else {
                continue;
            };
            let recomputed = load_for(book, &teacher.id, Period::Month(y, m));
            let cached = teacher.monthly_load(&key);
            if cached != recomputed {
                drifts.push(LedgerDrift {
                    teacher_id: teacher.id.clone(),
                    scope: key.clone(),
                    cached,
                    recomputed,
                });
                if recomputed == 0 {
                    teacher.monthly_loads.remove(&key);
                } else {
                    teacher.monthly_loads.insert(key, recomputed);
                }
            }
        }
    }

    drifts
}

fn parse_month_key(key: &str) -> Option<(i32, u32)> {
    let (y, m) = key.split_once('-')?;
    let year = y.parse::<i32>().ok()?;
    let month = m.parse::<u32>().ok()?;
    if (1..=12).contains(&month) {
        Some((year, month))
    } else {
        None
    }
}
