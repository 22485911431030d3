use chrono::{Datelike, NaiveDate, NaiveDateTime};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::ledger;
use crate::store::{month_key, CaseBook, CaseFile, CaseType, Settings, Teacher};

/// Roles that never receive cases regardless of load.
pub const EXEMPT_ROLES: &[&str] = &["physiotherapist"];

/// An incoming case before assignment: type and flags set by intake,
/// score and assignee still unset.
#[derive(Debug, Clone)]
pub struct CaseDraft {
    pub created_at: NaiveDateTime,
    pub case_type: CaseType,
    pub is_new: bool,
    pub diagnosis_count: i64,
    pub is_test: bool,
    pub reason: Option<String>,
}

impl CaseDraft {
    pub fn day(&self) -> NaiveDate {
        self.created_at.date()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    TestNotFinished,
    TesterProtection,
}

impl GateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestNotFinished => "testNotFinished",
            Self::TesterProtection => "testerProtection",
        }
    }
}

/// Outcome of a selection pass. `NoCandidate` is terminal; `PendingConfirm`
/// commits nothing until the caller confirms or rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NoCandidate,
    PendingConfirm {
        teacher_id: String,
        reason: GateReason,
    },
    Chosen {
        teacher_id: String,
    },
}

fn role_is_exempt(role: Option<&str>) -> bool {
    role.map(|r| {
        EXEMPT_ROLES
            .iter()
            .any(|e| r.trim().eq_ignore_ascii_case(e))
    })
    .unwrap_or(false)
}

/// Hard constraints. Everything here is binary; fairness ranking happens
/// afterwards on the survivors.
pub fn eligible<'a>(
    draft: &CaseDraft,
    teachers: &'a [Teacher],
    book: &CaseBook,
    settings: &Settings,
    excluded_ids: &[String],
) -> Vec<&'a Teacher> {
    let day = draft.day();
    teachers
        .iter()
        .filter(|t| t.active)
        .filter(|t| t.absent_on != Some(day))
        .filter(|t| t.backup_on != Some(day))
        .filter(|t| !excluded_ids.iter().any(|id| id == &t.id))
        .filter(|t| !role_is_exempt(t.role.as_deref()))
        .filter(|t| {
            (ledger::assignment_count(book, &t.id, day) as i64) < settings.daily_case_limit
        })
        .filter(|t| {
            if !draft.is_test {
                return true;
            }
            t.tester_on == Some(day) && !ledger::had_test_case_on(book, &t.id, day)
        })
        .collect()
}

/// Pure selection: eligibility, then the fairness tie-break, then the
/// escalation gate. Mutates nothing; commit happens separately.
pub fn decide(
    draft: &CaseDraft,
    teachers: &[Teacher],
    book: &CaseBook,
    settings: &Settings,
    excluded_ids: &[String],
    rng: &mut impl Rng,
) -> Decision {
    let mut pool = eligible(draft, teachers, book, settings, excluded_ids);
    if pool.is_empty() {
        return Decision::NoCandidate;
    }

    let day = draft.day();

    // Rule 1: the most recently served teacher sits the next case out,
    // unless that would empty the pool.
    if pool.len() > 1 {
        if let Some(last) = ledger::last_assignee(book, day) {
            if pool.iter().any(|t| t.id == last) {
                pool.retain(|t| t.id != last);
            }
        }
    }

    // Rules 2-4: successive narrowing, first criterion that isolates a
    // single survivor wins.
    if pool.len() > 1 {
        retain_min(&mut pool, |t| {
            ledger::load_for(book, &t.id, ledger::Period::Year(day.year()))
        });
    }
    if pool.len() > 1 {
        retain_min(&mut pool, |t| {
            ledger::assignment_count(book, &t.id, day) as i64
        });
    }
    if pool.len() > 1 {
        retain_min(&mut pool, |t| {
            ledger::month_assignment_count(book, &t.id, day.year(), day.month()) as i64
        });
    }

    // Rule 5: uniform random among the remainder.
    let Some(pick) = pool.choose(rng) else {
        return Decision::NoCandidate;
    };

    if !draft.is_test {
        if ledger::had_test_case_on(book, &pick.id, day) {
            return Decision::PendingConfirm {
                teacher_id: pick.id.clone(),
                reason: GateReason::TestNotFinished,
            };
        }
        if pick.tester_on == Some(day) {
            return Decision::PendingConfirm {
                teacher_id: pick.id.clone(),
                reason: GateReason::TesterProtection,
            };
        }
    }

    Decision::Chosen {
        teacher_id: pick.id.clone(),
    }
}

fn retain_min<K: Ord + Copy>(pool: &mut Vec<&Teacher>, key: impl Fn(&Teacher) -> K) {
    let Some(min) = pool.iter().map(|t| key(t)).min() else {
        return;
    };
    pool.retain(|t| key(t) == min);
}

/// Committed score of a draft. The diagnosis term is an extension hook and
/// contributes nothing at the default weight of 0.
pub fn case_score(draft: &CaseDraft, settings: &Settings) -> i64 {
    let mut score = settings.type_weight(draft.case_type);
    if draft.is_new {
        score += settings.score_new_bonus;
    }
    if draft.is_test {
        score += settings.score_test;
    }
    score += draft.diagnosis_count.clamp(0, 6) * settings.score_diagnosis_weight;
    score
}

/// Commit path: build the final CaseFile, append it to the open set and bump
/// the chosen teacher's caches. Notification is the caller's concern and
/// never rolls this back.
pub fn commit(
    teachers: &mut [Teacher],
    book: &mut CaseBook,
    settings: &Settings,
    draft: &CaseDraft,
    teacher_id: &str,
    case_id: String,
) -> CaseFile {
    let score = case_score(draft, settings);
    let case = CaseFile {
        id: case_id,
        day: draft.day(),
        created_at: draft.created_at,
        case_type: draft.case_type,
        is_new: draft.is_new,
        diagnosis_count: draft.diagnosis_count.clamp(0, 6),
        is_test: draft.is_test,
        assigned_to: Some(teacher_id.to_string()),
        score,
        is_absence_penalty: false,
        is_backup_bonus: false,
        reason: draft.reason.clone(),
    };

    if let Some(teacher) = teachers.iter_mut().find(|t| t.id == teacher_id) {
        teacher.yearly_load += score;
        *teacher
            .monthly_loads
            .entry(month_key(draft.day()))
            .or_insert(0) += score;
    }

    book.open.push(case.clone());
    case
}
