//! Gradebook arithmetic: weighted course average and the per-course progress
//! summary shown to students and parents.

use chrono::NaiveDate;
use serde::Serialize;

use crate::models::TargetStatus;

/// Scores accepted from the gradebook form.
pub const MIN_SCORE: i64 = 0;
pub const MAX_SCORE: i64 = 100;
/// Comments must be strictly shorter than this many characters.
pub const COMMENT_MAX_CHARS: usize = 50;

/// One assessment of a course together with the student's score, if graded.
#[derive(Debug, Clone, Copy)]
pub struct ScoredAssessment {
    pub max_score: f64,
    pub weight:    f64,
    pub score:     Option<f64>,
}

/// Weighted average in percent:
/// `sum((score / max_score) * weight) / sum(weight) * 100`.
///
/// Ungraded assessments and assessments with a zero maximum are skipped.
/// `None` when nothing contributes any weight.
pub fn weighted_average_percent<I>(assessments: I) -> Option<f64>
where
    I: IntoIterator<Item = ScoredAssessment>,
{
    let mut total = 0.0;
    let mut total_weight = 0.0;

    for a in assessments {
        let Some(score) = a.score else { continue };
        if a.max_score == 0.0 {
            continue;
        }
        total += (score / a.max_score) * a.weight;
        total_weight += a.weight;
    }

    if total_weight == 0.0 {
        return None;
    }
    Some(total / total_weight * 100.0)
}

/// Score as a percentage of the assessment maximum.
pub fn percent(score: Option<f64>, max_score: f64) -> Option<f64> {
    match score {
        Some(s) if max_score != 0.0 => Some(s / max_score * 100.0),
        _ => None,
    }
}

/// Parse one gradebook cell. Empty input clears the score.
pub fn parse_score(raw: &str) -> Result<Option<f64>, &'static str> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err("Score must be a whole number");
    }
    let value: i64 = raw.parse().map_err(|_| "Score must be a whole number")?;
    if !(MIN_SCORE..=MAX_SCORE).contains(&value) {
        return Err("Score must be between 0 and 100");
    }
    Ok(Some(value as f64))
}

/// A homework target as seen by the progress summary.
#[derive(Debug, Clone, Copy)]
pub struct TargetProgress {
    pub due_date: NaiveDate,
    pub status:   TargetStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSummary {
    /// Plain mean of the non-null scores, rounded to two decimals.
    pub avg:      Option<f64>,
    pub assigned: usize,
    pub done:     usize,
    pub next_due: Option<NaiveDate>,
    /// Consecutive done targets among the five latest by due date.
    pub streak:   usize,
    /// Set when something is assigned and nothing open is overdue.
    pub all_on_time: bool,
}

const STREAK_WINDOW: usize = 5;

pub fn progress_summary(
    scores: &[Option<f64>],
    targets: &[TargetProgress],
    today: NaiveDate,
) -> ProgressSummary {
    let graded: Vec<f64> = scores.iter().flatten().copied().collect();
    let avg = if graded.is_empty() {
        None
    } else {
        let mean = graded.iter().sum::<f64>() / graded.len() as f64;
        Some((mean * 100.0).round() / 100.0)
    };

    let assigned = targets.len();
    let done = targets.iter().filter(|t| t.status == TargetStatus::Done).count();

    let next_due = targets
        .iter()
        .filter(|t| t.status == TargetStatus::Todo)
        .map(|t| t.due_date)
        .min();

    let mut latest: Vec<&TargetProgress> = targets.iter().collect();
    latest.sort_by(|a, b| b.due_date.cmp(&a.due_date));
    let streak = latest
        .iter()
        .take(STREAK_WINDOW)
        .take_while(|t| t.status == TargetStatus::Done)
        .count();

    let late_exists = targets
        .iter()
        .any(|t| t.status == TargetStatus::Todo && t.due_date < today);

    ProgressSummary {
        avg,
        assigned,
        done,
        next_due,
        streak,
        all_on_time: assigned > 0 && !late_exists,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(max_score: f64, weight: f64, score: Option<f64>) -> ScoredAssessment {
        ScoredAssessment { max_score, weight, score }
    }

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    #[test]
    fn weighted_average_uses_weights() {
        // 80% with weight 1 and 50% with weight 3 -> (0.8 + 1.5) / 4 = 57.5%
        let avg = weighted_average_percent([
            scored(100.0, 1.0, Some(80.0)),
            scored(20.0, 3.0, Some(10.0)),
        ])
        .unwrap();
        assert!((avg - 57.5).abs() < 1e-9);
    }

    #[test]
    fn ungraded_and_zero_max_assessments_are_ignored() {
        let avg = weighted_average_percent([
            scored(100.0, 1.0, Some(90.0)),
            scored(100.0, 5.0, None),
            scored(0.0, 5.0, Some(3.0)),
        ])
        .unwrap();
        assert!((avg - 90.0).abs() < 1e-9);
    }

    #[test]
    fn nothing_graded_has_no_average() {
        assert_eq!(weighted_average_percent([scored(100.0, 1.0, None)]), None);
        assert_eq!(weighted_average_percent(Vec::new()), None);
        assert_eq!(weighted_average_percent([scored(100.0, 0.0, Some(50.0))]), None);
    }

    #[test]
    fn percent_of_max() {
        assert_eq!(percent(Some(45.0), 50.0), Some(90.0));
        assert_eq!(percent(None, 50.0), None);
        assert_eq!(percent(Some(10.0), 0.0), None);
    }

    #[test]
    fn score_cells_accept_only_whole_numbers_in_range() {
        assert_eq!(parse_score(""), Ok(None));
        assert_eq!(parse_score(" 87 "), Ok(Some(87.0)));
        assert_eq!(parse_score("100"), Ok(Some(100.0)));
        assert!(parse_score("101").is_err());
        assert!(parse_score("-1").is_err());
        assert!(parse_score("9.5").is_err());
        assert!(parse_score("abc").is_err());
    }

    #[test]
    fn progress_summary_counts_and_streak() {
        let targets = [
            TargetProgress { due_date: date(3, 1), status: TargetStatus::Todo },
            TargetProgress { due_date: date(3, 8), status: TargetStatus::Done },
            TargetProgress { due_date: date(3, 15), status: TargetStatus::Done },
            TargetProgress { due_date: date(3, 22), status: TargetStatus::Todo },
        ];
        let summary = progress_summary(&[Some(90.0), None, Some(75.0)], &targets, date(3, 10));

        assert_eq!(summary.avg, Some(82.5));
        assert_eq!(summary.assigned, 4);
        assert_eq!(summary.done, 2);
        assert_eq!(summary.next_due, Some(date(3, 1)));
        // Newest first: 3-22 is still open, so the streak is broken immediately.
        assert_eq!(summary.streak, 0);
        // 3-01 is open and overdue.
        assert!(!summary.all_on_time);
    }

    #[test]
    fn streak_counts_latest_done_targets() {
        let targets = [
            TargetProgress { due_date: date(1, 1), status: TargetStatus::Todo },
            TargetProgress { due_date: date(1, 8), status: TargetStatus::Done },
            TargetProgress { due_date: date(1, 15), status: TargetStatus::Done },
        ];
        let summary = progress_summary(&[], &targets, date(1, 1));
        assert_eq!(summary.streak, 2);
        assert!(summary.all_on_time);
        assert_eq!(summary.avg, None);
    }

    #[test]
    fn badge_requires_at_least_one_target() {
        let summary = progress_summary(&[], &[], date(1, 1));
        assert!(!summary.all_on_time);
        assert_eq!(summary.next_due, None);
    }
}
