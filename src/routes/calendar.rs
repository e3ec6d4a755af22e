//! `/calendar` — Monday-based week view.
//!
//! Admins see the week's events; teachers, students and parents see lesson
//! slots. Opening the teacher view first tops up the teacher's slots from
//! every active template, so the calendar is always filled ahead.

use std::collections::BTreeMap;

use axum::{
    extract::{Extension, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::{MySql, QueryBuilder};

use crate::{
    errors::AppResult,
    middleware::auth_guard::AuthUser,
    models::{display_name, Role, SlotStatus},
    services::{access, slots::generate_slots_for_teacher},
    state::AppState,
};

use super::today;

pub fn router() -> Router<AppState> {
    Router::new().route("/calendar", get(get_week))
}

// ── Row types ────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct SlotRow {
    id:                 String,
    scheduled_date:     NaiveDate,
    start_time:         NaiveTime,
    duration_minutes:   i32,
    status:             String,
    attendance_status:  Option<String>,
    student_id:         String,
    student_username:   String,
    student_first_name: String,
    student_last_name:  String,
    teacher_username:   String,
    teacher_first_name: String,
    teacher_last_name:  String,
    course_name:        String,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id:             String,
    title:          String,
    event_type:     String,
    start_datetime: NaiveDateTime,
    description:    String,
    external_url:   String,
    course_name:    Option<String>,
}

// ── Response types ───────────────────────────────────────────

#[derive(Serialize)]
struct SlotItem {
    id:                String,
    student_id:        String,
    time_label:        String,
    duration_minutes:  i32,
    title:             String,
    subtitle:          String,
    status:            String,
    /// Hidden while the slot is still planned.
    attendance_status: Option<String>,
    can_fill_report:   bool,
}

#[derive(Serialize)]
struct EventItem {
    id:           String,
    time_label:   String,
    title:        String,
    subtitle:     String,
    event_type:   String,
    description:  String,
    external_url: String,
}

#[derive(Serialize)]
struct DayColumn {
    date:     NaiveDate,
    /// 0 = Monday.
    weekday:  u8,
    is_today: bool,
    events:   Vec<EventItem>,
    slots:    Vec<SlotItem>,
}

#[derive(Serialize)]
struct WeekResponse {
    mode:        Role,
    week_offset: i64,
    week_start:  NaiveDate,
    /// Inclusive last day (Sunday).
    week_end:    NaiveDate,
    days:        Vec<DayColumn>,
}

#[derive(Deserialize)]
struct WeekQuery {
    week: Option<String>,
}

// ── Helpers ──────────────────────────────────────────────────

/// About a century either way; keeps date arithmetic inside chrono's range.
const MAX_WEEK_OFFSET: i64 = 5200;

/// Non-numeric offsets count as the current week; large ones are clamped.
fn parse_week_offset(raw: Option<&str>) -> i64 {
    raw.and_then(|w| w.trim().parse::<i64>().ok())
        .unwrap_or(0)
        .clamp(-MAX_WEEK_OFFSET, MAX_WEEK_OFFSET)
}

/// Monday of the week `offset` weeks away from the week containing `today`.
fn week_start(today: NaiveDate, offset: i64) -> NaiveDate {
    today - Duration::days(i64::from(today.weekday().num_days_from_monday()))
        + Duration::weeks(offset)
}

/// Teachers may report a slot once its day has come, or revisit one already reported.
fn can_fill_report(role: Role, date: NaiveDate, status: &str, today: NaiveDate) -> bool {
    role == Role::Teacher && (date <= today || status != SlotStatus::Planned.as_str())
}

fn slot_item(row: SlotRow, role: Role, today: NaiveDate) -> SlotItem {
    let student = display_name(&row.student_first_name, &row.student_last_name, &row.student_username);
    let (title, subtitle) = match role {
        Role::Student => {
            let teacher =
                display_name(&row.teacher_first_name, &row.teacher_last_name, &row.teacher_username);
            (row.course_name.clone(), format!("Teacher: {teacher}"))
        }
        Role::Teacher | Role::Parent | Role::Admin => (student, row.course_name.clone()),
    };
    let attendance_status = if row.status == SlotStatus::Planned.as_str() {
        None
    } else {
        row.attendance_status.clone()
    };

    SlotItem {
        can_fill_report: can_fill_report(role, row.scheduled_date, &row.status, today),
        id: row.id,
        student_id: row.student_id,
        time_label: row.start_time.format("%H:%M").to_string(),
        duration_minutes: row.duration_minutes,
        title,
        subtitle,
        status: row.status,
        attendance_status,
    }
}

fn event_item(row: EventRow) -> EventItem {
    EventItem {
        time_label: row.start_datetime.format("%H:%M").to_string(),
        subtitle: row.course_name.unwrap_or_else(|| row.event_type.clone()),
        id: row.id,
        title: row.title,
        event_type: row.event_type,
        description: row.description,
        external_url: row.external_url,
    }
}

// ── Handlers ─────────────────────────────────────────────────

async fn get_week(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<WeekQuery>,
) -> AppResult<Json<WeekResponse>> {
    let pool = &state.pool;
    let today = today();
    let week_offset = parse_week_offset(q.week.as_deref());
    let start = week_start(today, week_offset);
    let end = start + Duration::days(7);

    let mut events_by_day: BTreeMap<NaiveDate, Vec<EventItem>> = BTreeMap::new();
    let mut slots_by_day: BTreeMap<NaiveDate, Vec<SlotItem>> = BTreeMap::new();

    match user.role {
        Role::Admin => {
            let rows = sqlx::query_as::<_, EventRow>(
                "SELECT e.id, e.title, e.event_type, e.start_datetime, e.description,
                        e.external_url, c.name AS course_name
                 FROM events e
                 LEFT JOIN courses c ON c.id = e.course_id
                 WHERE DATE(e.start_datetime) >= ? AND DATE(e.start_datetime) < ?
                 ORDER BY e.start_datetime, e.id",
            )
            .bind(start)
            .bind(end)
            .fetch_all(pool)
            .await?;
            for row in rows {
                events_by_day
                    .entry(row.start_datetime.date())
                    .or_default()
                    .push(event_item(row));
            }
        }
        Role::Teacher | Role::Student | Role::Parent => {
            if user.role == Role::Teacher {
                generate_slots_for_teacher(
                    pool,
                    &user.user_id,
                    today,
                    state.config.slot_generation_days,
                )
                .await?;
            }

            let mut qb = QueryBuilder::<MySql>::new(
                "SELECT s.id, s.scheduled_date, s.start_time, s.duration_minutes, s.status,
                        s.attendance_status, s.student_id,
                        st.username AS student_username, st.first_name AS student_first_name,
                        st.last_name AS student_last_name,
                        t.username AS teacher_username, t.first_name AS teacher_first_name,
                        t.last_name AS teacher_last_name,
                        c.name AS course_name
                 FROM lesson_slots s
                 JOIN users st ON st.id = s.student_id
                 JOIN users t ON t.id = s.teacher_id
                 JOIN courses c ON c.id = s.course_id
                 WHERE s.scheduled_date >= ",
            );
            qb.push_bind(start)
                .push(" AND s.scheduled_date < ")
                .push_bind(end);

            if user.role == Role::Teacher {
                qb.push(" AND s.teacher_id = ").push_bind(user.user_id.clone());
            } else {
                let scope = access::visible_students(pool, &user).await?;
                scope.push_filter(&mut qb, "s.student_id");
            }
            qb.push(" ORDER BY s.scheduled_date, s.start_time, s.id");

            let rows: Vec<SlotRow> = qb.build_query_as::<SlotRow>().fetch_all(pool).await?;
            for row in rows {
                slots_by_day
                    .entry(row.scheduled_date)
                    .or_default()
                    .push(slot_item(row, user.role, today));
            }
        }
    }

    let days = (0..7u8)
        .map(|i| {
            let date = start + Duration::days(i64::from(i));
            DayColumn {
                date,
                weekday: i,
                is_today: date == today,
                events: events_by_day.remove(&date).unwrap_or_default(),
                slots: slots_by_day.remove(&date).unwrap_or_default(),
            }
        })
        .collect();

    Ok(Json(WeekResponse {
        mode: user.role,
        week_offset,
        week_start: start,
        week_end: end - Duration::days(1),
        days,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    #[test]
    fn week_offset_parsing() {
        assert_eq!(parse_week_offset(Some("2")), 2);
        assert_eq!(parse_week_offset(Some("-1")), -1);
        assert_eq!(parse_week_offset(Some("next")), 0);
        assert_eq!(parse_week_offset(None), 0);
    }

    #[test]
    fn extreme_offsets_are_clamped_and_stay_in_range() {
        let today = date(5, 16);
        for raw in ["100000000", "-100000000", "9223372036854775807", "-9223372036854775808"] {
            let offset = parse_week_offset(Some(raw));
            assert_eq!(offset.abs(), MAX_WEEK_OFFSET, "offset for {raw}");
            let start = week_start(today, offset);
            assert_eq!(start.weekday(), chrono::Weekday::Mon);
            assert!(start.checked_add_signed(Duration::days(7)).is_some());
        }
        assert_eq!(parse_week_offset(Some("5199")), 5199);
    }

    #[test]
    fn weeks_start_on_monday() {
        // 2024-05-16 is a Thursday.
        assert_eq!(week_start(date(5, 16), 0), date(5, 13));
        assert_eq!(week_start(date(5, 13), 0), date(5, 13));
        assert_eq!(week_start(date(5, 19), 0), date(5, 13));
        assert_eq!(week_start(date(5, 16), 1), date(5, 20));
        assert_eq!(week_start(date(5, 16), -2), date(4, 29));
    }

    #[test]
    fn report_is_fillable_for_past_or_reported_slots() {
        let today = date(5, 16);
        assert!(can_fill_report(Role::Teacher, date(5, 16), "planned", today));
        assert!(can_fill_report(Role::Teacher, date(5, 10), "planned", today));
        assert!(!can_fill_report(Role::Teacher, date(5, 20), "planned", today));
        assert!(can_fill_report(Role::Teacher, date(5, 20), "missed", today));
        assert!(!can_fill_report(Role::Student, date(5, 10), "planned", today));
        assert!(!can_fill_report(Role::Parent, date(5, 10), "done", today));
    }
}
