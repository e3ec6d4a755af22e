//! `/attendance` — monthly journal (weekdays × students) and day toggles.

use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Extension, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{MySql, QueryBuilder};
use uuid::Uuid;

use crate::{
    errors::{AppError, AppResult},
    middleware::auth_guard::AuthUser,
    models::{display_name, Cycle, Role},
    services::{
        access::{self, StudentScope},
        attendance::{format_minutes, month_bounds, parse_month, total_minutes, weekday_dates},
    },
    state::AppState,
};

use super::{parse_cycle, today};

pub fn router() -> Router<AppState> {
    Router::new().route("/attendance", get(journal).put(set_day))
}

#[derive(Deserialize)]
struct JournalQuery {
    month: Option<String>,
    cycle: Option<String>,
}

#[derive(sqlx::FromRow)]
struct StudentRow {
    id:         String,
    username:   String,
    first_name: String,
    last_name:  String,
    cycle:      String,
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    student_id: String,
    date:       NaiveDate,
    attended:   bool,
}

#[derive(Serialize)]
struct JournalStudent {
    id:    String,
    name:  String,
    cycle: String,
}

#[derive(Serialize)]
struct JournalCell {
    student_id: String,
    attended:   bool,
}

#[derive(Serialize)]
struct JournalRow {
    date:  NaiveDate,
    cells: Vec<JournalCell>,
}

#[derive(Serialize)]
struct StudentTotal {
    student_id: String,
    minutes:    i64,
    label:      String,
}

#[derive(Serialize)]
struct JournalResponse {
    month:           String,
    cycle:           Option<Cycle>,
    students:        Vec<JournalStudent>,
    rows:            Vec<JournalRow>,
    totals:          Vec<StudentTotal>,
    overall_minutes: i64,
    overall_label:   String,
}

#[derive(Deserialize)]
struct SetDayBody {
    student_id: String,
    date:       NaiveDate,
    attended:   bool,
}

async fn journal(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<JournalQuery>,
) -> AppResult<Json<JournalResponse>> {
    let pool = &state.pool;
    let cycle = parse_cycle(q.cycle.as_deref())?;
    let first = parse_month(q.month.as_deref(), today());
    let (start, end) = month_bounds(first);

    let scope = access::visible_students(pool, &user).await?;
    let mut qb = QueryBuilder::<MySql>::new(
        "SELECT id, username, first_name, last_name, cycle FROM users WHERE role = 'student'",
    );
    scope.push_filter(&mut qb, "id");
    if let Some(cycle) = cycle {
        qb.push(" AND cycle = ").push_bind(cycle.as_str());
    }
    qb.push(" ORDER BY username");
    let students: Vec<StudentRow> = qb.build_query_as().fetch_all(pool).await?;

    let ids: Vec<String> = students.iter().map(|s| s.id.clone()).collect();
    let mut qb = QueryBuilder::<MySql>::new(
        "SELECT student_id, date, attended FROM attendance_records WHERE date >= ",
    );
    qb.push_bind(start).push(" AND date < ").push_bind(end);
    StudentScope::Only(ids).push_filter(&mut qb, "student_id");
    let records: Vec<RecordRow> = qb.build_query_as().fetch_all(pool).await?;

    let mut attended: HashSet<(String, NaiveDate)> = HashSet::new();
    let mut attended_days: HashMap<String, i64> = HashMap::new();
    for r in records.into_iter().filter(|r| r.attended) {
        *attended_days.entry(r.student_id.clone()).or_default() += 1;
        attended.insert((r.student_id, r.date));
    }

    let rows = weekday_dates(first)
        .into_iter()
        .map(|date| JournalRow {
            date,
            cells: students
                .iter()
                .map(|s| JournalCell {
                    student_id: s.id.clone(),
                    attended:   attended.contains(&(s.id.clone(), date)),
                })
                .collect(),
        })
        .collect();

    let totals: Vec<StudentTotal> = students
        .iter()
        .map(|s| {
            let minutes = total_minutes(
                attended_days.get(&s.id).copied().unwrap_or(0),
                state.config.lesson_minutes,
            );
            StudentTotal { student_id: s.id.clone(), minutes, label: format_minutes(minutes) }
        })
        .collect();
    let overall_minutes: i64 = totals.iter().map(|t| t.minutes).sum();

    Ok(Json(JournalResponse {
        month: first.format("%Y-%m").to_string(),
        cycle,
        students: students
            .into_iter()
            .map(|s| JournalStudent {
                name:  display_name(&s.first_name, &s.last_name, &s.username),
                id:    s.id,
                cycle: s.cycle,
            })
            .collect(),
        rows,
        totals,
        overall_minutes,
        overall_label: format_minutes(overall_minutes),
    }))
}

async fn set_day(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<SetDayBody>,
) -> AppResult<StatusCode> {
    let pool = &state.pool;
    match user.role {
        Role::Admin => {
            let is_student: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ? AND role = 'student')",
            )
            .bind(&body.student_id)
            .fetch_one(pool)
            .await?;
            if !is_student {
                return Err(AppError::Forbidden);
            }
        }
        Role::Teacher | Role::Student | Role::Parent => {
            access::assert_manages_student(pool, &user, &body.student_id).await?;
        }
    }

    sqlx::query(
        "INSERT INTO attendance_records (id, student_id, date, attended)
         VALUES (?, ?, ?, ?)
         ON DUPLICATE KEY UPDATE attended = VALUES(attended)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&body.student_id)
    .bind(body.date)
    .bind(body.attended)
    .execute(pool)
    .await?;

    Ok(StatusCode::NO_CONTENT)
}
