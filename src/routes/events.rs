//! `/events` — exams, concerts and extra lessons, with student registration.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sqlx::{MySql, QueryBuilder};
use uuid::Uuid;
use validator::Validate;

use crate::{
    errors::{AppError, AppResult, FieldErrors},
    middleware::auth_guard::AuthUser,
    models::{EventType, Role},
    services::access,
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/events",               get(list_events).post(create_event))
        .route("/events/{id}/register", post(register))
}

#[derive(sqlx::FromRow, Serialize)]
struct EventRow {
    id:                String,
    title:             String,
    event_type:        String,
    start_datetime:    NaiveDateTime,
    end_datetime:      NaiveDateTime,
    description:       String,
    external_url:      String,
    course_id:         Option<String>,
    course_name:       Option<String>,
    participant_count: i64,
}

#[derive(Serialize)]
struct EventList {
    mode:      Role,
    events:    Vec<EventRow>,
    /// Events a student may still register for; empty for other roles.
    available: Vec<EventRow>,
}

#[derive(Deserialize)]
struct ListQuery {
    from: Option<NaiveDate>,
    to:   Option<NaiveDate>,
}

#[derive(Deserialize, Validate)]
struct CreateEventBody {
    #[validate(length(min = 1, max = 200, message = "Title is required (at most 200 characters)"))]
    title:          String,
    event_type:     EventType,
    start_datetime: NaiveDateTime,
    end_datetime:   NaiveDateTime,
    #[serde(default)]
    description:    String,
    #[serde(default)]
    #[validate(length(max = 500, message = "URL must be at most 500 characters"))]
    external_url:   String,
    course_id:      Option<String>,
}

const EVENT_SELECT: &str =
    "SELECT e.id, e.title, e.event_type, e.start_datetime, e.end_datetime, e.description,
            e.external_url, e.course_id, c.name AS course_name,
            (SELECT COUNT(*) FROM event_participants p WHERE p.event_id = e.id) AS participant_count
     FROM events e
     LEFT JOIN courses c ON c.id = e.course_id
     WHERE 1 = 1";

fn check_time_range(start: NaiveDateTime, end: NaiveDateTime) -> AppResult<()> {
    if start >= end {
        return Err(AppError::Validation(FieldErrors::single(
            "end_datetime",
            "End must be after start",
        )));
    }
    Ok(())
}

/// `[from, to]` by calendar day of the start time.
fn push_window(qb: &mut QueryBuilder<'_, MySql>, q: &ListQuery) {
    if let Some(from) = q.from {
        qb.push(" AND DATE(e.start_datetime) >= ").push_bind(from);
    }
    if let Some(to) = q.to {
        qb.push(" AND DATE(e.start_datetime) <= ").push_bind(to);
    }
}

async fn list_events(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<EventList>> {
    let pool = &state.pool;
    let mut qb = QueryBuilder::<MySql>::new(EVENT_SELECT);
    let mut available = Vec::new();

    match user.role {
        Role::Admin => {}
        Role::Teacher => {
            qb.push(" AND (e.created_by = ")
                .push_bind(user.user_id.clone())
                .push(" OR c.teacher_id = ")
                .push_bind(user.user_id.clone())
                .push(")");
        }
        Role::Student => {
            qb.push(" AND e.id IN (SELECT event_id FROM event_participants WHERE user_id = ")
                .push_bind(user.user_id.clone())
                .push(")");

            let mut open = QueryBuilder::<MySql>::new(EVENT_SELECT);
            open.push(
                " AND (e.course_id IS NULL
                       OR e.course_id IN (SELECT course_id FROM enrollments WHERE student_id = ",
            )
            .push_bind(user.user_id.clone())
            .push("))")
            .push(" AND e.id NOT IN (SELECT event_id FROM event_participants WHERE user_id = ")
            .push_bind(user.user_id.clone())
            .push(")");
            push_window(&mut open, &q);
            open.push(" ORDER BY e.start_datetime");
            available = open.build_query_as().fetch_all(pool).await?;
        }
        Role::Parent => {
            let children = access::children_of(pool, &user.user_id).await?;
            if children.is_empty() {
                qb.push(" AND 1 = 0");
            } else {
                qb.push(" AND (e.course_id IN (SELECT course_id FROM enrollments WHERE 1 = 1");
                access::StudentScope::Only(children.clone()).push_filter(&mut qb, "student_id");
                qb.push(") OR e.id IN (SELECT event_id FROM event_participants WHERE 1 = 1");
                access::StudentScope::Only(children).push_filter(&mut qb, "user_id");
                qb.push("))");
            }
        }
    }
    push_window(&mut qb, &q);
    qb.push(" ORDER BY e.start_datetime");
    let events = qb.build_query_as().fetch_all(pool).await?;

    Ok(Json(EventList { mode: user.role, events, available }))
}

async fn create_event(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateEventBody>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    if !user.is_staff() {
        return Err(AppError::Forbidden);
    }
    body.validate()?;
    check_time_range(body.start_datetime, body.end_datetime)?;
    let pool = &state.pool;

    let course_id = body.course_id.as_deref().filter(|c| !c.is_empty());
    if let Some(course_id) = course_id {
        access::assert_teaches_course(pool, &user, course_id).await?;
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO events
            (id, title, event_type, start_datetime, end_datetime, description, external_url, course_id, created_by)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(body.title.trim())
    .bind(body.event_type.as_str())
    .bind(body.start_datetime)
    .bind(body.end_datetime)
    .bind(body.description.trim())
    .bind(body.external_url.trim())
    .bind(course_id)
    .bind(&user.user_id)
    .execute(pool)
    .await?;

    tracing::info!(event_id = %id, event_type = %body.event_type, "Event created");
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

async fn register(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    match user.role {
        Role::Student => {}
        Role::Admin | Role::Teacher | Role::Parent => return Err(AppError::Forbidden),
    }
    let pool = &state.pool;

    let course_id: Option<Option<String>> =
        sqlx::query_scalar("SELECT course_id FROM events WHERE id = ?")
            .bind(&id)
            .fetch_optional(pool)
            .await?;
    let course_id = course_id.ok_or(AppError::NotFound)?;

    if let Some(course_id) = course_id {
        if !access::is_enrolled(pool, &course_id, &user.user_id).await? {
            return Err(AppError::Forbidden);
        }
    }

    sqlx::query("INSERT IGNORE INTO event_participants (event_id, user_id) VALUES (?, ?)")
        .bind(&id)
        .bind(&user.user_id)
        .execute(pool)
        .await?;

    tracing::info!(event_id = %id, user_id = %user.user_id, "Registered for event");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 12, 20).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn events_must_end_after_they_start() {
        assert!(check_time_range(at(18), at(20)).is_ok());
        assert!(matches!(check_time_range(at(18), at(18)), Err(AppError::Validation(_))));
        assert!(check_time_range(at(20), at(18)).is_err());
    }

    #[test]
    fn unknown_event_types_are_rejected() {
        let json = r#"{"title":"Recital","event_type":"party",
                       "start_datetime":"2024-12-20T18:00:00","end_datetime":"2024-12-20T20:00:00"}"#;
        assert!(serde_json::from_str::<CreateEventBody>(json).is_err());

        let json = json.replace("party", "concert");
        let body: CreateEventBody = serde_json::from_str(&json).unwrap();
        assert_eq!(body.event_type, EventType::Concert);
        assert!(body.validate().is_ok());
    }

    #[test]
    fn window_filters_by_start_day() {
        let mut qb = QueryBuilder::<MySql>::new("SELECT 1 FROM events e WHERE 1 = 1");
        push_window(&mut qb, &ListQuery { from: NaiveDate::from_ymd_opt(2024, 12, 1), to: None });
        assert_eq!(qb.sql(), "SELECT 1 FROM events e WHERE 1 = 1 AND DATE(e.start_datetime) >= ?");
    }
}
