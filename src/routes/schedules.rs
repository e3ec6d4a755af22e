//! Recurring lesson templates.
//!
//! * `GET    /students/{id}/schedule` — templates of one student
//! * `POST   /students/{id}/schedule` — create a template and generate its slots
//! * `PUT    /schedules/{id}`         — edit; active templates are regenerated
//! * `DELETE /schedules/{id}`         — deactivate (slots are kept)

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    routing::{get, put},
    Json, Router,
};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::Db,
    errors::{AppError, AppResult, FieldErrors},
    middleware::{auth_guard::AuthUser, role_guard::require_staff},
    models::{Role, ScheduleTemplate},
    services::{
        access::{self, ClassResolution},
        slots::generate_slots_for_schedule,
    },
    state::AppState,
};

use super::today;

const DEFAULT_DURATION_MINUTES: i32 = 45;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/students/{id}/schedule", get(list_student_schedule).post(create_schedule))
        .route("/schedules/{id}",         put(update_schedule).delete(deactivate_schedule))
        .route_layer(middleware::from_fn(require_staff))
}

// ── Request / response types ─────────────────────────────────

#[derive(Deserialize, Validate)]
struct CreateScheduleBody {
    /// Required for admins; teachers may omit it when they share exactly one course with the student.
    course_id: Option<String>,
    #[validate(range(max = 6, message = "weekday must be 0–6 (0 = Monday)"))]
    weekday: u8,
    start_time: String,
    #[validate(range(min = 5, max = 480, message = "duration must be 5–480 minutes"))]
    duration_minutes: Option<i32>,
}

#[derive(Deserialize, Validate)]
struct UpdateScheduleBody {
    #[validate(range(max = 6, message = "weekday must be 0–6 (0 = Monday)"))]
    weekday: Option<u8>,
    start_time: Option<String>,
    #[validate(range(min = 5, max = 480, message = "duration must be 5–480 minutes"))]
    duration_minutes: Option<i32>,
    active: Option<bool>,
}

#[derive(Serialize)]
struct ScheduleResponse {
    #[serde(flatten)]
    schedule:      ScheduleTemplate,
    created_slots: u64,
}

// ── Helpers ──────────────────────────────────────────────────

/// Accepts `HH:MM` or `HH:MM:SS`.
pub(super) fn parse_time(raw: &str) -> Result<NaiveTime, AppError> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| {
            AppError::Validation(FieldErrors::single("start_time", "Time must be HH:MM"))
        })
}

async fn fetch_template(pool: &Db, id: &str) -> AppResult<ScheduleTemplate> {
    sqlx::query_as::<_, ScheduleTemplate>(
        "SELECT id, teacher_id, student_id, course_id, weekday, start_time, duration_minutes, active
         FROM student_schedules WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound)
}

/// Admins edit any template; teachers only their own.
fn assert_owns_template(template: &ScheduleTemplate, caller: &AuthUser) -> AppResult<()> {
    match caller.role {
        Role::Admin => Ok(()),
        Role::Teacher if template.teacher_id == caller.user_id => Ok(()),
        Role::Teacher | Role::Student | Role::Parent => Err(AppError::Forbidden),
    }
}

/// Pick the course (and thereby the teacher) a new template belongs to.
async fn resolve_course(
    pool: &Db,
    caller: &AuthUser,
    student_id: &str,
    course_id: Option<&str>,
) -> AppResult<(String, String)> {
    let course_id = match (course_id, caller.role) {
        (Some(id), _) => id.to_string(),
        (None, Role::Teacher) => {
            match access::teacher_course_for_student(pool, &caller.user_id, student_id).await? {
                ClassResolution::Single(id) => id,
                ClassResolution::None => {
                    return Err(AppError::BadRequest(
                        "Student is not enrolled in any of your courses".into(),
                    ))
                }
                ClassResolution::Multiple => {
                    return Err(AppError::BadRequest(
                        "Student attends several of your courses; select a course".into(),
                    ))
                }
            }
        }
        (None, Role::Admin | Role::Student | Role::Parent) => {
            return Err(AppError::Validation(FieldErrors::single(
                "course_id",
                "Select a course",
            )))
        }
    };

    access::assert_teaches_course(pool, caller, &course_id).await?;
    if !access::is_enrolled(pool, &course_id, student_id).await? {
        return Err(AppError::BadRequest("Student is not enrolled in this course".into()));
    }

    let teacher_id: Option<String> =
        sqlx::query_scalar("SELECT teacher_id FROM courses WHERE id = ?")
            .bind(&course_id)
            .fetch_one(pool)
            .await?;
    let teacher_id = teacher_id
        .ok_or_else(|| AppError::BadRequest("Course has no teacher assigned".into()))?;

    Ok((course_id, teacher_id))
}

// ── Handlers ─────────────────────────────────────────────────

async fn list_student_schedule(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(student_id): Path<String>,
) -> AppResult<Json<Vec<ScheduleTemplate>>> {
    let pool = &state.pool;
    access::assert_manages_student(pool, &user, &student_id).await?;

    let rows = match user.role {
        Role::Teacher => {
            sqlx::query_as::<_, ScheduleTemplate>(
                "SELECT id, teacher_id, student_id, course_id, weekday, start_time, duration_minutes, active
                 FROM student_schedules
                 WHERE student_id = ? AND teacher_id = ?
                 ORDER BY weekday, start_time",
            )
            .bind(&student_id)
            .bind(&user.user_id)
            .fetch_all(pool)
            .await?
        }
        Role::Admin | Role::Student | Role::Parent => {
            sqlx::query_as::<_, ScheduleTemplate>(
                "SELECT id, teacher_id, student_id, course_id, weekday, start_time, duration_minutes, active
                 FROM student_schedules
                 WHERE student_id = ?
                 ORDER BY weekday, start_time",
            )
            .bind(&student_id)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(Json(rows))
}

async fn create_schedule(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(student_id): Path<String>,
    Json(body): Json<CreateScheduleBody>,
) -> AppResult<(StatusCode, Json<ScheduleResponse>)> {
    body.validate()?;
    let start_time = parse_time(&body.start_time)?;
    let pool = &state.pool;

    access::assert_manages_student(pool, &user, &student_id).await?;
    let (course_id, teacher_id) =
        resolve_course(pool, &user, &student_id, body.course_id.as_deref()).await?;

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO student_schedules
            (id, teacher_id, student_id, course_id, weekday, start_time, duration_minutes, active)
         VALUES (?, ?, ?, ?, ?, ?, ?, 1)",
    )
    .bind(&id)
    .bind(&teacher_id)
    .bind(&student_id)
    .bind(&course_id)
    .bind(body.weekday)
    .bind(start_time)
    .bind(body.duration_minutes.unwrap_or(DEFAULT_DURATION_MINUTES))
    .execute(pool)
    .await?;

    let schedule = fetch_template(pool, &id).await?;
    let created_slots = generate_slots_for_schedule(
        pool,
        &schedule,
        today(),
        state.config.slot_generation_days,
    )
    .await?;

    tracing::info!(schedule_id = %id, %student_id, created_slots, "Schedule template created");
    Ok((StatusCode::CREATED, Json(ScheduleResponse { schedule, created_slots })))
}

async fn update_schedule(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(body): Json<UpdateScheduleBody>,
) -> AppResult<Json<ScheduleResponse>> {
    body.validate()?;
    let pool = &state.pool;
    let current = fetch_template(pool, &id).await?;
    assert_owns_template(&current, &user)?;

    let start_time = match body.start_time.as_deref() {
        Some(raw) => parse_time(raw)?,
        None => current.start_time,
    };

    // Slots of the old weekday/time stay in place; only new dates are added.
    sqlx::query(
        "UPDATE student_schedules
         SET weekday = ?, start_time = ?, duration_minutes = ?, active = ?
         WHERE id = ?",
    )
    .bind(body.weekday.unwrap_or(current.weekday))
    .bind(start_time)
    .bind(body.duration_minutes.unwrap_or(current.duration_minutes))
    .bind(body.active.unwrap_or(current.active))
    .bind(&id)
    .execute(pool)
    .await?;

    let schedule = fetch_template(pool, &id).await?;
    let created_slots = generate_slots_for_schedule(
        pool,
        &schedule,
        today(),
        state.config.slot_generation_days,
    )
    .await?;

    Ok(Json(ScheduleResponse { schedule, created_slots }))
}

async fn deactivate_schedule(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let pool = &state.pool;
    let current = fetch_template(pool, &id).await?;
    assert_owns_template(&current, &user)?;

    sqlx::query("UPDATE student_schedules SET active = 0 WHERE id = ?")
        .bind(&id)
        .execute(pool)
        .await?;

    tracing::info!(schedule_id = %id, "Schedule template deactivated");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(teacher_id: &str) -> ScheduleTemplate {
        ScheduleTemplate {
            id:               "s1".into(),
            teacher_id:       teacher_id.into(),
            student_id:       "st".into(),
            course_id:        "c".into(),
            weekday:          0,
            start_time:       NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
            duration_minutes: 45,
            active:           true,
        }
    }

    #[test]
    fn start_time_accepts_minutes_and_seconds() {
        assert_eq!(parse_time("15:00").unwrap(), NaiveTime::from_hms_opt(15, 0, 0).unwrap());
        assert_eq!(parse_time("09:30:15").unwrap(), NaiveTime::from_hms_opt(9, 30, 15).unwrap());
        assert!(matches!(parse_time("25:00"), Err(AppError::Validation(_))));
        assert!(matches!(parse_time("soon"), Err(AppError::Validation(_))));
    }

    #[test]
    fn weekday_outside_range_is_rejected() {
        let body = CreateScheduleBody {
            course_id:        None,
            weekday:          7,
            start_time:       "15:00".into(),
            duration_minutes: None,
        };
        let errors = body.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("weekday"));
    }

    #[test]
    fn only_owner_or_admin_edits_a_template() {
        let tmpl = template("t1");
        let owner = AuthUser { user_id: "t1".into(), role: Role::Teacher };
        let other = AuthUser { user_id: "t2".into(), role: Role::Teacher };
        let admin = AuthUser { user_id: "a".into(), role: Role::Admin };
        assert!(assert_owns_template(&tmpl, &owner).is_ok());
        assert!(assert_owns_template(&tmpl, &admin).is_ok());
        assert!(matches!(assert_owns_template(&tmpl, &other), Err(AppError::Forbidden)));
    }
}
