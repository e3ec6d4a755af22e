//! `POST /slots/{id}/report` — turn a planned slot into a done or missed lesson.

use axum::{
    extract::{Extension, Path, State},
    middleware,
    routing::post,
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::{
    errors::{AppError, AppResult, FieldErrors},
    middleware::{auth_guard::AuthUser, role_guard::require_staff},
    models::{AttendanceStatus, LessonSlot, Role, SlotStatus},
    state::AppState,
};

use super::today;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/slots/{id}/report", post(fill_report))
        .route_layer(middleware::from_fn(require_staff))
}

#[derive(Deserialize, Validate)]
struct ReportBody {
    status:     SlotStatus,
    attendance: AttendanceStatus,
    #[validate(length(max = 200, message = "Topic must be at most 200 characters"))]
    topic:       Option<String>,
    report_text: Option<String>,
    #[validate(length(max = 500, message = "Media URL must be at most 500 characters"))]
    media_url:   Option<String>,
    #[validate(length(max = 49, message = "Result must be shorter than 50 characters"))]
    result:      Option<String>,
}

/// Only slots whose day has come may be reported, unless already reported once.
fn check_reportable(slot_date: NaiveDate, current: &str, today: NaiveDate) -> AppResult<()> {
    if slot_date > today && current == SlotStatus::Planned.as_str() {
        return Err(AppError::BadRequest("This lesson has not taken place yet".into()));
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

async fn fill_report(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(body): Json<ReportBody>,
) -> AppResult<Json<LessonSlot>> {
    body.validate()?;
    if body.status == SlotStatus::Planned {
        return Err(AppError::Validation(FieldErrors::single(
            "status",
            "Status must be done or missed",
        )));
    }

    let pool = &state.pool;
    let slot = sqlx::query_as::<_, LessonSlot>(
        "SELECT id, teacher_id, student_id, course_id, schedule_id, scheduled_date, start_time,
                duration_minutes, status, attendance_status, lesson_id
         FROM lesson_slots WHERE id = ?",
    )
    .bind(&id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound)?;

    match user.role {
        Role::Admin => {}
        Role::Teacher if slot.teacher_id == user.user_id => {}
        Role::Teacher | Role::Student | Role::Parent => return Err(AppError::Forbidden),
    }
    check_reportable(slot.scheduled_date, &slot.status, today())?;

    let present = body.attendance == AttendanceStatus::Present;
    let mut tx = pool.begin().await?;

    let lesson_id = match body.status {
        SlotStatus::Done => {
            let topic = non_empty(body.topic.as_deref()).unwrap_or_default();
            let lesson_id = match slot.lesson_id.clone() {
                Some(existing) => {
                    if !topic.is_empty() {
                        sqlx::query("UPDATE lessons SET topic = ? WHERE id = ?")
                            .bind(topic)
                            .bind(&existing)
                            .execute(&mut *tx)
                            .await?;
                    }
                    existing
                }
                None => {
                    let cycle: String = sqlx::query_scalar("SELECT cycle FROM users WHERE id = ?")
                        .bind(&slot.student_id)
                        .fetch_one(&mut *tx)
                        .await?;
                    let new_id = Uuid::new_v4().to_string();
                    sqlx::query(
                        "INSERT INTO lessons (id, course_id, date, topic, cycle, created_by)
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&new_id)
                    .bind(&slot.course_id)
                    .bind(slot.scheduled_date)
                    .bind(topic)
                    .bind(cycle)
                    .bind(&user.user_id)
                    .execute(&mut *tx)
                    .await?;
                    new_id
                }
            };

            sqlx::query(
                "INSERT INTO lesson_students (id, lesson_id, student_id, attended, result)
                 VALUES (?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE attended = VALUES(attended), result = VALUES(result)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&lesson_id)
            .bind(&slot.student_id)
            .bind(present)
            .bind(non_empty(body.result.as_deref()).unwrap_or_default())
            .execute(&mut *tx)
            .await?;

            let text = non_empty(body.report_text.as_deref());
            let media = non_empty(body.media_url.as_deref());
            if text.is_some() || media.is_some() {
                let existing: Option<String> = sqlx::query_scalar(
                    "SELECT id FROM lesson_reports WHERE lesson_id = ? AND student_id = ? LIMIT 1",
                )
                .bind(&lesson_id)
                .bind(&slot.student_id)
                .fetch_optional(&mut *tx)
                .await?;

                match existing {
                    Some(report_id) => {
                        sqlx::query("UPDATE lesson_reports SET text = ?, media_url = ? WHERE id = ?")
                            .bind(text.unwrap_or_default())
                            .bind(media.unwrap_or_default())
                            .bind(report_id)
                            .execute(&mut *tx)
                            .await?;
                    }
                    None => {
                        sqlx::query(
                            "INSERT INTO lesson_reports (id, lesson_id, student_id, text, media_url)
                             VALUES (?, ?, ?, ?, ?)",
                        )
                        .bind(Uuid::new_v4().to_string())
                        .bind(&lesson_id)
                        .bind(&slot.student_id)
                        .bind(text.unwrap_or_default())
                        .bind(media.unwrap_or_default())
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }
            Some(lesson_id)
        }
        SlotStatus::Missed | SlotStatus::Planned => slot.lesson_id.clone(),
    };

    sqlx::query(
        "UPDATE lesson_slots SET status = ?, attendance_status = ?, lesson_id = ? WHERE id = ?",
    )
    .bind(body.status.as_str())
    .bind(body.attendance.as_str())
    .bind(&lesson_id)
    .bind(&id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO attendance_records (id, student_id, date, attended)
         VALUES (?, ?, ?, ?)
         ON DUPLICATE KEY UPDATE attended = VALUES(attended)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&slot.student_id)
    .bind(slot.scheduled_date)
    .bind(present)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(
        slot_id = %id,
        status = %body.status,
        attendance = %body.attendance,
        "Slot report saved"
    );

    Ok(Json(LessonSlot {
        status: body.status.as_str().to_string(),
        attendance_status: Some(body.attendance.as_str().to_string()),
        lesson_id,
        ..slot
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[test]
    fn future_planned_slots_cannot_be_reported() {
        assert!(matches!(
            check_reportable(date(20), "planned", date(16)),
            Err(AppError::BadRequest(_))
        ));
        assert!(check_reportable(date(16), "planned", date(16)).is_ok());
        assert!(check_reportable(date(20), "done", date(16)).is_ok());
    }

    #[test]
    fn planned_is_not_a_report_outcome() {
        let body: ReportBody =
            serde_json::from_str(r#"{"status":"planned","attendance":"present"}"#).unwrap();
        assert_eq!(body.status, SlotStatus::Planned);
        assert!(body.validate().is_ok());
    }

    #[test]
    fn long_result_is_a_field_error() {
        let body = ReportBody {
            status:      SlotStatus::Done,
            attendance:  AttendanceStatus::Present,
            topic:       None,
            report_text: None,
            media_url:   None,
            result:      Some("x".repeat(50)),
        };
        let errors = body.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("result"));
    }

    #[test]
    fn blank_optional_text_is_ignored() {
        assert_eq!(non_empty(Some("  ")), None);
        assert_eq!(non_empty(Some(" ok ")), Some("ok"));
        assert_eq!(non_empty(None), None);
    }
}
