//! `/lessons` — lesson log, per-student attendance toggles and reports.

use std::collections::HashMap;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{MySql, QueryBuilder};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::Db,
    errors::{AppError, AppResult, FieldErrors},
    middleware::auth_guard::AuthUser,
    models::{Cycle, Role},
    services::access::{self, StudentScope},
    state::AppState,
};

use super::{push_id_list, IdsBody};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/lessons",                                    get(list_lessons).post(create_lesson))
        .route("/lessons/bulk-delete",                        post(bulk_delete))
        .route("/lessons/{id}",                               get(get_lesson))
        .route("/lessons/{id}/students/{student_id}/attendance", put(set_attendance))
}

// ── Row types ────────────────────────────────────────────────

#[derive(sqlx::FromRow, Serialize)]
struct LessonRow {
    id:          String,
    course_id:   String,
    course_name: String,
    date:        NaiveDate,
    topic:       String,
    cycle:       String,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id:          String,
    course_id:   String,
    course_name: String,
    date:        NaiveDate,
    topic:       String,
    cycle:       String,
    attended:    bool,
    result:      String,
}

#[derive(sqlx::FromRow)]
struct ReportTextRow {
    lesson_id:  String,
    student_id: Option<String>,
    text:       String,
}

#[derive(sqlx::FromRow, Serialize)]
struct ReportRow {
    id:            String,
    student_id:    Option<String>,
    student_name:  Option<String>,
    text:          String,
    media_url:     String,
    created_at:    NaiveDateTime,
}

#[derive(sqlx::FromRow, Serialize)]
struct LessonStudentRow {
    student_id: String,
    username:   String,
    attended:   bool,
    result:     String,
}

// ── Response types ───────────────────────────────────────────

#[derive(Serialize)]
struct LessonListItem {
    #[serde(flatten)]
    lesson:     LessonRow,
    /// Only present when the list is filtered to one student.
    attendance: Option<bool>,
    result:     String,
}

#[derive(Serialize)]
struct LessonDetail {
    #[serde(flatten)]
    lesson:   LessonRow,
    students: Vec<LessonStudentRow>,
    reports:  Vec<ReportRow>,
}

// ── Request types ────────────────────────────────────────────

#[derive(Deserialize)]
struct ListQuery {
    course:  Option<String>,
    student: Option<String>,
}

#[derive(Deserialize, Validate)]
struct CreateLessonBody {
    course_id: String,
    date:      NaiveDate,
    #[validate(length(min = 1, max = 200, message = "Topic is required (at most 200 characters)"))]
    topic:     String,
    cycle:     Cycle,
    #[validate(length(min = 1, message = "Select at least one student"))]
    student_ids: Vec<String>,
    #[validate(length(max = 49, message = "Result must be shorter than 50 characters"))]
    result:      Option<String>,
    report_text: Option<String>,
    #[validate(length(max = 500, message = "Media URL must be at most 500 characters"))]
    media_url:   Option<String>,
}

#[derive(Deserialize)]
struct AttendanceBody {
    attended: bool,
}

// ── Helpers ──────────────────────────────────────────────────

/// Entry result first, then the student's own report, then the general one.
fn resolve_result(entry: &str, student_report: Option<&str>, general_report: Option<&str>) -> String {
    [Some(entry), student_report, general_report]
        .into_iter()
        .flatten()
        .find(|text| !text.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Ids of the student-selection that are not allowed for this lesson.
fn foreign_ids<'a>(requested: &'a [String], allowed: &[String]) -> Vec<&'a String> {
    requested.iter().filter(|id| !allowed.contains(id)).collect()
}

/// Restrict `qb` to the lessons the caller may list.
fn push_lesson_scope(qb: &mut QueryBuilder<'_, MySql>, caller: &AuthUser, scope: &StudentScope) {
    match caller.role {
        Role::Admin => {}
        Role::Teacher => {
            qb.push(" AND c.teacher_id = ").push_bind(caller.user_id.clone());
        }
        Role::Student | Role::Parent => {
            qb.push(" AND l.course_id IN (SELECT e.course_id FROM enrollments e WHERE 1 = 1");
            scope.push_filter(qb, "e.student_id");
            qb.push(")");
        }
    }
}

async fn assert_can_view_lesson(
    pool: &Db,
    caller: &AuthUser,
    course_id: &str,
    course_teacher_id: Option<&str>,
) -> AppResult<()> {
    match caller.role {
        Role::Admin => Ok(()),
        Role::Teacher if course_teacher_id == Some(caller.user_id.as_str()) => Ok(()),
        Role::Teacher => Err(AppError::Forbidden),
        Role::Student | Role::Parent => {
            let scope = access::visible_students(pool, caller).await?;
            let mut qb = QueryBuilder::<MySql>::new(
                "SELECT EXISTS(SELECT 1 FROM enrollments WHERE course_id = ",
            );
            qb.push_bind(course_id.to_string());
            scope.push_filter(&mut qb, "student_id");
            qb.push(")");
            let ok: bool = qb.build_query_scalar().fetch_one(pool).await?;
            if ok {
                Ok(())
            } else {
                Err(AppError::Forbidden)
            }
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────

async fn list_lessons(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<Vec<LessonListItem>>> {
    let pool = &state.pool;
    let mut scope = access::visible_students(pool, &user).await?;

    let mut student_id = q.student.filter(|s| !s.is_empty());
    match user.role {
        Role::Student | Role::Parent => {
            if let Some(ref id) = student_id {
                if !scope.contains(id) {
                    return Err(AppError::Forbidden);
                }
                scope = scope.narrow_to(id);
            }
            // A single visible student is selected implicitly.
            if let StudentScope::Only(ids) = &scope {
                if ids.len() == 1 {
                    student_id = ids.first().cloned();
                }
            }
        }
        Role::Teacher => {
            if let Some(ref id) = student_id {
                if !scope.contains(id) {
                    return Err(AppError::Forbidden);
                }
            }
        }
        Role::Admin => {}
    }

    let Some(student_id) = student_id else {
        let mut qb = QueryBuilder::<MySql>::new(
            "SELECT l.id, l.course_id, c.name AS course_name, l.date, l.topic, l.cycle
             FROM lessons l
             JOIN courses c ON c.id = l.course_id
             WHERE 1 = 1",
        );
        push_lesson_scope(&mut qb, &user, &scope);
        if let Some(course) = q.course.filter(|c| !c.is_empty()) {
            qb.push(" AND l.course_id = ").push_bind(course);
        }
        qb.push(" ORDER BY l.date DESC, l.id DESC");

        let rows: Vec<LessonRow> = qb.build_query_as().fetch_all(pool).await?;
        let items = rows
            .into_iter()
            .map(|lesson| LessonListItem { lesson, attendance: None, result: String::new() })
            .collect();
        return Ok(Json(items));
    };

    let mut qb = QueryBuilder::<MySql>::new(
        "SELECT l.id, l.course_id, c.name AS course_name, l.date, l.topic, l.cycle,
                ls.attended, ls.result
         FROM lesson_students ls
         JOIN lessons l ON l.id = ls.lesson_id
         JOIN courses c ON c.id = l.course_id
         WHERE ls.student_id = ",
    );
    qb.push_bind(student_id.clone());
    push_lesson_scope(&mut qb, &user, &scope);
    if let Some(course) = q.course.filter(|c| !c.is_empty()) {
        qb.push(" AND l.course_id = ").push_bind(course);
    }
    qb.push(" ORDER BY l.date DESC, l.id DESC");
    let entries: Vec<EntryRow> = qb.build_query_as().fetch_all(pool).await?;

    // Newest first, so the first report seen per lesson wins.
    let reports = sqlx::query_as::<_, ReportTextRow>(
        "SELECT r.lesson_id, r.student_id, r.text
         FROM lesson_reports r
         JOIN lesson_students ls ON ls.lesson_id = r.lesson_id AND ls.student_id = ?
         WHERE r.student_id = ? OR r.student_id IS NULL
         ORDER BY r.created_at DESC",
    )
    .bind(&student_id)
    .bind(&student_id)
    .fetch_all(pool)
    .await?;

    let mut student_reports: HashMap<String, String> = HashMap::new();
    let mut general_reports: HashMap<String, String> = HashMap::new();
    for report in reports {
        let target = if report.student_id.is_some() {
            &mut student_reports
        } else {
            &mut general_reports
        };
        target.entry(report.lesson_id).or_insert(report.text);
    }

    let items = entries
        .into_iter()
        .map(|e| {
            let result = resolve_result(
                &e.result,
                student_reports.get(&e.id).map(String::as_str),
                general_reports.get(&e.id).map(String::as_str),
            );
            LessonListItem {
                lesson: LessonRow {
                    id:          e.id,
                    course_id:   e.course_id,
                    course_name: e.course_name,
                    date:        e.date,
                    topic:       e.topic,
                    cycle:       e.cycle,
                },
                attendance: Some(e.attended),
                result,
            }
        })
        .collect();
    Ok(Json(items))
}

async fn create_lesson(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateLessonBody>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    if !user.is_staff() {
        return Err(AppError::Forbidden);
    }
    body.validate()?;
    let pool = &state.pool;
    access::assert_teaches_course(pool, &user, &body.course_id).await?;

    let available: Vec<String> = sqlx::query_scalar(
        "SELECT e.student_id
         FROM enrollments e
         JOIN users u ON u.id = e.student_id
         WHERE e.course_id = ? AND u.cycle = ?",
    )
    .bind(&body.course_id)
    .bind(body.cycle.as_str())
    .fetch_all(pool)
    .await?;

    if !foreign_ids(&body.student_ids, &available).is_empty() {
        return Err(AppError::Forbidden);
    }
    let mut selected: Vec<&String> = Vec::new();
    for id in &body.student_ids {
        if !selected.contains(&id) {
            selected.push(id);
        }
    }
    if selected.is_empty() {
        return Err(AppError::Validation(FieldErrors::single(
            "student_ids",
            "Select at least one student",
        )));
    }

    let lesson_id = Uuid::new_v4().to_string();
    let result = body.result.as_deref().map(str::trim).unwrap_or_default();
    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO lessons (id, course_id, date, topic, cycle, created_by) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&lesson_id)
    .bind(&body.course_id)
    .bind(body.date)
    .bind(body.topic.trim())
    .bind(body.cycle.as_str())
    .bind(&user.user_id)
    .execute(&mut *tx)
    .await?;

    for student_id in &selected {
        sqlx::query(
            "INSERT INTO lesson_students (id, lesson_id, student_id, attended, result)
             VALUES (?, ?, ?, 1, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&lesson_id)
        .bind(student_id.as_str())
        .bind(result)
        .execute(&mut *tx)
        .await?;
    }

    let text = body.report_text.as_deref().map(str::trim).unwrap_or_default();
    let media = body.media_url.as_deref().map(str::trim).unwrap_or_default();
    if !text.is_empty() || !media.is_empty() {
        sqlx::query(
            "INSERT INTO lesson_reports (id, lesson_id, student_id, text, media_url)
             VALUES (?, ?, NULL, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&lesson_id)
        .bind(text)
        .bind(media)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    tracing::info!(%lesson_id, course_id = %body.course_id, students = selected.len(), "Lesson created");

    Ok((StatusCode::CREATED, Json(json!({ "id": lesson_id }))))
}

async fn get_lesson(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> AppResult<Json<LessonDetail>> {
    let pool = &state.pool;

    #[derive(sqlx::FromRow)]
    struct Owner {
        course_id:  String,
        teacher_id: Option<String>,
    }
    let owner = sqlx::query_as::<_, Owner>(
        "SELECT l.course_id, c.teacher_id FROM lessons l JOIN courses c ON c.id = l.course_id WHERE l.id = ?",
    )
    .bind(&id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::NotFound)?;
    assert_can_view_lesson(pool, &user, &owner.course_id, owner.teacher_id.as_deref()).await?;

    let lesson = sqlx::query_as::<_, LessonRow>(
        "SELECT l.id, l.course_id, c.name AS course_name, l.date, l.topic, l.cycle
         FROM lessons l JOIN courses c ON c.id = l.course_id
         WHERE l.id = ?",
    )
    .bind(&id)
    .fetch_one(pool)
    .await?;

    let mut students_qb = QueryBuilder::<MySql>::new(
        "SELECT ls.student_id, u.username, ls.attended, ls.result
         FROM lesson_students ls JOIN users u ON u.id = ls.student_id
         WHERE ls.lesson_id = ",
    );
    students_qb.push_bind(id.clone());
    // Students and parents only see their own rows.
    let scope = match user.role {
        Role::Admin | Role::Teacher => StudentScope::All,
        Role::Student | Role::Parent => access::visible_students(pool, &user).await?,
    };
    scope.push_filter(&mut students_qb, "ls.student_id");
    students_qb.push(" ORDER BY u.username");
    let students: Vec<LessonStudentRow> = students_qb.build_query_as().fetch_all(pool).await?;

    let reports = sqlx::query_as::<_, ReportRow>(
        "SELECT r.id, r.student_id, u.username AS student_name, r.text, r.media_url, r.created_at
         FROM lesson_reports r
         LEFT JOIN users u ON u.id = r.student_id
         WHERE r.lesson_id = ?
         ORDER BY r.created_at DESC",
    )
    .bind(&id)
    .fetch_all(pool)
    .await?;

    Ok(Json(LessonDetail { lesson, students, reports }))
}

async fn set_attendance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path((lesson_id, student_id)): Path<(String, String)>,
    Json(body): Json<AttendanceBody>,
) -> AppResult<StatusCode> {
    let pool = &state.pool;
    let teacher_id: Option<Option<String>> = sqlx::query_scalar(
        "SELECT c.teacher_id
         FROM lesson_students ls
         JOIN lessons l ON l.id = ls.lesson_id
         JOIN courses c ON c.id = l.course_id
         WHERE ls.lesson_id = ? AND ls.student_id = ?",
    )
    .bind(&lesson_id)
    .bind(&student_id)
    .fetch_optional(pool)
    .await?;
    let teacher_id = teacher_id.ok_or(AppError::NotFound)?;

    match user.role {
        Role::Admin => {}
        Role::Teacher if teacher_id.as_deref() == Some(user.user_id.as_str()) => {}
        Role::Teacher | Role::Student | Role::Parent => return Err(AppError::Forbidden),
    }

    sqlx::query("UPDATE lesson_students SET attended = ? WHERE lesson_id = ? AND student_id = ?")
        .bind(body.attended)
        .bind(&lesson_id)
        .bind(&student_id)
        .execute(pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn bulk_delete(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<IdsBody>,
) -> AppResult<Json<serde_json::Value>> {
    body.validate()?;
    let pool = &state.pool;

    let mut qb = match user.role {
        Role::Admin => QueryBuilder::<MySql>::new("DELETE l FROM lessons l WHERE 1 = 1"),
        Role::Teacher => {
            let mut qb = QueryBuilder::<MySql>::new(
                "DELETE l FROM lessons l JOIN courses c ON c.id = l.course_id WHERE c.teacher_id = ",
            );
            qb.push_bind(user.user_id.clone());
            qb
        }
        Role::Student | Role::Parent => return Err(AppError::Forbidden),
    };
    push_id_list(&mut qb, "l.id", &body.ids);

    let deleted = qb.build().execute(pool).await?.rows_affected();
    tracing::info!(user_id = %user.user_id, deleted, "Lessons deleted");
    Ok(Json(json!({ "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_prefers_entry_then_student_then_general_report() {
        assert_eq!(resolve_result("scales ok", Some("mine"), Some("all")), "scales ok");
        assert_eq!(resolve_result("", Some("mine"), Some("all")), "mine");
        assert_eq!(resolve_result("", Some(""), Some("all")), "all");
        assert_eq!(resolve_result("", None, None), "");
    }

    #[test]
    fn students_outside_the_cycle_are_foreign() {
        let allowed = vec!["a".to_string(), "b".to_string()];
        let requested = vec!["a".to_string(), "z".to_string()];
        assert_eq!(foreign_ids(&requested, &allowed), vec![&"z".to_string()]);
        assert!(foreign_ids(&allowed, &allowed).is_empty());
    }

    #[test]
    fn empty_student_selection_is_a_field_error() {
        let body: CreateLessonBody = serde_json::from_str(
            r#"{"course_id":"c","date":"2024-05-01","topic":"Scales","cycle":"general","student_ids":[]}"#,
        )
        .unwrap();
        let errors = body.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("student_ids"));
    }

    #[test]
    fn teacher_scope_filters_by_course_teacher() {
        let teacher = AuthUser { user_id: "t".into(), role: Role::Teacher };
        let mut qb = QueryBuilder::<MySql>::new("SELECT 1 FROM lessons l JOIN courses c WHERE 1 = 1");
        push_lesson_scope(&mut qb, &teacher, &StudentScope::All);
        assert!(qb.sql().ends_with("AND c.teacher_id = ?"));

        let parent = AuthUser { user_id: "p".into(), role: Role::Parent };
        let mut qb = QueryBuilder::<MySql>::new("SELECT 1 FROM lessons l WHERE 1 = 1");
        push_lesson_scope(&mut qb, &parent, &StudentScope::Only(Vec::new()));
        assert!(qb.sql().contains("AND 1 = 0)"));
    }
}
