//! Gradebook routes.
//!
//! Teacher side (course teacher or admin):
//! * `GET  /teacher/courses/{id}/grades`       — students × assessments table
//! * `PUT  /teacher/courses/{id}/grades`       — batch save of score/comment cells
//! * `POST /teacher/courses/{id}/grades/clear` — wipe scores of selected assessments
//! * `POST /teacher/courses/{id}/assessments`  — add a non-homework assessment
//!
//! Student side (student or parent):
//! * `GET  /courses/{id}/grades?student=`      — rows, weighted average and progress

use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{MySql, QueryBuilder};
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::Db,
    errors::{AppError, AppResult, FieldErrors},
    middleware::auth_guard::AuthUser,
    models::{display_name, AssessmentType, Role, TargetStatus},
    services::{
        access,
        grades::{
            parse_score, percent, progress_summary, weighted_average_percent, ProgressSummary,
            ScoredAssessment, TargetProgress, COMMENT_MAX_CHARS,
        },
    },
    state::AppState,
};

use super::{parse_cycle, push_id_list, today, IdsBody};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/teacher/courses/{id}/grades",       get(course_table).put(save_grades))
        .route("/teacher/courses/{id}/grades/clear", post(clear_grades))
        .route("/teacher/courses/{id}/assessments",  post(create_assessment))
        .route("/courses/{id}/grades",               get(student_grades))
}

// ── Row types ────────────────────────────────────────────────

#[derive(sqlx::FromRow, Serialize, Clone)]
struct AssessmentRow {
    id:              String,
    title:           String,
    assessment_type: String,
    max_score:       f64,
    weight:          f64,
}

#[derive(sqlx::FromRow)]
struct GradeRow {
    student_id:    String,
    assessment_id: String,
    score:         Option<f64>,
    comment:       String,
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
struct TargetRow {
    due_date: NaiveDate,
    status:   String,
}

// ── Response types ───────────────────────────────────────────

#[derive(Serialize)]
struct TableCell {
    assessment_id: String,
    score:         Option<f64>,
    comment:       String,
}

#[derive(Serialize)]
struct TableRow {
    student_id:      String,
    name:            String,
    cycle:           String,
    cells:           Vec<TableCell>,
    average_percent: Option<f64>,
}

#[derive(Serialize)]
struct CourseTable {
    course_id:   String,
    course_name: String,
    assessments: Vec<AssessmentRow>,
    rows:        Vec<TableRow>,
}

#[derive(Serialize)]
struct SaveResult {
    saved:  usize,
    errors: FieldErrors,
}

#[derive(Serialize)]
struct StudentGradeRow {
    #[serde(flatten)]
    assessment: AssessmentRow,
    score:      Option<f64>,
    comment:    String,
    percent:    Option<f64>,
}

#[derive(Serialize)]
struct TrendPoint {
    label: String,
    score: f64,
}

#[derive(Serialize)]
struct StudentGrades {
    course_id:       String,
    course_name:     String,
    student_id:      String,
    rows:            Vec<StudentGradeRow>,
    average_percent: Option<f64>,
    summary:         ProgressSummary,
    trend:           Vec<TrendPoint>,
}

// ── Request types ────────────────────────────────────────────

#[derive(Deserialize)]
struct CycleQuery {
    cycle: Option<String>,
}

#[derive(Deserialize)]
struct StudentQuery {
    student: Option<String>,
}

#[derive(Deserialize)]
struct GradeCellInput {
    student_id:    String,
    assessment_id: String,
    /// Whole number, numeric string, empty string or null.
    #[serde(default)]
    score:         Option<serde_json::Value>,
    #[serde(default)]
    comment:       String,
}

#[derive(Deserialize)]
struct SaveGradesBody {
    cells: Vec<GradeCellInput>,
}

#[derive(Deserialize, Validate)]
struct CreateAssessmentBody {
    #[validate(length(min = 1, max = 200, message = "Title is required (at most 200 characters)"))]
    title:           String,
    assessment_type: AssessmentType,
    #[validate(range(min = 1.0, message = "Maximum score must be positive"))]
    max_score:       Option<f64>,
    #[validate(range(min = 0.0, message = "Weight cannot be negative"))]
    weight:          Option<f64>,
}

// ── Helpers ──────────────────────────────────────────────────

fn cell_key(student_id: &str, assessment_id: &str) -> String {
    format!("{student_id}:{assessment_id}")
}

fn score_text(value: Option<&serde_json::Value>) -> Result<String, &'static str> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(String::new()),
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err("Score must be a whole number"),
    }
}

/// Check one gradebook cell against the course roster and its assessments.
fn validate_cell(
    cell: &GradeCellInput,
    students: &HashSet<&str>,
    assessments: &HashSet<&str>,
) -> Result<(Option<f64>, String), &'static str> {
    if !students.contains(cell.student_id.as_str()) || !assessments.contains(cell.assessment_id.as_str()) {
        return Err("Unknown student or assessment for this course");
    }
    let comment = cell.comment.trim();
    if comment.chars().count() >= COMMENT_MAX_CHARS {
        return Err("Comment must be shorter than 50 characters");
    }
    let score = parse_score(&score_text(cell.score.as_ref())?)?;
    Ok((score, comment.to_string()))
}

async fn course_name(pool: &Db, course_id: &str) -> AppResult<String> {
    sqlx::query_scalar("SELECT name FROM courses WHERE id = ?")
        .bind(course_id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound)
}

async fn course_assessments(pool: &Db, course_id: &str) -> AppResult<Vec<AssessmentRow>> {
    let rows = sqlx::query_as::<_, AssessmentRow>(
        "SELECT id, title, assessment_type, max_score, weight
         FROM assessments WHERE course_id = ?
         ORDER BY created_at, id",
    )
    .bind(course_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

async fn enrolled_student_ids(pool: &Db, course_id: &str) -> AppResult<Vec<String>> {
    let ids = sqlx::query_scalar("SELECT student_id FROM enrollments WHERE course_id = ?")
        .bind(course_id)
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// Which enrolled student a student or parent is looking at.
async fn resolve_viewed_student(
    pool: &Db,
    caller: &AuthUser,
    course_id: &str,
    requested: Option<&str>,
) -> AppResult<String> {
    match caller.role {
        Role::Student => {
            if !access::is_enrolled(pool, course_id, &caller.user_id).await? {
                return Err(AppError::Forbidden);
            }
            Ok(caller.user_id.clone())
        }
        Role::Parent => {
            let children = access::children_of(pool, &caller.user_id).await?;
            let student_id = match requested {
                Some(id) => {
                    if !children.iter().any(|c| c == id) {
                        return Err(AppError::Forbidden);
                    }
                    id.to_string()
                }
                None => {
                    let enrolled = enrolled_student_ids(pool, course_id).await?;
                    let mut candidates = children.into_iter().filter(|c| enrolled.contains(c));
                    match (candidates.next(), candidates.next()) {
                        (Some(only), None) => only,
                        // No enrolled child, or several and none selected.
                        _ => return Err(AppError::Forbidden),
                    }
                }
            };
            if !access::is_enrolled(pool, course_id, &student_id).await? {
                return Err(AppError::Forbidden);
            }
            Ok(student_id)
        }
        Role::Admin | Role::Teacher => Err(AppError::Forbidden),
    }
}

// ── Teacher handlers ─────────────────────────────────────────

async fn course_table(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(course_id): Path<String>,
    Query(q): Query<CycleQuery>,
) -> AppResult<Json<CourseTable>> {
    let pool = &state.pool;
    access::assert_teaches_course(pool, &user, &course_id).await?;
    let cycle = parse_cycle(q.cycle.as_deref())?;

    let name = course_name(pool, &course_id).await?;
    let assessments = course_assessments(pool, &course_id).await?;

    let mut qb = QueryBuilder::<MySql>::new(
        "SELECT u.id, u.username, u.first_name, u.last_name, u.cycle
         FROM enrollments e JOIN users u ON u.id = e.student_id
         WHERE e.course_id = ",
    );
    qb.push_bind(course_id.clone());
    if let Some(cycle) = cycle {
        qb.push(" AND u.cycle = ").push_bind(cycle.as_str());
    }
    qb.push(" ORDER BY u.username");
    let students: Vec<StudentRow> = qb.build_query_as().fetch_all(pool).await?;

    let grades = sqlx::query_as::<_, GradeRow>(
        "SELECT g.student_id, g.assessment_id, g.score, g.comment
         FROM grades g JOIN assessments a ON a.id = g.assessment_id
         WHERE a.course_id = ?",
    )
    .bind(&course_id)
    .fetch_all(pool)
    .await?;
    let grade_map: HashMap<(String, String), GradeRow> = grades
        .into_iter()
        .map(|g| ((g.student_id.clone(), g.assessment_id.clone()), g))
        .collect();

    let rows = students
        .into_iter()
        .map(|s| {
            let mut scored = Vec::with_capacity(assessments.len());
            let cells = assessments
                .iter()
                .map(|a| {
                    let grade = grade_map.get(&(s.id.clone(), a.id.clone()));
                    let score = grade.and_then(|g| g.score);
                    scored.push(ScoredAssessment { max_score: a.max_score, weight: a.weight, score });
                    TableCell {
                        assessment_id: a.id.clone(),
                        score,
                        comment: grade.map(|g| g.comment.clone()).unwrap_or_default(),
                    }
                })
                .collect();
            TableRow {
                name: display_name(&s.first_name, &s.last_name, &s.username),
                student_id: s.id,
                cycle: s.cycle,
                cells,
                average_percent: weighted_average_percent(scored),
            }
        })
        .collect();

    Ok(Json(CourseTable { course_id, course_name: name, assessments, rows }))
}

async fn save_grades(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(course_id): Path<String>,
    Json(body): Json<SaveGradesBody>,
) -> AppResult<Json<SaveResult>> {
    let pool = &state.pool;
    access::assert_teaches_course(pool, &user, &course_id).await?;

    let student_ids = enrolled_student_ids(pool, &course_id).await?;
    let assessments = course_assessments(pool, &course_id).await?;
    let students: HashSet<&str> = student_ids.iter().map(String::as_str).collect();
    let assessment_ids: HashSet<&str> = assessments.iter().map(|a| a.id.as_str()).collect();

    let mut errors = FieldErrors::default();
    let mut valid = Vec::new();
    for cell in &body.cells {
        match validate_cell(cell, &students, &assessment_ids) {
            Ok((score, comment)) => valid.push((cell, score, comment)),
            Err(message) => errors.add(cell_key(&cell.student_id, &cell.assessment_id), message),
        }
    }

    let mut tx = pool.begin().await?;
    for (cell, score, comment) in &valid {
        sqlx::query(
            "INSERT INTO grades (id, assessment_id, student_id, score, comment)
             VALUES (?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE score = VALUES(score), comment = VALUES(comment)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&cell.assessment_id)
        .bind(&cell.student_id)
        .bind(*score)
        .bind(comment)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    if !errors.is_empty() {
        tracing::warn!(%course_id, saved = valid.len(), "Some grade cells were rejected");
    }
    Ok(Json(SaveResult { saved: valid.len(), errors }))
}

async fn clear_grades(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(course_id): Path<String>,
    Json(body): Json<IdsBody>,
) -> AppResult<Json<serde_json::Value>> {
    body.validate()?;
    let pool = &state.pool;
    access::assert_teaches_course(pool, &user, &course_id).await?;

    let mut qb = QueryBuilder::<MySql>::new("SELECT id FROM assessments WHERE course_id = ");
    qb.push_bind(course_id.clone());
    push_id_list(&mut qb, "id", &body.ids);
    let existing: Vec<String> = qb.build_query_scalar().fetch_all(pool).await?;

    let requested: HashSet<&String> = body.ids.iter().collect();
    if existing.len() != requested.len() {
        return Err(AppError::Forbidden);
    }

    let mut qb = QueryBuilder::<MySql>::new("UPDATE grades SET score = NULL, comment = '' WHERE 1 = 1");
    push_id_list(&mut qb, "assessment_id", &existing);
    let cleared = qb.build().execute(pool).await?.rows_affected();

    tracing::info!(%course_id, cleared, "Grades cleared");
    Ok(Json(json!({ "cleared": cleared })))
}

async fn create_assessment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(course_id): Path<String>,
    Json(body): Json<CreateAssessmentBody>,
) -> AppResult<(StatusCode, Json<AssessmentRow>)> {
    body.validate()?;
    let pool = &state.pool;
    access::assert_teaches_course(pool, &user, &course_id).await?;

    let row = AssessmentRow {
        id:              Uuid::new_v4().to_string(),
        title:           body.title.trim().to_string(),
        assessment_type: body.assessment_type.as_str().to_string(),
        max_score:       body.max_score.unwrap_or(100.0),
        weight:          body.weight.unwrap_or(1.0),
    };

    let insert = sqlx::query(
        "INSERT INTO assessments (id, course_id, title, assessment_type, max_score, weight)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&row.id)
    .bind(&course_id)
    .bind(&row.title)
    .bind(&row.assessment_type)
    .bind(row.max_score)
    .bind(row.weight)
    .execute(pool)
    .await;

    if let Err(sqlx::Error::Database(ref db_err)) = insert {
        if db_err.is_unique_violation() {
            return Err(AppError::Conflict(
                "An assessment with this title already exists in the course".into(),
            ));
        }
    }
    insert?;

    Ok((StatusCode::CREATED, Json(row)))
}

// ── Student / parent handler ─────────────────────────────────

async fn student_grades(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(course_id): Path<String>,
    Query(q): Query<StudentQuery>,
) -> AppResult<Json<StudentGrades>> {
    let pool = &state.pool;
    let name = course_name(pool, &course_id).await?;
    let requested = q.student.as_deref().filter(|s| !s.is_empty());
    let student_id = resolve_viewed_student(pool, &user, &course_id, requested).await?;

    let assessments = course_assessments(pool, &course_id).await?;
    let grades = sqlx::query_as::<_, GradeRow>(
        "SELECT g.student_id, g.assessment_id, g.score, g.comment
         FROM grades g JOIN assessments a ON a.id = g.assessment_id
         WHERE a.course_id = ? AND g.student_id = ?",
    )
    .bind(&course_id)
    .bind(&student_id)
    .fetch_all(pool)
    .await?;
    let by_assessment: HashMap<&str, &GradeRow> =
        grades.iter().map(|g| (g.assessment_id.as_str(), g)).collect();

    let targets: Vec<TargetProgress> = sqlx::query_as::<_, TargetRow>(
        "SELECT a.due_date, t.status
         FROM assignment_targets t JOIN assignments a ON a.id = t.assignment_id
         WHERE t.student_id = ? AND a.course_id = ?",
    )
    .bind(&student_id)
    .bind(&course_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|t| TargetProgress {
        due_date: t.due_date,
        status:   t.status.parse().unwrap_or(TargetStatus::Todo),
    })
    .collect();

    let mut rows = Vec::with_capacity(assessments.len());
    let mut scored = Vec::with_capacity(assessments.len());
    let mut trend = Vec::new();
    for a in assessments {
        let grade = by_assessment.get(a.id.as_str());
        let score = grade.and_then(|g| g.score);
        scored.push(ScoredAssessment { max_score: a.max_score, weight: a.weight, score });
        if let Some(score) = score {
            trend.push(TrendPoint { label: a.title.clone(), score });
        }
        rows.push(StudentGradeRow {
            percent: percent(score, a.max_score),
            comment: grade.map(|g| g.comment.clone()).unwrap_or_default(),
            score,
            assessment: a,
        });
    }

    let scores: Vec<Option<f64>> = grades.iter().map(|g| g.score).collect();
    Ok(Json(StudentGrades {
        course_id,
        course_name: name,
        student_id,
        rows,
        average_percent: weighted_average_percent(scored),
        summary: progress_summary(&scores, &targets, today()),
        trend,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cell(student: &str, assessment: &str, score: serde_json::Value, comment: &str) -> GradeCellInput {
        GradeCellInput {
            student_id:    student.into(),
            assessment_id: assessment.into(),
            score:         Some(score),
            comment:       comment.into(),
        }
    }

    fn roster() -> (HashSet<&'static str>, HashSet<&'static str>) {
        (["s1"].into_iter().collect(), ["a1"].into_iter().collect())
    }

    #[test]
    fn valid_cells_parse_numbers_and_strings() {
        let (students, assessments) = roster();
        assert_eq!(
            validate_cell(&cell("s1", "a1", json!(87), " good "), &students, &assessments),
            Ok((Some(87.0), "good".to_string()))
        );
        assert_eq!(
            validate_cell(&cell("s1", "a1", json!("90"), ""), &students, &assessments),
            Ok((Some(90.0), String::new()))
        );
        assert_eq!(
            validate_cell(&cell("s1", "a1", json!(null), ""), &students, &assessments),
            Ok((None, String::new()))
        );
    }

    #[test]
    fn invalid_cells_are_rejected() {
        let (students, assessments) = roster();
        assert!(validate_cell(&cell("s1", "a1", json!(101), ""), &students, &assessments).is_err());
        assert!(validate_cell(&cell("s1", "a1", json!(9.5), ""), &students, &assessments).is_err());
        assert!(validate_cell(&cell("s1", "a1", json!(true), ""), &students, &assessments).is_err());
        assert!(validate_cell(&cell("s2", "a1", json!(50), ""), &students, &assessments).is_err());
        assert!(validate_cell(&cell("s1", "a9", json!(50), ""), &students, &assessments).is_err());
    }

    #[test]
    fn comment_must_stay_under_fifty_chars() {
        let (students, assessments) = roster();
        let ok = "x".repeat(49);
        let too_long = "x".repeat(50);
        assert!(validate_cell(&cell("s1", "a1", json!(""), &ok), &students, &assessments).is_ok());
        assert!(validate_cell(&cell("s1", "a1", json!(""), &too_long), &students, &assessments).is_err());
    }

    #[test]
    fn cell_keys_name_student_and_assessment() {
        assert_eq!(cell_key("s1", "a1"), "s1:a1");
    }
}
