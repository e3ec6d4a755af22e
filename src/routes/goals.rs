//! `/goals` — monthly goals per student.

use std::collections::HashSet;

use axum::{
    extract::{Extension, Query, State},
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
    errors::{AppError, AppResult, FieldErrors},
    middleware::auth_guard::AuthUser,
    models::{display_name, Role},
    services::{access, attendance::month_start},
    state::AppState,
};

use super::{push_id_list, today, IdsBody};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/goals",             get(list_goals).post(create_goal))
        .route("/goals/bulk-delete", post(bulk_delete))
}

#[derive(sqlx::FromRow)]
struct GoalRow {
    id:               String,
    student_id:       String,
    student_username: String,
    student_first:    String,
    student_last:     String,
    teacher_id:       Option<String>,
    month:            NaiveDate,
    title:            String,
    details:          String,
}

#[derive(Serialize)]
struct GoalItem {
    id:           String,
    student_id:   String,
    student_name: String,
    teacher_id:   Option<String>,
    month:        NaiveDate,
    title:        String,
    details:      String,
    can_delete:   bool,
}

#[derive(Serialize)]
struct GoalList {
    /// The applied student filter; an out-of-scope request is dropped.
    selected_student: Option<String>,
    can_edit:         bool,
    goals:            Vec<GoalItem>,
}

#[derive(Deserialize)]
struct GoalQuery {
    student: Option<String>,
}

#[derive(Deserialize, Validate)]
struct CreateGoalBody {
    student_id: String,
    #[validate(length(min = 1, max = 255, message = "Title is required (at most 255 characters)"))]
    title:      String,
    #[serde(default)]
    details:    String,
    /// `YYYY-MM` or any date inside the month; defaults to the current month.
    month:      Option<String>,
}

/// Admins delete any goal; teachers their own goals or goals of their students.
fn can_delete_goal(
    caller: &AuthUser,
    goal_teacher_id: Option<&str>,
    goal_student_id: &str,
    teacher_students: &HashSet<String>,
) -> bool {
    match caller.role {
        Role::Admin => true,
        Role::Teacher => {
            goal_teacher_id == Some(caller.user_id.as_str())
                || teacher_students.contains(goal_student_id)
        }
        Role::Student | Role::Parent => false,
    }
}

/// Goals are kept per month, stored as the first day of that month.
fn goal_month(raw: Option<&str>, today: NaiveDate) -> AppResult<NaiveDate> {
    let Some(value) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(month_start(today));
    };
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{value}-01"), "%Y-%m-%d"))
        .map(month_start)
        .map_err(|_| AppError::Validation(FieldErrors::single("month", "Month must be YYYY-MM")))
}

async fn teacher_students(state: &AppState, caller: &AuthUser) -> AppResult<HashSet<String>> {
    match caller.role {
        Role::Teacher => Ok(access::teacher_student_ids(&state.pool, &caller.user_id)
            .await?
            .into_iter()
            .collect()),
        Role::Admin | Role::Student | Role::Parent => Ok(HashSet::new()),
    }
}

async fn list_goals(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<GoalQuery>,
) -> AppResult<Json<GoalList>> {
    let pool = &state.pool;
    let scope = access::visible_students(pool, &user).await?;
    let selected = q
        .student
        .filter(|s| !s.is_empty())
        .filter(|s| scope.contains(s));

    let mut qb = QueryBuilder::<MySql>::new(
        "SELECT g.id, g.student_id, u.username AS student_username,
                u.first_name AS student_first, u.last_name AS student_last,
                g.teacher_id, g.month, g.title, g.details
         FROM goals g JOIN users u ON u.id = g.student_id
         WHERE u.role = 'student'",
    );
    match &selected {
        Some(student_id) => scope.narrow_to(student_id).push_filter(&mut qb, "g.student_id"),
        None => scope.push_filter(&mut qb, "g.student_id"),
    }
    qb.push(" ORDER BY g.month, u.username, g.created_at");
    let rows: Vec<GoalRow> = qb.build_query_as().fetch_all(pool).await?;

    let taught = teacher_students(&state, &user).await?;
    let goals = rows
        .into_iter()
        .map(|r| GoalItem {
            can_delete:   can_delete_goal(&user, r.teacher_id.as_deref(), &r.student_id, &taught),
            student_name: display_name(&r.student_first, &r.student_last, &r.student_username),
            id:           r.id,
            student_id:   r.student_id,
            teacher_id:   r.teacher_id,
            month:        r.month,
            title:        r.title,
            details:      r.details,
        })
        .collect();

    Ok(Json(GoalList { selected_student: selected, can_edit: user.is_staff(), goals }))
}

async fn create_goal(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateGoalBody>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    body.validate()?;
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
                return Err(AppError::Validation(FieldErrors::single(
                    "student_id",
                    "Unknown student",
                )));
            }
        }
        Role::Teacher => access::assert_manages_student(pool, &user, &body.student_id).await?,
        Role::Student | Role::Parent => return Err(AppError::Forbidden),
    }

    let month = goal_month(body.month.as_deref(), today())?;
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO goals (id, student_id, teacher_id, month, title, details)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&body.student_id)
    .bind(&user.user_id)
    .bind(month)
    .bind(body.title.trim())
    .bind(body.details.trim())
    .execute(pool)
    .await?;

    tracing::info!(goal_id = %id, student_id = %body.student_id, %month, "Goal created");
    Ok((StatusCode::CREATED, Json(json!({ "id": id, "month": month }))))
}

async fn bulk_delete(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<IdsBody>,
) -> AppResult<Json<serde_json::Value>> {
    if !user.is_staff() {
        return Err(AppError::Forbidden);
    }
    body.validate()?;
    let pool = &state.pool;

    #[derive(sqlx::FromRow)]
    struct Owner {
        id:         String,
        student_id: String,
        teacher_id: Option<String>,
    }

    let mut qb = QueryBuilder::<MySql>::new("SELECT id, student_id, teacher_id FROM goals WHERE 1 = 1");
    push_id_list(&mut qb, "id", &body.ids);
    let owners: Vec<Owner> = qb.build_query_as().fetch_all(pool).await?;

    let taught = teacher_students(&state, &user).await?;
    if owners
        .iter()
        .any(|o| !can_delete_goal(&user, o.teacher_id.as_deref(), &o.student_id, &taught))
    {
        return Err(AppError::Forbidden);
    }

    let ids: Vec<String> = owners.into_iter().map(|o| o.id).collect();
    let mut qb = QueryBuilder::<MySql>::new("DELETE FROM goals WHERE 1 = 1");
    push_id_list(&mut qb, "id", &ids);
    let deleted = qb.build().execute(pool).await?.rows_affected();

    tracing::info!(user_id = %user.user_id, deleted, "Goals deleted");
    Ok(Json(json!({ "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(role: Role) -> AuthUser {
        AuthUser { user_id: "t1".into(), role }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn delete_rights_by_role() {
        let taught: HashSet<String> = ["s1".to_string()].into_iter().collect();
        assert!(can_delete_goal(&caller(Role::Admin), None, "s9", &taught));
        assert!(can_delete_goal(&caller(Role::Teacher), Some("t1"), "s9", &taught));
        assert!(can_delete_goal(&caller(Role::Teacher), Some("t2"), "s1", &taught));
        assert!(!can_delete_goal(&caller(Role::Teacher), Some("t2"), "s9", &taught));
        assert!(!can_delete_goal(&caller(Role::Student), Some("t1"), "s1", &taught));
        assert!(!can_delete_goal(&caller(Role::Parent), None, "s1", &taught));
    }

    #[test]
    fn month_is_normalised_to_its_first_day() {
        let today = date(2024, 9, 18);
        assert_eq!(goal_month(None, today).unwrap(), date(2024, 9, 1));
        assert_eq!(goal_month(Some(""), today).unwrap(), date(2024, 9, 1));
        assert_eq!(goal_month(Some("2024-11"), today).unwrap(), date(2024, 11, 1));
        assert_eq!(goal_month(Some("2025-02-14"), today).unwrap(), date(2025, 2, 1));
        assert!(matches!(goal_month(Some("next month"), today), Err(AppError::Validation(_))));
    }
}
