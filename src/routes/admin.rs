//! `/admin` routes — accounts, courses, enrollments and parent links.
//! All routes in this module require the `Admin` role.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::hash_password,
    db::Db,
    errors::{AppError, AppResult},
    middleware::{auth_guard::AuthUser, role_guard::require_admin},
    models::{CourseType, Cycle, Role},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    // require_admin reads Extension<AuthUser> (injected by require_auth in mod.rs);
    // it does not need AppState, so plain from_fn is sufficient.
    let admin_guard = middleware::from_fn(require_admin);
    Router::new()
        .route("/admin/users",                              get(list_users).post(create_user))
        .route("/admin/users/{id}",                         put(update_user))
        .route("/admin/courses",                            get(list_courses).post(create_course))
        .route("/admin/courses/{id}/students",              post(enroll_student))
        .route("/admin/courses/{id}/students/{student_id}", delete(unenroll_student))
        .route("/admin/parents/{id}/children",              post(link_child))
        .route("/admin/parents/{id}/children/{child_id}",   delete(unlink_child))
        .route_layer(admin_guard)
}

// ── Row types ────────────────────────────────────────────────

#[derive(sqlx::FromRow, Serialize)]
struct UserRow {
    id:           String,
    username:     String,
    first_name:   String,
    last_name:    String,
    role:         String,
    cycle:        String,
    school_grade: String,
    is_active:    bool,
}

#[derive(sqlx::FromRow, Serialize)]
struct CourseRow {
    id:            String,
    name:          String,
    course_type:   String,
    teacher_id:    Option<String>,
    student_count: i64,
}

const USER_COLUMNS: &str =
    "id, username, first_name, last_name, role, cycle, school_grade, is_active";

// ── Request bodies ───────────────────────────────────────────

#[derive(Deserialize)]
struct ListUsersQuery {
    role: Option<Role>,
}

#[derive(Deserialize, Validate)]
struct CreateUserBody {
    #[validate(length(min = 3, max = 150, message = "Username must be 3–150 characters"))]
    username:     String,
    #[validate(length(min = 1, message = "Password is required"))]
    password:     String,
    role:         Role,
    #[serde(default)]
    #[validate(length(max = 150))]
    first_name:   String,
    #[serde(default)]
    #[validate(length(max = 150))]
    last_name:    String,
    cycle:        Option<Cycle>,
    #[serde(default)]
    #[validate(length(max = 20, message = "School grade must be at most 20 characters"))]
    school_grade: String,
}

#[derive(Deserialize, Validate)]
struct UpdateUserBody {
    role:         Option<Role>,
    cycle:        Option<Cycle>,
    #[validate(length(max = 20, message = "School grade must be at most 20 characters"))]
    school_grade: Option<String>,
    is_active:    Option<bool>,
    #[validate(length(min = 1, message = "Password cannot be empty"))]
    password:     Option<String>,
}

#[derive(Deserialize, Validate)]
struct CreateCourseBody {
    #[validate(length(min = 1, max = 200, message = "Name is required (at most 200 characters)"))]
    name:        String,
    course_type: CourseType,
    teacher_id:  Option<String>,
}

#[derive(Deserialize)]
struct EnrollBody {
    student_id: String,
}

#[derive(Deserialize)]
struct LinkChildBody {
    child_id: String,
}

// ── Helpers ──────────────────────────────────────────────────

async fn fetch_user(pool: &Db, id: &str) -> AppResult<UserRow> {
    sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound)
}

/// The user must exist and carry `role`; anything else is a bad reference.
async fn require_role(pool: &Db, id: &str, role: Role) -> AppResult<()> {
    let actual: Option<String> = sqlx::query_scalar("SELECT role FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    match actual {
        None => Err(AppError::NotFound),
        Some(r) if r == role.as_str() => Ok(()),
        Some(_) => Err(AppError::BadRequest(format!("User is not a {role}"))),
    }
}

/// Admins may not lock themselves out.
fn check_self_update(admin: &AuthUser, target_id: &str, body: &UpdateUserBody) -> AppResult<()> {
    if admin.user_id != target_id {
        return Ok(());
    }
    if body.is_active == Some(false) {
        return Err(AppError::BadRequest("Cannot deactivate your own account".into()));
    }
    if body.role.is_some_and(|r| r != Role::Admin) {
        return Err(AppError::BadRequest("Cannot change your own role".into()));
    }
    Ok(())
}

// ── Users ────────────────────────────────────────────────────

async fn list_users(
    State(state): State<AppState>,
    Query(q): Query<ListUsersQuery>,
) -> AppResult<Json<Vec<UserRow>>> {
    let pool = &state.pool;
    let rows = match q.role {
        Some(role) => {
            sqlx::query_as::<_, UserRow>(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE role = ? ORDER BY username"
            ))
            .bind(role.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, UserRow>(&format!(
                "SELECT {USER_COLUMNS} FROM users ORDER BY role, username"
            ))
            .fetch_all(pool)
            .await?
        }
    };
    Ok(Json(rows))
}

async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserBody>,
) -> AppResult<(StatusCode, Json<UserRow>)> {
    body.validate()?;
    let pool = &state.pool;
    let username = body.username.trim();

    let taken: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE username = ?)")
        .bind(username)
        .fetch_one(pool)
        .await?;
    if taken {
        return Err(AppError::Conflict("Username is already taken".into()));
    }

    let id   = Uuid::new_v4().to_string();
    let hash = hash_password(&body.password)?;
    let insert = sqlx::query(
        "INSERT INTO users (id, username, first_name, last_name, password_hash, role, cycle, school_grade, is_active)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)",
    )
    .bind(&id)
    .bind(username)
    .bind(body.first_name.trim())
    .bind(body.last_name.trim())
    .bind(hash)
    .bind(body.role.as_str())
    .bind(body.cycle.unwrap_or(Cycle::General).as_str())
    .bind(body.school_grade.trim())
    .execute(pool)
    .await;

    if let Err(sqlx::Error::Database(ref db_err)) = insert {
        if db_err.code().as_deref() == Some("23000") {
            return Err(AppError::Conflict("Username is already taken".into()));
        }
    }
    insert?;

    tracing::info!(user_id = %id, role = %body.role, "User created");
    Ok((StatusCode::CREATED, Json(fetch_user(pool, &id).await?)))
}

async fn update_user(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(body): Json<UpdateUserBody>,
) -> AppResult<Json<UserRow>> {
    body.validate()?;
    check_self_update(&admin, &id, &body)?;
    let pool = &state.pool;

    // 404 before any write
    fetch_user(pool, &id).await?;

    let mut tx = pool.begin().await?;
    if let Some(role) = body.role {
        sqlx::query("UPDATE users SET role = ? WHERE id = ?")
            .bind(role.as_str()).bind(&id).execute(&mut *tx).await?;
    }
    if let Some(cycle) = body.cycle {
        sqlx::query("UPDATE users SET cycle = ? WHERE id = ?")
            .bind(cycle.as_str()).bind(&id).execute(&mut *tx).await?;
    }
    if let Some(ref grade) = body.school_grade {
        sqlx::query("UPDATE users SET school_grade = ? WHERE id = ?")
            .bind(grade.trim()).bind(&id).execute(&mut *tx).await?;
    }
    if let Some(active) = body.is_active {
        sqlx::query("UPDATE users SET is_active = ? WHERE id = ?")
            .bind(active).bind(&id).execute(&mut *tx).await?;
        if !active {
            sqlx::query("DELETE FROM user_sessions WHERE user_id = ?")
                .bind(&id).execute(&mut *tx).await?;
        }
    }
    if let Some(ref password) = body.password {
        let hash = hash_password(password)?;
        sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(hash).bind(&id).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    tracing::info!(user_id = %id, admin_id = %admin.user_id, "User updated");
    Ok(Json(fetch_user(pool, &id).await?))
}

// ── Courses ──────────────────────────────────────────────────

async fn list_courses(State(state): State<AppState>) -> AppResult<Json<Vec<CourseRow>>> {
    let rows = sqlx::query_as::<_, CourseRow>(
        "SELECT c.id, c.name, c.course_type, c.teacher_id, COUNT(e.id) AS student_count
         FROM courses c
         LEFT JOIN enrollments e ON e.course_id = c.id
         GROUP BY c.id, c.name, c.course_type, c.teacher_id
         ORDER BY c.name",
    )
    .fetch_all(&state.pool)
    .await?;
    Ok(Json(rows))
}

async fn create_course(
    State(state): State<AppState>,
    Json(body): Json<CreateCourseBody>,
) -> AppResult<(StatusCode, Json<CourseRow>)> {
    body.validate()?;
    let pool = &state.pool;
    let teacher_id = body.teacher_id.as_deref().filter(|t| !t.is_empty());
    if let Some(teacher_id) = teacher_id {
        require_role(pool, teacher_id, Role::Teacher).await?;
    }

    let row = CourseRow {
        id:            Uuid::new_v4().to_string(),
        name:          body.name.trim().to_string(),
        course_type:   body.course_type.as_str().to_string(),
        teacher_id:    teacher_id.map(str::to_string),
        student_count: 0,
    };
    sqlx::query("INSERT INTO courses (id, name, course_type, teacher_id) VALUES (?, ?, ?, ?)")
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.course_type)
        .bind(&row.teacher_id)
        .execute(pool)
        .await?;

    tracing::info!(course_id = %row.id, "Course created");
    Ok((StatusCode::CREATED, Json(row)))
}

// ── Enrollments ──────────────────────────────────────────────

async fn enroll_student(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
    Json(body): Json<EnrollBody>,
) -> AppResult<StatusCode> {
    let pool = &state.pool;
    let course_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM courses WHERE id = ?)")
        .bind(&course_id)
        .fetch_one(pool)
        .await?;
    if !course_exists {
        return Err(AppError::NotFound);
    }
    require_role(pool, &body.student_id, Role::Student).await?;

    sqlx::query("INSERT IGNORE INTO enrollments (id, course_id, student_id) VALUES (?, ?, ?)")
        .bind(Uuid::new_v4().to_string())
        .bind(&course_id)
        .bind(&body.student_id)
        .execute(pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unenroll_student(
    State(state): State<AppState>,
    Path((course_id, student_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    let affected = sqlx::query("DELETE FROM enrollments WHERE course_id = ? AND student_id = ?")
        .bind(&course_id)
        .bind(&student_id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Parent links ─────────────────────────────────────────────

async fn link_child(
    State(state): State<AppState>,
    Path(parent_id): Path<String>,
    Json(body): Json<LinkChildBody>,
) -> AppResult<StatusCode> {
    let pool = &state.pool;
    require_role(pool, &parent_id, Role::Parent).await?;
    require_role(pool, &body.child_id, Role::Student).await?;

    sqlx::query("INSERT IGNORE INTO parent_children (id, parent_id, child_id) VALUES (?, ?, ?)")
        .bind(Uuid::new_v4().to_string())
        .bind(&parent_id)
        .bind(&body.child_id)
        .execute(pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unlink_child(
    State(state): State<AppState>,
    Path((parent_id, child_id)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    let affected = sqlx::query("DELETE FROM parent_children WHERE parent_id = ? AND child_id = ?")
        .bind(&parent_id)
        .bind(&child_id)
        .execute(&state.pool)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> AuthUser {
        AuthUser { user_id: "admin-1".into(), role: Role::Admin }
    }

    fn update(json: &str) -> UpdateUserBody {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn admins_cannot_lock_themselves_out() {
        assert!(check_self_update(&admin(), "admin-1", &update(r#"{"is_active":false}"#)).is_err());
        assert!(check_self_update(&admin(), "admin-1", &update(r#"{"role":"teacher"}"#)).is_err());
        assert!(check_self_update(&admin(), "admin-1", &update(r#"{"cycle":"extra"}"#)).is_ok());
        assert!(check_self_update(&admin(), "other", &update(r#"{"is_active":false}"#)).is_ok());
    }

    #[test]
    fn unknown_roles_are_rejected_at_deserialization() {
        assert!(serde_json::from_str::<UpdateUserBody>(r#"{"role":"child"}"#).is_err());
    }

    #[test]
    fn create_user_body_defaults() {
        let body: CreateUserBody =
            serde_json::from_str(r#"{"username":"nina","password":"pw","role":"student"}"#).unwrap();
        assert!(body.validate().is_ok());
        assert_eq!(body.cycle, None);
        assert!(body.school_grade.is_empty());

        let short: CreateUserBody =
            serde_json::from_str(r#"{"username":"ab","password":"pw","role":"parent"}"#).unwrap();
        assert!(short.validate().is_err());
    }
}
