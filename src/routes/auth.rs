use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_cookies::{
    cookie::{time::Duration as CookieDuration, SameSite},
    Cookie, Cookies,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{generate_token, hash_password, hash_token, validate_password_strength, verify_password},
    config::Config,
    db::Db,
    errors::{AppError, AppResult, FieldErrors},
    middleware::auth_guard::{AuthUser, SESSION_COOKIE},
    models::{Cycle, Role},
    state::AppState,
};

// ── Request / response types ──────────────────────────────────

#[derive(Deserialize, Validate)]
struct LoginRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    username: String,
    #[validate(length(min = 1, message = "Password is required"))]
    password: String,
}

#[derive(Deserialize, Validate)]
struct ChangeUsernameRequest {
    #[validate(length(min = 3, max = 150, message = "Username must be 3–150 characters"))]
    username: String,
}

#[derive(Deserialize, Validate)]
struct ChangePasswordRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    current_password: String,
    #[validate(length(min = 1, message = "New password is required"))]
    new_password:     String,
}

#[derive(Deserialize, Validate)]
struct RegisterRequest {
    #[validate(length(min = 3, max = 150, message = "Username must be 3–150 characters"))]
    username:         String,
    #[validate(length(min = 1, message = "Password is required"))]
    password:         String,
    #[validate(must_match(other = "password", message = "Passwords do not match"))]
    password_confirm: String,
}

#[derive(Serialize)]
struct UserResponse {
    id:           String,
    username:     String,
    first_name:   String,
    last_name:    String,
    role:         Role,
    cycle:        Cycle,
    school_grade: String,
}

// ── Database row types ────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct UserRow {
    id:            String,
    username:      String,
    first_name:    String,
    last_name:     String,
    password_hash: String,
    role:          String,
    cycle:         String,
    school_grade:  String,
    is_active:     bool,
}

impl UserRow {
    fn into_user(self) -> AppResult<UserResponse> {
        let role = self
            .role
            .parse::<Role>()
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        Ok(UserResponse {
            id:           self.id,
            username:     self.username,
            first_name:   self.first_name,
            last_name:    self.last_name,
            role,
            cycle:        self.cycle.parse().unwrap_or(Cycle::General),
            school_grade: self.school_grade,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InvitationRow {
    id:           String,
    course_id:    String,
    first_name:   String,
    last_name:    String,
    school_grade: String,
}

const USER_COLUMNS: &str =
    "id, username, first_name, last_name, password_hash, role, cycle, school_grade, is_active";

// ── Router ────────────────────────────────────────────────────

/// Routes reachable without a session.
pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/auth/login",            post(login))
        .route("/auth/logout",           post(logout))
        .route("/auth/register/{token}", post(register))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/me",       get(me))
        .route("/auth/username", put(change_username))
        .route("/auth/password", put(change_password))
}

// ── Handlers ──────────────────────────────────────────────────

/// POST /auth/login — username + password.
async fn login(
    State(state): State<AppState>,
    cookies: Cookies,
    Json(body): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    body.validate()?;
    let pool = &state.pool;

    let row = sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = ? LIMIT 1"
    ))
    .bind(body.username.trim())
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::Unauthorized)?;

    if !row.is_active {
        return Err(AppError::Unauthorized);
    }
    verify_password(&body.password, &row.password_hash)?;

    let session_token = create_session(pool, &row.id, state.config.session_days).await?;
    set_session_cookie(&cookies, &session_token, state.config.session_days);

    tracing::info!(user_id = %row.id, "User logged in");
    Ok(Json(row.into_user()?))
}

/// POST /auth/logout — delete the current session.
async fn logout(
    State(state): State<AppState>,
    cookies: Cookies,
) -> AppResult<impl IntoResponse> {
    if let Some(token) = cookies.get(SESSION_COOKIE).map(|c| c.value().to_owned()) {
        sqlx::query("DELETE FROM user_sessions WHERE token = ?")
            .bind(&token)
            .execute(&state.pool)
            .await?;
    }
    clear_session_cookie(&cookies);
    Ok(StatusCode::NO_CONTENT)
}

/// GET /auth/me — the currently logged-in user.
async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> AppResult<impl IntoResponse> {
    let row = fetch_user(&state.pool, &user.user_id).await?;
    Ok(Json(row.into_user()?))
}

/// PUT /auth/username
async fn change_username(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<ChangeUsernameRequest>,
) -> AppResult<impl IntoResponse> {
    body.validate()?;
    let pool = &state.pool;
    let username = body.username.trim();

    let taken: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM users WHERE username = ? AND id <> ?)",
    )
    .bind(username)
    .bind(&user.user_id)
    .fetch_one(pool)
    .await?;
    if taken {
        return Err(AppError::Conflict("Username is already taken".into()));
    }

    let result = sqlx::query("UPDATE users SET username = ? WHERE id = ?")
        .bind(username)
        .bind(&user.user_id)
        .execute(pool)
        .await;

    // Guard against duplicate key (race condition / double-submit)
    if let Err(sqlx::Error::Database(ref db_err)) = result {
        if db_err.is_unique_violation() {
            return Err(AppError::Conflict("Username is already taken".into()));
        }
    }
    result?;

    let row = fetch_user(pool, &user.user_id).await?;
    Ok(Json(row.into_user()?))
}

/// PUT /auth/password — requires the current password.
async fn change_password(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<ChangePasswordRequest>,
) -> AppResult<impl IntoResponse> {
    body.validate()?;
    let pool = &state.pool;
    let row = fetch_user(pool, &user.user_id).await?;

    if verify_password(&body.current_password, &row.password_hash).is_err() {
        return Err(AppError::Validation(FieldErrors::single(
            "current_password",
            "Current password is incorrect",
        )));
    }
    check_new_password(&state.config, &body.new_password)?;

    let hash = hash_password(&body.new_password)?;
    sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
        .bind(hash)
        .bind(&user.user_id)
        .execute(pool)
        .await?;

    tracing::info!(user_id = %user.user_id, "Password changed");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /auth/register/{token} — a student accepts a teacher invitation.
///
/// Creates the account, enrolls it in the invitation's course and marks the
/// invitation used, all in one transaction. The new student is logged in.
async fn register(
    State(state): State<AppState>,
    cookies: Cookies,
    Path(token): Path<String>,
    Json(body): Json<RegisterRequest>,
) -> AppResult<impl IntoResponse> {
    body.validate()?;
    check_new_password(&state.config, &body.password)?;
    let pool = &state.pool;
    let username = body.username.trim();

    let mut tx = pool.begin().await?;

    let invitation = sqlx::query_as::<_, InvitationRow>(
        "SELECT id, course_id, first_name, last_name, school_grade
         FROM student_invitations
         WHERE token_hash = ? AND used_at IS NULL AND expires_at > UTC_TIMESTAMP()
         LIMIT 1
         FOR UPDATE",
    )
    .bind(hash_token(&token))
    .fetch_optional(&mut *tx)
    .await?
    .ok_or_else(|| AppError::BadRequest("Invitation is invalid, expired or already used".into()))?;

    let taken: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE username = ?)")
        .bind(username)
        .fetch_one(&mut *tx)
        .await?;
    if taken {
        return Err(AppError::Validation(FieldErrors::single(
            "username",
            "Username is already taken",
        )));
    }

    let id   = Uuid::new_v4().to_string();
    let hash = hash_password(&body.password)?;
    sqlx::query(
        "INSERT INTO users (id, username, first_name, last_name, password_hash, role, cycle, school_grade, is_active)
         VALUES (?, ?, ?, ?, ?, 'student', 'general', ?, 1)",
    )
    .bind(&id)
    .bind(username)
    .bind(&invitation.first_name)
    .bind(&invitation.last_name)
    .bind(hash)
    .bind(&invitation.school_grade)
    .execute(&mut *tx)
    .await?;

    sqlx::query("INSERT IGNORE INTO enrollments (id, course_id, student_id) VALUES (?, ?, ?)")
        .bind(Uuid::new_v4().to_string())
        .bind(&invitation.course_id)
        .bind(&id)
        .execute(&mut *tx)
        .await?;

    sqlx::query("UPDATE student_invitations SET used_at = UTC_TIMESTAMP() WHERE id = ?")
        .bind(&invitation.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    tracing::info!(user_id = %id, course_id = %invitation.course_id, "Student registered from invitation");

    let session_token = create_session(pool, &id, state.config.session_days).await?;
    set_session_cookie(&cookies, &session_token, state.config.session_days);

    let row = fetch_user(pool, &id).await?;
    Ok((StatusCode::CREATED, Json(row.into_user()?)))
}

// ── Internal helpers ──────────────────────────────────────────

async fn fetch_user(pool: &Db, user_id: &str) -> AppResult<UserRow> {
    sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = ? LIMIT 1"
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or(AppError::Unauthorized)
}

/// Strength rules apply outside development only.
fn check_new_password(config: &Config, password: &str) -> AppResult<()> {
    if config.is_development() {
        return Ok(());
    }
    validate_password_strength(password)
}

async fn create_session(pool: &Db, user_id: &str, days: i64) -> AppResult<String> {
    let token = generate_token();
    let id    = Uuid::new_v4().to_string();
    let expires_at =
        (Utc::now() + chrono::Duration::days(days)).naive_utc();

    sqlx::query(
        "INSERT INTO user_sessions (id, user_id, token, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(id)
    .bind(user_id)
    .bind(&token)
    .bind(expires_at)
    .execute(pool)
    .await?;

    Ok(token)
}

fn set_session_cookie(cookies: &Cookies, token: &str, days: i64) {
    let cookie = Cookie::build((SESSION_COOKIE, token.to_owned()))
        .http_only(true)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(CookieDuration::days(days))
        .build();
    cookies.add(cookie);
}

fn clear_session_cookie(cookies: &Cookies) {
    let cookie = Cookie::build((SESSION_COOKIE, ""))
        .http_only(true)
        .path("/")
        .max_age(CookieDuration::ZERO)
        .build();
    cookies.add(cookie);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_rules_only_apply_outside_development() {
        let mut config = Config::for_tests();
        assert!(check_new_password(&config, "x").is_ok());

        config.app_env = "production".into();
        assert!(matches!(
            check_new_password(&config, "x"),
            Err(AppError::Validation(_))
        ));
        assert!(check_new_password(&config, "Str0ngEnough").is_ok());
    }

    #[test]
    fn user_rows_render_without_the_hash() {
        let row = UserRow {
            id:            "u1".into(),
            username:      "anna".into(),
            first_name:    "Anna".into(),
            last_name:     "K".into(),
            password_hash: "$argon2id$...".into(),
            role:          "student".into(),
            cycle:         "accelerated".into(),
            school_grade:  "5".into(),
            is_active:     true,
        };
        let json = serde_json::to_value(row.into_user().unwrap()).unwrap();
        assert_eq!(json["role"], "student");
        assert_eq!(json["cycle"], "accelerated");
        assert!(json.get("password_hash").is_none());
    }

    #[test]
    fn registration_requires_matching_passwords() {
        let body = RegisterRequest {
            username:         "new.student".into(),
            password:         "Secret123".into(),
            password_confirm: "Secret124".into(),
        };
        let errors = body.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("password_confirm"));
    }
}
