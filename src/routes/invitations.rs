//! `POST /invitations` — a teacher invites a student into their class.
//!
//! Only the SHA-256 of the token is stored; the raw token is returned once
//! and redeemed at `POST /auth/register/{token}`.

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::{generate_token, hash_token},
    errors::{AppError, AppResult},
    middleware::auth_guard::AuthUser,
    models::Role,
    services::access::{self, ClassResolution},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/invitations", post(create_invitation))
}

#[derive(Deserialize, Validate)]
struct CreateInvitationBody {
    #[validate(length(min = 1, max = 150, message = "First name is required (at most 150 characters)"))]
    first_name:   String,
    #[validate(length(min = 1, max = 150, message = "Last name is required (at most 150 characters)"))]
    last_name:    String,
    #[serde(default)]
    #[validate(length(max = 20, message = "School grade must be at most 20 characters"))]
    school_grade: String,
}

#[derive(Serialize)]
struct CreatedInvitation {
    id:         String,
    course_id:  String,
    /// Shown once; only its hash is kept.
    token:      String,
    expires_at: NaiveDateTime,
}

fn single_course(resolution: ClassResolution) -> AppResult<String> {
    match resolution {
        ClassResolution::Single(course_id) => Ok(course_id),
        ClassResolution::None => Err(AppError::BadRequest(
            "No class is assigned to you. Contact an administrator.".into(),
        )),
        ClassResolution::Multiple => Err(AppError::BadRequest(
            "Invitations require exactly one assigned class".into(),
        )),
    }
}

async fn create_invitation(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateInvitationBody>,
) -> AppResult<(StatusCode, Json<CreatedInvitation>)> {
    match user.role {
        Role::Teacher => {}
        Role::Admin | Role::Student | Role::Parent => return Err(AppError::Forbidden),
    }
    body.validate()?;
    let pool = &state.pool;
    let course_id = single_course(access::user_single_class(pool, &user).await?)?;

    let token = generate_token();
    let id = Uuid::new_v4().to_string();
    let expires_at = (Utc::now() + chrono::Duration::days(state.config.invitation_days)).naive_utc();

    sqlx::query(
        "INSERT INTO student_invitations
            (id, teacher_id, course_id, first_name, last_name, school_grade, token_hash, expires_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&user.user_id)
    .bind(&course_id)
    .bind(body.first_name.trim())
    .bind(body.last_name.trim())
    .bind(body.school_grade.trim())
    .bind(hash_token(&token))
    .bind(expires_at)
    .execute(pool)
    .await?;

    tracing::info!(invitation_id = %id, %course_id, "Student invitation created");
    Ok((StatusCode::CREATED, Json(CreatedInvitation { id, course_id, token, expires_at })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invitations_need_exactly_one_class() {
        assert_eq!(single_course(ClassResolution::Single("c1".into())).unwrap(), "c1");
        assert!(matches!(single_course(ClassResolution::None), Err(AppError::BadRequest(_))));
        assert!(matches!(single_course(ClassResolution::Multiple), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn names_are_required() {
        let body: CreateInvitationBody =
            serde_json::from_str(r#"{"first_name":"","last_name":"Ivanova"}"#).unwrap();
        let errors = body.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("first_name"));
        assert!(!errors.field_errors().contains_key("school_grade"));
    }
}
