//! Role-based authorization guards layered on top of `require_auth`.

use axum::{
    extract::{Extension, Request},
    middleware::Next,
    response::Response,
};

use crate::errors::AppError;
use crate::middleware::auth_guard::AuthUser;
use crate::models::Role;

/// Middleware: require the `admin` role.
pub async fn require_admin(
    Extension(user): Extension<AuthUser>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if user.role != Role::Admin {
        return Err(AppError::Forbidden);
    }
    Ok(next.run(req).await)
}

/// Middleware: require the `teacher` or `admin` role.
pub async fn require_staff(
    Extension(user): Extension<AuthUser>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    match user.role {
        Role::Admin | Role::Teacher => Ok(next.run(req).await),
        Role::Student | Role::Parent => Err(AppError::Forbidden),
    }
}
