use axum::{middleware, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use sqlx::{MySql, QueryBuilder};
use validator::Validate;

use crate::{
    errors::{AppError, AppResult, FieldErrors},
    middleware::auth_guard::require_auth,
    models::Cycle,
    state::AppState,
};

mod admin;
mod attendance;
mod auth;
mod calendar;
mod courses;
mod events;
mod goals;
mod grades;
mod homework;
mod invitations;
mod lessons;
mod schedules;
mod slots;

/// Build the full `/api/v1` router.
///
/// Login and invitation registration are left unprotected; every other route
/// is wrapped in the session-based [`require_auth`] middleware.
pub fn all_routes(state: AppState) -> Router<AppState> {
    let auth_mw = middleware::from_fn_with_state(state, require_auth);
    Router::new()
        .merge(auth::public_router())
        .merge(
            Router::new()
                .merge(auth::router())
                .merge(admin::router())
                .merge(courses::router())
                .merge(invitations::router())
                .merge(schedules::router())
                .merge(calendar::router())
                .merge(slots::router())
                .merge(lessons::router())
                .merge(attendance::router())
                .merge(homework::router())
                .merge(grades::router())
                .merge(goals::router())
                .merge(events::router())
                .route_layer(auth_mw),
        )
}

// ── Shared request helpers ───────────────────────────────────

/// Server-local calendar date.
pub(crate) fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// `?cycle=` filter: absent or empty means no filter.
pub(crate) fn parse_cycle(raw: Option<&str>) -> AppResult<Option<Cycle>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(value) => value
            .parse::<Cycle>()
            .map(Some)
            .map_err(|_| AppError::Validation(FieldErrors::single("cycle", "Unknown cycle"))),
    }
}

/// Body of every bulk action: the selected ids.
#[derive(Deserialize, Validate)]
pub(crate) struct IdsBody {
    #[validate(length(min = 1, message = "Nothing selected"))]
    pub ids: Vec<String>,
}

/// Append `AND <column> IN (...)`, or `AND 1 = 0` for an empty list.
pub(crate) fn push_id_list(qb: &mut QueryBuilder<'_, MySql>, column: &str, ids: &[String]) {
    if ids.is_empty() {
        qb.push(" AND 1 = 0");
        return;
    }
    qb.push(" AND ").push(column).push(" IN (");
    let mut list = qb.separated(", ");
    for id in ids {
        list.push_bind(id.clone());
    }
    list.push_unseparated(")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use sqlx::mysql::MySqlPoolOptions;
    use tower::ServiceExt;
    use tower_cookies::CookieManagerLayer;

    use crate::config::Config;

    /// Full router over a pool that never connects; only paths that fail
    /// before touching the database are exercised.
    fn app() -> Router {
        let config = Config::for_tests();
        let pool = MySqlPoolOptions::new()
            .connect_lazy(&crate::db::database_url(&config))
            .unwrap();
        let state = AppState { pool, config };
        Router::new()
            .nest("/api/v1", all_routes(state.clone()))
            .layer(CookieManagerLayer::new())
            .with_state(state)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn protected_routes_require_a_session() {
        for uri in ["/api/v1/calendar", "/api/v1/assignments", "/api/v1/auth/me"] {
            let response = app()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
            assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");
        }
    }

    #[tokio::test]
    async fn attachment_upload_requires_a_session() {
        let response = app()
            .oneshot(
                Request::post("/api/v1/assignments/a1/attachment")
                    .header("content-type", "multipart/form-data; boundary=x")
                    .body(Body::from("--x--\r\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_rejects_blank_credentials_per_field() {
        let request = Request::post("/api/v1/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"username":"","password":""}"#))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(response).await;
        assert_eq!(json["code"], "VALIDATION_ERROR");
        assert!(json["fields"]["username"].is_array());
        assert!(json["fields"]["password"].is_array());
    }

    #[test]
    fn cycle_filter_parsing() {
        assert_eq!(parse_cycle(None).unwrap(), None);
        assert_eq!(parse_cycle(Some("  ")).unwrap(), None);
        assert_eq!(parse_cycle(Some("extra")).unwrap(), Some(Cycle::Extra));
        assert!(matches!(parse_cycle(Some("weekly")), Err(AppError::Validation(_))));
    }

    #[test]
    fn id_list_sql() {
        let mut qb = QueryBuilder::<MySql>::new("DELETE FROM goals WHERE 1 = 1");
        push_id_list(&mut qb, "id", &["a".into(), "b".into()]);
        assert_eq!(qb.sql(), "DELETE FROM goals WHERE 1 = 1 AND id IN (?, ?)");

        let mut qb = QueryBuilder::<MySql>::new("DELETE FROM goals WHERE 1 = 1");
        push_id_list(&mut qb, "id", &[]);
        assert_eq!(qb.sql(), "DELETE FROM goals WHERE 1 = 1 AND 1 = 0");
    }

    #[test]
    fn empty_selection_is_a_validation_error() {
        let body: IdsBody = serde_json::from_str(r#"{"ids":[]}"#).unwrap();
        assert!(body.validate().is_err());
    }
}
