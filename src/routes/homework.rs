//! `/assignments` — homework lists per role, creation, attachments, completion and deletion.

use axum::{
    extract::{DefaultBodyLimit, Extension, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{MySql, QueryBuilder};
use tokio::fs;
use uuid::Uuid;
use validator::Validate;

use crate::{
    db::Db,
    errors::{AppError, AppResult},
    middleware::auth_guard::AuthUser,
    models::{display_name, EffectiveStatus, Role, TargetStatus},
    services::{
        access,
        homework::{self, can_delete_assignment, effective_status, NewAssignment},
    },
    state::AppState,
};

use super::{parse_cycle, push_id_list, today, IdsBody};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/assignments",                   get(list_assignments).post(create_assignment))
        .route("/assignments/bulk-delete",       post(bulk_delete))
        .route("/assignments/targets/{id}/done", post(mark_done))
        .route(
            "/assignments/{id}/attachment",
            post(upload_attachment).layer(DefaultBodyLimit::max(ATTACHMENT_MAX_BYTES)),
        )
}

/// Directory where assignment attachments are stored (relative to the binary's cwd).
const UPLOAD_DIR: &str = "uploads/assignments";
const ATTACHMENT_MAX_BYTES: usize = 100 * 1024 * 1024;
const ATTACHMENT_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "gif", "webp", "heic", "mp4", "mov", "webm", "m4v"];

// ── Row types ────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct AssignmentRow {
    id:           String,
    course_id:    String,
    course_name:  String,
    title:        String,
    description:  String,
    due_date:     NaiveDate,
    attachment:   Option<String>,
    created_by:   String,
    teacher_id:   Option<String>,
    target_count: i64,
    done_count:   i64,
}

#[derive(sqlx::FromRow)]
struct TargetRow {
    target_id:       String,
    assignment_id:   String,
    course_name:     String,
    title:           String,
    description:     String,
    due_date:        NaiveDate,
    attachment:      Option<String>,
    status:          String,
    student_comment: String,
}

const OWNER_SELECT: &str =
    "SELECT a.id, a.created_by, c.teacher_id, a.attachment
     FROM assignments a JOIN courses c ON c.id = a.course_id
     WHERE 1 = 1";

#[derive(sqlx::FromRow)]
struct OwnerRow {
    id:         String,
    created_by: String,
    teacher_id: Option<String>,
    attachment: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ChildRow {
    id:         String,
    username:   String,
    first_name: String,
    last_name:  String,
}

// ── Response types ───────────────────────────────────────────

#[derive(Serialize)]
struct AssignmentItem {
    id:           String,
    course_id:    String,
    course_name:  String,
    title:        String,
    description:  String,
    due_date:       NaiveDate,
    attachment_url: Option<String>,
    target_count:   i64,
    done_count:     i64,
    can_delete:     bool,
}

#[derive(Serialize)]
struct TargetItem {
    target_id:       String,
    assignment_id:   String,
    course_name:     String,
    title:           String,
    description:     String,
    due_date:        NaiveDate,
    attachment_url:  Option<String>,
    status:          EffectiveStatus,
    student_comment: String,
}

#[derive(Serialize)]
struct ChildBlock {
    student_id: String,
    name:       String,
    targets:    Vec<TargetItem>,
}

#[derive(Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
enum AssignmentList {
    Admin   { assignments: Vec<AssignmentItem> },
    Teacher { assignments: Vec<AssignmentItem> },
    Student { targets: Vec<TargetItem> },
    Parent  { children: Vec<ChildBlock> },
}

// ── Request types ────────────────────────────────────────────

#[derive(Deserialize)]
struct ListQuery {
    cycle: Option<String>,
}

#[derive(Deserialize, Validate)]
struct CreateAssignmentBody {
    course_id:   String,
    #[validate(length(min = 1, max = 200, message = "Title is required (at most 200 characters)"))]
    title:       String,
    #[serde(default)]
    description: String,
    due_date:    NaiveDate,
    #[serde(default)]
    student_ids: Vec<String>,
}

#[derive(Deserialize, Default)]
struct DoneBody {
    comment: Option<String>,
}

// ── Helpers ──────────────────────────────────────────────────

/// Lowercased extension of an uploaded photo or video.
fn attachment_extension(file_name: &str) -> AppResult<String> {
    let ext = std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    if ATTACHMENT_EXTENSIONS.contains(&ext.as_str()) {
        Ok(ext)
    } else {
        Err(AppError::BadRequest("Attachment must be a photo or a video".into()))
    }
}

fn attachment_url(file_name: Option<&str>) -> Option<String> {
    file_name.map(|name| format!("/{UPLOAD_DIR}/{name}"))
}

async fn remove_attachment(file_name: &str) {
    if let Err(err) = fs::remove_file(format!("{UPLOAD_DIR}/{file_name}")).await {
        tracing::warn!(%file_name, error = %err, "Could not remove attachment file");
    }
}

async fn targets_for(pool: &Db, student_id: &str, today: NaiveDate) -> AppResult<Vec<TargetItem>> {
    let rows = sqlx::query_as::<_, TargetRow>(
        "SELECT t.id AS target_id, a.id AS assignment_id, c.name AS course_name, a.title,
                a.description, a.due_date, a.attachment, t.status, t.student_comment
         FROM assignment_targets t
         JOIN assignments a ON a.id = t.assignment_id
         JOIN courses c ON c.id = a.course_id
         WHERE t.student_id = ?
         ORDER BY a.due_date, a.id",
    )
    .bind(student_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| TargetItem {
            status: effective_status(r.due_date, r.status.parse::<TargetStatus>().ok(), today),
            attachment_url: attachment_url(r.attachment.as_deref()),
            target_id: r.target_id,
            assignment_id: r.assignment_id,
            course_name: r.course_name,
            title: r.title,
            description: r.description,
            due_date: r.due_date,
            student_comment: r.student_comment,
        })
        .collect())
}

// ── Handlers ─────────────────────────────────────────────────

async fn list_assignments(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<ListQuery>,
) -> AppResult<Json<AssignmentList>> {
    let pool = &state.pool;
    let today = today();

    match user.role {
        Role::Admin | Role::Teacher => {
            let cycle = parse_cycle(q.cycle.as_deref())?;
            let mut qb = QueryBuilder::<MySql>::new(
                "SELECT a.id, a.course_id, c.name AS course_name, a.title, a.description, a.due_date,
                        a.attachment, a.created_by, c.teacher_id,
                        COUNT(t.id) AS target_count,
                        CAST(COALESCE(SUM(t.status = 'done'), 0) AS SIGNED) AS done_count
                 FROM assignments a
                 JOIN courses c ON c.id = a.course_id
                 LEFT JOIN assignment_targets t ON t.assignment_id = a.id",
            );
            if let Some(cycle) = cycle {
                qb.push(" AND t.student_id IN (SELECT id FROM users WHERE cycle = ")
                    .push_bind(cycle.as_str())
                    .push(")");
            }
            qb.push(" WHERE 1 = 1");
            if user.role == Role::Teacher {
                qb.push(" AND a.created_by = ").push_bind(user.user_id.clone());
            }
            qb.push(" GROUP BY a.id, a.course_id, c.name, a.title, a.description, a.due_date, a.attachment, a.created_by, c.teacher_id");
            if cycle.is_some() {
                qb.push(" HAVING COUNT(t.id) > 0");
            }
            qb.push(" ORDER BY a.due_date, a.id");

            let rows: Vec<AssignmentRow> = qb.build_query_as().fetch_all(pool).await?;
            let assignments: Vec<AssignmentItem> = rows
                .into_iter()
                .map(|r| AssignmentItem {
                    can_delete: can_delete_assignment(&user, &r.created_by, r.teacher_id.as_deref()),
                    attachment_url: attachment_url(r.attachment.as_deref()),
                    id: r.id,
                    course_id: r.course_id,
                    course_name: r.course_name,
                    title: r.title,
                    description: r.description,
                    due_date: r.due_date,
                    target_count: r.target_count,
                    done_count: r.done_count,
                })
                .collect();

            Ok(Json(if user.role == Role::Admin {
                AssignmentList::Admin { assignments }
            } else {
                AssignmentList::Teacher { assignments }
            }))
        }
        Role::Student => Ok(Json(AssignmentList::Student {
            targets: targets_for(pool, &user.user_id, today).await?,
        })),
        Role::Parent => {
            let children = sqlx::query_as::<_, ChildRow>(
                "SELECT u.id, u.username, u.first_name, u.last_name
                 FROM parent_children pc JOIN users u ON u.id = pc.child_id
                 WHERE pc.parent_id = ?
                 ORDER BY u.username",
            )
            .bind(&user.user_id)
            .fetch_all(pool)
            .await?;

            let mut blocks = Vec::with_capacity(children.len());
            for child in children {
                blocks.push(ChildBlock {
                    name:    display_name(&child.first_name, &child.last_name, &child.username),
                    targets: targets_for(pool, &child.id, today).await?,
                    student_id: child.id,
                });
            }
            Ok(Json(AssignmentList::Parent { children: blocks }))
        }
    }
}

async fn create_assignment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateAssignmentBody>,
) -> AppResult<(StatusCode, Json<homework::CreatedAssignment>)> {
    if !user.is_staff() {
        return Err(AppError::Forbidden);
    }
    body.validate()?;
    let pool = &state.pool;
    access::assert_teaches_course(pool, &user, &body.course_id).await?;

    let created = homework::create_assignment_with_targets(
        pool,
        &user.user_id,
        NewAssignment {
            course_id:   &body.course_id,
            title:       body.title.trim(),
            description: body.description.trim(),
            due_date:    body.due_date,
            student_ids: &body.student_ids,
        },
    )
    .await
    .map_err(|err| match err {
        AppError::Database(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            AppError::Conflict("An assessment with this title already exists in the course".into())
        }
        other => other,
    })?;

    tracing::info!(
        assignment_id = %created.id,
        course_id = %body.course_id,
        targets = created.target_count,
        "Assignment created"
    );
    Ok((StatusCode::CREATED, Json(created)))
}

async fn mark_done(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    body: Option<Json<DoneBody>>,
) -> AppResult<StatusCode> {
    let pool = &state.pool;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let owner: Option<String> =
        sqlx::query_scalar("SELECT student_id FROM assignment_targets WHERE id = ?")
            .bind(&id)
            .fetch_optional(pool)
            .await?;
    let owner = owner.ok_or(AppError::NotFound)?;

    match user.role {
        Role::Student if owner == user.user_id => {}
        Role::Student | Role::Teacher | Role::Parent | Role::Admin => {
            return Err(AppError::Forbidden)
        }
    }

    let comment = body.comment.as_deref().map(str::trim).unwrap_or_default();
    sqlx::query("UPDATE assignment_targets SET status = ?, student_comment = ? WHERE id = ?")
        .bind(TargetStatus::Done.as_str())
        .bind(comment)
        .bind(&id)
        .execute(pool)
        .await?;

    Ok(StatusCode::NO_CONTENT)
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

    let mut qb = QueryBuilder::<MySql>::new(OWNER_SELECT);
    push_id_list(&mut qb, "a.id", &body.ids);
    let owners: Vec<OwnerRow> = qb.build_query_as().fetch_all(pool).await?;

    // All or nothing: one foreign assignment rejects the whole batch.
    if owners
        .iter()
        .any(|o| !can_delete_assignment(&user, &o.created_by, o.teacher_id.as_deref()))
    {
        return Err(AppError::Forbidden);
    }
    if owners.is_empty() {
        return Ok(Json(json!({ "deleted": 0 })));
    }

    let (ids, attachments): (Vec<String>, Vec<Option<String>>) =
        owners.into_iter().map(|o| (o.id, o.attachment)).unzip();
    let mut tx = pool.begin().await?;

    let mut qb = QueryBuilder::<MySql>::new("DELETE FROM assessments WHERE 1 = 1");
    push_id_list(&mut qb, "source_assignment_id", &ids);
    qb.build().execute(&mut *tx).await?;

    let mut qb = QueryBuilder::<MySql>::new("DELETE FROM assignments WHERE 1 = 1");
    push_id_list(&mut qb, "id", &ids);
    let deleted = qb.build().execute(&mut *tx).await?.rows_affected();

    tx.commit().await?;
    for file_name in attachments.iter().flatten() {
        remove_attachment(file_name).await;
    }
    tracing::info!(user_id = %user.user_id, deleted, "Assignments deleted");
    Ok(Json(json!({ "deleted": deleted })))
}

/// Attach a photo or video via `multipart/form-data` (field `file`).
/// A new upload replaces the previous attachment.
async fn upload_attachment(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> AppResult<Json<serde_json::Value>> {
    if !user.is_staff() {
        return Err(AppError::Forbidden);
    }
    let pool = &state.pool;

    let mut qb = QueryBuilder::<MySql>::new(OWNER_SELECT);
    qb.push(" AND a.id = ").push_bind(id.clone());
    let owner: OwnerRow = qb
        .build_query_as()
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound)?;
    if !can_delete_assignment(&user, &owner.created_by, owner.teacher_id.as_deref()) {
        return Err(AppError::Forbidden);
    }

    let mut upload = None;
    while let Some(field) = multipart.next_field().await
        .map_err(|e| AppError::BadRequest(e.to_string()))? {
        if field.name() == Some("file") {
            let ext = attachment_extension(field.file_name().unwrap_or_default())?;
            let bytes = field.bytes().await
                .map_err(|e| AppError::BadRequest(e.to_string()))?;
            upload = Some((ext, bytes));
        }
    }
    let (ext, bytes) = upload.ok_or_else(|| AppError::BadRequest("Missing file field".into()))?;
    if bytes.is_empty() {
        return Err(AppError::BadRequest("Attachment is empty".into()));
    }

    fs::create_dir_all(UPLOAD_DIR).await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Could not create upload dir: {e}")))?;
    let file_name = format!("{}.{ext}", Uuid::new_v4());
    fs::write(format!("{UPLOAD_DIR}/{file_name}"), &bytes).await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Write failed: {e}")))?;

    sqlx::query("UPDATE assignments SET attachment = ? WHERE id = ?")
        .bind(&file_name)
        .bind(&owner.id)
        .execute(pool)
        .await?;
    if let Some(previous) = owner.attachment.as_deref() {
        remove_attachment(previous).await;
    }

    tracing::info!(assignment_id = %owner.id, %file_name, size = bytes.len(), "Assignment attachment stored");
    Ok(Json(json!({ "id": owner.id, "attachment_url": attachment_url(Some(&file_name)) })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachments_accept_photos_and_videos_only() {
        assert_eq!(attachment_extension("scales.JPG").unwrap(), "jpg");
        assert_eq!(attachment_extension("etude.take2.mp4").unwrap(), "mp4");
        assert_eq!(attachment_extension("recital.MOV").unwrap(), "mov");
        assert!(matches!(attachment_extension("notes.pdf"), Err(AppError::BadRequest(_))));
        assert!(matches!(attachment_extension("no_extension"), Err(AppError::BadRequest(_))));
        assert!(matches!(attachment_extension(""), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn attachment_url_points_at_static_uploads() {
        assert_eq!(
            attachment_url(Some("abc.png")).as_deref(),
            Some("/uploads/assignments/abc.png")
        );
        assert_eq!(attachment_url(None), None);
    }
}
