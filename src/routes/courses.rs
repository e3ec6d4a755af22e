//! `/courses` — course list and detail, scoped by role.

use axum::{
    extract::{Extension, Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::{MySql, QueryBuilder};

use crate::{
    db::Db,
    errors::{AppError, AppResult},
    middleware::auth_guard::AuthUser,
    models::{display_name, Cycle, Role},
    services::access,
    state::AppState,
};

use super::parse_cycle;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/courses",      get(list_courses))
        .route("/courses/{id}", get(course_detail))
}

#[derive(sqlx::FromRow, Serialize)]
struct CourseRow {
    id:           String,
    name:         String,
    course_type:  String,
    teacher_id:   Option<String>,
    teacher_name: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ChildRow {
    id:         String,
    username:   String,
    first_name: String,
    last_name:  String,
}

#[derive(Serialize)]
struct ChildLink {
    student_id: String,
    name:       String,
}

#[derive(Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum CourseList {
    Student     { courses: Vec<CourseRow> },
    ParentPick  { children: Vec<ChildLink> },
    ParentChild { student_id: String, courses: Vec<CourseRow> },
    Teacher     { cycle: Option<Cycle>, courses: Vec<CourseRow> },
    Admin       { cycle: Option<Cycle>, courses: Vec<CourseRow> },
}

#[derive(Serialize)]
struct CourseDetail {
    #[serde(flatten)]
    course:     CourseRow,
    /// The student whose view this is; `None` for staff.
    student_id: Option<String>,
}

#[derive(Deserialize)]
struct CourseQuery {
    student: Option<String>,
    cycle:   Option<String>,
}

/// Base select; callers append `WHERE` conditions.
const COURSE_SELECT: &str =
    "SELECT c.id, c.name, c.course_type, c.teacher_id,
            NULLIF(TRIM(CONCAT(t.first_name, ' ', t.last_name)), '') AS teacher_name
     FROM courses c
     LEFT JOIN users t ON t.id = c.teacher_id
     WHERE 1 = 1";

async fn courses_of_student(pool: &Db, student_id: &str) -> AppResult<Vec<CourseRow>> {
    let mut qb = QueryBuilder::<MySql>::new(COURSE_SELECT);
    qb.push(" AND c.id IN (SELECT course_id FROM enrollments WHERE student_id = ")
        .push_bind(student_id.to_string())
        .push(") ORDER BY c.name");
    Ok(qb.build_query_as().fetch_all(pool).await?)
}

/// A parent may only act for a linked child.
async fn linked_child(pool: &Db, parent_id: &str, student_id: &str) -> AppResult<()> {
    if access::children_of(pool, parent_id).await?.iter().any(|c| c == student_id) {
        Ok(())
    } else {
        Err(AppError::NotFound)
    }
}

async fn list_courses(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(q): Query<CourseQuery>,
) -> AppResult<Json<CourseList>> {
    let pool = &state.pool;
    let student = q.student.as_deref().filter(|s| !s.is_empty());

    let list = match user.role {
        Role::Student => CourseList::Student {
            courses: courses_of_student(pool, &user.user_id).await?,
        },
        Role::Parent => match student {
            None => {
                let children = sqlx::query_as::<_, ChildRow>(
                    "SELECT u.id, u.username, u.first_name, u.last_name
                     FROM parent_children pc JOIN users u ON u.id = pc.child_id
                     WHERE pc.parent_id = ?
                     ORDER BY u.username",
                )
                .bind(&user.user_id)
                .fetch_all(pool)
                .await?;
                CourseList::ParentPick {
                    children: children
                        .into_iter()
                        .map(|c| ChildLink {
                            name:       display_name(&c.first_name, &c.last_name, &c.username),
                            student_id: c.id,
                        })
                        .collect(),
                }
            }
            Some(student_id) => {
                linked_child(pool, &user.user_id, student_id).await?;
                CourseList::ParentChild {
                    student_id: student_id.to_string(),
                    courses:    courses_of_student(pool, student_id).await?,
                }
            }
        },
        Role::Teacher | Role::Admin => {
            let cycle = parse_cycle(q.cycle.as_deref())?;
            let mut qb = QueryBuilder::<MySql>::new(COURSE_SELECT);
            if user.role == Role::Teacher {
                qb.push(" AND c.teacher_id = ").push_bind(user.user_id.clone());
            }
            if let Some(cycle) = cycle {
                qb.push(
                    " AND c.id IN (SELECT e.course_id FROM enrollments e
                                   JOIN users s ON s.id = e.student_id
                                   WHERE s.cycle = ",
                )
                .push_bind(cycle.as_str())
                .push(")");
            }
            qb.push(" ORDER BY c.name");
            let courses = qb.build_query_as().fetch_all(pool).await?;
            if user.role == Role::Teacher {
                CourseList::Teacher { cycle, courses }
            } else {
                CourseList::Admin { cycle, courses }
            }
        }
    };
    Ok(Json(list))
}

async fn course_detail(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Query(q): Query<CourseQuery>,
) -> AppResult<Json<CourseDetail>> {
    let pool = &state.pool;
    let mut qb = QueryBuilder::<MySql>::new(COURSE_SELECT);
    qb.push(" AND c.id = ").push_bind(id.clone());
    let course: CourseRow = qb
        .build_query_as()
        .fetch_optional(pool)
        .await?
        .ok_or(AppError::NotFound)?;

    let student_id = match user.role {
        Role::Admin | Role::Teacher => None,
        Role::Student => {
            if !access::is_enrolled(pool, &id, &user.user_id).await? {
                return Err(AppError::Forbidden);
            }
            Some(user.user_id.clone())
        }
        Role::Parent => {
            let student_id = q
                .student
                .filter(|s| !s.is_empty())
                .ok_or_else(|| AppError::BadRequest("Select a student".into()))?;
            linked_child(pool, &user.user_id, &student_id).await?;
            if !access::is_enrolled(pool, &id, &student_id).await? {
                return Err(AppError::Forbidden);
            }
            Some(student_id)
        }
    };

    Ok(Json(CourseDetail { course, student_id }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course() -> CourseRow {
        CourseRow {
            id:           "c1".into(),
            name:         "Piano".into(),
            course_type:  "instrument".into(),
            teacher_id:   Some("t1".into()),
            teacher_name: Some("Ivan Petrov".into()),
        }
    }

    #[test]
    fn list_is_tagged_with_its_mode() {
        let json = serde_json::to_value(CourseList::ParentPick { children: vec![] }).unwrap();
        assert_eq!(json["mode"], "parent_pick");

        let json = serde_json::to_value(CourseList::Teacher {
            cycle:   Some(Cycle::Extra),
            courses: vec![course()],
        })
        .unwrap();
        assert_eq!(json["mode"], "teacher");
        assert_eq!(json["cycle"], "extra");
        assert_eq!(json["courses"][0]["name"], "Piano");
    }

    #[test]
    fn detail_flattens_the_course() {
        let json = serde_json::to_value(CourseDetail { course: course(), student_id: None }).unwrap();
        assert_eq!(json["id"], "c1");
        assert!(json["student_id"].is_null());
    }
}
