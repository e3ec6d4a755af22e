//! Homework assignments: creation with per-student targets and gradebook rows,
//! and the status students and parents actually see.

use chrono::NaiveDate;
use sqlx::{MySql, QueryBuilder};
use uuid::Uuid;

use crate::{
    db::Db,
    errors::AppResult,
    middleware::auth_guard::AuthUser,
    models::{AssessmentType, EffectiveStatus, Role, TargetStatus},
};

/// `done` stays done; an open target past its due date is late.
pub fn effective_status(
    due_date: NaiveDate,
    status: Option<TargetStatus>,
    today: NaiveDate,
) -> EffectiveStatus {
    if status == Some(TargetStatus::Done) {
        return EffectiveStatus::Done;
    }
    if due_date < today {
        return EffectiveStatus::Late;
    }
    EffectiveStatus::Todo
}

/// Admins may delete anything; teachers what they created or what belongs to their course.
pub fn can_delete_assignment(
    caller: &AuthUser,
    created_by: &str,
    course_teacher_id: Option<&str>,
) -> bool {
    match caller.role {
        Role::Admin => true,
        Role::Teacher => {
            created_by == caller.user_id || course_teacher_id == Some(caller.user_id.as_str())
        }
        Role::Student | Role::Parent => false,
    }
}

#[derive(Debug)]
pub struct NewAssignment<'a> {
    pub course_id:   &'a str,
    pub title:       &'a str,
    pub description: &'a str,
    pub due_date:    NaiveDate,
    pub student_ids: &'a [String],
}

#[derive(Debug, serde::Serialize)]
pub struct CreatedAssignment {
    pub id:            String,
    pub assessment_id: String,
    pub target_count:  usize,
}

/// Unique ids in first-seen order.
fn dedup_ids(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}

/// Create the assignment, its single homework assessment (max 100, weight 1),
/// and a `todo` target plus an empty grade for every selected student that is
/// actually enrolled in the course. Students outside the course are dropped.
/// Everything happens in one transaction.
pub async fn create_assignment_with_targets(
    pool: &Db,
    created_by: &str,
    new: NewAssignment<'_>,
) -> AppResult<CreatedAssignment> {
    let mut tx = pool.begin().await?;

    let assignment_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO assignments (id, course_id, title, description, due_date, created_by)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&assignment_id)
    .bind(new.course_id)
    .bind(new.title)
    .bind(new.description)
    .bind(new.due_date)
    .bind(created_by)
    .execute(&mut *tx)
    .await?;

    let assessment_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO assessments (id, course_id, title, assessment_type, max_score, weight, source_assignment_id)
         VALUES (?, ?, ?, ?, 100, 1, ?)",
    )
    .bind(&assessment_id)
    .bind(new.course_id)
    .bind(new.title)
    .bind(AssessmentType::Homework.as_str())
    .bind(&assignment_id)
    .execute(&mut *tx)
    .await?;

    let requested = dedup_ids(new.student_ids);
    let enrolled: Vec<String> = if requested.is_empty() {
        Vec::new()
    } else {
        let mut qb = QueryBuilder::<MySql>::new(
            "SELECT student_id FROM enrollments WHERE course_id = ",
        );
        qb.push_bind(new.course_id).push(" AND student_id IN (");
        let mut list = qb.separated(", ");
        for id in &requested {
            list.push_bind(id.clone());
        }
        list.push_unseparated(")");
        qb.build_query_scalar::<String>().fetch_all(&mut *tx).await?
    };

    let targets: Vec<&String> = requested.iter().filter(|id| enrolled.contains(id)).collect();
    for student_id in &targets {
        sqlx::query(
            "INSERT IGNORE INTO assignment_targets (id, assignment_id, student_id, status, student_comment)
             VALUES (?, ?, ?, ?, '')",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&assignment_id)
        .bind(student_id.as_str())
        .bind(TargetStatus::Todo.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT IGNORE INTO grades (id, assessment_id, student_id, score, comment)
             VALUES (?, ?, ?, NULL, '')",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&assessment_id)
        .bind(student_id.as_str())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    if targets.len() < requested.len() {
        tracing::warn!(
            %assignment_id,
            requested = requested.len(),
            assigned = targets.len(),
            "Dropped students not enrolled in the course"
        );
    }

    Ok(CreatedAssignment {
        id: assignment_id,
        assessment_id,
        target_count: targets.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn user(role: Role) -> AuthUser {
        AuthUser { user_id: "me".into(), role }
    }

    #[test]
    fn done_wins_over_lateness() {
        assert_eq!(
            effective_status(date(1), Some(TargetStatus::Done), date(10)),
            EffectiveStatus::Done
        );
    }

    #[test]
    fn open_target_past_due_is_late() {
        assert_eq!(
            effective_status(date(9), Some(TargetStatus::Todo), date(10)),
            EffectiveStatus::Late
        );
        assert_eq!(effective_status(date(9), None, date(10)), EffectiveStatus::Late);
    }

    #[test]
    fn due_today_is_still_todo() {
        assert_eq!(
            effective_status(date(10), Some(TargetStatus::Todo), date(10)),
            EffectiveStatus::Todo
        );
    }

    #[test]
    fn delete_permissions_by_role() {
        assert!(can_delete_assignment(&user(Role::Admin), "someone", None));
        assert!(can_delete_assignment(&user(Role::Teacher), "me", None));
        assert!(can_delete_assignment(&user(Role::Teacher), "someone", Some("me")));
        assert!(!can_delete_assignment(&user(Role::Teacher), "someone", Some("other")));
        assert!(!can_delete_assignment(&user(Role::Student), "me", Some("me")));
        assert!(!can_delete_assignment(&user(Role::Parent), "me", None));
    }

    #[test]
    fn duplicate_student_ids_collapse() {
        let ids = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(dedup_ids(&ids), vec!["a".to_string(), "b".to_string()]);
    }
}
