//! Role-scoped visibility: which students and courses a caller may see.
//!
//! Every rule here is an exhaustive `match` on [`Role`], so adding a role
//! forces each visibility decision to be revisited.

use sqlx::{MySql, QueryBuilder};

use crate::{
    db::Db,
    errors::{AppError, AppResult},
    middleware::auth_guard::AuthUser,
    models::Role,
};

/// The set of students a caller may read data for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudentScope {
    All,
    Only(Vec<String>),
}

impl StudentScope {
    pub fn contains(&self, student_id: &str) -> bool {
        match self {
            StudentScope::All => true,
            StudentScope::Only(ids) => ids.iter().any(|id| id == student_id),
        }
    }

    /// Narrow to one student, or to nothing if that student is out of scope.
    pub fn narrow_to(&self, student_id: &str) -> StudentScope {
        if self.contains(student_id) {
            StudentScope::Only(vec![student_id.to_string()])
        } else {
            StudentScope::Only(Vec::new())
        }
    }

    /// Append `AND <column> IN (...)` for a restricted scope.
    ///
    /// An empty scope becomes `AND 1 = 0` so the query simply returns nothing.
    pub fn push_filter(&self, qb: &mut QueryBuilder<'_, MySql>, column: &str) {
        match self {
            StudentScope::All => {}
            StudentScope::Only(ids) if ids.is_empty() => {
                qb.push(" AND 1 = 0");
            }
            StudentScope::Only(ids) => {
                qb.push(" AND ").push(column).push(" IN (");
                let mut list = qb.separated(", ");
                for id in ids {
                    list.push_bind(id.clone());
                }
                list.push_unseparated(")");
            }
        }
    }
}

/// Outcome of looking up "the" course of a teacher or student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassResolution {
    None,
    Single(String),
    Multiple,
}

impl ClassResolution {
    pub fn from_ids(mut ids: Vec<String>) -> Self {
        match ids.len() {
            0 => ClassResolution::None,
            1 => ClassResolution::Single(ids.remove(0)),
            _ => ClassResolution::Multiple,
        }
    }
}

pub async fn children_of(pool: &Db, parent_id: &str) -> AppResult<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT pc.child_id
         FROM parent_children pc
         JOIN users u ON u.id = pc.child_id
         WHERE pc.parent_id = ?
         ORDER BY u.username",
    )
    .bind(parent_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub async fn teacher_student_ids(pool: &Db, teacher_id: &str) -> AppResult<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT e.student_id
         FROM enrollments e
         JOIN courses c ON c.id = e.course_id
         WHERE c.teacher_id = ?",
    )
    .bind(teacher_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Students whose records the caller may read.
pub async fn visible_students(pool: &Db, caller: &AuthUser) -> AppResult<StudentScope> {
    let scope = match caller.role {
        Role::Admin   => StudentScope::All,
        Role::Teacher => StudentScope::Only(teacher_student_ids(pool, &caller.user_id).await?),
        Role::Student => StudentScope::Only(vec![caller.user_id.clone()]),
        Role::Parent  => StudentScope::Only(children_of(pool, &caller.user_id).await?),
    };
    Ok(scope)
}

pub async fn teacher_teaches_student(
    pool: &Db,
    teacher_id: &str,
    student_id: &str,
) -> AppResult<bool> {
    let ok: bool = sqlx::query_scalar(
        "SELECT EXISTS(
            SELECT 1 FROM enrollments e
            JOIN courses c ON c.id = e.course_id
            WHERE c.teacher_id = ? AND e.student_id = ?
         )",
    )
    .bind(teacher_id)
    .bind(student_id)
    .fetch_one(pool)
    .await?;
    Ok(ok)
}

/// Staff check for writing a student's records: admins always, teachers
/// only for students enrolled in one of their courses.
pub async fn assert_manages_student(
    pool: &Db,
    caller: &AuthUser,
    student_id: &str,
) -> AppResult<()> {
    match caller.role {
        Role::Admin => Ok(()),
        Role::Teacher => {
            if teacher_teaches_student(pool, &caller.user_id, student_id).await? {
                Ok(())
            } else {
                Err(AppError::Forbidden)
            }
        }
        Role::Student | Role::Parent => Err(AppError::Forbidden),
    }
}

/// The course must exist; teachers must be its teacher. Admins pass.
pub async fn assert_teaches_course(
    pool: &Db,
    caller: &AuthUser,
    course_id: &str,
) -> AppResult<()> {
    let teacher_id: Option<Option<String>> = sqlx::query_scalar(
        "SELECT teacher_id FROM courses WHERE id = ?",
    )
    .bind(course_id)
    .fetch_optional(pool)
    .await?;
    let teacher_id = teacher_id.ok_or(AppError::NotFound)?;

    match caller.role {
        Role::Admin => Ok(()),
        Role::Teacher if teacher_id.as_deref() == Some(caller.user_id.as_str()) => Ok(()),
        Role::Teacher | Role::Student | Role::Parent => Err(AppError::Forbidden),
    }
}

pub async fn is_enrolled(pool: &Db, course_id: &str, student_id: &str) -> AppResult<bool> {
    let ok: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM enrollments WHERE course_id = ? AND student_id = ?)",
    )
    .bind(course_id)
    .bind(student_id)
    .fetch_one(pool)
    .await?;
    Ok(ok)
}

/// Course ids visible to the caller, ordered by course name.
/// Admins see every course only when `include_admin` is set.
pub async fn user_course_ids(
    pool: &Db,
    caller: &AuthUser,
    include_admin: bool,
) -> AppResult<Vec<String>> {
    let ids: Vec<String> = match caller.role {
        Role::Student => {
            sqlx::query_scalar(
                "SELECT c.id FROM courses c
                 JOIN enrollments e ON e.course_id = c.id
                 WHERE e.student_id = ?
                 ORDER BY c.name",
            )
            .bind(&caller.user_id)
            .fetch_all(pool)
            .await?
        }
        Role::Parent => {
            sqlx::query_scalar(
                "SELECT c.id FROM courses c
                 JOIN enrollments e ON e.course_id = c.id
                 JOIN parent_children pc ON pc.child_id = e.student_id
                 WHERE pc.parent_id = ?
                 GROUP BY c.id, c.name
                 ORDER BY c.name",
            )
            .bind(&caller.user_id)
            .fetch_all(pool)
            .await?
        }
        Role::Teacher => {
            sqlx::query_scalar("SELECT id FROM courses WHERE teacher_id = ? ORDER BY name")
                .bind(&caller.user_id)
                .fetch_all(pool)
                .await?
        }
        Role::Admin if include_admin => {
            sqlx::query_scalar("SELECT id FROM courses ORDER BY name")
                .fetch_all(pool)
                .await?
        }
        Role::Admin => Vec::new(),
    };
    Ok(ids)
}

/// Resolve the caller's single class (used for invitations).
pub async fn user_single_class(pool: &Db, caller: &AuthUser) -> AppResult<ClassResolution> {
    Ok(ClassResolution::from_ids(user_course_ids(pool, caller, false).await?))
}

/// The course a teacher shares with a student: none, exactly one, or ambiguous.
pub async fn teacher_course_for_student(
    pool: &Db,
    teacher_id: &str,
    student_id: &str,
) -> AppResult<ClassResolution> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT c.id FROM courses c
         JOIN enrollments e ON e.course_id = c.id
         WHERE c.teacher_id = ? AND e.student_id = ?
         ORDER BY c.name",
    )
    .bind(teacher_id)
    .bind(student_id)
    .fetch_all(pool)
    .await?;
    Ok(ClassResolution::from_ids(ids))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_membership() {
        let scope = StudentScope::Only(vec!["a".into(), "b".into()]);
        assert!(scope.contains("a"));
        assert!(!scope.contains("c"));
        assert!(StudentScope::All.contains("anyone"));
    }

    #[test]
    fn narrowing_out_of_scope_yields_empty() {
        let scope = StudentScope::Only(vec!["a".into()]);
        assert_eq!(scope.narrow_to("a"), StudentScope::Only(vec!["a".into()]));
        assert_eq!(scope.narrow_to("z"), StudentScope::Only(Vec::new()));
        assert_eq!(StudentScope::All.narrow_to("z"), StudentScope::Only(vec!["z".into()]));
    }

    #[test]
    fn filter_sql_for_each_scope() {
        let mut qb = QueryBuilder::<MySql>::new("SELECT 1 FROM t WHERE 1 = 1");
        StudentScope::All.push_filter(&mut qb, "t.student_id");
        assert_eq!(qb.sql(), "SELECT 1 FROM t WHERE 1 = 1");

        let mut qb = QueryBuilder::<MySql>::new("SELECT 1 FROM t WHERE 1 = 1");
        StudentScope::Only(Vec::new()).push_filter(&mut qb, "t.student_id");
        assert_eq!(qb.sql(), "SELECT 1 FROM t WHERE 1 = 1 AND 1 = 0");

        let mut qb = QueryBuilder::<MySql>::new("SELECT 1 FROM t WHERE 1 = 1");
        StudentScope::Only(vec!["a".into(), "b".into()]).push_filter(&mut qb, "t.student_id");
        assert_eq!(qb.sql(), "SELECT 1 FROM t WHERE 1 = 1 AND t.student_id IN (?, ?)");
    }

    #[test]
    fn class_resolution_from_ids() {
        assert_eq!(ClassResolution::from_ids(vec![]), ClassResolution::None);
        assert_eq!(
            ClassResolution::from_ids(vec!["c1".into()]),
            ClassResolution::Single("c1".into())
        );
        assert_eq!(
            ClassResolution::from_ids(vec!["c1".into(), "c2".into()]),
            ClassResolution::Multiple
        );
    }
}
