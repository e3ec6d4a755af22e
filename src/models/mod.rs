//! Domain enums and the row types shared between services and routes.
//!
//! Enums are stored as lowercase `VARCHAR` values; rows carry the raw string
//! and handlers convert with `str::parse` where behaviour depends on it.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Declares a string-backed enum with `as_str`, `FromStr`, `Display` and serde
/// support using the same spelling as the database column.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self { $($name::$variant => $text),+ }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("invalid {} value: {other}", stringify!($name))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ── Users ────────────────────────────────────────────────────

string_enum! {
    /// The four account kinds. Every authorization decision matches on this.
    pub enum Role {
        Admin   => "admin",
        Teacher => "teacher",
        Student => "student",
        Parent  => "parent",
    }
}

impl Role {
    /// Teachers and admins manage school data; students and parents only read.
    pub fn is_staff(self) -> bool {
        matches!(self, Role::Admin | Role::Teacher)
    }
}

string_enum! {
    /// Study track of a student.
    pub enum Cycle {
        General     => "general",
        Accelerated => "accelerated",
        Extra       => "extra",
    }
}

/// "First Last", or the username when both names are blank.
pub fn display_name(first_name: &str, last_name: &str, username: &str) -> String {
    let full = format!("{} {}", first_name.trim(), last_name.trim());
    let full = full.trim();
    if full.is_empty() {
        username.to_string()
    } else {
        full.to_string()
    }
}

// ── Courses ──────────────────────────────────────────────────

string_enum! {
    pub enum CourseType {
        Instrument => "instrument",
        Ensemble   => "ensemble",
        Theory     => "theory",
    }
}

// ── Slots ────────────────────────────────────────────────────

string_enum! {
    pub enum SlotStatus {
        Planned => "planned",
        Done    => "done",
        Missed  => "missed",
    }
}

string_enum! {
    pub enum AttendanceStatus {
        Present => "present",
        Absent  => "absent",
        Excused => "excused",
    }
}

// ── Homework ─────────────────────────────────────────────────

string_enum! {
    /// Stored status of an assignment target.
    pub enum TargetStatus {
        Todo => "todo",
        Done => "done",
    }
}

string_enum! {
    /// Status shown to readers: stored `done` wins, otherwise lateness is
    /// derived from the due date.
    pub enum EffectiveStatus {
        Todo => "TODO",
        Done => "DONE",
        Late => "LATE",
    }
}

// ── Gradebook ────────────────────────────────────────────────

string_enum! {
    pub enum AssessmentType {
        Homework    => "homework",
        Performance => "performance",
        Jury        => "jury",
        TheoryTest  => "theory_test",
    }
}

// ── Events ───────────────────────────────────────────────────

string_enum! {
    pub enum EventType {
        Lesson  => "lesson",
        Exam    => "exam",
        Concert => "concert",
    }
}

// ── Schedule templates and slots ─────────────────────────────

/// A recurring weekly lesson commitment (`student_schedules`).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScheduleTemplate {
    pub id:               String,
    pub teacher_id:       String,
    pub student_id:       String,
    pub course_id:        String,
    /// 0 = Monday … 6 = Sunday.
    pub weekday:          u8,
    pub start_time:       NaiveTime,
    pub duration_minutes: i32,
    pub active:           bool,
}

/// One dated occurrence derived from a [`ScheduleTemplate`].
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LessonSlot {
    pub id:                String,
    pub teacher_id:        String,
    pub student_id:        String,
    pub course_id:         String,
    pub schedule_id:       Option<String>,
    pub scheduled_date:    NaiveDate,
    pub start_time:        NaiveTime,
    pub duration_minutes:  i32,
    pub status:            String,
    pub attendance_status: Option<String>,
    pub lesson_id:         Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_its_column_value() {
        for role in [Role::Admin, Role::Teacher, Role::Student, Role::Parent] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("ADMIN".parse::<Role>().is_err());
    }

    #[test]
    fn only_admin_and_teacher_are_staff() {
        assert!(Role::Admin.is_staff());
        assert!(Role::Teacher.is_staff());
        assert!(!Role::Student.is_staff());
        assert!(!Role::Parent.is_staff());
    }

    #[test]
    fn display_name_falls_back_to_username() {
        assert_eq!(display_name("Anna", "Petrova", "anna"), "Anna Petrova");
        assert_eq!(display_name("Anna", "", "anna"), "Anna");
        assert_eq!(display_name(" ", "", "anna"), "anna");
    }

    #[test]
    fn serde_uses_column_spelling() {
        let json = serde_json::to_string(&AssessmentType::TheoryTest).unwrap();
        assert_eq!(json, "\"theory_test\"");
        let status: EffectiveStatus = serde_json::from_str("\"LATE\"").unwrap();
        assert_eq!(status, EffectiveStatus::Late);
    }
}
