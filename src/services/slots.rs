//! Recurring-lesson slot generator.
//!
//! A [`ScheduleTemplate`] says "this student has a lesson with this teacher
//! every <weekday> at <time>". Generation walks a window of `days` days
//! starting at a reference date and makes sure exactly one `lesson_slots` row
//! exists per matching date. Existing rows are never touched, so reports
//! already filed against a slot survive any number of regenerations.

use std::future::Future;

use chrono::{Datelike, Duration, NaiveDate, NaiveTime};
use uuid::Uuid;

use crate::{
    db::Db,
    errors::AppResult,
    models::ScheduleTemplate,
};

/// Dates in `[start, start + days)` whose weekday (0 = Monday) matches.
///
/// The window is a plain day-count offset, so a 14-day window that starts on
/// a Monday contains exactly two Mondays.
pub fn occurrence_dates(weekday: u8, start: NaiveDate, days: i64) -> Vec<NaiveDate> {
    (0..days.max(0))
        .map(|offset| start + Duration::days(offset))
        .filter(|date| date.weekday().num_days_from_monday() == u32::from(weekday))
        .collect()
}

/// A slot about to be created for one occurrence date.
#[derive(Debug, Clone)]
pub struct NewSlot<'a> {
    pub teacher_id:       &'a str,
    pub student_id:       &'a str,
    pub course_id:        &'a str,
    pub schedule_id:      &'a str,
    pub scheduled_date:   NaiveDate,
    pub start_time:       NaiveTime,
    pub duration_minutes: i32,
}

/// Persistence seam for the generator.
pub trait SlotStore {
    /// Atomically create the slot unless one already exists for
    /// (teacher, student, date, start time). Returns `true` when a row was created.
    fn insert_slot_if_missing(
        &self,
        slot: &NewSlot<'_>,
    ) -> impl Future<Output = AppResult<bool>> + Send;
}

impl SlotStore for Db {
    async fn insert_slot_if_missing(&self, slot: &NewSlot<'_>) -> AppResult<bool> {
        // INSERT IGNORE reports 0 affected rows when the unique occurrence key
        // already exists, which makes concurrent generators safe.
        let affected = sqlx::query(
            "INSERT IGNORE INTO lesson_slots
                (id, teacher_id, student_id, course_id, schedule_id,
                 scheduled_date, start_time, duration_minutes, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'planned')",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(slot.teacher_id)
        .bind(slot.student_id)
        .bind(slot.course_id)
        .bind(slot.schedule_id)
        .bind(slot.scheduled_date)
        .bind(slot.start_time)
        .bind(slot.duration_minutes)
        .execute(self)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }
}

/// Ensure one slot per matching date of `template` in the window.
/// Returns the number of newly created slots; inactive templates create none.
pub async fn generate_slots_for_schedule<S: SlotStore>(
    store: &S,
    template: &ScheduleTemplate,
    start: NaiveDate,
    days: i64,
) -> AppResult<u64> {
    if !template.active {
        return Ok(0);
    }

    let mut created = 0u64;
    for date in occurrence_dates(template.weekday, start, days) {
        let slot = NewSlot {
            teacher_id:       &template.teacher_id,
            student_id:       &template.student_id,
            course_id:        &template.course_id,
            schedule_id:      &template.id,
            scheduled_date:   date,
            start_time:       template.start_time,
            duration_minutes: template.duration_minutes,
        };
        if store.insert_slot_if_missing(&slot).await? {
            created += 1;
        }
    }

    if created > 0 {
        tracing::debug!(schedule_id = %template.id, created, "Generated lesson slots");
    }
    Ok(created)
}

/// Run the generator for every active template of a teacher.
pub async fn generate_slots_for_teacher(
    pool: &Db,
    teacher_id: &str,
    start: NaiveDate,
    days: i64,
) -> AppResult<u64> {
    let templates: Vec<ScheduleTemplate> = sqlx::query_as::<_, ScheduleTemplate>(
        "SELECT id, teacher_id, student_id, course_id, weekday, start_time, duration_minutes, active
         FROM student_schedules
         WHERE teacher_id = ? AND active = 1",
    )
    .bind(teacher_id)
    .fetch_all(pool)
    .await?;

    let mut created = 0u64;
    for template in &templates {
        created += generate_slots_for_schedule(pool, template, start, days).await?;
    }

    if created > 0 {
        tracing::info!(%teacher_id, created, templates = templates.len(), "Generated teacher lesson slots");
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    type Key = (String, String, NaiveDate, NaiveTime);

    /// In-memory store keyed like the `lesson_slots` unique index; the value is the slot status.
    #[derive(Default)]
    struct MemoryStore {
        slots: Mutex<BTreeMap<Key, String>>,
    }

    impl MemoryStore {
        fn len(&self) -> usize {
            self.slots.lock().unwrap().len()
        }

        fn dates(&self) -> Vec<NaiveDate> {
            self.slots.lock().unwrap().keys().map(|k| k.2).collect()
        }

        fn set_status(&self, date: NaiveDate, status: &str) {
            let mut slots = self.slots.lock().unwrap();
            for (key, value) in slots.iter_mut() {
                if key.2 == date {
                    *value = status.to_string();
                }
            }
        }

        fn statuses(&self) -> Vec<String> {
            self.slots.lock().unwrap().values().cloned().collect()
        }
    }

    impl SlotStore for MemoryStore {
        async fn insert_slot_if_missing(&self, slot: &NewSlot<'_>) -> AppResult<bool> {
            let key = (
                slot.teacher_id.to_string(),
                slot.student_id.to_string(),
                slot.scheduled_date,
                slot.start_time,
            );
            let mut slots = self.slots.lock().unwrap();
            if slots.contains_key(&key) {
                return Ok(false);
            }
            slots.insert(key, "planned".to_string());
            Ok(true)
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn template(weekday: u8, active: bool) -> ScheduleTemplate {
        ScheduleTemplate {
            id:               "tmpl-1".into(),
            teacher_id:       "teacher-1".into(),
            student_id:       "student-1".into(),
            course_id:        "course-1".into(),
            weekday,
            start_time:       NaiveTime::from_hms_opt(15, 0, 0).unwrap(),
            duration_minutes: 45,
            active,
        }
    }

    // 2024-01-01 is a Monday.
    const MONDAY: (i32, u32, u32) = (2024, 1, 1);

    #[tokio::test]
    async fn monday_template_over_two_weeks_creates_two_slots_a_week_apart() {
        let store = MemoryStore::default();
        let start = date(MONDAY.0, MONDAY.1, MONDAY.2);

        let created = generate_slots_for_schedule(&store, &template(0, true), start, 14)
            .await
            .unwrap();

        assert_eq!(created, 2);
        let dates = store.dates();
        assert_eq!(dates, vec![start, start + Duration::days(7)]);
    }

    #[test]
    fn occurrence_count_matches_weekdays_in_window() {
        let start = date(2024, 2, 27); // Tuesday, window crosses a leap day
        for weekday in 0u8..7 {
            for days in [0i64, 1, 6, 7, 8, 29, 60, 61] {
                let expected = (0..days)
                    .filter(|o| {
                        (start + Duration::days(*o)).weekday().num_days_from_monday()
                            == u32::from(weekday)
                    })
                    .count();
                let dates = occurrence_dates(weekday, start, days);
                assert_eq!(dates.len(), expected, "weekday {weekday}, days {days}");
                assert!(dates.iter().all(|d| *d >= start && *d < start + Duration::days(days)));
            }
        }
    }

    #[test]
    fn window_includes_start_and_excludes_end() {
        let start = date(MONDAY.0, MONDAY.1, MONDAY.2);
        assert_eq!(occurrence_dates(0, start, 1), vec![start]);
        assert!(occurrence_dates(0, start + Duration::days(1), 6).is_empty());
        assert!(occurrence_dates(3, start, 0).is_empty());
    }

    #[tokio::test]
    async fn regenerating_is_idempotent() {
        let store = MemoryStore::default();
        let start = date(MONDAY.0, MONDAY.1, MONDAY.2);
        let tmpl = template(2, true);

        let first = generate_slots_for_schedule(&store, &tmpl, start, 60).await.unwrap();
        let after_first = store.dates();
        let second = generate_slots_for_schedule(&store, &tmpl, start, 60).await.unwrap();

        assert!(first > 0);
        assert_eq!(second, 0);
        assert_eq!(store.dates(), after_first);
    }

    #[tokio::test]
    async fn inactive_template_creates_nothing() {
        let store = MemoryStore::default();
        let start = date(MONDAY.0, MONDAY.1, MONDAY.2);

        let created = generate_slots_for_schedule(&store, &template(0, false), start, 60)
            .await
            .unwrap();

        assert_eq!(created, 0);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn deactivation_stops_generation_but_keeps_existing_slots() {
        let store = MemoryStore::default();
        let start = date(MONDAY.0, MONDAY.1, MONDAY.2);

        generate_slots_for_schedule(&store, &template(4, true), start, 14).await.unwrap();
        let existing = store.len();

        // Later window: an inactive template must not extend the calendar.
        let later = start + Duration::days(14);
        let created = generate_slots_for_schedule(&store, &template(4, false), later, 14)
            .await
            .unwrap();

        assert_eq!(created, 0);
        assert_eq!(store.len(), existing);
    }

    #[tokio::test]
    async fn overlapping_windows_leave_reported_slots_untouched() {
        let store = MemoryStore::default();
        let start = date(MONDAY.0, MONDAY.1, MONDAY.2);
        let tmpl = template(0, true);

        generate_slots_for_schedule(&store, &tmpl, start, 14).await.unwrap();
        store.set_status(start, "done");

        let created = generate_slots_for_schedule(&store, &tmpl, start, 21).await.unwrap();

        assert_eq!(created, 1);
        assert_eq!(store.len(), 3);
        assert_eq!(store.statuses().iter().filter(|s| *s == "done").count(), 1);
    }
}
