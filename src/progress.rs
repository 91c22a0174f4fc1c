//! Progress calculator: one 0..1 score per (student, cohort), derived from
//! the external course-completion signal (weight 0.7) and the attendance
//! ratio (weight 0.3). Recompute is a full rebuild from source signals, so
//! overlapping calls for the same key are harmless.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::attendance;
use crate::cohorts;
use crate::db::uuid_col;
use crate::error::{EngineError, Result};
use crate::models::ProgressSnapshot;
use crate::sessions;
use crate::sources::CompletionSource;

pub const COMPLETION_WEIGHT: f64 = 0.7;
pub const ATTENDANCE_WEIGHT: f64 = 0.3;

/// Weighted composite of the two signals, clamped to [0, 1]. Pure and
/// deterministic: same inputs, same score.
pub fn compute_progress(completion_ratio: f64, attendance_ratio: f64) -> f64 {
    let completion = completion_ratio.clamp(0.0, 1.0);
    let attendance = attendance_ratio.clamp(0.0, 1.0);
    (COMPLETION_WEIGHT * completion + ATTENDANCE_WEIGHT * attendance).clamp(0.0, 1.0)
}

/// 0..100 scale for dashboards.
pub fn display_score(score: f64) -> f64 {
    score * 100.0
}

/// Mean completion over the distinct courses the cohort's sessions deliver.
/// Each external read is bounded by `timeout`; any failure aborts the whole
/// recompute before anything is written.
async fn cohort_completion_ratio(
    pool: &SqlitePool,
    source: &dyn CompletionSource,
    timeout: Duration,
    student_id: Uuid,
    cohort_id: Uuid,
) -> Result<f64> {
    let courses = sessions::courses_for_cohort(pool, cohort_id).await?;
    if courses.is_empty() {
        return Ok(0.0);
    }

    let mut total = 0.0;
    for course_id in &courses {
        let ratio = tokio::time::timeout(timeout, source.completion_ratio(student_id, *course_id))
            .await
            .map_err(|_| {
                EngineError::External(format!(
                    "completion source timed out for student {student_id} course {course_id}"
                ))
            })??;
        total += ratio.clamp(0.0, 1.0);
    }
    Ok(total / courses.len() as f64)
}

/// Rebuild the snapshot for one (student, cohort) key. Fails closed: if the
/// completion source is unavailable the existing snapshot stays as it was.
/// Safe to call repeatedly and concurrently; the write is last-writer-wins.
pub async fn recompute(
    pool: &SqlitePool,
    source: &dyn CompletionSource,
    timeout: Duration,
    student_id: Uuid,
    cohort_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ProgressSnapshot> {
    cohorts::get_cohort(pool, cohort_id).await?;

    let completion_ratio =
        cohort_completion_ratio(pool, source, timeout, student_id, cohort_id).await?;
    let attendance_ratio = attendance::attendance_ratio(pool, student_id, cohort_id, now).await?;
    let score = compute_progress(completion_ratio, attendance_ratio);

    sqlx::query(
        "INSERT INTO progress_snapshots
         (student_id, cohort_id, completion_ratio, attendance_ratio, score, recomputed_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (student_id, cohort_id) DO UPDATE SET
         completion_ratio = excluded.completion_ratio,
         attendance_ratio = excluded.attendance_ratio,
         score = excluded.score,
         recomputed_at = excluded.recomputed_at",
    )
    .bind(student_id.to_string())
    .bind(cohort_id.to_string())
    .bind(completion_ratio)
    .bind(attendance_ratio)
    .bind(score)
    .bind(now)
    .execute(pool)
    .await?;

    debug!(%student_id, %cohort_id, score, "progress recomputed");
    Ok(ProgressSnapshot {
        student_id,
        cohort_id,
        completion_ratio,
        attendance_ratio,
        score,
        recomputed_at: now,
    })
}

pub async fn get_progress(
    pool: &SqlitePool,
    student_id: Uuid,
    cohort_id: Uuid,
) -> Result<ProgressSnapshot> {
    let row = sqlx::query(
        "SELECT * FROM progress_snapshots WHERE student_id = ? AND cohort_id = ?",
    )
    .bind(student_id.to_string())
    .bind(cohort_id.to_string())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| {
        EngineError::NotFound(format!(
            "progress snapshot for student {student_id} in cohort {cohort_id}"
        ))
    })?;

    Ok(ProgressSnapshot {
        student_id: uuid_col(&row, "student_id")?,
        cohort_id: uuid_col(&row, "cohort_id")?,
        completion_ratio: row.get("completion_ratio"),
        attendance_ratio: row.get("attendance_ratio"),
        score: row.get("score"),
        recomputed_at: row.get("recomputed_at"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone};

    use super::*;
    use crate::db::testing::test_pool;
    use crate::models::{ActorRole, AttendanceOutcome, CohortDefinition, IntakeTerm};
    use crate::sources::testing::{FailingCompletion, StubCompletion, StubRoles};

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn weighted_sum_matches_the_formula() {
        for (c, a) in [(0.0, 0.0), (1.0, 1.0), (0.5, 0.25), (0.9, 0.1), (0.33, 0.67)] {
            let expected = 0.7 * c + 0.3 * a;
            assert!((compute_progress(c, a) - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn result_stays_in_unit_range() {
        assert_eq!(compute_progress(5.0, 3.0), 1.0);
        assert_eq!(compute_progress(-1.0, -0.5), 0.0);
        assert_eq!(compute_progress(1.0, 1.0), 1.0);
    }

    #[test]
    fn display_scales_to_hundred() {
        assert!((display_score(compute_progress(1.0, 1.0)) - 100.0).abs() < 1e-9);
        assert!((display_score(0.42) - 42.0).abs() < 1e-9);
    }

    struct Fixture {
        pool: SqlitePool,
        cohort: Uuid,
        student: Uuid,
        course: Uuid,
        now: DateTime<Utc>,
    }

    async fn fixture() -> Fixture {
        let pool = test_pool().await;
        // Whole seconds survive the TEXT round-trip exactly.
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        let student = Uuid::new_v4();
        let course = Uuid::new_v4();
        let teacher = Uuid::new_v4();

        let cohort = cohorts::create_cohort(
            &pool,
            &CohortDefinition {
                name: "Cloud Ops 2026".into(),
                academic_year: 2026,
                intake_term: IntakeTerm::September,
                semester: 1,
                start_date: NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
                created_by: Uuid::new_v4(),
            },
        )
        .await
        .unwrap();
        cohorts::add_members(&pool, cohort, &[student], now).await.unwrap();

        // Two past sessions of the same course, one attended.
        let attended = sessions::create_session(
            &pool,
            cohort,
            course,
            teacher,
            now - ChronoDuration::hours(6),
            now - ChronoDuration::hours(5),
            "",
        )
        .await
        .unwrap();
        sessions::create_session(
            &pool,
            cohort,
            course,
            teacher,
            now - ChronoDuration::hours(4),
            now - ChronoDuration::hours(3),
            "",
        )
        .await
        .unwrap();

        let roles = StubRoles(HashMap::from([(teacher, ActorRole::Teacher)]));
        attendance::mark(
            &pool,
            &roles,
            attended,
            student,
            AttendanceOutcome::Attended,
            teacher,
            now,
        )
        .await
        .unwrap();

        Fixture { pool, cohort, student, course, now }
    }

    #[tokio::test]
    async fn recompute_writes_the_weighted_snapshot() {
        let fx = fixture().await;
        let source = StubCompletion(HashMap::from([((fx.student, fx.course), 0.8)]));

        let snapshot = recompute(&fx.pool, &source, TIMEOUT, fx.student, fx.cohort, fx.now)
            .await
            .unwrap();
        assert!((snapshot.completion_ratio - 0.8).abs() < 1e-9);
        assert!((snapshot.attendance_ratio - 0.5).abs() < 1e-9);
        assert!((snapshot.score - (0.7 * 0.8 + 0.3 * 0.5)).abs() < 1e-9);

        let stored = get_progress(&fx.pool, fx.student, fx.cohort).await.unwrap();
        assert_eq!(stored, snapshot);
    }

    #[tokio::test]
    async fn recompute_is_idempotent_for_unchanged_inputs() {
        let fx = fixture().await;
        let source = StubCompletion(HashMap::from([((fx.student, fx.course), 0.8)]));

        let first = recompute(&fx.pool, &source, TIMEOUT, fx.student, fx.cohort, fx.now)
            .await
            .unwrap();
        let second = recompute(&fx.pool, &source, TIMEOUT, fx.student, fx.cohort, fx.now)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(get_progress(&fx.pool, fx.student, fx.cohort).await.unwrap(), second);
    }

    #[tokio::test]
    async fn failed_completion_source_leaves_the_snapshot_untouched() {
        let fx = fixture().await;
        let source = StubCompletion(HashMap::from([((fx.student, fx.course), 0.8)]));
        let before = recompute(&fx.pool, &source, TIMEOUT, fx.student, fx.cohort, fx.now)
            .await
            .unwrap();

        let err = recompute(
            &fx.pool,
            &FailingCompletion,
            TIMEOUT,
            fx.student,
            fx.cohort,
            fx.now + ChronoDuration::hours(1),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "EXTERNAL_DEPENDENCY");

        let after = get_progress(&fx.pool, fx.student, fx.cohort).await.unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn missing_cohort_is_not_found() {
        let pool = test_pool().await;
        let source = StubCompletion(HashMap::new());
        let err = recompute(&pool, &source, TIMEOUT, Uuid::new_v4(), Uuid::new_v4(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NOT_FOUND");
    }
}
