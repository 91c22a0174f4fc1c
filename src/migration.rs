//! One-shot migration from the legacy direct-enrollment model.
//!
//! Three phases: analyze (dry run, report only), backup, transform. The
//! grouping heuristic is exactly that, a heuristic, which is why analyze is
//! a separate read-only step whose report is meant to be reviewed before
//! execute. Not safe to run alongside live traffic; callers must arrange a
//! maintenance window.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cohorts;
use crate::db::{opt_uuid_col, uuid_col};
use crate::error::{EngineError, Result};
use crate::models::{
    CohortDefinition, IntakeTerm, LegacyEnrollment, MigrationRecord, MigrationStatus,
};
use crate::progress;
use crate::sessions;

/// Tables snapshotted before transform and restored wholesale on rollback.
const BACKUP_TABLES: &[&str] = &[
    "cohorts",
    "cohort_members",
    "active_members",
    "sessions",
    "attendance_records",
    "attendance_audit",
    "progress_snapshots",
    "legacy_enrollments",
];

#[derive(Debug, Clone)]
pub struct CandidateCohort {
    pub academic_year: i32,
    pub intake_term: IntakeTerm,
    pub term_start: NaiveDate,
    pub term_end: NaiveDate,
    pub students: Vec<Uuid>,
    /// Distinct courses in the group, with the teacher first seen for each.
    pub courses: Vec<(Uuid, Uuid)>,
    pub enrollments: Vec<LegacyEnrollment>,
}

impl CandidateCohort {
    pub fn display_name(&self) -> String {
        format!(
            "Migrated {} {}",
            match self.intake_term {
                IntakeTerm::September => "September",
                IntakeTerm::March => "March",
            },
            self.academic_year
        )
    }
}

#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub candidates: Vec<CandidateCohort>,
    pub total_enrollments: usize,
}

#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub cohorts_created: usize,
    pub migrated: usize,
    pub failed: usize,
    pub records: Vec<MigrationRecord>,
}

async fn load_legacy(pool: &SqlitePool) -> Result<Vec<LegacyEnrollment>> {
    let rows = sqlx::query("SELECT * FROM legacy_enrollments ORDER BY term_start, id")
        .fetch_all(pool)
        .await?;
    let mut enrollments = Vec::with_capacity(rows.len());
    for row in rows {
        enrollments.push(LegacyEnrollment {
            id: uuid_col(&row, "id")?,
            student_id: uuid_col(&row, "student_id")?,
            course_id: uuid_col(&row, "course_id")?,
            teacher_id: uuid_col(&row, "teacher_id")?,
            term_start: row.get("term_start"),
            term_end: row.get("term_end"),
            completion_ratio: row.get("completion_ratio"),
        });
    }
    Ok(enrollments)
}

/// Intake term by start month: June through December reads as a September
/// intake, the rest as March.
fn intake_for(term_start: NaiveDate) -> IntakeTerm {
    if (6..=12).contains(&term_start.month()) {
        IntakeTerm::September
    } else {
        IntakeTerm::March
    }
}

/// Dry run: group legacy enrollments into candidate cohorts by shared
/// (academic year, intake term). Reads only, repeatable.
pub async fn analyze(pool: &SqlitePool) -> Result<MigrationPlan> {
    let enrollments = load_legacy(pool).await?;
    let total_enrollments = enrollments.len();

    let mut groups: BTreeMap<(i32, &'static str), CandidateCohort> = BTreeMap::new();
    for enrollment in enrollments {
        let intake = intake_for(enrollment.term_start);
        let year = enrollment.term_end.year();
        let candidate = groups.entry((year, intake.as_str())).or_insert_with(|| {
            CandidateCohort {
                academic_year: year,
                intake_term: intake,
                term_start: enrollment.term_start,
                term_end: enrollment.term_end,
                students: Vec::new(),
                courses: Vec::new(),
                enrollments: Vec::new(),
            }
        });

        candidate.term_start = candidate.term_start.min(enrollment.term_start);
        candidate.term_end = candidate.term_end.max(enrollment.term_end);
        if !candidate.students.contains(&enrollment.student_id) {
            candidate.students.push(enrollment.student_id);
        }
        if !candidate.courses.iter().any(|(c, _)| *c == enrollment.course_id) {
            candidate.courses.push((enrollment.course_id, enrollment.teacher_id));
        }
        candidate.enrollments.push(enrollment);
    }

    Ok(MigrationPlan {
        candidates: groups.into_values().collect(),
        total_enrollments,
    })
}

async fn active_backup(pool: &SqlitePool) -> Result<Option<i64>> {
    let id: Option<i64> =
        sqlx::query_scalar("SELECT id FROM migration_backups WHERE active = 1 LIMIT 1")
            .fetch_optional(pool)
            .await?;
    Ok(id)
}

/// Snapshot every affected table before any write.
async fn backup(pool: &SqlitePool, now: DateTime<Utc>) -> Result<()> {
    for table in BACKUP_TABLES {
        sqlx::query(&format!("DROP TABLE IF EXISTS mig_backup_{table}"))
            .execute(pool)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE mig_backup_{table} AS SELECT * FROM {table}"
        ))
        .execute(pool)
        .await?;
    }
    sqlx::query("INSERT INTO migration_backups (created_at, active) VALUES (?, 1)")
        .bind(now)
        .execute(pool)
        .await?;
    info!("pre-migration backup taken");
    Ok(())
}

fn session_window(
    term_start: NaiveDate,
    course_index: usize,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    // One two-hour slot per course on consecutive days, so a teacher carrying
    // several courses never collides with themselves.
    let day = term_start + Duration::days(course_index as i64);
    let starts_at = day
        .and_hms_opt(9, 0, 0)
        .ok_or_else(|| EngineError::Validation {
            field: "term_start".into(),
            message: format!("cannot derive a session window from {day}"),
        })?
        .and_utc();
    Ok((starts_at, starts_at + Duration::hours(2)))
}

async fn set_record(
    pool: &SqlitePool,
    legacy_id: Uuid,
    cohort_id: Option<Uuid>,
    session_id: Option<Uuid>,
    status: MigrationStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO migration_records (legacy_id, cohort_id, session_id, status, error, run_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (legacy_id) DO UPDATE SET
         cohort_id = excluded.cohort_id,
         session_id = excluded.session_id,
         status = excluded.status,
         error = excluded.error,
         run_at = excluded.run_at",
    )
    .bind(legacy_id.to_string())
    .bind(cohort_id.map(|id| id.to_string()))
    .bind(session_id.map(|id| id.to_string()))
    .bind(status.as_str())
    .bind(error)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Transform phase. Refuses to run twice: an active backup means a previous
/// execute has not been rolled back. One failing record never blocks the
/// rest; each legacy row ends up migrated or failed with a reason.
pub async fn execute(pool: &SqlitePool, now: DateTime<Utc>, migrator: Uuid) -> Result<MigrationReport> {
    if active_backup(pool).await?.is_some() {
        return Err(EngineError::Precondition(
            "a migration backup is already active; roll back before executing again".into(),
        ));
    }

    let plan = analyze(pool).await?;
    backup(pool, now).await?;

    for candidate in &plan.candidates {
        for enrollment in &candidate.enrollments {
            set_record(pool, enrollment.id, None, None, MigrationStatus::Pending, None, now)
                .await?;
        }
    }

    let mut cohorts_created = 0;
    let mut migrated = 0;
    let mut failed = 0;

    for candidate in &plan.candidates {
        let definition = CohortDefinition {
            name: candidate.display_name(),
            academic_year: candidate.academic_year,
            intake_term: candidate.intake_term,
            semester: 1,
            start_date: candidate.term_start,
            end_date: candidate.term_end,
            created_by: migrator,
        };
        let cohort_id = match cohorts::create_cohort(pool, &definition).await {
            Ok(id) => id,
            Err(err) => {
                warn!(name = %definition.name, error = %err, "candidate cohort failed");
                for enrollment in &candidate.enrollments {
                    set_record(
                        pool,
                        enrollment.id,
                        None,
                        None,
                        MigrationStatus::Failed,
                        Some(&err.to_string()),
                        now,
                    )
                    .await?;
                    failed += 1;
                }
                continue;
            }
        };
        cohorts_created += 1;

        // One session per distinct course in the group.
        let mut session_of_course: BTreeMap<Uuid, Uuid> = BTreeMap::new();
        for (index, (course_id, teacher_id)) in candidate.courses.iter().enumerate() {
            let (starts_at, ends_at) = session_window(candidate.term_start, index)?;
            match sessions::create_session(
                pool, cohort_id, *course_id, *teacher_id, starts_at, ends_at, "",
            )
            .await
            {
                Ok(session_id) => {
                    session_of_course.insert(*course_id, session_id);
                }
                Err(err) => {
                    warn!(%course_id, error = %err, "session synthesis failed");
                }
            }
        }

        for enrollment in &candidate.enrollments {
            let session_id = session_of_course.get(&enrollment.course_id).copied();
            let outcome = migrate_enrollment(pool, cohort_id, enrollment, session_id, now).await;
            match outcome {
                Ok(()) => {
                    set_record(
                        pool,
                        enrollment.id,
                        Some(cohort_id),
                        session_id,
                        MigrationStatus::Migrated,
                        None,
                        now,
                    )
                    .await?;
                    migrated += 1;
                }
                Err(err) => {
                    set_record(
                        pool,
                        enrollment.id,
                        Some(cohort_id),
                        session_id,
                        MigrationStatus::Failed,
                        Some(&err.to_string()),
                        now,
                    )
                    .await?;
                    failed += 1;
                }
            }
        }

        if !session_of_course.is_empty() {
            cohorts::activate(pool, cohort_id).await?;
        }
    }

    let records = list_records(pool).await?;
    info!(cohorts_created, migrated, failed, "migration executed");
    Ok(MigrationReport { cohorts_created, migrated, failed, records })
}

/// Membership plus a progress snapshot carrying the legacy completion ratio
/// untouched; attendance starts from zero under the new model.
async fn migrate_enrollment(
    pool: &SqlitePool,
    cohort_id: Uuid,
    enrollment: &LegacyEnrollment,
    session_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<()> {
    session_id.ok_or_else(|| {
        EngineError::Precondition(format!(
            "no session could be synthesized for course {}",
            enrollment.course_id
        ))
    })?;

    cohorts::add_members(pool, cohort_id, &[enrollment.student_id], now).await?;

    let completion = enrollment.completion_ratio.clamp(0.0, 1.0);
    sqlx::query(
        "INSERT INTO progress_snapshots
         (student_id, cohort_id, completion_ratio, attendance_ratio, score, recomputed_at)
         VALUES (?, ?, ?, 0.0, ?, ?)
         ON CONFLICT (student_id, cohort_id) DO UPDATE SET
         completion_ratio = excluded.completion_ratio,
         score = excluded.score,
         recomputed_at = excluded.recomputed_at",
    )
    .bind(enrollment.student_id.to_string())
    .bind(cohort_id.to_string())
    .bind(completion)
    .bind(progress::compute_progress(completion, 0.0))
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Restore every backed-up table wholesale and discard migration output.
/// Returns false (a no-op) when no backup is active; safe to repeat.
pub async fn rollback(pool: &SqlitePool) -> Result<bool> {
    let Some(backup_id) = active_backup(pool).await? else {
        return Ok(false);
    };

    let mut tx = pool.begin().await?;
    for table in BACKUP_TABLES {
        sqlx::query(&format!("DELETE FROM {table}")).execute(&mut *tx).await?;
        sqlx::query(&format!("INSERT INTO {table} SELECT * FROM mig_backup_{table}"))
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DELETE FROM migration_records").execute(&mut *tx).await?;
    sqlx::query("UPDATE migration_backups SET active = 0 WHERE id = ?")
        .bind(backup_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(backup_id, "migration rolled back");
    Ok(true)
}

pub async fn list_records(pool: &SqlitePool) -> Result<Vec<MigrationRecord>> {
    let rows = sqlx::query("SELECT * FROM migration_records ORDER BY legacy_id")
        .fetch_all(pool)
        .await?;
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let status: String = row.get("status");
        let status = match status.as_str() {
            "pending" => MigrationStatus::Pending,
            "migrated" => MigrationStatus::Migrated,
            _ => MigrationStatus::Failed,
        };
        records.push(MigrationRecord {
            legacy_id: uuid_col(&row, "legacy_id")?,
            cohort_id: opt_uuid_col(&row, "cohort_id")?,
            session_id: opt_uuid_col(&row, "session_id")?,
            status,
            error: row.get("error"),
        });
    }
    Ok(records)
}

/// Load the migration feed from a CSV export of the legacy system.
pub async fn import_legacy_csv(pool: &SqlitePool, csv_path: &Path) -> Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)
        .map_err(|e| EngineError::External(format!("cannot read {}: {e}", csv_path.display())))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<LegacyEnrollment>() {
        let row = result
            .map_err(|e| EngineError::Validation {
                field: "csv".into(),
                message: e.to_string(),
            })?;
        let outcome = sqlx::query(
            "INSERT OR IGNORE INTO legacy_enrollments
             (id, student_id, course_id, teacher_id, term_start, term_end, completion_ratio)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.id.to_string())
        .bind(row.student_id.to_string())
        .bind(row.course_id.to_string())
        .bind(row.teacher_id.to_string())
        .bind(row.term_start)
        .bind(row.term_end)
        .bind(row.completion_ratio)
        .execute(pool)
        .await?;
        if outcome.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::db::testing::test_pool;
    use crate::models::CohortStatus;

    async fn insert_legacy(
        pool: &SqlitePool,
        student: Uuid,
        course: Uuid,
        teacher: Uuid,
        term_start: NaiveDate,
        term_end: NaiveDate,
        ratio: f64,
    ) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO legacy_enrollments
             (id, student_id, course_id, teacher_id, term_start, term_end, completion_ratio)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(student.to_string())
        .bind(course.to_string())
        .bind(teacher.to_string())
        .bind(term_start)
        .bind(term_end)
        .bind(ratio)
        .execute(pool)
        .await
        .unwrap();
        id
    }

    fn autumn() -> (NaiveDate, NaiveDate) {
        (
            NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        )
    }

    fn spring() -> (NaiveDate, NaiveDate) {
        (
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 7, 31).unwrap(),
        )
    }

    #[tokio::test]
    async fn analyze_groups_by_term_and_mutates_nothing() {
        let pool = test_pool().await;
        let (a_start, a_end) = autumn();
        let (s_start, s_end) = spring();
        let course = Uuid::new_v4();
        let teacher = Uuid::new_v4();

        insert_legacy(&pool, Uuid::new_v4(), course, teacher, a_start, a_end, 0.5).await;
        insert_legacy(&pool, Uuid::new_v4(), course, teacher, a_start, a_end, 0.7).await;
        insert_legacy(&pool, Uuid::new_v4(), course, teacher, s_start, s_end, 0.2).await;

        let plan = analyze(&pool).await.unwrap();
        assert_eq!(plan.total_enrollments, 3);
        assert_eq!(plan.candidates.len(), 2);

        let autumn_candidate = plan
            .candidates
            .iter()
            .find(|c| c.intake_term == IntakeTerm::September)
            .unwrap();
        assert_eq!(autumn_candidate.students.len(), 2);
        assert_eq!(autumn_candidate.courses.len(), 1);

        let cohort_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cohorts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(cohort_count, 0);
    }

    #[tokio::test]
    async fn execute_then_rollback_restores_collections() {
        let pool = test_pool().await;
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap();
        let (start, end) = autumn();
        let course = Uuid::new_v4();
        let teacher = Uuid::new_v4();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        insert_legacy(&pool, s1, course, teacher, start, end, 0.8).await;
        insert_legacy(&pool, s2, course, teacher, start, end, 0.45).await;

        let report = execute(&pool, now, Uuid::new_v4()).await.unwrap();
        assert_eq!(report.cohorts_created, 1);
        assert_eq!(report.migrated, 2);
        assert_eq!(report.failed, 0);

        let cohort_id = report.records[0].cohort_id.unwrap();
        let cohort = cohorts::get_cohort(&pool, cohort_id).await.unwrap();
        assert_eq!(cohort.status, CohortStatus::Active);
        assert_eq!(cohorts::list_members(&pool, cohort_id).await.unwrap().len(), 2);

        // Legacy progress value carried over untouched.
        let snapshot = progress::get_progress(&pool, s1, cohort_id).await.unwrap();
        assert!((snapshot.completion_ratio - 0.8).abs() < 1e-9);
        assert_eq!(snapshot.attendance_ratio, 0.0);

        // Executing again without rollback is refused.
        let err = execute(&pool, now, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), "PRECONDITION");

        assert!(rollback(&pool).await.unwrap());

        for (table, expected) in [
            ("cohorts", 0_i64),
            ("cohort_members", 0),
            ("active_members", 0),
            ("sessions", 0),
            ("progress_snapshots", 0),
            ("migration_records", 0),
            ("legacy_enrollments", 2),
        ] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(count, expected, "table {table}");
        }

        // Legacy rows survive field-for-field.
        let ratios: Vec<f64> = sqlx::query_scalar(
            "SELECT completion_ratio FROM legacy_enrollments ORDER BY completion_ratio",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(ratios, vec![0.45, 0.8]);

        // Repeated rollback is a no-op.
        assert!(!rollback(&pool).await.unwrap());

        // After rollback, execute becomes possible again.
        let rerun = execute(&pool, now, Uuid::new_v4()).await.unwrap();
        assert_eq!(rerun.migrated, 2);
    }

    #[tokio::test]
    async fn conflicting_student_fails_without_blocking_others() {
        let pool = test_pool().await;
        let now = Utc.with_ymd_and_hms(2026, 2, 10, 9, 0, 0).unwrap();
        let (start, end) = autumn();
        let course = Uuid::new_v4();
        let teacher = Uuid::new_v4();
        let taken = Uuid::new_v4();
        let free = Uuid::new_v4();

        // `taken` is already claimed by a live cohort.
        let existing = cohorts::create_cohort(
            &pool,
            &CohortDefinition {
                name: "Existing".into(),
                academic_year: 2026,
                intake_term: IntakeTerm::September,
                semester: 1,
                start_date: start,
                end_date: end,
                created_by: Uuid::new_v4(),
            },
        )
        .await
        .unwrap();
        cohorts::add_members(&pool, existing, &[taken], now).await.unwrap();

        insert_legacy(&pool, taken, course, teacher, start, end, 0.6).await;
        insert_legacy(&pool, free, course, teacher, start, end, 0.9).await;

        let report = execute(&pool, now, Uuid::new_v4()).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.failed, 1);

        let failed: Vec<_> = report
            .records
            .iter()
            .filter(|r| r.status == MigrationStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap_or("").contains("already belongs"));
    }
}
