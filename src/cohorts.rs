//! Cohort store: cohort lifecycle and membership.
//!
//! Membership writes go through a per-student claim row in `active_members`,
//! the derived student -> cohort index. The claim is a single
//! `INSERT ... ON CONFLICT DO NOTHING`, so two admins racing to assign the
//! same student cannot both win.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::db::uuid_col;
use crate::error::{EngineError, Result};
use crate::models::{Cohort, CohortDefinition, CohortStatus, IntakeTerm};

pub async fn create_cohort(pool: &SqlitePool, def: &CohortDefinition) -> Result<Uuid> {
    if def.name.trim().is_empty() {
        return Err(EngineError::Validation {
            field: "name".into(),
            message: "cohort name must not be empty".into(),
        });
    }
    if !(2000..=2100).contains(&def.academic_year) {
        return Err(EngineError::Validation {
            field: "academic_year".into(),
            message: format!("academic year {} is not plausible", def.academic_year),
        });
    }
    if !(1..=10).contains(&def.semester) {
        return Err(EngineError::Validation {
            field: "semester".into(),
            message: format!("semester {} outside 1..=10", def.semester),
        });
    }
    if def.end_date <= def.start_date {
        return Err(EngineError::Validation {
            field: "end_date".into(),
            message: format!("end date {} not after start date {}", def.end_date, def.start_date),
        });
    }

    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO cohorts
         (id, name, academic_year, intake_term, semester, start_date, end_date, status, created_by)
         VALUES (?, ?, ?, ?, ?, ?, ?, 'draft', ?)",
    )
    .bind(id.to_string())
    .bind(&def.name)
    .bind(def.academic_year)
    .bind(def.intake_term.as_str())
    .bind(def.semester)
    .bind(def.start_date)
    .bind(def.end_date)
    .bind(def.created_by.to_string())
    .execute(pool)
    .await?;

    info!(cohort_id = %id, name = %def.name, "cohort created");
    Ok(id)
}

pub async fn get_cohort(pool: &SqlitePool, cohort_id: Uuid) -> Result<Cohort> {
    let row = sqlx::query("SELECT * FROM cohorts WHERE id = ?")
        .bind(cohort_id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("cohort {cohort_id}")))?;

    let status: String = row.get("status");
    let intake: String = row.get("intake_term");
    Ok(Cohort {
        id: uuid_col(&row, "id")?,
        name: row.get("name"),
        academic_year: row.get("academic_year"),
        intake_term: IntakeTerm::parse(&intake)?,
        semester: row.get("semester"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        status: CohortStatus::parse(&status)?,
        created_by: uuid_col(&row, "created_by")?,
    })
}

/// Add students to a cohort. Claims are taken one student at a time, so a
/// failure part-way leaves earlier students assigned; the call is safe to
/// retry with the same list.
///
/// The claim is taken at membership time, for draft cohorts too: assigning a
/// student to next term's draft reserves their seat and blocks any competing
/// assignment until they are removed or the claiming cohort completes.
pub async fn add_members(
    pool: &SqlitePool,
    cohort_id: Uuid,
    student_ids: &[Uuid],
    now: DateTime<Utc>,
) -> Result<()> {
    let cohort = get_cohort(pool, cohort_id).await?;
    match cohort.status {
        CohortStatus::Draft | CohortStatus::Active => {}
        other => {
            return Err(EngineError::Precondition(format!(
                "cohort {cohort_id} is {}, members can no longer be added",
                other.as_str()
            )))
        }
    }

    for &student_id in student_ids {
        let mut tx = pool.begin().await?;

        let claimed = sqlx::query(
            "INSERT INTO active_members (student_id, cohort_id)
             VALUES (?, ?)
             ON CONFLICT (student_id) DO NOTHING",
        )
        .bind(student_id.to_string())
        .bind(cohort_id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            let owner: String =
                sqlx::query_scalar("SELECT cohort_id FROM active_members WHERE student_id = ?")
                    .bind(student_id.to_string())
                    .fetch_one(&mut *tx)
                    .await?;
            if owner != cohort_id.to_string() {
                return Err(EngineError::Conflict(format!(
                    "student {student_id} already belongs to cohort {owner}"
                )));
            }
        }

        sqlx::query(
            "INSERT OR IGNORE INTO cohort_members (cohort_id, student_id, added_at)
             VALUES (?, ?, ?)",
        )
        .bind(cohort_id.to_string())
        .bind(student_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    Ok(())
}

/// Remove a student and release their claim in one transaction, so access
/// checks see the revocation as soon as it commits.
pub async fn remove_member(pool: &SqlitePool, cohort_id: Uuid, student_id: Uuid) -> Result<()> {
    let mut tx = pool.begin().await?;

    let removed = sqlx::query("DELETE FROM cohort_members WHERE cohort_id = ? AND student_id = ?")
        .bind(cohort_id.to_string())
        .bind(student_id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if removed == 0 {
        return Err(EngineError::NotFound(format!(
            "student {student_id} is not a member of cohort {cohort_id}"
        )));
    }

    sqlx::query("DELETE FROM active_members WHERE student_id = ? AND cohort_id = ?")
        .bind(student_id.to_string())
        .bind(cohort_id.to_string())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn activate(pool: &SqlitePool, cohort_id: Uuid) -> Result<()> {
    let cohort = get_cohort(pool, cohort_id).await?;
    match cohort.status {
        CohortStatus::Active => return Ok(()),
        CohortStatus::Draft => {}
        other => {
            return Err(EngineError::Precondition(format!(
                "cohort {cohort_id} is {}, cannot activate",
                other.as_str()
            )))
        }
    }

    let has_sessions: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM sessions WHERE cohort_id = ?)")
            .bind(cohort_id.to_string())
            .fetch_one(pool)
            .await?;
    if !has_sessions {
        return Err(EngineError::Precondition(format!(
            "cohort {cohort_id} has no linked sessions"
        )));
    }

    sqlx::query("UPDATE cohorts SET status = 'active' WHERE id = ?")
        .bind(cohort_id.to_string())
        .execute(pool)
        .await?;
    info!(%cohort_id, "cohort activated");
    Ok(())
}

pub async fn complete(pool: &SqlitePool, cohort_id: Uuid) -> Result<()> {
    let cohort = get_cohort(pool, cohort_id).await?;
    match cohort.status {
        CohortStatus::Completed => return Ok(()),
        CohortStatus::Active => {}
        other => {
            return Err(EngineError::Precondition(format!(
                "cohort {cohort_id} is {}, cannot complete",
                other.as_str()
            )))
        }
    }
    transition_and_release(pool, cohort_id, CohortStatus::Completed).await
}

/// Terminal and idempotent. Progress history stays queryable afterwards.
pub async fn archive(pool: &SqlitePool, cohort_id: Uuid) -> Result<()> {
    let cohort = get_cohort(pool, cohort_id).await?;
    if cohort.status == CohortStatus::Archived {
        return Ok(());
    }
    transition_and_release(pool, cohort_id, CohortStatus::Archived).await
}

async fn transition_and_release(
    pool: &SqlitePool,
    cohort_id: Uuid,
    status: CohortStatus,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE cohorts SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(cohort_id.to_string())
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM active_members WHERE cohort_id = ?")
        .bind(cohort_id.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!(%cohort_id, status = status.as_str(), "cohort transitioned");
    Ok(())
}

/// Members in insertion order.
pub async fn list_members(pool: &SqlitePool, cohort_id: Uuid) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        "SELECT student_id FROM cohort_members WHERE cohort_id = ? ORDER BY added_at, student_id",
    )
    .bind(cohort_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut members = Vec::with_capacity(rows.len());
    for row in rows {
        members.push(uuid_col(&row, "student_id")?);
    }
    Ok(members)
}

/// The cohort currently claiming this student, if any.
pub async fn claimed_cohort_of(pool: &SqlitePool, student_id: Uuid) -> Result<Option<Uuid>> {
    let row = sqlx::query("SELECT cohort_id FROM active_members WHERE student_id = ?")
        .bind(student_id.to_string())
        .fetch_optional(pool)
        .await?;
    match row {
        None => Ok(None),
        Some(r) => uuid_col(&r, "cohort_id").map(Some),
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::db::testing::test_pool;

    fn sample_definition() -> CohortDefinition {
        CohortDefinition {
            name: "Web Dev 2026".into(),
            academic_year: 2026,
            intake_term: IntakeTerm::September,
            semester: 1,
            start_date: NaiveDate::from_ymd_opt(2025, 9, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
            created_by: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn rejects_inverted_date_window() {
        let pool = test_pool().await;
        let mut def = sample_definition();
        def.end_date = def.start_date;
        let err = create_cohort(&pool, &def).await.unwrap_err();
        assert_eq!(err.kind(), "VALIDATION");
    }

    #[tokio::test]
    async fn rejects_semester_out_of_range() {
        let pool = test_pool().await;
        let mut def = sample_definition();
        def.semester = 11;
        let err = create_cohort(&pool, &def).await.unwrap_err();
        assert_eq!(err.kind(), "VALIDATION");
    }

    #[tokio::test]
    async fn rejects_implausible_academic_year() {
        let pool = test_pool().await;
        let mut def = sample_definition();
        def.academic_year = 1926;
        let err = create_cohort(&pool, &def).await.unwrap_err();
        assert_eq!(err.kind(), "VALIDATION");
    }

    #[tokio::test]
    async fn student_cannot_join_two_cohorts() {
        let pool = test_pool().await;
        let now = Utc::now();
        let first = create_cohort(&pool, &sample_definition()).await.unwrap();
        let second = create_cohort(&pool, &sample_definition()).await.unwrap();
        let student = Uuid::new_v4();

        add_members(&pool, first, &[student], now).await.unwrap();
        let err = add_members(&pool, second, &[student], now).await.unwrap_err();
        assert_eq!(err.kind(), "CONFLICT");

        assert_eq!(claimed_cohort_of(&pool, student).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn re_adding_to_same_cohort_is_a_noop() {
        let pool = test_pool().await;
        let now = Utc::now();
        let cohort = create_cohort(&pool, &sample_definition()).await.unwrap();
        let student = Uuid::new_v4();

        add_members(&pool, cohort, &[student], now).await.unwrap();
        add_members(&pool, cohort, &[student], now).await.unwrap();
        assert_eq!(list_members(&pool, cohort).await.unwrap(), vec![student]);
    }

    #[tokio::test]
    async fn activation_requires_linked_sessions() {
        let pool = test_pool().await;
        let cohort = create_cohort(&pool, &sample_definition()).await.unwrap();

        let err = activate(&pool, cohort).await.unwrap_err();
        assert_eq!(err.kind(), "PRECONDITION");

        sqlx::query(
            "INSERT INTO sessions (id, cohort_id, course_id, teacher_id, starts_at, ends_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(cohort.to_string())
        .bind(Uuid::new_v4().to_string())
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now())
        .bind(Utc::now() + chrono::Duration::hours(2))
        .execute(&pool)
        .await
        .unwrap();

        activate(&pool, cohort).await.unwrap();
        // Idempotent once active.
        activate(&pool, cohort).await.unwrap();
        let cohort = get_cohort(&pool, cohort).await.unwrap();
        assert_eq!(cohort.status, CohortStatus::Active);
    }

    #[tokio::test]
    async fn archive_releases_claims_and_is_terminal() {
        let pool = test_pool().await;
        let now = Utc::now();
        let first = create_cohort(&pool, &sample_definition()).await.unwrap();
        let second = create_cohort(&pool, &sample_definition()).await.unwrap();
        let student = Uuid::new_v4();

        add_members(&pool, first, &[student], now).await.unwrap();
        archive(&pool, first).await.unwrap();
        archive(&pool, first).await.unwrap();

        // Claim released, the student can be reassigned.
        add_members(&pool, second, &[student], now).await.unwrap();
        assert_eq!(claimed_cohort_of(&pool, student).await.unwrap(), Some(second));

        let err = activate(&pool, first).await.unwrap_err();
        assert_eq!(err.kind(), "PRECONDITION");
    }

    #[tokio::test]
    async fn completion_follows_activation_and_releases_claims() {
        let pool = test_pool().await;
        let now = Utc::now();
        let cohort = create_cohort(&pool, &sample_definition()).await.unwrap();
        let student = Uuid::new_v4();
        add_members(&pool, cohort, &[student], now).await.unwrap();

        // Draft cohorts cannot complete.
        let err = complete(&pool, cohort).await.unwrap_err();
        assert_eq!(err.kind(), "PRECONDITION");

        sqlx::query(
            "INSERT INTO sessions (id, cohort_id, course_id, teacher_id, starts_at, ends_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(cohort.to_string())
        .bind(Uuid::new_v4().to_string())
        .bind(Uuid::new_v4().to_string())
        .bind(now)
        .bind(now + chrono::Duration::hours(2))
        .execute(&pool)
        .await
        .unwrap();
        activate(&pool, cohort).await.unwrap();

        complete(&pool, cohort).await.unwrap();
        complete(&pool, cohort).await.unwrap();
        assert_eq!(claimed_cohort_of(&pool, student).await.unwrap(), None);
        // Membership history survives for reporting.
        assert_eq!(list_members(&pool, cohort).await.unwrap(), vec![student]);
    }

    #[tokio::test]
    async fn removal_releases_the_claim() {
        let pool = test_pool().await;
        let now = Utc::now();
        let cohort = create_cohort(&pool, &sample_definition()).await.unwrap();
        let student = Uuid::new_v4();

        add_members(&pool, cohort, &[student], now).await.unwrap();
        remove_member(&pool, cohort, student).await.unwrap();
        assert_eq!(claimed_cohort_of(&pool, student).await.unwrap(), None);

        let err = remove_member(&pool, cohort, student).await.unwrap_err();
        assert_eq!(err.kind(), "NOT_FOUND");
    }
}
