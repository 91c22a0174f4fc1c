//! Attendance tracker: one record per (student, session), overwritable by an
//! authorized actor, with every prior state kept in an append-only audit
//! table. Records are never deleted.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::db::{opt_uuid_col, uuid_col};
use crate::error::{EngineError, Result};
use crate::models::{ActorRole, AttendanceAuditEntry, AttendanceOutcome, AttendanceRecord};
use crate::sessions;
use crate::sources::RoleSource;

/// Record or correct an attendance outcome.
///
/// Only the session's teacher or an admin may mark; the student must belong
/// to the session's cohort. Overwrites are always permitted (clerical fixes),
/// but the prior value and actor land in the audit trail first, inside the
/// same transaction.
pub async fn mark(
    pool: &SqlitePool,
    roles: &dyn RoleSource,
    session_id: Uuid,
    student_id: Uuid,
    outcome: AttendanceOutcome,
    actor_id: Uuid,
    now: DateTime<Utc>,
) -> Result<()> {
    if outcome == AttendanceOutcome::Unmarked {
        return Err(EngineError::Validation {
            field: "outcome".into(),
            message: "cannot mark a record back to unmarked".into(),
        });
    }

    let session = sessions::get_session(pool, session_id).await?;

    if actor_id != session.teacher_id {
        match roles.role_of(actor_id).await {
            Ok(ActorRole::Admin) => {}
            Ok(role) => {
                return Err(EngineError::Authorization(format!(
                    "actor {actor_id} is {} and not the session's teacher",
                    role.as_str()
                )))
            }
            Err(EngineError::NotFound(_)) => {
                return Err(EngineError::Authorization(format!(
                    "actor {actor_id} is unknown to the identity source"
                )))
            }
            Err(err) => return Err(err),
        }
    }

    let is_member: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM cohort_members WHERE cohort_id = ? AND student_id = ?)",
    )
    .bind(session.cohort_id.to_string())
    .bind(student_id.to_string())
    .fetch_one(pool)
    .await?;
    if !is_member {
        return Err(EngineError::NotFound(format!(
            "student {student_id} is not a member of cohort {}",
            session.cohort_id
        )));
    }

    let mut tx = pool.begin().await?;

    let prior = sqlx::query(
        "SELECT outcome, marked_by, marked_at FROM attendance_records
         WHERE session_id = ? AND student_id = ?",
    )
    .bind(session_id.to_string())
    .bind(student_id.to_string())
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(prior) = prior {
        let prior_outcome: String = prior.get("outcome");
        let prior_marked_by: Option<String> = prior.get("marked_by");
        let prior_marked_at: Option<DateTime<Utc>> = prior.get("marked_at");
        sqlx::query(
            "INSERT INTO attendance_audit
             (session_id, student_id, prior_outcome, prior_marked_by, prior_marked_at,
              changed_by, changed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id.to_string())
        .bind(student_id.to_string())
        .bind(prior_outcome)
        .bind(prior_marked_by)
        .bind(prior_marked_at)
        .bind(actor_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        "INSERT INTO attendance_records (session_id, student_id, outcome, marked_by, marked_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (session_id, student_id) DO UPDATE SET
         outcome = excluded.outcome,
         marked_by = excluded.marked_by,
         marked_at = excluded.marked_at",
    )
    .bind(session_id.to_string())
    .bind(student_id.to_string())
    .bind(outcome.as_str())
    .bind(actor_id.to_string())
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    info!(%session_id, %student_id, outcome = outcome.as_str(), "attendance marked");
    Ok(())
}

pub async fn get_record(
    pool: &SqlitePool,
    session_id: Uuid,
    student_id: Uuid,
) -> Result<AttendanceRecord> {
    let row = sqlx::query(
        "SELECT * FROM attendance_records WHERE session_id = ? AND student_id = ?",
    )
    .bind(session_id.to_string())
    .bind(student_id.to_string())
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| {
        EngineError::NotFound(format!(
            "attendance record for student {student_id} in session {session_id}"
        ))
    })?;

    let outcome: String = row.get("outcome");
    Ok(AttendanceRecord {
        session_id: uuid_col(&row, "session_id")?,
        student_id: uuid_col(&row, "student_id")?,
        outcome: AttendanceOutcome::parse(&outcome)?,
        marked_by: opt_uuid_col(&row, "marked_by")?,
        marked_at: row.get("marked_at"),
    })
}

/// Prior states of a record, oldest first.
pub async fn audit_trail(
    pool: &SqlitePool,
    session_id: Uuid,
    student_id: Uuid,
) -> Result<Vec<AttendanceAuditEntry>> {
    let rows = sqlx::query(
        "SELECT * FROM attendance_audit
         WHERE session_id = ? AND student_id = ? ORDER BY id",
    )
    .bind(session_id.to_string())
    .bind(student_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let prior_outcome: String = row.get("prior_outcome");
        entries.push(AttendanceAuditEntry {
            session_id: uuid_col(&row, "session_id")?,
            student_id: uuid_col(&row, "student_id")?,
            prior_outcome: AttendanceOutcome::parse(&prior_outcome)?,
            prior_marked_by: opt_uuid_col(&row, "prior_marked_by")?,
            prior_marked_at: row.get("prior_marked_at"),
            changed_by: uuid_col(&row, "changed_by")?,
            changed_at: row.get("changed_at"),
        });
    }
    Ok(entries)
}

/// Materialise the default `unmarked` record for every (member, session)
/// pair whose session has started. Idempotent.
pub async fn ensure_unmarked_records(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64> {
    let created = sqlx::query(
        "INSERT OR IGNORE INTO attendance_records (session_id, student_id, outcome)
         SELECT s.id, m.student_id, 'unmarked'
         FROM sessions s
         JOIN cohort_members m ON m.cohort_id = s.cohort_id
         WHERE s.starts_at <= ?",
    )
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(created)
}

/// attended / sessions-already-started, for one student in one cohort.
/// Sessions that have not started yet are excluded from the denominator so
/// students are never penalised for unheld sessions; 0.0 when nothing has
/// started.
pub async fn attendance_ratio(
    pool: &SqlitePool,
    student_id: Uuid,
    cohort_id: Uuid,
    now: DateTime<Utc>,
) -> Result<f64> {
    let past_sessions: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE cohort_id = ? AND starts_at <= ?")
            .bind(cohort_id.to_string())
            .bind(now)
            .fetch_one(pool)
            .await?;
    if past_sessions == 0 {
        return Ok(0.0);
    }

    let attended: i64 = sqlx::query_scalar(
        "SELECT COUNT(*)
         FROM attendance_records ar
         JOIN sessions s ON s.id = ar.session_id
         WHERE ar.student_id = ? AND s.cohort_id = ? AND s.starts_at <= ?
           AND ar.outcome = 'attended'",
    )
    .bind(student_id.to_string())
    .bind(cohort_id.to_string())
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(attended as f64 / past_sessions as f64)
}
