//! Session linkage: scheduled sessions tie one cohort to one course and one
//! teacher, and are the sole gate for course-content access.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::cohorts;
use crate::db::uuid_col;
use crate::error::{EngineError, Result};
use crate::models::{CohortStatus, Session};

fn validate_window(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Result<()> {
    if ends_at <= starts_at {
        return Err(EngineError::Validation {
            field: "ends_at".into(),
            message: format!("session end {ends_at} not after start {starts_at}"),
        });
    }
    Ok(())
}

/// SQLite reports a lost write race as a busy/locked error; the caller-facing
/// answer in that case is a re-run of the overlap check, not a driver error.
fn is_busy(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.message().contains("locked") || db.message().contains("busy")
    )
}

async fn check_teacher_free(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    teacher_id: Uuid,
    exclude_session: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) -> Result<()> {
    let double_booked: bool = sqlx::query_scalar(
        "SELECT EXISTS(
            SELECT 1 FROM sessions
            WHERE teacher_id = ? AND id != ? AND starts_at < ? AND ends_at > ?
        )",
    )
    .bind(teacher_id.to_string())
    .bind(exclude_session.to_string())
    .bind(ends_at)
    .bind(starts_at)
    .fetch_one(&mut **tx)
    .await?;
    if double_booked {
        return Err(EngineError::Conflict(format!(
            "teacher {teacher_id} already has a session overlapping {starts_at}..{ends_at}"
        )));
    }
    Ok(())
}

async fn insert_session_checked(pool: &SqlitePool, session: &Session) -> Result<()> {
    let mut tx = pool.begin().await?;
    check_teacher_free(
        &mut tx,
        session.teacher_id,
        session.id,
        session.starts_at,
        session.ends_at,
    )
    .await?;
    sqlx::query(
        "INSERT INTO sessions (id, cohort_id, course_id, teacher_id, starts_at, ends_at, location)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(session.id.to_string())
    .bind(session.cohort_id.to_string())
    .bind(session.course_id.to_string())
    .bind(session.teacher_id.to_string())
    .bind(session.starts_at)
    .bind(session.ends_at)
    .bind(&session.location)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn create_session(
    pool: &SqlitePool,
    cohort_id: Uuid,
    course_id: Uuid,
    teacher_id: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    location: &str,
) -> Result<Uuid> {
    validate_window(starts_at, ends_at)?;

    let cohort = cohorts::get_cohort(pool, cohort_id).await?;
    match cohort.status {
        CohortStatus::Draft | CohortStatus::Active => {}
        other => {
            return Err(EngineError::Precondition(format!(
                "cohort {cohort_id} is {}, its calendar is closed",
                other.as_str()
            )))
        }
    }

    // Teachers can serve many cohorts, but not two sessions at once.
    let session = Session {
        id: Uuid::new_v4(),
        cohort_id,
        course_id,
        teacher_id,
        starts_at,
        ends_at,
        location: location.to_string(),
    };
    match insert_session_checked(pool, &session).await {
        Err(EngineError::Database(err)) if is_busy(&err) => {
            insert_session_checked(pool, &session).await?;
        }
        other => other?,
    }
    info!(session_id = %session.id, %cohort_id, %course_id, "session created");
    Ok(session.id)
}

/// Sessions are mutable only until their original start time passes; after
/// that the record is append-only (attendance keeps accruing against it).
pub async fn reschedule_session(
    pool: &SqlitePool,
    session_id: Uuid,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<()> {
    validate_window(starts_at, ends_at)?;
    let session = get_session(pool, session_id).await?;
    if session.starts_at <= now {
        return Err(EngineError::Precondition(format!(
            "session {session_id} already started, it can no longer be rescheduled"
        )));
    }

    match move_session_checked(pool, &session, starts_at, ends_at).await {
        Err(EngineError::Database(err)) if is_busy(&err) => {
            move_session_checked(pool, &session, starts_at, ends_at).await
        }
        other => other,
    }
}

async fn move_session_checked(
    pool: &SqlitePool,
    session: &Session,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    check_teacher_free(&mut tx, session.teacher_id, session.id, starts_at, ends_at).await?;
    sqlx::query("UPDATE sessions SET starts_at = ?, ends_at = ? WHERE id = ?")
        .bind(starts_at)
        .bind(ends_at)
        .bind(session.id.to_string())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    Ok(Session {
        id: uuid_col(row, "id")?,
        cohort_id: uuid_col(row, "cohort_id")?,
        course_id: uuid_col(row, "course_id")?,
        teacher_id: uuid_col(row, "teacher_id")?,
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
        location: row.get("location"),
    })
}

pub async fn get_session(pool: &SqlitePool, session_id: Uuid) -> Result<Session> {
    let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
        .bind(session_id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))?;
    session_from_row(&row)
}

pub async fn sessions_for_cohort(pool: &SqlitePool, cohort_id: Uuid) -> Result<Vec<Session>> {
    let rows = sqlx::query("SELECT * FROM sessions WHERE cohort_id = ? ORDER BY starts_at")
        .bind(cohort_id.to_string())
        .fetch_all(pool)
        .await?;
    rows.iter().map(session_from_row).collect()
}

/// Distinct courses a cohort's calendar delivers.
pub async fn courses_for_cohort(pool: &SqlitePool, cohort_id: Uuid) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        "SELECT DISTINCT course_id FROM sessions WHERE cohort_id = ? ORDER BY course_id",
    )
    .bind(cohort_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(|row| uuid_col(row, "course_id")).collect()
}

/// The single source of truth for content access: true iff the student's
/// active cohort has a session delivering the course. Evaluated fresh on
/// every call, no cache to invalidate.
pub async fn course_access_for(
    pool: &SqlitePool,
    student_id: Uuid,
    course_id: Uuid,
) -> Result<bool> {
    let allowed: bool = sqlx::query_scalar(
        "SELECT EXISTS(
            SELECT 1
            FROM active_members am
            JOIN cohorts c ON c.id = am.cohort_id AND c.status = 'active'
            JOIN sessions s ON s.cohort_id = am.cohort_id
            WHERE am.student_id = ? AND s.course_id = ?
        )",
    )
    .bind(student_id.to_string())
    .bind(course_id.to_string())
    .fetch_one(pool)
    .await?;
    Ok(allowed)
}
