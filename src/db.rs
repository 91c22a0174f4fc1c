//! Pool construction, schema bootstrap, and seed data.

use std::str::FromStr;

use chrono::{Duration, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{CohortDefinition, IntakeTerm};
use crate::{cohorts, sessions};

pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Decode a TEXT uuid column.
pub(crate) fn uuid_col(row: &SqliteRow, col: &str) -> Result<Uuid> {
    let value: String = row.try_get(col)?;
    Uuid::parse_str(&value).map_err(|e| {
        sqlx::Error::ColumnDecode {
            index: col.to_string(),
            source: Box::new(e),
        }
        .into()
    })
}

/// Decode a nullable TEXT uuid column.
pub(crate) fn opt_uuid_col(row: &SqliteRow, col: &str) -> Result<Option<Uuid>> {
    let value: Option<String> = row.try_get(col)?;
    match value {
        None => Ok(None),
        Some(v) => Uuid::parse_str(&v).map(Some).map_err(|e| {
            sqlx::Error::ColumnDecode {
                index: col.to_string(),
                source: Box::new(e),
            }
            .into()
        }),
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cohorts (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        academic_year INTEGER NOT NULL,
        intake_term TEXT NOT NULL,
        semester INTEGER NOT NULL,
        start_date TEXT NOT NULL,
        end_date TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'draft',
        created_by TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS cohort_members (
        cohort_id TEXT NOT NULL,
        student_id TEXT NOT NULL,
        added_at TEXT NOT NULL,
        PRIMARY KEY (cohort_id, student_id)
    )",
    // Derived student -> active cohort index; one claim row per student.
    "CREATE TABLE IF NOT EXISTS active_members (
        student_id TEXT PRIMARY KEY,
        cohort_id TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        cohort_id TEXT NOT NULL,
        course_id TEXT NOT NULL,
        teacher_id TEXT NOT NULL,
        starts_at TEXT NOT NULL,
        ends_at TEXT NOT NULL,
        location TEXT NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_teacher ON sessions (teacher_id)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_cohort ON sessions (cohort_id)",
    "CREATE TABLE IF NOT EXISTS attendance_records (
        session_id TEXT NOT NULL,
        student_id TEXT NOT NULL,
        outcome TEXT NOT NULL DEFAULT 'unmarked',
        marked_by TEXT,
        marked_at TEXT,
        PRIMARY KEY (session_id, student_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_attendance_marked_at ON attendance_records (marked_at)",
    "CREATE TABLE IF NOT EXISTS attendance_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        student_id TEXT NOT NULL,
        prior_outcome TEXT NOT NULL,
        prior_marked_by TEXT,
        prior_marked_at TEXT,
        changed_by TEXT NOT NULL,
        changed_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS progress_snapshots (
        student_id TEXT NOT NULL,
        cohort_id TEXT NOT NULL,
        completion_ratio REAL NOT NULL,
        attendance_ratio REAL NOT NULL,
        score REAL NOT NULL,
        recomputed_at TEXT NOT NULL,
        PRIMARY KEY (student_id, cohort_id)
    )",
    "CREATE TABLE IF NOT EXISTS actors (
        id TEXT PRIMARY KEY,
        full_name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE,
        role TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS course_completion (
        student_id TEXT NOT NULL,
        course_id TEXT NOT NULL,
        ratio REAL NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (student_id, course_id)
    )",
    "CREATE TABLE IF NOT EXISTS followup_notices (
        session_id TEXT NOT NULL,
        student_id TEXT NOT NULL,
        sent_at TEXT NOT NULL,
        PRIMARY KEY (session_id, student_id)
    )",
    "CREATE TABLE IF NOT EXISTS scheduler_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        last_run_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS legacy_enrollments (
        id TEXT PRIMARY KEY,
        student_id TEXT NOT NULL,
        course_id TEXT NOT NULL,
        teacher_id TEXT NOT NULL,
        term_start TEXT NOT NULL,
        term_end TEXT NOT NULL,
        completion_ratio REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS migration_records (
        legacy_id TEXT PRIMARY KEY,
        cohort_id TEXT,
        session_id TEXT,
        status TEXT NOT NULL,
        error TEXT,
        run_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS migration_backups (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    )",
];

pub async fn init_db(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    sqlx::query("INSERT OR IGNORE INTO scheduler_state (id, last_run_at) VALUES (1, NULL)")
        .execute(pool)
        .await?;
    info!("schema ready");
    Ok(())
}

const SEED_ADMIN: &str = "3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2";
const SEED_TEACHER: &str = "0c22f1f1-9184-4fd4-9b21-28c68a6a89dc";
const SEED_STUDENT_A: &str = "d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2";
const SEED_STUDENT_B: &str = "7e3f2b10-6a54-4f4e-9b8a-1d2c3e4f5a6b";
const SEED_COURSE: &str = "aa11bb22-cc33-4d44-8e55-ff6677889900";

pub async fn seed(pool: &SqlitePool) -> Result<()> {
    let actors = vec![
        (SEED_ADMIN, "Nadia Okafor", "nadia.okafor@example.edu", "admin"),
        (SEED_TEACHER, "Jules Moreno", "jules.moreno@example.edu", "teacher"),
        (SEED_STUDENT_A, "Avery Lee", "avery.lee@example.edu", "student"),
        (SEED_STUDENT_B, "Kiara Patel", "kiara.patel@example.edu", "student"),
    ];

    for (id, name, email, role) in actors {
        sqlx::query(
            "INSERT INTO actors (id, full_name, email, role)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (email) DO UPDATE
             SET full_name = excluded.full_name, role = excluded.role",
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .bind(role)
        .execute(pool)
        .await?;
    }

    let completions = vec![(SEED_STUDENT_A, 0.8_f64), (SEED_STUDENT_B, 0.45_f64)];
    for (student, ratio) in completions {
        sqlx::query(
            "INSERT INTO course_completion (student_id, course_id, ratio, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (student_id, course_id) DO UPDATE SET
             ratio = excluded.ratio, updated_at = excluded.updated_at",
        )
        .bind(student)
        .bind(SEED_COURSE)
        .bind(ratio)
        .bind(chrono::Utc::now())
        .execute(pool)
        .await?;
    }

    let legacy = vec![
        ("11111111-1111-4111-8111-111111111111", SEED_STUDENT_A, 0.8_f64),
        ("22222222-2222-4222-8222-222222222222", SEED_STUDENT_B, 0.45_f64),
    ];
    let term_start = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap_or_default();
    let term_end = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap_or_default();
    for (id, student, ratio) in legacy {
        sqlx::query(
            "INSERT OR IGNORE INTO legacy_enrollments
             (id, student_id, course_id, teacher_id, term_start, term_end, completion_ratio)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(student)
        .bind(SEED_COURSE)
        .bind(SEED_TEACHER)
        .bind(term_start)
        .bind(term_end)
        .bind(ratio)
        .execute(pool)
        .await?;
    }

    seed_demo_cohort(pool).await?;

    info!("seed data inserted");
    Ok(())
}

/// A small live cohort so mark/access/recompute have something to act on.
/// Skipped when it already exists, so seeding stays repeatable.
async fn seed_demo_cohort(pool: &SqlitePool) -> Result<()> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM cohorts WHERE name = 'Fullstack 2026')")
            .fetch_one(pool)
            .await?;
    if exists {
        return Ok(());
    }

    let admin = Uuid::from_str(SEED_ADMIN).unwrap_or_default();
    let teacher = Uuid::from_str(SEED_TEACHER).unwrap_or_default();
    let students = [
        Uuid::from_str(SEED_STUDENT_A).unwrap_or_default(),
        Uuid::from_str(SEED_STUDENT_B).unwrap_or_default(),
    ];
    let course = Uuid::from_str(SEED_COURSE).unwrap_or_default();
    let now = Utc::now();

    let cohort = cohorts::create_cohort(
        pool,
        &CohortDefinition {
            name: "Fullstack 2026".into(),
            academic_year: 2026,
            intake_term: IntakeTerm::September,
            semester: 1,
            start_date: NaiveDate::from_ymd_opt(2025, 9, 1).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap_or_default(),
            created_by: admin,
        },
    )
    .await?;
    cohorts::add_members(pool, cohort, &students, now).await?;
    sessions::create_session(
        pool,
        cohort,
        course,
        teacher,
        now - Duration::days(1),
        now - Duration::days(1) + Duration::hours(2),
        "room 101",
    )
    .await?;
    sessions::create_session(
        pool,
        cohort,
        course,
        teacher,
        now + Duration::days(6),
        now + Duration::days(6) + Duration::hours(2),
        "room 101",
    )
    .await?;
    cohorts::activate(pool, cohort).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory SQLite pool with the schema applied.
    pub async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("failed to create in-memory SQLite pool");
        init_db(&pool).await.expect("failed to apply schema");
        pool
    }
}
