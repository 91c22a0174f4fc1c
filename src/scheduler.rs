//! Attendance workflow scheduler.
//!
//! Each cycle materialises overdue `unmarked` records, flags them for staff
//! follow-up (a notification, never an auto-mark), and recomputes progress
//! for everyone whose attendance changed since the previous cycle. One
//! student's failure never aborts the batch; failures land in the report.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use sqlx::{Row, SqlitePool};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::attendance;
use crate::db::uuid_col;
use crate::error::Result;
use crate::progress;
use crate::sources::{CompletionSource, NotificationSink};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Wall-clock cadence of the recurring run.
    pub interval: Duration,
    /// How long after a session ends before unmarked records are flagged.
    pub grace: ChronoDuration,
    /// Upper bound on each completion-source read.
    pub completion_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            grace: ChronoDuration::hours(24),
            completion_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecomputeFailure {
    pub student_id: Uuid,
    pub cohort_id: Uuid,
    pub error: String,
}

/// Outcome of one scheduler cycle, for the operational report.
#[derive(Debug, Clone)]
pub struct SchedulerReport {
    pub ran_at: DateTime<Utc>,
    pub records_created: u64,
    pub followups_sent: usize,
    pub recomputed: usize,
    pub failures: Vec<RecomputeFailure>,
}

/// One reconciliation cycle. `now` is an argument so tests drive time
/// directly instead of sleeping.
pub async fn run_once(
    pool: &SqlitePool,
    completion: &dyn CompletionSource,
    notifier: &dyn NotificationSink,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Result<SchedulerReport> {
    let records_created = attendance::ensure_unmarked_records(pool, now).await?;

    // Flag overdue unmarked records for the session's teacher, once each.
    let cutoff = now - config.grace;
    let overdue = sqlx::query(
        "SELECT ar.session_id, ar.student_id, s.teacher_id
         FROM attendance_records ar
         JOIN sessions s ON s.id = ar.session_id
         LEFT JOIN followup_notices n
           ON n.session_id = ar.session_id AND n.student_id = ar.student_id
         WHERE ar.outcome = 'unmarked' AND s.ends_at <= ? AND n.session_id IS NULL",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let mut followups_sent = 0;
    for row in &overdue {
        let session_id = uuid_col(row, "session_id")?;
        let student_id = uuid_col(row, "student_id")?;
        let teacher_id = uuid_col(row, "teacher_id")?;

        notifier
            .notify(
                teacher_id,
                "attendance.followup",
                json!({
                    "session_id": session_id,
                    "student_id": student_id,
                }),
            )
            .await;

        sqlx::query(
            "INSERT OR IGNORE INTO followup_notices (session_id, student_id, sent_at)
             VALUES (?, ?, ?)",
        )
        .bind(session_id.to_string())
        .bind(student_id.to_string())
        .bind(now)
        .execute(pool)
        .await?;
        followups_sent += 1;
    }

    // Recompute progress for every key touched since the previous run. The
    // watermark advances to the newest marked_at this cycle actually saw,
    // never to `now`: a mark that commits after the read below with an
    // earlier caller-side timestamp still lands above the watermark and is
    // picked up next cycle.
    let last_run: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT last_run_at FROM scheduler_state WHERE id = 1")
            .fetch_one(pool)
            .await?;
    let touched = sqlx::query(
        "SELECT ar.student_id, s.cohort_id, MAX(ar.marked_at) AS marked_at
         FROM attendance_records ar
         JOIN sessions s ON s.id = ar.session_id
         WHERE ar.marked_at IS NOT NULL AND (? IS NULL OR ar.marked_at > ?)
         GROUP BY ar.student_id, s.cohort_id",
    )
    .bind(last_run)
    .bind(last_run)
    .fetch_all(pool)
    .await?;

    let mut recomputed = 0;
    let mut failures = Vec::new();
    let mut watermark: Option<DateTime<Utc>> = None;
    for row in &touched {
        let student_id = uuid_col(row, "student_id")?;
        let cohort_id = uuid_col(row, "cohort_id")?;
        let marked_at: DateTime<Utc> = row.get("marked_at");
        watermark = Some(watermark.map_or(marked_at, |w| w.max(marked_at)));
        match progress::recompute(
            pool,
            completion,
            config.completion_timeout,
            student_id,
            cohort_id,
            now,
        )
        .await
        {
            Ok(_) => recomputed += 1,
            Err(err) => {
                warn!(%student_id, %cohort_id, error = %err, "recompute failed");
                failures.push(RecomputeFailure {
                    student_id,
                    cohort_id,
                    error: format!("{}: {err}", err.kind()),
                });
            }
        }
    }

    if let Some(watermark) = watermark {
        sqlx::query("UPDATE scheduler_state SET last_run_at = ? WHERE id = 1")
            .bind(watermark)
            .execute(pool)
            .await?;
    }

    Ok(SchedulerReport {
        ran_at: now,
        records_created,
        followups_sent,
        recomputed,
        failures,
    })
}

/// Recurring loop; runs until the token is cancelled.
pub async fn run(
    pool: &SqlitePool,
    completion: &dyn CompletionSource,
    notifier: &dyn NotificationSink,
    config: &SchedulerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("scheduler received shutdown signal");
                break;
            }

            _ = ticker.tick() => {
                match run_once(pool, completion, notifier, config, Utc::now()).await {
                    Ok(report) => info!(
                        records_created = report.records_created,
                        followups_sent = report.followups_sent,
                        recomputed = report.recomputed,
                        failures = report.failures.len(),
                        "scheduler cycle complete"
                    ),
                    Err(err) => warn!(error = %err, "scheduler cycle failed"),
                }
            }
        }
    }
    Ok(())
}
