//! Ports to the external collaborators: course-progress source, identity
//! source, and notification sink. Production adapters read the local sync
//! tables; tests substitute in-memory stubs.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::ActorRole;

/// Course-progress collaborator: completion ratio per (student, course).
#[async_trait]
pub trait CompletionSource: Send + Sync {
    async fn completion_ratio(&self, student_id: Uuid, course_id: Uuid) -> Result<f64>;
}

/// Identity collaborator: resolves an actor id to a role.
#[async_trait]
pub trait RoleSource: Send + Sync {
    async fn role_of(&self, actor_id: Uuid) -> Result<ActorRole>;
}

/// Notification collaborator, fire-and-forget.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, recipient_id: Uuid, event_kind: &str, payload: serde_json::Value);
}

/// Reads completion ratios from the `course_completion` sync table.
pub struct DbCompletionSource {
    pool: SqlitePool,
}

impl DbCompletionSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CompletionSource for DbCompletionSource {
    async fn completion_ratio(&self, student_id: Uuid, course_id: Uuid) -> Result<f64> {
        let row = sqlx::query(
            "SELECT ratio FROM course_completion WHERE student_id = ? AND course_id = ?",
        )
        .bind(student_id.to_string())
        .bind(course_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        // A student with no recorded progress has completed nothing.
        Ok(row.map(|r| r.get::<f64, _>("ratio")).unwrap_or(0.0))
    }
}

/// Resolves roles from the `actors` table.
pub struct DbRoleSource {
    pool: SqlitePool,
}

impl DbRoleSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoleSource for DbRoleSource {
    async fn role_of(&self, actor_id: Uuid) -> Result<ActorRole> {
        let row = sqlx::query("SELECT role FROM actors WHERE id = ?")
            .bind(actor_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("actor {actor_id}")))?;
        let role: String = row.get("role");
        ActorRole::parse(&role)
    }
}

/// Logs notifications instead of delivering them; stands in for the real
/// delivery service when running from the CLI.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, recipient_id: Uuid, event_kind: &str, payload: serde_json::Value) {
        info!(%recipient_id, event_kind, %payload, "notification");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Fixed completion ratios keyed by (student, course).
    pub struct StubCompletion(pub HashMap<(Uuid, Uuid), f64>);

    #[async_trait]
    impl CompletionSource for StubCompletion {
        async fn completion_ratio(&self, student_id: Uuid, course_id: Uuid) -> Result<f64> {
            Ok(*self.0.get(&(student_id, course_id)).unwrap_or(&0.0))
        }
    }

    /// Always fails, for fail-closed recompute tests.
    pub struct FailingCompletion;

    #[async_trait]
    impl CompletionSource for FailingCompletion {
        async fn completion_ratio(&self, _student_id: Uuid, _course_id: Uuid) -> Result<f64> {
            Err(EngineError::External("completion source unavailable".into()))
        }
    }

    /// Fixed actor -> role map.
    pub struct StubRoles(pub HashMap<Uuid, ActorRole>);

    #[async_trait]
    impl RoleSource for StubRoles {
        async fn role_of(&self, actor_id: Uuid) -> Result<ActorRole> {
            self.0
                .get(&actor_id)
                .copied()
                .ok_or_else(|| EngineError::NotFound(format!("actor {actor_id}")))
        }
    }

    /// Collects notifications for assertions.
    #[derive(Default)]
    pub struct CollectingNotifier(pub Mutex<Vec<(Uuid, String, serde_json::Value)>>);

    #[async_trait]
    impl NotificationSink for CollectingNotifier {
        async fn notify(&self, recipient_id: Uuid, event_kind: &str, payload: serde_json::Value) {
            self.0
                .lock()
                .expect("notifier mutex poisoned")
                .push((recipient_id, event_kind.to_string(), payload));
        }
    }
}
