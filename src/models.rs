use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CohortStatus {
    Draft,
    Active,
    Completed,
    Archived,
}

impl CohortStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            other => Err(EngineError::Validation {
                field: "status".into(),
                message: format!("unknown cohort status '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntakeTerm {
    September,
    March,
}

impl IntakeTerm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::September => "september",
            Self::March => "march",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "september" => Ok(Self::September),
            "march" => Ok(Self::March),
            other => Err(EngineError::Validation {
                field: "intake_term".into(),
                message: format!("unknown intake term '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Cohort {
    pub id: Uuid,
    pub name: String,
    pub academic_year: i32,
    pub intake_term: IntakeTerm,
    pub semester: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: CohortStatus,
    pub created_by: Uuid,
}

/// Input for cohort creation; the store assigns the id and the draft status.
#[derive(Debug, Clone)]
pub struct CohortDefinition {
    pub name: String,
    pub academic_year: i32,
    pub intake_term: IntakeTerm,
    pub semester: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub cohort_id: Uuid,
    pub course_id: Uuid,
    pub teacher_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceOutcome {
    Unmarked,
    Attended,
    Absent,
    Excused,
}

impl AttendanceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmarked => "unmarked",
            Self::Attended => "attended",
            Self::Absent => "absent",
            Self::Excused => "excused",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "unmarked" => Ok(Self::Unmarked),
            "attended" => Ok(Self::Attended),
            "absent" => Ok(Self::Absent),
            "excused" => Ok(Self::Excused),
            other => Err(EngineError::Validation {
                field: "outcome".into(),
                message: format!("unknown attendance outcome '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub session_id: Uuid,
    pub student_id: Uuid,
    pub outcome: AttendanceOutcome,
    pub marked_by: Option<Uuid>,
    pub marked_at: Option<DateTime<Utc>>,
}

/// One prior state of an attendance record, appended on every overwrite.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceAuditEntry {
    pub session_id: Uuid,
    pub student_id: Uuid,
    pub prior_outcome: AttendanceOutcome,
    pub prior_marked_by: Option<Uuid>,
    pub prior_marked_at: Option<DateTime<Utc>>,
    pub changed_by: Uuid,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub student_id: Uuid,
    pub cohort_id: Uuid,
    pub completion_ratio: f64,
    pub attendance_ratio: f64,
    pub score: f64,
    pub recomputed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Admin,
    Staff,
    Teacher,
    Student,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Staff => "staff",
            Self::Teacher => "teacher",
            Self::Student => "student",
        }
    }

    pub fn parse(value: &str) -> Result<Self, EngineError> {
        match value {
            "admin" => Ok(Self::Admin),
            "staff" => Ok(Self::Staff),
            "teacher" => Ok(Self::Teacher),
            "student" => Ok(Self::Student),
            other => Err(EngineError::Validation {
                field: "role".into(),
                message: format!("unknown actor role '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Pending,
    Migrated,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Migrated => "migrated",
            Self::Failed => "failed",
        }
    }
}

/// A row of the legacy direct-enrollment model, fed to the migration tool.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyEnrollment {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub teacher_id: Uuid,
    pub term_start: NaiveDate,
    pub term_end: NaiveDate,
    pub completion_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub legacy_id: Uuid,
    pub cohort_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub status: MigrationStatus,
    pub error: Option<String>,
}
