//! Markdown reports for the operational entry points.

use std::fmt::Write;

use crate::migration::{MigrationPlan, MigrationReport};
use crate::models::MigrationStatus;
use crate::scheduler::SchedulerReport;

pub fn build_plan_report(plan: &MigrationPlan) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Legacy Migration Plan (dry run)");
    let _ = writeln!(
        output,
        "{} legacy enrollments grouped into {} candidate cohorts.",
        plan.total_enrollments,
        plan.candidates.len()
    );
    let _ = writeln!(output);

    if plan.candidates.is_empty() {
        let _ = writeln!(output, "No legacy enrollments to migrate.");
        return output;
    }

    for candidate in &plan.candidates {
        let _ = writeln!(output, "## {}", candidate.display_name());
        let _ = writeln!(
            output,
            "- term: {} to {}",
            candidate.term_start, candidate.term_end
        );
        let _ = writeln!(output, "- students: {}", candidate.students.len());
        let _ = writeln!(
            output,
            "- sessions to synthesize: {} (one per course)",
            candidate.courses.len()
        );
        let _ = writeln!(output, "- enrollments: {}", candidate.enrollments.len());
        let _ = writeln!(output);
    }

    let _ = writeln!(
        output,
        "The grouping above is heuristic; review it before running execute."
    );
    output
}

pub fn build_migration_report(report: &MigrationReport) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Legacy Migration Result");
    let _ = writeln!(output, "- cohorts created: {}", report.cohorts_created);
    let _ = writeln!(output, "- enrollments migrated: {}", report.migrated);
    let _ = writeln!(output, "- enrollments failed: {}", report.failed);
    let _ = writeln!(output);

    let failures: Vec<_> = report
        .records
        .iter()
        .filter(|r| r.status == MigrationStatus::Failed)
        .collect();
    if failures.is_empty() {
        let _ = writeln!(output, "No failed records.");
    } else {
        let _ = writeln!(output, "## Failed Records");
        for record in failures {
            let _ = writeln!(
                output,
                "- {}: {}",
                record.legacy_id,
                record.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    output
}

pub fn build_scheduler_report(report: &SchedulerReport) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Scheduler Cycle {}", report.ran_at);
    let _ = writeln!(output, "- unmarked records materialised: {}", report.records_created);
    let _ = writeln!(output, "- follow-up notifications sent: {}", report.followups_sent);
    let _ = writeln!(output, "- progress snapshots recomputed: {}", report.recomputed);

    if report.failures.is_empty() {
        let _ = writeln!(output, "- recompute failures: none");
    } else {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Recompute Failures");
        for failure in &report.failures {
            let _ = writeln!(
                output,
                "- student {} in cohort {}: {}",
                failure.student_id, failure.cohort_id, failure.error
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::scheduler::RecomputeFailure;

    #[test]
    fn scheduler_report_lists_failures() {
        let report = SchedulerReport {
            ran_at: Utc::now(),
            records_created: 3,
            followups_sent: 1,
            recomputed: 2,
            failures: vec![RecomputeFailure {
                student_id: Uuid::new_v4(),
                cohort_id: Uuid::new_v4(),
                error: "EXTERNAL_DEPENDENCY: completion source unavailable".into(),
            }],
        };
        let text = build_scheduler_report(&report);
        assert!(text.contains("follow-up notifications sent: 1"));
        assert!(text.contains("Recompute Failures"));
    }

    #[test]
    fn empty_plan_reads_as_empty() {
        let plan = MigrationPlan { candidates: vec![], total_enrollments: 0 };
        let text = build_plan_report(&plan);
        assert!(text.contains("No legacy enrollments to migrate."));
    }
}
