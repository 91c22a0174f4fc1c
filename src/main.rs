use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cohort_progress_engine::models::{AttendanceOutcome, CohortDefinition, IntakeTerm};
use cohort_progress_engine::sources::{DbCompletionSource, DbRoleSource, LogNotifier};
use cohort_progress_engine::{
    attendance, cohorts, db, migration, progress, report, scheduler, sessions,
};

#[derive(Parser)]
#[command(name = "cohort-progress")]
#[command(about = "Cohort management and progress tracking engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Cohort lifecycle and membership
    Cohort {
        #[command(subcommand)]
        command: CohortCommands,
    },
    /// Session scheduling
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Check whether a student may access a course
    Access {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        course: Uuid,
    },
    /// Mark attendance for a student in a session
    Mark {
        #[arg(long)]
        session: Uuid,
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        outcome: String,
        #[arg(long)]
        actor: Uuid,
    },
    /// Recompute one student's progress snapshot
    Recompute {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        cohort: Uuid,
    },
    /// Show a stored progress snapshot
    Progress {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        cohort: Uuid,
    },
    /// Run the attendance workflow scheduler
    Scheduler {
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
        #[arg(long, default_value_t = 24)]
        grace_hours: i64,
        /// Run a single cycle and print its report instead of looping
        #[arg(long)]
        once: bool,
    },
    /// Import legacy enrollments from a CSV export
    ImportLegacy {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Legacy migration entry points
    Migrate {
        #[command(subcommand)]
        command: MigrateCommands,
    },
}

#[derive(Subcommand)]
enum CohortCommands {
    /// Create a draft cohort
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        year: i32,
        /// "september" or "march"
        #[arg(long)]
        term: String,
        #[arg(long)]
        semester: i32,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        actor: Uuid,
    },
    /// Add students to a cohort
    AddMembers {
        #[arg(long)]
        cohort: Uuid,
        #[arg(long, required = true, num_args = 1..)]
        students: Vec<Uuid>,
    },
    /// Remove a student from a cohort
    RemoveMember {
        #[arg(long)]
        cohort: Uuid,
        #[arg(long)]
        student: Uuid,
    },
    /// Activate a draft cohort
    Activate {
        #[arg(long)]
        cohort: Uuid,
    },
    /// Complete an active cohort
    Complete {
        #[arg(long)]
        cohort: Uuid,
    },
    /// Archive a cohort
    Archive {
        #[arg(long)]
        cohort: Uuid,
    },
    /// List a cohort's members
    Members {
        #[arg(long)]
        cohort: Uuid,
    },
    /// Show the cohort currently claiming a student, if any
    Of {
        #[arg(long)]
        student: Uuid,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Schedule a session on a cohort's calendar
    Schedule {
        #[arg(long)]
        cohort: Uuid,
        #[arg(long)]
        course: Uuid,
        #[arg(long)]
        teacher: Uuid,
        /// RFC 3339, e.g. 2026-09-01T09:00:00Z
        #[arg(long)]
        starts: DateTime<Utc>,
        #[arg(long)]
        ends: DateTime<Utc>,
        #[arg(long, default_value = "")]
        location: String,
    },
    /// Move a session that has not started yet
    Reschedule {
        #[arg(long)]
        session: Uuid,
        #[arg(long)]
        starts: DateTime<Utc>,
        #[arg(long)]
        ends: DateTime<Utc>,
    },
    /// Print a cohort's calendar in start order
    Calendar {
        #[arg(long)]
        cohort: Uuid,
    },
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Dry run: write the candidate-cohort grouping report
    Analyze {
        #[arg(long, default_value = "migration-plan.md")]
        out: PathBuf,
    },
    /// Back up affected collections and transform legacy enrollments
    Execute {
        #[arg(long)]
        actor: Uuid,
    },
    /// Restore every collection from the pre-migration backup
    Rollback,
}

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://cohort-progress.db".into());

    let pool = db::connect(&database_url)
        .await
        .context("failed to open the engine database")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Cohort { command } => match command {
            CohortCommands::Create {
                name,
                year,
                term,
                semester,
                start,
                end,
                actor,
            } => {
                let id = cohorts::create_cohort(
                    &pool,
                    &CohortDefinition {
                        name,
                        academic_year: year,
                        intake_term: IntakeTerm::parse(&term)?,
                        semester,
                        start_date: start,
                        end_date: end,
                        created_by: actor,
                    },
                )
                .await?;
                println!("{id}");
            }
            CohortCommands::AddMembers { cohort, students } => {
                cohorts::add_members(&pool, cohort, &students, Utc::now()).await?;
                println!("Added {} students.", students.len());
            }
            CohortCommands::RemoveMember { cohort, student } => {
                cohorts::remove_member(&pool, cohort, student).await?;
                println!("Removed {student}.");
            }
            CohortCommands::Activate { cohort } => {
                cohorts::activate(&pool, cohort).await?;
                println!("Cohort {cohort} is active.");
            }
            CohortCommands::Complete { cohort } => {
                cohorts::complete(&pool, cohort).await?;
                println!("Cohort {cohort} is completed.");
            }
            CohortCommands::Archive { cohort } => {
                cohorts::archive(&pool, cohort).await?;
                println!("Cohort {cohort} is archived.");
            }
            CohortCommands::Members { cohort } => {
                for student in cohorts::list_members(&pool, cohort).await? {
                    println!("{student}");
                }
            }
            CohortCommands::Of { student } => {
                match cohorts::claimed_cohort_of(&pool, student).await? {
                    Some(cohort) => println!("{cohort}"),
                    None => println!("none"),
                }
            }
        },
        Commands::Session { command } => match command {
            SessionCommands::Schedule {
                cohort,
                course,
                teacher,
                starts,
                ends,
                location,
            } => {
                let id = sessions::create_session(
                    &pool, cohort, course, teacher, starts, ends, &location,
                )
                .await?;
                println!("{id}");
            }
            SessionCommands::Reschedule { session, starts, ends } => {
                sessions::reschedule_session(&pool, session, starts, ends, Utc::now()).await?;
                println!("Session {session} moved to {starts}..{ends}.");
            }
            SessionCommands::Calendar { cohort } => {
                for session in sessions::sessions_for_cohort(&pool, cohort).await? {
                    println!(
                        "{} {}..{} course {} teacher {} {}",
                        session.id,
                        session.starts_at,
                        session.ends_at,
                        session.course_id,
                        session.teacher_id,
                        session.location
                    );
                }
            }
        },
        Commands::Access { student, course } => {
            let allowed = sessions::course_access_for(&pool, student, course).await?;
            println!("{}", if allowed { "granted" } else { "denied" });
        }
        Commands::Mark {
            session,
            student,
            outcome,
            actor,
        } => {
            let outcome = AttendanceOutcome::parse(&outcome)?;
            let roles = DbRoleSource::new(pool.clone());
            let now = Utc::now();
            attendance::mark(&pool, &roles, session, student, outcome, actor, now).await?;
            println!("Marked {} for student {student}.", outcome.as_str());

            // The mark is committed at this point; a recompute hiccup is a
            // warning, not a command failure. The scheduler picks the key up
            // on its next cycle.
            let cohort = sessions::get_session(&pool, session).await?.cohort_id;
            let completion = DbCompletionSource::new(pool.clone());
            match progress::recompute(&pool, &completion, COMPLETION_TIMEOUT, student, cohort, now)
                .await
            {
                Ok(snapshot) => {
                    println!("Progress now {:.1}.", progress::display_score(snapshot.score));
                }
                Err(err) => warn!(error = %err, "ad-hoc recompute failed"),
            }
        }
        Commands::Recompute { student, cohort } => {
            let completion = DbCompletionSource::new(pool.clone());
            let snapshot = progress::recompute(
                &pool,
                &completion,
                COMPLETION_TIMEOUT,
                student,
                cohort,
                Utc::now(),
            )
            .await?;
            println!(
                "completion {:.2}, attendance {:.2}, score {:.1}",
                snapshot.completion_ratio,
                snapshot.attendance_ratio,
                progress::display_score(snapshot.score)
            );
        }
        Commands::Progress { student, cohort } => {
            let snapshot = progress::get_progress(&pool, student, cohort).await?;
            println!(
                "completion {:.2}, attendance {:.2}, score {:.1} (recomputed {})",
                snapshot.completion_ratio,
                snapshot.attendance_ratio,
                progress::display_score(snapshot.score),
                snapshot.recomputed_at
            );
        }
        Commands::Scheduler {
            interval_secs,
            grace_hours,
            once,
        } => {
            let config = scheduler::SchedulerConfig {
                interval: Duration::from_secs(interval_secs),
                grace: chrono::Duration::hours(grace_hours),
                completion_timeout: COMPLETION_TIMEOUT,
            };
            let completion = DbCompletionSource::new(pool.clone());
            let notifier = LogNotifier;

            if once {
                let cycle =
                    scheduler::run_once(&pool, &completion, &notifier, &config, Utc::now()).await?;
                print!("{}", report::build_scheduler_report(&cycle));
            } else {
                let cancel = CancellationToken::new();
                let signal_cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        signal_cancel.cancel();
                    }
                });
                scheduler::run(&pool, &completion, &notifier, &config, cancel).await?;
            }
        }
        Commands::ImportLegacy { csv } => {
            let inserted = migration::import_legacy_csv(&pool, &csv).await?;
            println!("Inserted {inserted} legacy enrollments from {}.", csv.display());
        }
        Commands::Migrate { command } => match command {
            MigrateCommands::Analyze { out } => {
                let plan = migration::analyze(&pool).await?;
                std::fs::write(&out, report::build_plan_report(&plan))?;
                println!("Plan written to {}.", out.display());
            }
            MigrateCommands::Execute { actor } => {
                let outcome = migration::execute(&pool, Utc::now(), actor).await?;
                print!("{}", report::build_migration_report(&outcome));
            }
            MigrateCommands::Rollback => {
                if migration::rollback(&pool).await? {
                    println!("Rolled back to the pre-migration backup.");
                } else {
                    println!("No active backup; nothing to roll back.");
                }
            }
        },
    }

    Ok(())
}
