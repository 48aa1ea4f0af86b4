use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use school_health_metrics::config::Config;
use school_health_metrics::dashboard::StatusFilter;
use school_health_metrics::db::{self, PgStore};
use school_health_metrics::models::{ClassDashboard, Grade, Student};
use school_health_metrics::report;
use school_health_metrics::store::{read_measurements_csv, HealthStore, MemoryStore};
use school_health_metrics::{HealthService, ServiceSettings, SyncEventBus};

#[derive(Parser)]
#[command(name = "school-health")]
#[command(about = "Student health metrics, class dashboards and reports", long_about = None)]
struct Cli {
    /// Config file (defaults to <config dir>/school-health/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Serve reads from a measurement CSV instead of Postgres
    #[arg(long, global = true)]
    from_csv: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct OutArg {
    /// Write the Markdown report here instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample students and measurements
    Seed,
    /// Import measurements from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Monthly series, nutrition breakdown and sections for a grade
    Dashboard {
        #[arg(long)]
        grade: Grade,
        #[arg(long)]
        json: bool,
    },
    /// Class report from each student's latest measurement
    ClassReport {
        #[arg(long)]
        grade: Grade,
        #[command(flatten)]
        out: OutArg,
    },
    /// Individual report with full history and trends
    StudentReport {
        #[arg(long)]
        student_number: String,
        #[command(flatten)]
        out: OutArg,
    },
    /// Latest BMI, status, percentile and BMI direction for a student
    StudentMetrics {
        #[arg(long)]
        student_number: String,
    },
    /// Last week's nutrition and exercise averages and goal progress
    Activity {
        #[arg(long)]
        student_number: String,
    },
    /// List students in a grade by nutrition status
    Students {
        #[arg(long)]
        grade: Grade,
        #[arg(long, default_value = "all")]
        filter: StatusFilter,
        #[arg(long)]
        section: Option<String>,
    },
    /// Record a measurement taken now
    Record {
        #[arg(long)]
        student_number: String,
        #[arg(long)]
        height: f64,
        #[arg(long)]
        weight: f64,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    match &cli.command {
        Commands::InitDb => {
            let pool = connect(&config).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
            return Ok(());
        }
        Commands::Seed => {
            let pool = connect(&config).await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
            return Ok(());
        }
        Commands::Import { csv } => {
            let pool = connect(&config).await?;
            let inserted = db::import_csv(&pool, csv).await?;
            println!("Inserted {inserted} measurements from {}.", csv.display());
            return Ok(());
        }
        _ => {}
    }

    let store: Arc<dyn HealthStore> = match &cli.from_csv {
        Some(path) => {
            let rows = read_measurements_csv(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            log::info!("Loaded {} measurements from {}", rows.len(), path.display());
            Arc::new(MemoryStore::from_rows(&rows))
        }
        None => Arc::new(PgStore::new(connect(&config).await?)),
    };
    let bus = Arc::new(SyncEventBus::new(config.sync.subscriber_soft_cap));
    let service = HealthService::new(store, bus, ServiceSettings::from(&config));

    match cli.command {
        Commands::Dashboard { grade, json } => {
            let dashboard = service.get_class_dashboard(grade).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&*dashboard)?);
            } else {
                print_dashboard(grade, &dashboard);
            }
        }
        Commands::ClassReport { grade, out } => {
            let report = service.get_class_report(grade).await?;
            emit(&report::render_class_report(&report), out.out.as_deref())?;
        }
        Commands::StudentReport {
            student_number,
            out,
        } => {
            let student = require_student(&service, &student_number).await?;
            let report = service.get_student_report(student.id).await?;
            emit(&report::render_student_report(&report), out.out.as_deref())?;
        }
        Commands::StudentMetrics { student_number } => {
            let student = require_student(&service, &student_number).await?;
            let metrics = service.get_student_metrics(student.id).await?;

            println!(
                "{} (grade {}, section {})",
                student.full_name(),
                student.grade,
                student.section
            );
            match metrics.bmi {
                Some(bmi) => println!("BMI {bmi:.1} ({})", metrics.status),
                None => println!("BMI unavailable ({})", metrics.status),
            }
            println!("Percentile within own history: {}", metrics.percentile);
            if let Some(trend) = metrics.bmi_trend {
                println!("BMI trend: {:?} ({:+.1})", trend.direction, trend.change);
            }
        }
        Commands::Activity { student_number } => {
            let student = require_student(&service, &student_number).await?;
            let summary = service.get_activity_summary(student.id).await?;

            println!("{} activity", student.full_name());
            println!(
                "Average calories: {} kcal over {} days",
                summary.average_calories,
                summary.nutrition_logs.len()
            );
            println!(
                "Average exercise: {} minutes over {} days",
                summary.average_exercise_minutes,
                summary.exercise_logs.len()
            );
            println!("Goal progress: {}%", summary.goal_progress);
        }
        Commands::Students {
            grade,
            filter,
            section,
        } => {
            let students = service
                .list_students(grade, filter, section.as_deref())
                .await?;
            if students.is_empty() {
                println!("No students match this filter.");
                return Ok(());
            }
            for student in students {
                println!(
                    "- {} {} (section {})",
                    student.student_number,
                    student.full_name(),
                    student.section
                );
            }
        }
        Commands::Record {
            student_number,
            height,
            weight,
            notes,
        } => {
            let student = require_student(&service, &student_number).await?;
            let outcome = service
                .add_health_record(student.id, height, weight, notes)
                .await?;
            if let Some(warning) = &outcome.warning {
                println!("Warning: {warning}");
            }
            match outcome.record.bmi() {
                Some(bmi) => println!(
                    "Recorded {} for {}: BMI {bmi:.1} ({}).",
                    outcome.record.date.format("%Y-%m-%d"),
                    student.full_name(),
                    outcome.record.bmi_status()
                ),
                None => println!("Recorded measurement for {}.", student.full_name()),
            }
        }
        Commands::InitDb | Commands::Seed | Commands::Import { .. } => {}
    }

    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let database_url = config
        .database_url()
        .context("DATABASE_URL must be set to a Postgres instance (or pass --from-csv)")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn require_student(service: &HealthService, student_number: &str) -> anyhow::Result<Student> {
    service
        .find_student_by_number(student_number)
        .await?
        .with_context(|| format!("no student with number {student_number}"))
}

fn emit(markdown: &str, out: Option<&Path>) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            std::fs::write(path, markdown)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Report written to {}.", path.display());
        }
        None => print!("{markdown}"),
    }
    Ok(())
}

fn print_dashboard(grade: Grade, dashboard: &ClassDashboard) {
    println!("Grade {grade} dashboard");
    println!("Month  Height   Weight   BMI    Records");
    for point in &dashboard.monthly_series {
        println!(
            "{:<6} {:>7.1} {:>8.1} {:>6.1} {:>7}",
            point.label,
            point.average_height,
            point.average_weight,
            point.average_bmi,
            point.record_count
        );
    }

    let overall = &dashboard.overall_averages;
    println!(
        "Overall: height {} cm, weight {} kg, BMI {}",
        overall.average_height, overall.average_weight, overall.average_bmi
    );

    let categories = &dashboard.nutrition_categories;
    println!(
        "Nutrition: normal {} ({}%), underweight {} ({}%), overweight {} ({}%)",
        categories.counts.normal,
        categories.percentages.normal,
        categories.counts.underweight,
        categories.percentages.underweight,
        categories.counts.overweight,
        categories.percentages.overweight
    );

    for section in &dashboard.sections {
        println!(
            "Section {}: {} records ({} normal, {} underweight, {} overweight)",
            section.name, section.count, section.normal, section.underweight, section.overweight
        );
    }
}
