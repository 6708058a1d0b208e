use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand};
use sea_orm::ConnectionTrait;
use serde::Serialize;
use tracing::info;

use pos_migrate::{
    config::{self, AppConfig},
    db::{self, DbConfig, DbPool},
    errors::{MigrationError, Result},
    evolver::{self, render::render_plan, AppliedLog, ApplyOptions, MigrationPlan},
    inspector::SchemaInspector,
    migration::{Migration, MigrationRun, MigrationRunner, MigrationStatus},
    migrator,
    schema::TargetSchema,
};

#[derive(Parser)]
#[command(
    name = "pos-migrate",
    about = "Plan and apply idempotent schema migrations for the POS backend",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether each registered migration is applied
    Status,
    /// Print the steps a migration would run, without running them
    Plan(PlanArgs),
    /// Apply one migration, or every pending one in order
    Up(NameArgs),
    /// Roll back one migration, or the most recent one present
    Down(NameArgs),
    /// Describe a table as the catalog reports it
    Inspect {
        table: String,
    },
}

#[derive(Args)]
struct PlanArgs {
    /// Migration name; all registered migrations when omitted
    name: Option<String>,
    /// Plan the rollback instead
    #[arg(long)]
    down: bool,
    /// Print SQL instead of step descriptions
    #[arg(long)]
    sql: bool,
    /// Plan against a target schema read from a JSON file
    #[arg(long, value_name = "FILE", conflicts_with_all = ["name", "down"])]
    target: Option<PathBuf>,
}

#[derive(Args)]
struct NameArgs {
    name: Option<String>,
}

#[derive(Serialize)]
struct StatusLine {
    migration: String,
    status: MigrationStatus,
}

#[derive(Serialize)]
struct PlanOutput {
    migration: String,
    direction: &'static str,
    steps: MigrationPlan,
    #[serde(skip_serializing_if = "Option::is_none")]
    sql: Option<Vec<String>>,
}

#[derive(Serialize)]
struct RunOutput {
    migration: String,
    status: MigrationStatus,
    log: AppliedLog,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match config::load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::from(2);
        }
    };
    config::init_tracing(cfg.log_level(), cfg.log_json);

    match run(cli, &cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_failure(&err);
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(cli: Cli, cfg: &AppConfig) -> Result<()> {
    let db_config = DbConfig::try_from(cfg)?;
    let options = ApplyOptions::from(cfg);
    let schema = cfg.database.schema_name();
    let json = cli.json;

    // Read CLI input before connecting so a bad file never opens a connection.
    let target = match &cli.command {
        Commands::Plan(PlanArgs {
            target: Some(path), ..
        }) => Some(read_target(path)?),
        _ => None,
    };
    let command = cli.command;

    db::with_connection(&db_config, move |conn| {
        Box::pin(async move {
            let runner = MigrationRunner::new(conn, schema).with_options(options);
            match command {
                Commands::Status => status(&runner, json).await,
                Commands::Plan(args) => match target {
                    Some(target) => plan_target(conn, &runner, &target, args.sql, json).await,
                    None => plan(conn, &runner, args, json).await,
                },
                Commands::Up(args) => up(&runner, args.name, json).await,
                Commands::Down(args) => down(&runner, args.name, json).await,
                Commands::Inspect { table } => inspect(conn, runner.schema(), &table, json).await,
            }
        })
    })
    .await
}

fn read_target(path: &PathBuf) -> Result<TargetSchema> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn selected(name: Option<&str>) -> Result<Vec<Box<dyn Migration>>> {
    match name {
        Some(name) => Ok(vec![migrator::find(name)?]),
        None => Ok(migrator::registered()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn status(runner: &MigrationRunner<'_, DbPool>, json: bool) -> Result<()> {
    let mut lines = Vec::new();
    for migration in migrator::registered() {
        lines.push(StatusLine {
            migration: migration.name().to_string(),
            status: runner.status(migration.as_ref()).await?,
        });
    }
    if json {
        return print_json(&lines);
    }
    for line in lines {
        println!("{:<50} {}", line.migration, line.status);
    }
    Ok(())
}

fn print_plan(conn: &DbPool, output: &PlanOutput, sql: bool) -> Result<()> {
    println!("{} ({}):", output.migration, output.direction);
    if output.steps.is_empty() {
        println!("  nothing to do");
        return Ok(());
    }
    if sql {
        for statement in render_plan(&output.steps, conn.get_database_backend())? {
            println!("  {}", statement);
        }
    } else {
        for (index, step) in output.steps.iter().enumerate() {
            println!("  {:>2}. {}", index, step);
        }
    }
    Ok(())
}

async fn plan(
    conn: &DbPool,
    runner: &MigrationRunner<'_, DbPool>,
    args: PlanArgs,
    json: bool,
) -> Result<()> {
    let mut outputs = Vec::new();
    for migration in selected(args.name.as_deref())? {
        let (direction, steps) = if args.down {
            ("down", runner.plan_down(migration.as_ref()).await?)
        } else {
            ("up", runner.plan_up(migration.as_ref()).await?)
        };
        let sql = if args.sql {
            Some(render_plan(&steps, conn.get_database_backend())?)
        } else {
            None
        };
        outputs.push(PlanOutput {
            migration: migration.name().to_string(),
            direction,
            steps,
            sql,
        });
    }

    if json {
        return print_json(&outputs);
    }
    for output in &outputs {
        print_plan(conn, output, args.sql)?;
    }
    Ok(())
}

async fn plan_target(
    conn: &DbPool,
    runner: &MigrationRunner<'_, DbPool>,
    target: &TargetSchema,
    sql: bool,
    json: bool,
) -> Result<()> {
    let snapshot = runner.snapshot(target).await?;
    let steps = evolver::plan(target, &snapshot)?;
    steps.validate(&snapshot)?;

    let output = PlanOutput {
        migration: "target".to_string(),
        direction: "up",
        sql: if sql {
            Some(render_plan(&steps, conn.get_database_backend())?)
        } else {
            None
        },
        steps,
    };
    if json {
        print_json(&output)
    } else {
        print_plan(conn, &output, sql)
    }
}

fn print_run(output: &RunOutput, json: bool) -> Result<()> {
    if json {
        return print_json(output);
    }
    println!("{}: {}", output.migration, output.status);
    for entry in &output.log.entries {
        println!("  {:>2}. {} [{:?}]", entry.index, entry.step, entry.outcome);
    }
    Ok(())
}

async fn up(runner: &MigrationRunner<'_, DbPool>, name: Option<String>, json: bool) -> Result<()> {
    for migration in selected(name.as_deref())? {
        let status = runner.status(migration.as_ref()).await?;
        if status == MigrationStatus::Applied {
            info!(migration = %migration.name(), "Already applied, skipping");
            continue;
        }
        let mut run = MigrationRun::new(migration.name());
        let log = runner.up(migration.as_ref(), &mut run).await?;
        print_run(
            &RunOutput {
                migration: run.name.clone(),
                status: run.status,
                log,
            },
            json,
        )?;
    }
    Ok(())
}

async fn down(runner: &MigrationRunner<'_, DbPool>, name: Option<String>, json: bool) -> Result<()> {
    let candidates = match name {
        Some(name) => vec![migrator::find(&name)?],
        None => migrator::registered().into_iter().rev().collect(),
    };

    for migration in candidates {
        // Anything still present counts as applied; a partial apply rolls back too.
        if runner.plan_down(migration.as_ref()).await?.is_empty() {
            info!(migration = %migration.name(), "Nothing to roll back");
            continue;
        }
        let mut run = MigrationRun::with_status(migration.name(), MigrationStatus::Applied);
        let log = runner.down(migration.as_ref(), &mut run).await?;
        return print_run(
            &RunOutput {
                migration: run.name.clone(),
                status: run.status,
                log,
            },
            json,
        );
    }
    println!("nothing to roll back");
    Ok(())
}

async fn inspect(conn: &DbPool, schema: &str, table: &str, json: bool) -> Result<()> {
    let snapshot = SchemaInspector::new(conn).describe_table(schema, table).await?;
    let Some(described) = snapshot.table(table) else {
        return Err(MigrationError::InvalidPlan(format!(
            "table {}.{} does not exist",
            schema, table
        )));
    };
    if json {
        return print_json(described);
    }

    println!("{}.{}", schema, described.name);
    if let Some(collation) = &described.collation {
        println!("  collation: {}", collation);
    }
    for column in &described.columns {
        println!(
            "  {:<30} {}{}",
            column.name,
            column.shape().describe(),
            if column.is_primary_key { " PRIMARY KEY" } else { "" }
        );
    }
    for index in described.indexes.values() {
        println!(
            "  {}index {} ({})",
            if index.unique { "unique " } else { "" },
            index.name,
            index.columns.join(", ")
        );
    }
    for fk in described.foreign_keys.values() {
        println!(
            "  foreign key {} ({}) -> {}({}) ON DELETE {}",
            fk.name, fk.column, fk.referenced_table, fk.referenced_column, fk.on_delete
        );
    }
    Ok(())
}

/// Failures go to stderr with what was committed and how to undo it.
fn report_failure(err: &MigrationError) {
    eprintln!("error: {}", err);
    let Some(committed) = err.committed() else {
        return;
    };

    eprintln!("committed before the failure:");
    for entry in committed.committed() {
        eprintln!("  {:>2}. {} [{:?}]", entry.index, entry.step, entry.outcome);
    }

    let compensation = committed.compensation_plan();
    if compensation.is_empty() {
        eprintln!("no schema changes to compensate");
    } else {
        eprintln!("compensation plan:");
        for (index, step) in compensation.iter().enumerate() {
            eprintln!("  {:>2}. {}", index, step);
        }
    }
}
