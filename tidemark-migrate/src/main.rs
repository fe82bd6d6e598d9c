//! Tidemark Migration CLI Tool
//!
//! Command-line interface for applying and inspecting SQL migrations.
//! Supports both interactive use and CI/CD pipelines (exit status 0 on success, 1 on error).

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process;
use tidemark::backend::Backend;
use tidemark::migration::{MigrationInfo, MigrationState, MigrationStatus};
use tidemark::{MigrateConfig, Migrator, PostgresBackend, SqliteBackend, TidemarkConfig};

#[derive(Parser, Debug)]
#[command(name = "tidemark-migrate")]
#[command(about = "Migration management tool for Tidemark")]
#[command(version = "0.1.0")]
struct Cli {
    /// Database connection URL (`postgresql://…` or `sqlite:<path>`)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Configuration file (default: config/tidemark.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Migration location; repeat for several (overrides configuration)
    #[arg(long = "location", global = true)]
    locations: Vec<String>,

    /// Schema to manage; the first hosts the history table (overrides configuration)
    #[arg(long = "schema", global = true)]
    schemas: Vec<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations
    Migrate {
        /// Dry run - show what would be applied without running
        #[arg(long)]
        dry_run: bool,
    },

    /// Show every resolved and applied migration
    Info {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate applied migrations against the resolved ones
    Validate,

    /// Baseline an existing database
    Baseline {
        /// Version to baseline at (default: configured baseline version, else 1)
        #[arg(long)]
        version: Option<String>,
    },

    /// Remove failed migration rows and realign checksums
    Repair,
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let quiet = cli.quiet;
    match run(cli) {
        Ok(()) => {
            if !quiet {
                println!("{}", "✅ Success".green());
            }
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{} {:#}", "❌ Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = load_settings(&cli)?;
    let database_url = database_url(cli.database_url.clone(), settings.database.url.clone())?;
    let backend = open_backend(&database_url)?;
    let mut config = apply_overrides(settings.migrate, &cli);

    match cli.command {
        Commands::Migrate { dry_run } => handle_migrate(&Migrator::new(config)?, backend.as_ref(), dry_run),
        Commands::Info { json } => handle_info(&Migrator::new(config)?, backend.as_ref(), json),
        Commands::Validate => handle_validate(&Migrator::new(config)?, backend.as_ref()),
        Commands::Baseline { version } => {
            if let Some(version) = version {
                config = config.with_baseline_version(version);
            }
            handle_baseline(&Migrator::new(config)?, backend.as_ref())
        }
        Commands::Repair => handle_repair(&Migrator::new(config)?, backend.as_ref()),
    }
}

fn load_settings(cli: &Cli) -> anyhow::Result<TidemarkConfig> {
    match &cli.config {
        Some(path) => TidemarkConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => TidemarkConfig::load().context("Failed to load configuration"),
    }
}

/// `--database-url`, then `TIDEMARK_DATABASE_URL`, then `DATABASE_URL`, then the config file
fn database_url(flag: Option<String>, configured: Option<String>) -> anyhow::Result<String> {
    flag.or_else(|| std::env::var("TIDEMARK_DATABASE_URL").ok())
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .or(configured)
        .context(
            "Database URL not provided. Use --database-url, set TIDEMARK_DATABASE_URL or DATABASE_URL, \
             or set database.url in the configuration file",
        )
}

fn sqlite_path(url: &str) -> Option<&str> {
    url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))
}

fn open_backend(url: &str) -> anyhow::Result<Box<dyn Backend>> {
    if let Some(path) = sqlite_path(url) {
        let backend = SqliteBackend::open(path).with_context(|| format!("Failed to open SQLite database {path}"))?;
        return Ok(Box::new(backend));
    }
    let backend = PostgresBackend::connect(url).context("Error connecting to database")?;
    Ok(Box::new(backend))
}

fn apply_overrides(mut config: MigrateConfig, cli: &Cli) -> MigrateConfig {
    if !cli.locations.is_empty() {
        config = config.with_locations(cli.locations.iter().cloned());
    }
    if !cli.schemas.is_empty() {
        config = config.with_schemas(cli.schemas.iter().cloned());
    }
    config
}

fn handle_migrate(migrator: &Migrator, backend: &dyn Backend, dry_run: bool) -> anyhow::Result<()> {
    if dry_run {
        let status = migrator.info(backend)?;
        let pending: Vec<&MigrationInfo> = status.pending().collect();
        if pending.is_empty() {
            println!("No pending migrations to apply to schema {}", status.schema);
            return Ok(());
        }
        println!("Would apply {} migration(s) to schema {}:", pending.len(), status.schema);
        for (i, info) in pending.iter().enumerate() {
            println!("  {}. {} ({})", i + 1, label(info), info.script);
        }
        return Ok(());
    }

    println!("Applying migrations...");
    let result = migrator.migrate(backend)?;
    let version = result
        .target_schema_version
        .as_ref()
        .map_or_else(|| "<< Empty Schema >>".to_string(), ToString::to_string);
    if result.applied_count > 0 {
        println!(
            "✅ Successfully applied {} migration(s) to schema {} (now at version {})",
            result.applied_count, result.schema, version
        );
    } else {
        println!("✅ Schema {} is up to date (version {})", result.schema, version);
    }
    Ok(())
}

fn handle_info(migrator: &Migrator, backend: &dyn Backend, json: bool) -> anyhow::Result<()> {
    let status = migrator.info(backend)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    print_status(&status);
    Ok(())
}

fn handle_validate(migrator: &Migrator, backend: &dyn Backend) -> anyhow::Result<()> {
    println!("Validating migrations...");
    migrator.validate(backend)?;
    println!("✅ All applied migrations match");
    Ok(())
}

fn handle_baseline(migrator: &Migrator, backend: &dyn Backend) -> anyhow::Result<()> {
    let version = migrator.baseline(backend)?;
    println!("✅ Baselined at version {}", version);
    Ok(())
}

fn handle_repair(migrator: &Migrator, backend: &dyn Backend) -> anyhow::Result<()> {
    let report = migrator.repair(backend)?;
    println!(
        "✅ Repaired schema {}: removed {} failed row(s), realigned {} checksum(s)",
        report.schema,
        report.removed_failed,
        report.realigned.len()
    );
    for migration in &report.realigned {
        println!("  ↺ {}", migration);
    }
    Ok(())
}

fn print_status(status: &MigrationStatus) {
    println!("\n📋 Schema {}\n", status.schema.bold());
    if status.migrations.is_empty() {
        println!("  No migrations found");
    }
    for info in &status.migrations {
        let installed = info
            .installed_on
            .map_or_else(String::new, |ts| ts.format("%Y-%m-%d %H:%M:%S").to_string());
        println!(
            "  {:<10} {:<12} {:<40} {:<19} {}",
            info.kind.as_str(),
            info.version.as_ref().map_or_else(String::new, ToString::to_string),
            info.description,
            installed,
            colored_state(info.state)
        );
    }

    let current = status
        .latest_applied_version()
        .map_or_else(|| "<< Empty Schema >>".to_string(), ToString::to_string);
    println!(
        "\n📈 Summary: version {}, {} applied, {} pending, {} failed",
        current, status.applied_count, status.pending_count, status.failed_count
    );
    if let Some(next) = status.next_pending_version() {
        println!("Next Pending Version: {}", next);
    }
}

fn colored_state(state: MigrationState) -> colored::ColoredString {
    let text = state.as_str();
    match state {
        MigrationState::Success | MigrationState::Baseline => text.green(),
        MigrationState::Pending | MigrationState::Outdated => text.yellow(),
        MigrationState::Failed | MigrationState::Missing => text.red(),
        MigrationState::Ignored => text.magenta(),
        MigrationState::BelowBaseline | MigrationState::Superseded => text.dimmed(),
    }
}

fn label(info: &MigrationInfo) -> String {
    match &info.version {
        Some(v) => format!("{} - {}", v, info.description),
        None => format!("<< Repeatable >> {}", info.description),
    }
}
