//! Main entry point for the yuniql cli tool

mod cli;

use crate::cli::{CliError, Command, DbArgs, EraseArgs, RunArgs, VnextArgs};
use clap::Parser;
use cli::Cli;
use comfy_table::{Cell, CellAlignment, Table};
use console::{Style, Term};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};
use time::macros::format_description;
use yuniql::{Config, DbVersion, Migrator, RunReport, VersionStatus};

fn main() {
    human_panic::setup_panic!(human_panic::Metadata::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
    .support("Open an issue with the panic report attached"));

    if let Err(e) = crate::inner_main() {
        eprintln!("{e}");
        std::process::exit(1)
    }
}

fn inner_main() -> Result<(), CliError> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.debug { "debug" } else { "info" }),
    )
    .format_timestamp(None)
    .init();

    match &cli.command {
        Some(Command::Init) => {
            let config = base_config(&cli)?;
            yuniql::workspace::init(&config.workspace)?;
            println!(
                "{:>12} workspace {}",
                Style::new().green().bold().apply_to("Initialized"),
                config.workspace.display()
            );
            Ok(())
        }
        Some(Command::Vnext(args)) => vnext(&cli, args),
        Some(Command::Run(args)) => {
            let config = run_config(&cli, args, false)?;
            migrator_command(config, |migrator| async move { run(&migrator).await })
        }
        Some(Command::Verify(args)) => {
            let config = run_config(&cli, args, true)?;
            migrator_command(config, |migrator| async move { run(&migrator).await })
        }
        Some(Command::Erase(args)) => {
            let config = erase_config(&cli, args)?;
            migrator_command(config, |migrator| async move { erase(&migrator).await })
        }
        Some(Command::List(args)) => {
            let mut config = base_config(&cli)?;
            apply_db_args(&mut config, args)?;
            migrator_command(config, |migrator| async move { list(&migrator).await })
        }
        None => Err(CliError::UnknownCommand),
    }
}

/// Configuration file if any, with the global flags applied.
fn base_config(cli: &Cli) -> Result<Config, CliError> {
    let mut config = match &cli.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };
    if let Some(workspace) = &cli.workspace {
        config.workspace = workspace.clone();
    }
    Ok(config)
}

fn apply_db_args(config: &mut Config, args: &DbArgs) -> Result<(), CliError> {
    if let Some(platform) = &args.platform {
        config.platform = platform.clone();
    }
    if let Some(connection_string) = &args.connection_string {
        config.connection_string = connection_string.clone();
    }
    if args.meta_schema.is_some() {
        config.meta_schema_name = args.meta_schema.clone();
    }
    if args.meta_table.is_some() {
        config.meta_table_name = args.meta_table.clone();
    }
    if args.command_timeout.is_some() {
        config.command_timeout_secs = args.command_timeout;
    }
    if config.connection_string.trim().is_empty() {
        return Err(CliError::MissingConnectionString);
    }
    Ok(())
}

fn run_config(cli: &Cli, args: &RunArgs, verify_only: bool) -> Result<Config, CliError> {
    let mut config = base_config(cli)?;
    apply_db_args(&mut config, &args.db)?;
    if args.target_version.is_some() {
        config.target_version = args.target_version.clone();
    }
    if args.auto_create_db {
        config.auto_create_database = true;
    }
    config.tokens.extend(args.tokens.iter().cloned());
    if let Some(separator) = args.bulk_separator {
        config.bulk_separator = separator;
    }
    if let Some(batch_size) = args.bulk_batch_size {
        config.bulk_batch_size = batch_size;
    }
    if args.additional_artifacts.is_some() {
        config.additional_artifacts = args.additional_artifacts.clone();
    }
    config.verify_only = verify_only;
    Ok(config)
}

fn erase_config(cli: &Cli, args: &EraseArgs) -> Result<Config, CliError> {
    let mut config = base_config(cli)?;
    apply_db_args(&mut config, &args.db)?;
    config.tokens.extend(args.tokens.iter().cloned());
    Ok(config)
}

fn migrator_command<F, Fut>(config: Config, command: F) -> Result<(), CliError>
where
    F: FnOnce(Migrator) -> Fut,
    Fut: std::future::Future<Output = Result<(), CliError>>,
{
    let migrator = Migrator::from_config(config)?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(command(migrator))
}

fn vnext(cli: &Cli, args: &VnextArgs) -> Result<(), CliError> {
    let config = base_config(cli)?;
    let file_name = args.file.as_deref();
    let created = if args.major {
        yuniql::increment_major_version(&config.workspace, file_name)?
    } else {
        yuniql::increment_minor_version(&config.workspace, file_name)?
    };
    println!(
        "{:>12} {}",
        Style::new().green().bold().apply_to("Created"),
        config.workspace.join(created).display()
    );
    Ok(())
}

fn spinner(prefix: &'static str, message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template(if Term::stdout().size().1 > 80 {
            "{prefix:>12.cyan.bold} {spinner} {wide_msg}"
        } else {
            "{prefix:>12.cyan.bold} {spinner}"
        })
        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix);
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

async fn run(migrator: &Migrator) -> Result<(), CliError> {
    let start = Instant::now();
    let verify_only = migrator.config().verify_only;
    let pb = spinner(
        if verify_only { "Verifying" } else { "Migrating" },
        format!(
            "{} {}",
            migrator.platform().name(),
            migrator.platform().connection_info()
        ),
    );
    let result = if verify_only {
        migrator.verify().await
    } else {
        migrator.run().await
    };
    pb.finish_and_clear();

    match result {
        Ok(report) => {
            show_report(&report, &start);
            Ok(())
        }
        Err(e) => {
            if let Some(path) = e.script_path() {
                println!(
                    "{:>12} {}",
                    Style::new().red().bold().apply_to("Failed"),
                    path.display()
                );
            }
            Err(e.into())
        }
    }
}

fn show_report(report: &RunReport, start: &Instant) {
    let green_bold = Style::new().green().bold();
    if report.database_created {
        println!("{:>12} database", green_bold.apply_to("Created"));
    }
    if report.metadata_created {
        println!("{:>12} schema version table", green_bold.apply_to("Created"));
    }
    let applied = if report.verify_only {
        Style::new().yellow().bold().apply_to("Verified")
    } else {
        green_bold.apply_to("Applied")
    };
    for version in &report.applied_versions {
        println!("{:>12} {}", applied, version);
    }

    if report.is_up_to_date() {
        println!(
            "{:>12} No pending versions, database is at {}.",
            green_bold.apply_to("Finished"),
            report
                .current_version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "no version".to_string())
        );
    } else if report.verify_only {
        println!(
            "{:>12} {} versions verified and rolled back in {}",
            green_bold.apply_to("Finished"),
            report.applied_versions.len(),
            HumanDuration(start.elapsed())
        );
    } else {
        println!(
            "{:>12} Database migrated in {} ({} statements, {} rows loaded)",
            green_bold.apply_to("Finished"),
            HumanDuration(start.elapsed()),
            report.statements,
            report.bulk_rows
        );
    }
}

async fn erase(migrator: &Migrator) -> Result<(), CliError> {
    let start = Instant::now();
    let pb = spinner(
        "Erasing",
        format!(
            "{} {}",
            migrator.platform().name(),
            migrator.platform().connection_info()
        ),
    );
    let result = migrator.erase().await;
    pb.finish_and_clear();
    let statements = result?;
    println!(
        "{:>12} {} statements executed in {}",
        Style::new().green().bold().apply_to("Erased"),
        statements,
        HumanDuration(start.elapsed())
    );
    Ok(())
}

async fn list(migrator: &Migrator) -> Result<(), CliError> {
    let versions = migrator.list().await?;
    show_versions(&versions)?;
    match migrator.current_version().await? {
        Some(version) => println!("Current version: {}", version),
        None => println!("Current version: none"),
    }
    Ok(())
}

fn show_versions(versions: &[DbVersion]) -> Result<(), CliError> {
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL_CONDENSED)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS)
        .set_header(vec![
            "#",
            "Version",
            "Status",
            "Checksum",
            "Applied at (UTC)",
            "By",
            "Duration",
        ]);
    if versions.is_empty() {
        table.add_row(vec![
            Cell::new(""),
            Cell::new(""),
            Cell::new("No versions applied.").fg(comfy_table::Color::Cyan),
        ]);
    } else {
        let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        for version in versions {
            table.add_row(vec![
                Cell::new(version.sequence_id).set_alignment(CellAlignment::Right),
                Cell::new(&version.version),
                Cell::new(version.status.to_string()).fg(match version.status {
                    VersionStatus::Successful => comfy_table::Color::Green,
                    VersionStatus::Failed => comfy_table::Color::Red,
                }),
                Cell::new(version.checksum32()),
                match version.applied_on_utc {
                    Some(ts) => Cell::new(ts.format(format)?),
                    None => Cell::new("unknown").fg(comfy_table::Color::Yellow),
                },
                Cell::new(format!(
                    "{} ({} {})",
                    version.applied_by_user,
                    version.applied_by_tool,
                    version.applied_by_tool_version
                )),
                {
                    let cell = Cell::new(format!("{} ms", version.duration_ms))
                        .set_alignment(CellAlignment::Right);
                    if version.duration_ms >= 3_600_000 {
                        cell.fg(comfy_table::Color::Red)
                    } else if version.duration_ms >= 60_000 {
                        cell.fg(comfy_table::Color::Yellow)
                    } else {
                        cell
                    }
                },
            ]);
            if let Some(path) = &version.failed_script_path {
                table.add_row(vec![
                    Cell::new(""),
                    Cell::new(""),
                    Cell::new(format!(
                        "{}: {}",
                        path,
                        version.failed_script_error.as_deref().unwrap_or("")
                    ))
                    .fg(comfy_table::Color::Red),
                ]);
            }
        }
    }
    println!("{table}");
    Ok(())
}
