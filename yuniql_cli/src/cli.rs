//! Defines the CLI application

use std::path::PathBuf;
use thiserror::Error;
use yuniql::{MigratorError, WorkspaceError};

#[derive(clap::Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// TOML configuration file, flags given on the command line take precedence
    #[arg(short = 'c', long, env = "YUNIQL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Workspace directory path
    #[arg(short = 'p', long, env = "YUNIQL_WORKSPACE", global = true)]
    pub workspace: Option<PathBuf>,

    /// Print debug logs
    #[arg(short = 'd', long, default_value = "false", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Scaffold a workspace with the required directories.
    Init,

    /// Create the next version directory.
    Vnext(VnextArgs),

    /// Apply pending versions to the database.
    Run(RunArgs),

    /// Apply pending versions and roll everything back.
    ///
    /// Only available on platforms with transactional DDL.
    Verify(RunArgs),

    /// Run the `_erase` scripts.
    Erase(EraseArgs),

    /// Display the schema version table.
    List(DbArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct VnextArgs {
    /// Increment the major version instead of the minor one
    #[arg(short = 'm', long, default_value = "false")]
    pub major: bool,

    /// Create an empty script file with this name in the new directory
    #[arg(short = 'f', long)]
    pub file: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DbArgs {
    /// Target platform: postgresql, sqlserver or mysql
    #[arg(long, env = "YUNIQL_PLATFORM")]
    pub platform: Option<String>,

    /// Database connection string
    #[arg(short = 'C', long, env = "YUNIQL_CONNECTION_STRING", hide_env_values = true)]
    pub connection_string: Option<String>,

    /// Schema of the schema version table
    #[arg(long)]
    pub meta_schema: Option<String>,

    /// Name of the schema version table
    #[arg(long)]
    pub meta_table: Option<String>,

    /// Seconds before a statement is abandoned
    #[arg(long)]
    pub command_timeout: Option<u64>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub db: DbArgs,

    /// Highest version to apply (if not defined apply all)
    #[arg(short = 't', long, env = "YUNIQL_TARGET_VERSION")]
    pub target_version: Option<String>,

    /// Create the database when it does not exist
    #[arg(short = 'a', long, env = "YUNIQL_AUTO_CREATE_DB", default_value = "false")]
    pub auto_create_db: bool,

    /// Token replaced in scripts, as KEY=VALUE
    #[arg(short = 'k', long = "token", value_parser = yuniql::parse_token)]
    pub tokens: Vec<(String, String)>,

    /// Field separator of CSV files
    #[arg(long)]
    pub bulk_separator: Option<char>,

    /// Rows per INSERT batch when loading CSV files
    #[arg(long)]
    pub bulk_batch_size: Option<usize>,

    /// Free-form text stored with every applied version
    #[arg(long)]
    pub additional_artifacts: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct EraseArgs {
    #[command(flatten)]
    pub db: DbArgs,

    /// Token replaced in scripts, as KEY=VALUE
    #[arg(short = 'k', long = "token", value_parser = yuniql::parse_token)]
    pub tokens: Vec<(String, String)>,
}

/// An Error occurred while running a command
#[derive(Debug, Error)]
pub enum CliError {
    #[error("unknown command")]
    UnknownCommand,

    #[error("missing connection string, use --connection-string or YUNIQL_CONNECTION_STRING")]
    MissingConnectionString,

    #[error(transparent)]
    IoError(std::io::Error),

    #[error(transparent)]
    MigratorError(MigratorError),

    #[error(transparent)]
    TimeError(time::Error),
}

impl From<MigratorError> for CliError {
    fn from(err: MigratorError) -> CliError {
        CliError::MigratorError(err)
    }
}

impl From<WorkspaceError> for CliError {
    fn from(err: WorkspaceError) -> CliError {
        CliError::MigratorError(MigratorError::Workspace(err))
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> CliError {
        CliError::IoError(err)
    }
}

impl From<time::error::Format> for CliError {
    fn from(err: time::error::Format) -> CliError {
        CliError::TimeError(time::Error::Format(err))
    }
}
