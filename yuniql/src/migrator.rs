use crate::bulk::{read_csv, table_name_for, BulkImportError};
use crate::drivers::{create_platform, Platform, Session};
use crate::version_log::{DbVersion, VersionStatus};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;
#[cfg(feature = "tokio-postgres")]
use tokio_postgres::error::Error as PgError;
use yuniql_core::version::version_directories;
use yuniql_core::workspace::{
    self, find_files, load_sql_scripts, version_script_groups, DRAFT_DIR, ERASE_DIR, INIT_DIR,
    POST_DIR, PRE_DIR,
};
use yuniql_core::{replace_tokens, LocalVersion, ScriptFile, VersionDirectory, WorkspaceError};

pub const DEFAULT_META_TABLE_NAME: &str = "__yuniql_schema_version";

/// An Error occurred during a migration run
#[derive(Debug, Error)]
pub enum MigratorError {
    #[error(transparent)]
    Workspace(WorkspaceError),

    #[error("unsupported platform `{platform}` (supported: postgresql, sqlserver, mysql)")]
    UnsupportedPlatform { platform: String },

    #[error("database `{database}` does not exist, create it manually or enable auto create")]
    DatabaseNotFound { database: String },

    #[error("script `{}` failed: {source}\nstatement:\n{statement}", .path.display())]
    ScriptExecution {
        path: PathBuf,
        statement: String,
        source: Box<MigratorError>,
    },

    #[error("bulk import of `{}` failed: {source}", .path.display())]
    BulkImport {
        path: PathBuf,
        source: BulkImportError,
    },

    #[error("platform `{platform}` does not support transactional DDL, verify is not available")]
    VerifyNotSupported { platform: String },

    #[error("command timed out after {seconds} s")]
    CommandTimeout { seconds: u64 },

    #[error("invalid connection string: {0}")]
    ConnectionString(String),

    #[error("invalid row in schema version table: {0}")]
    InvalidVersionRow(String),

    #[error("cannot load configuration `{}`: {message}", .path.display())]
    ConfigFile { path: PathBuf, message: String },

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Io(std::io::Error),

    #[cfg(feature = "tokio-postgres")]
    #[error(transparent)]
    PgError(PgError),

    #[cfg(feature = "mysql_async")]
    #[error(transparent)]
    MySqlError(mysql_async::Error),

    #[cfg(feature = "tiberius")]
    #[error(transparent)]
    MssqlError(tiberius::error::Error),
}

impl MigratorError {
    /// The innermost error, past any script context.
    pub fn root(&self) -> &MigratorError {
        match self {
            MigratorError::ScriptExecution { source, .. } => source.root(),
            other => other,
        }
    }

    /// Path of the script or CSV file that failed, if any.
    pub fn script_path(&self) -> Option<&Path> {
        match self {
            MigratorError::ScriptExecution { path, .. }
            | MigratorError::BulkImport { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<WorkspaceError> for MigratorError {
    fn from(err: WorkspaceError) -> MigratorError {
        MigratorError::Workspace(err)
    }
}

impl From<std::io::Error> for MigratorError {
    fn from(err: std::io::Error) -> MigratorError {
        MigratorError::Io(err)
    }
}

#[cfg(feature = "tokio-postgres")]
impl From<PgError> for MigratorError {
    fn from(err: PgError) -> MigratorError {
        MigratorError::PgError(err)
    }
}

#[cfg(feature = "mysql_async")]
impl From<mysql_async::Error> for MigratorError {
    fn from(err: mysql_async::Error) -> MigratorError {
        MigratorError::MySqlError(err)
    }
}

#[cfg(feature = "tiberius")]
impl From<tiberius::error::Error> for MigratorError {
    fn from(err: tiberius::error::Error) -> MigratorError {
        MigratorError::MssqlError(err)
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize, serde::Serialize),
    serde(default)
)]
pub struct Config {
    /// Workspace root holding `_init`, `_pre`, `v*.*`, `_draft`, `_post` and `_erase`.
    pub workspace: PathBuf,

    /// Platform key: `postgresql`, `sqlserver` or `mysql`.
    pub platform: String,

    pub connection_string: String,

    /// Highest version to apply (if not defined apply all).
    pub target_version: Option<String>,

    /// Create the target database when it does not exist.
    pub auto_create_database: bool,

    /// Values for `${KEY}` placeholders in scripts.
    pub tokens: BTreeMap<String, String>,

    /// Run everything, then roll back.
    pub verify_only: bool,

    /// Schema of the schema version table (if not defined use the platform default).
    pub meta_schema_name: Option<String>,

    /// Name of the schema version table (if not defined use `__yuniql_schema_version`).
    pub meta_table_name: Option<String>,

    pub bulk_separator: char,

    /// Rows per batch for platforms that load CSV files with `INSERT`.
    pub bulk_batch_size: usize,

    /// Upper bound for every statement and bulk load.
    pub command_timeout_secs: Option<u64>,

    pub applied_by_tool: String,

    pub applied_by_tool_version: String,

    /// Free-form text stored with every applied version.
    pub additional_artifacts: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workspace: PathBuf::from("."),
            platform: "postgresql".to_string(),
            connection_string: String::new(),
            target_version: None,
            auto_create_database: false,
            tokens: BTreeMap::new(),
            verify_only: false,
            meta_schema_name: None,
            meta_table_name: None,
            bulk_separator: ',',
            bulk_batch_size: 1000,
            command_timeout_secs: None,
            applied_by_tool: "yuniql".to_string(),
            applied_by_tool_version: env!("CARGO_PKG_VERSION").to_string(),
            additional_artifacts: None,
        }
    }
}

impl Config {
    pub fn effective_meta_table_name(&self) -> &str {
        self.meta_table_name
            .as_deref()
            .unwrap_or(DEFAULT_META_TABLE_NAME)
    }

    pub fn effective_meta_schema_name<'a>(&'a self, platform: &'a dyn Platform) -> Option<&'a str> {
        self.meta_schema_name
            .as_deref()
            .or_else(|| platform.default_schema())
    }

    /// Parsed target version, an empty string meaning no bound.
    pub fn effective_target_version(&self) -> Result<Option<LocalVersion>, MigratorError> {
        match self.target_version.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(version) => Ok(Some(LocalVersion::from_str(version)?)),
        }
    }

    #[cfg(feature = "toml")]
    pub fn from_toml_file(path: &Path) -> Result<Config, MigratorError> {
        let config_error = |message: String| MigratorError::ConfigFile {
            path: path.to_path_buf(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
        toml::from_str(&text).map_err(|e| config_error(e.to_string()))
    }
}

/// Outcome of [`Migrator::run`] and [`Migrator::verify`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    pub database_created: bool,
    pub metadata_created: bool,
    pub verify_only: bool,
    pub target_version: Option<LocalVersion>,
    /// Versions applied by this run, in order. Rolled back again when `verify_only`.
    pub applied_versions: Vec<LocalVersion>,
    pub current_version: Option<LocalVersion>,
    pub statements: usize,
    pub bulk_rows: u64,
}

impl RunReport {
    pub fn is_up_to_date(&self) -> bool {
        self.applied_versions.is_empty()
    }
}

/// Version being applied while phases run, kept for failure bookkeeping.
struct InProgress {
    row_version: String,
    update: bool,
    checksum: String,
    started: Instant,
}

const META_DB_NAME: &str = "YUNIQL_DB_NAME";
const META_SCHEMA_NAME: &str = "YUNIQL_SCHEMA_NAME";
const META_TABLE_NAME: &str = "YUNIQL_TABLE_NAME";

/// Applies a workspace to one database.
///
/// A run walks the phases `_init` (first run only), `_pre`, every pending version
/// directory, `_draft` and `_post` on a single session. Platforms with
/// transactional DDL wrap the whole walk in one transaction.
pub struct Migrator {
    config: Config,
    platform: Box<dyn Platform>,
}

impl Migrator {
    pub fn new(config: Config, platform: Box<dyn Platform>) -> Self {
        Migrator { config, platform }
    }

    /// Build the platform named by `config.platform`.
    pub fn from_config(config: Config) -> Result<Self, MigratorError> {
        let platform = create_platform(&config.platform, &config.connection_string)?;
        Ok(Migrator::new(config, platform))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    fn meta_tokens(&self) -> BTreeMap<String, String> {
        let mut tokens = BTreeMap::new();
        tokens.insert(
            META_DB_NAME.to_string(),
            self.platform.connection_info().database,
        );
        tokens.insert(
            META_SCHEMA_NAME.to_string(),
            self.config
                .effective_meta_schema_name(self.platform.as_ref())
                .unwrap_or_default()
                .to_string(),
        );
        tokens.insert(
            META_TABLE_NAME.to_string(),
            self.config.effective_meta_table_name().to_string(),
        );
        tokens
    }

    fn template(&self, sql: &str) -> String {
        replace_tokens(&self.meta_tokens(), sql)
    }

    async fn bounded<T>(
        &self,
        command: impl Future<Output = Result<T, MigratorError>>,
    ) -> Result<T, MigratorError> {
        match self.config.command_timeout_secs {
            Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), command)
                .await
                .map_err(|_| MigratorError::CommandTimeout { seconds })?,
            None => command.await,
        }
    }

    /// Apply every pending version up to the target.
    pub async fn run(&self) -> Result<RunReport, MigratorError> {
        self.execute(self.config.verify_only).await
    }

    /// Apply every pending version up to the target, then roll everything back.
    pub async fn verify(&self) -> Result<RunReport, MigratorError> {
        self.execute(true).await
    }

    async fn execute(&self, verify_only: bool) -> Result<RunReport, MigratorError> {
        let root = &self.config.workspace;
        workspace::validate(root)?;
        let transactional = self.platform.is_transactional_ddl_supported();
        if verify_only && !transactional {
            return Err(MigratorError::VerifyNotSupported {
                platform: self.platform.name().to_string(),
            });
        }
        let target = self.config.effective_target_version()?;
        let local_versions = version_directories(root)?;

        info!(
            "{} {} on {} ({})",
            if verify_only { "Verifying" } else { "Running" },
            root.display(),
            self.platform.connection_info(),
            self.platform.name()
        );

        let mut report = RunReport {
            verify_only,
            target_version: target,
            ..RunReport::default()
        };
        report.database_created = self
            .ensure_database(self.config.auto_create_database && !verify_only)
            .await?;

        let templates = self.platform.templates();
        let mut session = self.platform.connect().await?;
        let metadata_exists = session
            .exists(&self.template(templates.check_metadata_exists))
            .await?;
        let rows = if metadata_exists {
            session
                .query_versions(&self.template(templates.get_all_versions))
                .await?
        } else {
            Vec::new()
        };

        let mut applied = BTreeSet::new();
        let mut failed = BTreeMap::new();
        for row in &rows {
            let version = row.local_version()?;
            if row.is_successful() {
                applied.insert(version);
            } else {
                failed.insert(version, row.version.clone());
            }
        }
        report.current_version = applied.last().copied();

        let bound = target.or_else(|| local_versions.last().map(|dir| dir.version));
        if let (Some(current), Some(bound)) = (report.current_version, bound) {
            if current >= bound {
                info!("Database is already at {}, nothing to do", current);
                return Ok(report);
            }
        }
        let pending: Vec<&VersionDirectory> = local_versions
            .iter()
            .filter(|dir| !applied.contains(&dir.version))
            .filter(|dir| bound.map_or(true, |bound| dir.version <= bound))
            .collect();

        if transactional {
            session.begin().await?;
        }
        let mut in_progress = None;
        let outcome = self
            .run_phases(
                session.as_mut(),
                !metadata_exists,
                &pending,
                &failed,
                &mut report,
                &mut in_progress,
            )
            .await;

        match outcome {
            Ok(()) if verify_only => {
                session.rollback().await?;
                info!(
                    "Verified {} version(s), all changes rolled back",
                    report.applied_versions.len()
                );
                Ok(report)
            }
            Ok(()) => {
                if transactional {
                    session.commit().await?;
                }
                info!(
                    "Applied {} version(s), database is at {}",
                    report.applied_versions.len(),
                    report
                        .current_version
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
                Ok(report)
            }
            Err(err) => {
                if let Some(detail) = self.platform.try_parse_error(&err) {
                    error!("Database error {}", detail);
                }
                if transactional {
                    warn!("Rolling back all changes of this run");
                    if let Err(rollback_err) = session.rollback().await {
                        error!("Rollback failed: {}", rollback_err);
                    }
                } else if let Some(progress) = in_progress {
                    self.record_failure(session.as_mut(), progress, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn run_phases(
        &self,
        session: &mut dyn Session,
        create_metadata: bool,
        pending: &[&VersionDirectory],
        failed: &BTreeMap<LocalVersion, String>,
        report: &mut RunReport,
        in_progress: &mut Option<InProgress>,
    ) -> Result<(), MigratorError> {
        let root = &self.config.workspace;
        if create_metadata {
            let sql = self.template(self.platform.templates().create_metadata);
            session.execute(&sql).await?;
            report.metadata_created = true;
            info!(
                "Created schema version table {}",
                self.config.effective_meta_table_name()
            );
            report.statements += self.run_directory(session, &root.join(INIT_DIR)).await?;
        }
        report.statements += self.run_directory(session, &root.join(PRE_DIR)).await?;

        for dir in pending {
            info!("Applying {}", dir.name);
            let groups = version_script_groups(&dir.path)?;
            let checksum = workspace::checksum(groups.iter().flat_map(|(_, scripts)| scripts));
            let (row_version, update) = match failed.get(&dir.version) {
                Some(recorded) => (recorded.clone(), true),
                None => (dir.name.clone(), false),
            };
            *in_progress = Some(InProgress {
                row_version,
                update,
                checksum,
                started: Instant::now(),
            });

            for (group_dir, scripts) in &groups {
                for script in scripts {
                    report.statements += self.run_script(session, script).await?;
                }
                for csv in find_files(group_dir, "csv")? {
                    report.bulk_rows += self.import_csv(session, &csv).await?;
                }
            }

            if let Some(progress) = in_progress.take() {
                let row = self.version_row(&progress, VersionStatus::Successful);
                self.write_version(session, &row, progress.update).await?;
                debug!("Recorded {}", row);
            }
            report.applied_versions.push(dir.version);
            report.current_version = Some(dir.version);
        }

        report.statements += self.run_directory(session, &root.join(DRAFT_DIR)).await?;
        report.statements += self.run_directory(session, &root.join(POST_DIR)).await?;
        Ok(())
    }

    async fn run_directory(
        &self,
        session: &mut dyn Session,
        dir: &Path,
    ) -> Result<usize, MigratorError> {
        let mut statements = 0;
        for script in load_sql_scripts(dir)? {
            statements += self.run_script(session, &script).await?;
        }
        Ok(statements)
    }

    async fn run_script(
        &self,
        session: &mut dyn Session,
        script: &ScriptFile,
    ) -> Result<usize, MigratorError> {
        info!("Executing {}", script.path.display());
        let mut statements = 0;
        for statement in self.platform.split(&script.sql) {
            let statement = replace_tokens(&self.config.tokens, &statement);
            debug!("{}", statement);
            if let Err(err) = self.bounded(session.execute(&statement)).await {
                return Err(MigratorError::ScriptExecution {
                    path: script.path.clone(),
                    statement,
                    source: Box::new(err),
                });
            }
            statements += 1;
        }
        Ok(statements)
    }

    async fn import_csv(
        &self,
        session: &mut dyn Session,
        path: &Path,
    ) -> Result<u64, MigratorError> {
        let bulk_error = |source| MigratorError::BulkImport {
            path: path.to_path_buf(),
            source,
        };
        let table = table_name_for(path, self.platform.default_schema()).map_err(bulk_error)?;
        let data = read_csv(path, self.config.bulk_separator).map_err(bulk_error)?;
        info!(
            "Importing {} ({} rows) into {}",
            path.display(),
            data.rows.len(),
            table
        );
        self.bounded(session.bulk_import(&table, &data, self.config.bulk_batch_size))
            .await
            .map_err(|err| match err {
                err @ MigratorError::BulkImport { .. } => err,
                err => MigratorError::ScriptExecution {
                    path: path.to_path_buf(),
                    statement: format!("bulk import into {}", table),
                    source: Box::new(err),
                },
            })
    }

    fn version_row(&self, progress: &InProgress, status: VersionStatus) -> DbVersion {
        let mut row = DbVersion::new(
            progress.row_version.clone(),
            status,
            self.config.applied_by_tool.clone(),
            self.config.applied_by_tool_version.clone(),
        );
        row.duration_ms = i64::try_from(progress.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        row.checksum = progress.checksum.clone();
        row.additional_artifacts = self.config.additional_artifacts.clone();
        row
    }

    async fn write_version(
        &self,
        session: &mut dyn Session,
        row: &DbVersion,
        update: bool,
    ) -> Result<(), MigratorError> {
        let templates = self.platform.templates();
        let sql = if update {
            templates.update_version
        } else {
            templates.insert_version
        };
        session.write_version(&self.template(sql), row).await
    }

    /// Keep a `Failed` row so an operator can see where a non-transactional run stopped.
    async fn record_failure(
        &self,
        session: &mut dyn Session,
        progress: InProgress,
        err: &MigratorError,
    ) {
        let mut row = self.version_row(&progress, VersionStatus::Failed);
        row.failed_script_path = err.script_path().map(|p| p.display().to_string());
        row.failed_script_error = Some(err.root().to_string());
        match self.write_version(session, &row, progress.update).await {
            Ok(()) => warn!("Recorded {} as Failed", row.version),
            Err(write_err) => error!("Cannot record failure of {}: {}", row.version, write_err),
        }
    }

    async fn ensure_database(&self, allow_create: bool) -> Result<bool, MigratorError> {
        let templates = self.platform.templates();
        let database = self.platform.connection_info().database;
        let mut admin = self.platform.connect_admin().await?;
        if admin
            .exists(&self.template(templates.check_database_exists))
            .await?
        {
            return Ok(false);
        }
        if !allow_create {
            return Err(MigratorError::DatabaseNotFound { database });
        }
        admin
            .execute(&self.template(templates.create_database))
            .await?;
        info!("Created database {}", database);
        Ok(true)
    }

    /// Run the `_erase` scripts, in one transaction where the platform allows it.
    pub async fn erase(&self) -> Result<usize, MigratorError> {
        let root = &self.config.workspace;
        workspace::validate(root)?;
        let transactional = self.platform.is_transactional_ddl_supported();
        info!(
            "Erasing {} ({})",
            self.platform.connection_info(),
            self.platform.name()
        );

        let mut session = self.platform.connect().await?;
        if transactional {
            session.begin().await?;
        }
        match self
            .run_directory(session.as_mut(), &root.join(ERASE_DIR))
            .await
        {
            Ok(statements) => {
                if transactional {
                    session.commit().await?;
                }
                info!("Erase completed, {} statement(s) executed", statements);
                Ok(statements)
            }
            Err(err) => {
                if let Some(detail) = self.platform.try_parse_error(&err) {
                    error!("Database error {}", detail);
                }
                if transactional {
                    warn!("Rolling back erase");
                    if let Err(rollback_err) = session.rollback().await {
                        error!("Rollback failed: {}", rollback_err);
                    }
                }
                Err(err)
            }
        }
    }

    /// Every row of the schema version table, empty when the table does not exist yet.
    pub async fn list(&self) -> Result<Vec<DbVersion>, MigratorError> {
        let templates = self.platform.templates();
        let mut session = self.platform.connect().await?;
        if !session
            .exists(&self.template(templates.check_metadata_exists))
            .await?
        {
            return Ok(Vec::new());
        }
        session
            .query_versions(&self.template(templates.get_all_versions))
            .await
    }

    pub async fn current_version(&self) -> Result<Option<String>, MigratorError> {
        let templates = self.platform.templates();
        let mut session = self.platform.connect().await?;
        if !session
            .exists(&self.template(templates.check_metadata_exists))
            .await?
        {
            return Ok(None);
        }
        session
            .query_string(&self.template(templates.get_current_version))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.effective_meta_table_name(), "__yuniql_schema_version");
        assert_eq!(config.bulk_separator, ',');
        assert_eq!(config.bulk_batch_size, 1000);
        assert_eq!(config.effective_target_version().unwrap(), None);
    }

    #[test]
    fn empty_target_means_no_bound() {
        let mut config = Config {
            target_version: Some("  ".to_string()),
            ..Config::default()
        };
        assert_eq!(config.effective_target_version().unwrap(), None);
        config.target_version = Some("v1.9".to_string());
        assert_eq!(
            config.effective_target_version().unwrap(),
            Some(LocalVersion::new(1, 9))
        );
        config.target_version = Some("1.9".to_string());
        assert!(matches!(
            config.effective_target_version(),
            Err(MigratorError::Workspace(WorkspaceError::VersionParsing { .. }))
        ));
    }

    #[test]
    fn root_skips_script_context() {
        let err = MigratorError::ScriptExecution {
            path: PathBuf::from("v1.00/b.sql"),
            statement: "SELECT 1".to_string(),
            source: Box::new(MigratorError::CommandTimeout { seconds: 5 }),
        };
        assert!(matches!(
            err.root(),
            MigratorError::CommandTimeout { seconds: 5 }
        ));
        assert_eq!(err.script_path(), Some(Path::new("v1.00/b.sql")));
        assert!(err.to_string().contains("statement:\nSELECT 1"));
    }

    #[cfg(feature = "toml")]
    #[test]
    fn config_from_toml_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("yuniql.toml");
        std::fs::write(
            &path,
            r#"
workspace = "db"
platform = "sqlserver"
connection_string = "server=localhost;database=shop"
target_version = "v1.02"
auto_create_database = true
meta_table_name = "schema_history"
bulk_separator = ";"

[tokens]
SCHEMA = "sales"
"#,
        )
        .unwrap();

        let config = Config::from_toml_file(&path).unwrap();
        assert_eq!(config.workspace, PathBuf::from("db"));
        assert_eq!(config.platform, "sqlserver");
        assert!(config.auto_create_database);
        assert_eq!(config.effective_meta_table_name(), "schema_history");
        assert_eq!(config.bulk_separator, ';');
        assert_eq!(config.bulk_batch_size, 1000);
        assert_eq!(config.tokens.get("SCHEMA").map(String::as_str), Some("sales"));

        std::fs::write(&path, "bulk_batch_size = \"many\"").unwrap();
        assert!(matches!(
            Config::from_toml_file(&path),
            Err(MigratorError::ConfigFile { .. })
        ));
    }
}
