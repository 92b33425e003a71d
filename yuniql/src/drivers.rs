#[cfg(feature = "tokio-postgres")]
mod tokio_postgres;

#[cfg(feature = "mysql_async")]
mod mysql_async;

#[cfg(feature = "tiberius")]
mod tiberius;

#[cfg(feature = "mysql_async")]
pub use self::mysql_async::MySqlPlatform;
#[cfg(feature = "tiberius")]
pub use self::tiberius::SqlServerPlatform;
#[cfg(feature = "tokio-postgres")]
pub use self::tokio_postgres::PostgresPlatform;

use crate::bulk::{CsvData, TableName};
use crate::migrator::MigratorError;
use crate::version_log::DbVersion;
use async_trait::async_trait;
use std::fmt;
use yuniql_core::SplitStrategy;

/// Where a connection string points, for display only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub data_source: String,
    pub database: String,
    pub port: Option<u16>,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}/{}", self.data_source, port, self.database),
            None => write!(f, "{}/{}", self.data_source, self.database),
        }
    }
}

/// SQL text a platform uses for bootstrap checks and the schema version table.
///
/// `${YUNIQL_DB_NAME}`, `${YUNIQL_SCHEMA_NAME}` and `${YUNIQL_TABLE_NAME}` are
/// replaced before execution. `insert_version` and `update_version` bind, in order:
/// version, tool, tool version, status, duration ms, checksum, failed script path,
/// failed script error and additional artifacts.
#[derive(Debug)]
pub struct SqlTemplates {
    pub check_database_exists: &'static str,
    pub create_database: &'static str,
    pub check_metadata_exists: &'static str,
    pub create_metadata: &'static str,
    pub get_current_version: &'static str,
    pub get_all_versions: &'static str,
    pub insert_version: &'static str,
    pub update_version: &'static str,
}

/// One open database connection.
#[async_trait]
pub trait Session: Send {
    /// Execute a statement (or a multi-statement script where the platform allows it).
    async fn execute(&mut self, sql: &str) -> Result<(), MigratorError>;

    /// True if the query returns at least one row.
    async fn exists(&mut self, sql: &str) -> Result<bool, MigratorError>;

    /// First column of the first row, if any.
    async fn query_string(&mut self, sql: &str) -> Result<Option<String>, MigratorError>;

    async fn query_versions(&mut self, sql: &str) -> Result<Vec<DbVersion>, MigratorError>;

    /// Run an insert or update template with the fields of `version` bound.
    async fn write_version(&mut self, sql: &str, version: &DbVersion) -> Result<(), MigratorError>;

    async fn begin(&mut self) -> Result<(), MigratorError>;

    async fn commit(&mut self) -> Result<(), MigratorError>;

    async fn rollback(&mut self) -> Result<(), MigratorError>;

    /// Load parsed CSV rows into `table`, returning the number of rows written.
    async fn bulk_import(
        &mut self,
        table: &TableName,
        data: &CsvData,
        batch_size: usize,
    ) -> Result<u64, MigratorError>;
}

/// Everything that differs between database families.
#[async_trait]
pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;

    fn connection_info(&self) -> ConnectionInfo;

    /// Schema used for the schema version table and for CSV files without one.
    fn default_schema(&self) -> Option<&'static str>;

    /// Whether DDL can be rolled back. Decides if a run is wrapped in one transaction.
    fn is_transactional_ddl_supported(&self) -> bool;

    fn split_strategy(&self) -> &SplitStrategy;

    fn split(&self, sql: &str) -> Vec<String> {
        self.split_strategy().split(sql)
    }

    fn templates(&self) -> &'static SqlTemplates;

    /// Connection to the target database.
    async fn connect(&self) -> Result<Box<dyn Session>, MigratorError>;

    /// Connection to an administrative database, used to check for and create the target.
    async fn connect_admin(&self) -> Result<Box<dyn Session>, MigratorError>;

    /// `"<code>: <message>"` when `err` wraps a server error of this platform.
    fn try_parse_error(&self, err: &MigratorError) -> Option<String>;
}

/// Create the platform registered under `platform`.
#[cfg_attr(
    not(any(feature = "tokio-postgres", feature = "mysql_async", feature = "tiberius")),
    allow(unused_variables)
)]
pub fn create_platform(
    platform: &str,
    connection_string: &str,
) -> Result<Box<dyn Platform>, MigratorError> {
    match platform.to_ascii_lowercase().as_str() {
        #[cfg(feature = "tokio-postgres")]
        "postgresql" | "postgres" => Ok(Box::new(PostgresPlatform::new(connection_string)?)),
        #[cfg(feature = "tiberius")]
        "sqlserver" | "mssql" => Ok(Box::new(SqlServerPlatform::new(connection_string)?)),
        #[cfg(feature = "mysql_async")]
        "mysql" | "mariadb" => Ok(Box::new(MySqlPlatform::new(connection_string)?)),
        _ => Err(MigratorError::UnsupportedPlatform {
            platform: platform.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_platform_is_unsupported() {
        match create_platform("oracle", "") {
            Err(MigratorError::UnsupportedPlatform { platform }) => assert_eq!(platform, "oracle"),
            Err(e) => panic!("unexpected error {}", e),
            Ok(p) => panic!("unexpected platform {}", p.name()),
        }
    }

    #[test]
    fn connection_info_display() {
        let info = ConnectionInfo {
            data_source: "localhost".to_string(),
            database: "shop".to_string(),
            port: Some(5432),
        };
        assert_eq!(info.to_string(), "localhost:5432/shop");
    }

    #[cfg(feature = "tokio-postgres")]
    #[test]
    fn postgres_from_connection_string() {
        let platform =
            create_platform("PostgreSQL", "host=db port=5433 user=app dbname=shop").unwrap();
        assert_eq!(platform.name(), "postgresql");
        assert!(platform.is_transactional_ddl_supported());
        assert_eq!(platform.default_schema(), Some("public"));
        assert_eq!(
            platform.connection_info(),
            ConnectionInfo {
                data_source: "db".to_string(),
                database: "shop".to_string(),
                port: Some(5433),
            }
        );
    }

    #[cfg(feature = "mysql_async")]
    #[test]
    fn mysql_from_connection_string() {
        let platform = create_platform("mysql", "mysql://app:secret@db:3307/shop").unwrap();
        assert!(!platform.is_transactional_ddl_supported());
        assert_eq!(platform.default_schema(), None);
        assert_eq!(platform.connection_info().to_string(), "db:3307/shop");
    }

    #[cfg(feature = "tiberius")]
    #[test]
    fn sqlserver_from_connection_string() {
        let platform = create_platform(
            "sqlserver",
            "Server=tcp:db,1434;Database=shop;User Id=sa;Password=secret;TrustServerCertificate=true",
        )
        .unwrap();
        assert!(platform.is_transactional_ddl_supported());
        assert_eq!(platform.default_schema(), Some("dbo"));
        assert_eq!(platform.connection_info().to_string(), "db:1434/shop");
        assert_eq!(
            platform.split("CREATE TABLE a(id INT)\nGO\nCREATE TABLE b(id INT)"),
            vec!["CREATE TABLE a(id INT)", "CREATE TABLE b(id INT)"]
        );
    }
}
