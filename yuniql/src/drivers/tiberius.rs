use super::{ConnectionInfo, Platform, Session, SqlTemplates};
use crate::bulk::{coerce, BulkImportError, CellValue, ColumnFamily, CsvData, TableName};
use crate::migrator::MigratorError;
use crate::version_log::DbVersion;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tiberius::numeric::Numeric;
use tiberius::{Client, ColumnData, Config as MssqlConfig, IntoSql, Query, TokenRow};
use time::macros::date;
use time::PrimitiveDateTime;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use yuniql_core::SplitStrategy;

static TEMPLATES: SqlTemplates = SqlTemplates {
    check_database_exists: "SELECT 1 FROM sys.databases WHERE name = N'${YUNIQL_DB_NAME}';",
    create_database: "CREATE DATABASE [${YUNIQL_DB_NAME}];",
    check_metadata_exists: "SELECT 1 FROM sys.tables t INNER JOIN sys.schemas s ON t.schema_id = s.schema_id WHERE s.name = N'${YUNIQL_SCHEMA_NAME}' AND t.name = N'${YUNIQL_TABLE_NAME}';",
    create_metadata: "CREATE TABLE [${YUNIQL_SCHEMA_NAME}].[${YUNIQL_TABLE_NAME}](
    sequence_id BIGINT IDENTITY(1,1) NOT NULL,
    version NVARCHAR(190) NOT NULL,
    applied_on_utc DATETIME2 NOT NULL,
    applied_by_user NVARCHAR(128) NOT NULL,
    applied_by_tool NVARCHAR(32) NOT NULL,
    applied_by_tool_version NVARCHAR(16) NOT NULL,
    status NVARCHAR(32) NOT NULL,
    duration_ms BIGINT NOT NULL,
    checksum NVARCHAR(64) NOT NULL,
    failed_script_path NVARCHAR(4000) NULL,
    failed_script_error NVARCHAR(MAX) NULL,
    additional_artifacts NVARCHAR(MAX) NULL,
    CONSTRAINT PK_${YUNIQL_TABLE_NAME} PRIMARY KEY (sequence_id),
    CONSTRAINT IX_${YUNIQL_TABLE_NAME} UNIQUE (version)
);",
    get_current_version: "SELECT TOP 1 version FROM [${YUNIQL_SCHEMA_NAME}].[${YUNIQL_TABLE_NAME}] WHERE status = N'Successful' ORDER BY sequence_id DESC;",
    get_all_versions: "SELECT sequence_id, version, applied_on_utc, applied_by_user, applied_by_tool, applied_by_tool_version, status, duration_ms, checksum, failed_script_path, failed_script_error, additional_artifacts FROM [${YUNIQL_SCHEMA_NAME}].[${YUNIQL_TABLE_NAME}] ORDER BY sequence_id ASC;",
    insert_version: "INSERT INTO [${YUNIQL_SCHEMA_NAME}].[${YUNIQL_TABLE_NAME}] (version, applied_on_utc, applied_by_user, applied_by_tool, applied_by_tool_version, status, duration_ms, checksum, failed_script_path, failed_script_error, additional_artifacts) VALUES (@P1, SYSUTCDATETIME(), SUSER_SNAME(), @P2, @P3, @P4, @P5, @P6, @P7, @P8, @P9);",
    update_version: "UPDATE [${YUNIQL_SCHEMA_NAME}].[${YUNIQL_TABLE_NAME}] SET applied_on_utc = SYSUTCDATETIME(), applied_by_user = SUSER_SNAME(), applied_by_tool = @P2, applied_by_tool_version = @P3, status = @P4, duration_ms = @P5, checksum = @P6, failed_script_path = @P7, failed_script_error = @P8, additional_artifacts = @P9 WHERE version = @P1;",
};

const COLUMNS_QUERY: &str = "SELECT c.name, t.name FROM sys.columns c \
    INNER JOIN sys.types t ON c.user_type_id = t.user_type_id \
    WHERE c.object_id = OBJECT_ID(@P1) AND c.is_identity = 0 AND c.is_computed = 0 \
    AND t.name NOT IN ('timestamp', 'rowversion') \
    ORDER BY c.column_id;";

type MssqlClient = Client<Compat<TcpStream>>;

/// Data source, port and database of an ADO.NET style connection string.
fn parse_ado(connection_string: &str) -> ConnectionInfo {
    let mut info = ConnectionInfo {
        data_source: "localhost".to_string(),
        database: String::new(),
        port: None,
    };
    for pair in connection_string.split(';') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "server" | "data source" | "address" | "addr" | "network address" => {
                let value = value.strip_prefix("tcp:").unwrap_or(value);
                match value.split_once(',') {
                    Some((host, port)) => {
                        info.data_source = host.trim().to_string();
                        info.port = port.trim().parse().ok();
                    }
                    None => info.data_source = value.to_string(),
                }
            }
            "database" | "initial catalog" => info.database = value.to_string(),
            _ => {}
        }
    }
    info
}

pub struct SqlServerPlatform {
    config: MssqlConfig,
    info: ConnectionInfo,
    split_strategy: SplitStrategy,
}

impl SqlServerPlatform {
    /// Accepts ADO.NET connection strings (`Server=...;Database=...;User Id=...`).
    pub fn new(connection_string: &str) -> Result<Self, MigratorError> {
        let config = MssqlConfig::from_ado_string(connection_string)
            .map_err(|e| MigratorError::ConnectionString(e.to_string()))?;
        let info = parse_ado(connection_string);
        if info.database.is_empty() {
            return Err(MigratorError::ConnectionString(
                "missing Database or Initial Catalog".to_string(),
            ));
        }
        Ok(SqlServerPlatform {
            config,
            info,
            split_strategy: SplitStrategy::go(),
        })
    }

    async fn open(config: MssqlConfig) -> Result<Box<dyn Session>, MigratorError> {
        let tcp = TcpStream::connect(config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        let client = Client::connect(config, tcp.compat_write()).await?;
        Ok(Box::new(SqlServerSession { client }))
    }
}

#[async_trait]
impl Platform for SqlServerPlatform {
    fn name(&self) -> &'static str {
        "sqlserver"
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.info.clone()
    }

    fn default_schema(&self) -> Option<&'static str> {
        Some("dbo")
    }

    fn is_transactional_ddl_supported(&self) -> bool {
        true
    }

    fn split_strategy(&self) -> &SplitStrategy {
        &self.split_strategy
    }

    fn templates(&self) -> &'static SqlTemplates {
        &TEMPLATES
    }

    async fn connect(&self) -> Result<Box<dyn Session>, MigratorError> {
        SqlServerPlatform::open(self.config.clone()).await
    }

    async fn connect_admin(&self) -> Result<Box<dyn Session>, MigratorError> {
        let mut config = self.config.clone();
        config.database("master");
        SqlServerPlatform::open(config).await
    }

    fn try_parse_error(&self, err: &MigratorError) -> Option<String> {
        match err.root() {
            MigratorError::MssqlError(tiberius::error::Error::Server(e)) => {
                Some(format!("{}: {}", e.code(), e.message()))
            }
            _ => None,
        }
    }
}

pub struct SqlServerSession {
    client: MssqlClient,
}

/// How a typed cell is written into a TDS bulk load row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wire {
    Native,
    /// `datetime`: days since 1900-01-01 and 1/300 second ticks.
    DateTime,
    /// `smalldatetime`: days since 1900-01-01 and minutes.
    SmallDateTime,
    /// `money` and `smallmoney`: four decimal places.
    Money,
}

fn mssql_column(data_type: &str) -> Option<(ColumnFamily, Wire)> {
    let column = match data_type {
        "bit" => (ColumnFamily::Boolean, Wire::Native),
        "tinyint" => (ColumnFamily::TinyInt, Wire::Native),
        "smallint" => (ColumnFamily::SmallInt, Wire::Native),
        "int" => (ColumnFamily::Integer, Wire::Native),
        "bigint" => (ColumnFamily::BigInt, Wire::Native),
        "real" => (ColumnFamily::Real, Wire::Native),
        "float" => (ColumnFamily::Double, Wire::Native),
        "decimal" | "numeric" => (ColumnFamily::Decimal, Wire::Native),
        "money" | "smallmoney" => (ColumnFamily::Decimal, Wire::Money),
        "date" => (ColumnFamily::Date, Wire::Native),
        "time" => (ColumnFamily::Time, Wire::Native),
        "datetime2" => (ColumnFamily::Timestamp, Wire::Native),
        "datetime" => (ColumnFamily::Timestamp, Wire::DateTime),
        "smalldatetime" => (ColumnFamily::Timestamp, Wire::SmallDateTime),
        "datetimeoffset" => (ColumnFamily::TimestampTz, Wire::Native),
        "uniqueidentifier" => (ColumnFamily::Uuid, Wire::Native),
        "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext" => {
            (ColumnFamily::Text, Wire::Native)
        }
        _ => return None,
    };
    Some(column)
}

const TICKS_PER_DAY: i128 = 24 * 60 * 60 * 300;

/// Days since 1900-01-01 and the time of day in nanoseconds.
fn legacy_parts(ts: PrimitiveDateTime) -> (i64, i128) {
    let days = (ts.date() - date!(1900 - 01 - 01)).whole_days();
    let nanos = (ts - ts.date().midnight()).whole_nanoseconds();
    (days, nanos)
}

fn legacy_datetime(ts: PrimitiveDateTime) -> Option<tiberius::time::DateTime> {
    if ts.year() < 1753 {
        return None;
    }
    let (mut days, nanos) = legacy_parts(ts);
    let mut ticks = (nanos * 3 + 5_000_000) / 10_000_000;
    if ticks >= TICKS_PER_DAY {
        days += 1;
        ticks -= TICKS_PER_DAY;
    }
    Some(tiberius::time::DateTime::new(
        i32::try_from(days).ok()?,
        u32::try_from(ticks).ok()?,
    ))
}

fn legacy_smalldatetime(ts: PrimitiveDateTime) -> Option<tiberius::time::SmallDateTime> {
    let (mut days, nanos) = legacy_parts(ts);
    let mut minutes = (nanos + 30_000_000_000) / 60_000_000_000;
    if minutes >= 24 * 60 {
        days += 1;
        minutes -= 24 * 60;
    }
    Some(tiberius::time::SmallDateTime::new(
        u16::try_from(days).ok()?,
        u16::try_from(minutes).ok()?,
    ))
}

fn money(value: Decimal) -> Numeric {
    let mut value = value.round_dp(4);
    value.rescale(4);
    Numeric::new_with_scale(value.mantissa(), 4)
}

/// `None` when the value does not fit the legacy column type.
fn column_data(value: CellValue, wire: Wire) -> Option<ColumnData<'static>> {
    let data = match (value, wire) {
        (CellValue::Timestamp(v), Wire::DateTime) => match v {
            Some(ts) => ColumnData::DateTime(Some(legacy_datetime(ts)?)),
            None => ColumnData::DateTime(None),
        },
        (CellValue::Timestamp(v), Wire::SmallDateTime) => match v {
            Some(ts) => ColumnData::SmallDateTime(Some(legacy_smalldatetime(ts)?)),
            None => ColumnData::SmallDateTime(None),
        },
        (CellValue::Decimal(v), Wire::Money) => ColumnData::Numeric(v.map(money)),
        (CellValue::Boolean(v), _) => v.into_sql(),
        (CellValue::TinyInt(v), _) => v.into_sql(),
        (CellValue::SmallInt(v), _) => v.into_sql(),
        (CellValue::Integer(v), _) => v.into_sql(),
        (CellValue::BigInt(v), _) => v.into_sql(),
        (CellValue::Real(v), _) => v.into_sql(),
        (CellValue::Double(v), _) => v.into_sql(),
        (CellValue::Decimal(v), _) => v.into_sql(),
        (CellValue::Date(v), _) => v.into_sql(),
        (CellValue::Time(v), _) => v.into_sql(),
        (CellValue::Timestamp(v), _) => v.into_sql(),
        (CellValue::TimestampTz(v), _) => v.into_sql(),
        (CellValue::Uuid(v), _) => v.into_sql(),
        (CellValue::Text(v), _) => v.into_sql(),
    };
    Some(data)
}

fn bulk_failure(data: &CsvData, source: BulkImportError) -> MigratorError {
    MigratorError::BulkImport {
        path: data.path.clone(),
        source,
    }
}

#[async_trait]
impl Session for SqlServerSession {
    async fn execute(&mut self, sql: &str) -> Result<(), MigratorError> {
        self.client.simple_query(sql).await?.into_results().await?;
        Ok(())
    }

    async fn exists(&mut self, sql: &str) -> Result<bool, MigratorError> {
        let rows = self
            .client
            .simple_query(sql)
            .await?
            .into_first_result()
            .await?;
        Ok(!rows.is_empty())
    }

    async fn query_string(&mut self, sql: &str) -> Result<Option<String>, MigratorError> {
        match self.client.simple_query(sql).await?.into_row().await? {
            Some(row) => Ok(row.try_get::<&str, usize>(0)?.map(str::to_string)),
            None => Ok(None),
        }
    }

    async fn query_versions(&mut self, sql: &str) -> Result<Vec<DbVersion>, MigratorError> {
        let rows = self
            .client
            .simple_query(sql)
            .await?
            .into_first_result()
            .await?;
        let text = |row: &tiberius::Row, index: usize| -> Result<Option<String>, MigratorError> {
            Ok(row.try_get::<&str, usize>(index)?.map(str::to_string))
        };
        let required = |row: &tiberius::Row, index: usize| -> Result<String, MigratorError> {
            text(row, index)?.ok_or_else(|| {
                MigratorError::InvalidVersionRow(format!("column {} is NULL", index))
            })
        };
        let mut versions = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            versions.push(DbVersion {
                sequence_id: row.try_get::<i64, usize>(0)?.unwrap_or_default(),
                version: required(row, 1)?,
                applied_on_utc: row.try_get::<PrimitiveDateTime, usize>(2)?,
                applied_by_user: required(row, 3)?,
                applied_by_tool: required(row, 4)?,
                applied_by_tool_version: required(row, 5)?,
                status: required(row, 6)?.parse()?,
                duration_ms: row.try_get::<i64, usize>(7)?.unwrap_or_default(),
                checksum: required(row, 8)?,
                failed_script_path: text(row, 9)?,
                failed_script_error: text(row, 10)?,
                additional_artifacts: text(row, 11)?,
            });
        }
        Ok(versions)
    }

    async fn write_version(&mut self, sql: &str, version: &DbVersion) -> Result<(), MigratorError> {
        let mut query = Query::new(sql);
        query.bind(version.version.as_str());
        query.bind(version.applied_by_tool.as_str());
        query.bind(version.applied_by_tool_version.as_str());
        query.bind(version.status.to_string());
        query.bind(version.duration_ms);
        query.bind(version.checksum.as_str());
        query.bind(version.failed_script_path.as_deref());
        query.bind(version.failed_script_error.as_deref());
        query.bind(version.additional_artifacts.as_deref());
        query.execute(&mut self.client).await?;
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), MigratorError> {
        self.execute("BEGIN TRANSACTION").await
    }

    async fn commit(&mut self) -> Result<(), MigratorError> {
        self.execute("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), MigratorError> {
        self.execute("IF @@TRANCOUNT > 0 ROLLBACK").await
    }

    /// TDS bulk load. Table columns missing from the file are sent as typed NULLs.
    async fn bulk_import(
        &mut self,
        table: &TableName,
        data: &CsvData,
        _batch_size: usize,
    ) -> Result<u64, MigratorError> {
        let target = table.to_string();
        let columns: Vec<(String, String)> = self
            .client
            .query(COLUMNS_QUERY, &[&target.as_str()])
            .await?
            .into_first_result()
            .await?
            .iter()
            .map(|row| -> Result<(String, String), MigratorError> {
                Ok((
                    row.try_get::<&str, usize>(0)?.unwrap_or_default().to_string(),
                    row.try_get::<&str, usize>(1)?.unwrap_or_default().to_string(),
                ))
            })
            .collect::<Result<_, _>>()?;
        if columns.is_empty() {
            return Err(bulk_failure(
                data,
                BulkImportError::TableNotFound { table: target },
            ));
        }
        for header in &data.headers {
            if !columns.iter().any(|(name, _)| name.eq_ignore_ascii_case(header)) {
                return Err(bulk_failure(
                    data,
                    BulkImportError::UnknownColumn {
                        table: target,
                        column: header.clone(),
                    },
                ));
            }
        }

        // (position in the csv row, family, wire) per destination column, in table order
        let mut layout = Vec::with_capacity(columns.len());
        for (name, data_type) in &columns {
            let (family, wire) = mssql_column(data_type).ok_or_else(|| {
                bulk_failure(
                    data,
                    BulkImportError::UnsupportedColumnType {
                        column: name.clone(),
                        data_type: data_type.clone(),
                    },
                )
            })?;
            layout.push((name.as_str(), data.column_index(name), family, wire));
        }

        let mut request = self.client.bulk_insert(&target).await?;
        for (index, cells) in data.rows.iter().enumerate() {
            let mut row = TokenRow::new();
            for (name, position, family, wire) in &layout {
                let cell = position.and_then(|p| cells.get(p)).and_then(|c| c.as_deref());
                let value = coerce(*family, name, index + 1, cell)
                    .map_err(|source| bulk_failure(data, source))?;
                let value = column_data(value, *wire).ok_or_else(|| {
                    bulk_failure(
                        data,
                        BulkImportError::InvalidValue {
                            row: index + 1,
                            column: name.to_string(),
                            value: cell.unwrap_or_default().to_string(),
                            family: *family,
                        },
                    )
                })?;
                row.push(value);
            }
            request.send(row).await?;
        }
        let result = request.finalize().await?;
        Ok(result.total())
    }
}
