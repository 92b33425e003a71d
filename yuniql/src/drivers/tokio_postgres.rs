use super::{ConnectionInfo, Platform, Session, SqlTemplates};
use crate::bulk::{coerce, BulkImportError, CellValue, ColumnFamily, CsvData, TableName};
use crate::migrator::MigratorError;
use crate::version_log::DbVersion;
use async_trait::async_trait;
use futures::pin_mut;
use std::str::FromStr;
use time::PrimitiveDateTime;
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::config::Host;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use yuniql_core::SplitStrategy;

static TEMPLATES: SqlTemplates = SqlTemplates {
    check_database_exists: "SELECT 1 FROM pg_database WHERE datname = '${YUNIQL_DB_NAME}';",
    create_database: "CREATE DATABASE \"${YUNIQL_DB_NAME}\";",
    check_metadata_exists: "SELECT 1 FROM pg_tables WHERE schemaname = '${YUNIQL_SCHEMA_NAME}' AND tablename = '${YUNIQL_TABLE_NAME}';",
    create_metadata: "CREATE SCHEMA IF NOT EXISTS \"${YUNIQL_SCHEMA_NAME}\";
CREATE TABLE \"${YUNIQL_SCHEMA_NAME}\".\"${YUNIQL_TABLE_NAME}\"(
    sequence_id bigint GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    version varchar(190) NOT NULL,
    applied_on_utc timestamp NOT NULL DEFAULT (now() AT TIME ZONE 'UTC'),
    applied_by_user varchar(128) NOT NULL DEFAULT current_user,
    applied_by_tool varchar(32) NOT NULL,
    applied_by_tool_version varchar(16) NOT NULL,
    status varchar(32) NOT NULL,
    duration_ms bigint NOT NULL,
    checksum varchar(64) NOT NULL,
    failed_script_path varchar(4000) NULL,
    failed_script_error text NULL,
    additional_artifacts text NULL,
    CONSTRAINT \"ix_${YUNIQL_TABLE_NAME}\" UNIQUE (version)
);",
    get_current_version: "SELECT version FROM \"${YUNIQL_SCHEMA_NAME}\".\"${YUNIQL_TABLE_NAME}\" WHERE status = 'Successful' ORDER BY sequence_id DESC LIMIT 1;",
    get_all_versions: "SELECT sequence_id, version, applied_on_utc, applied_by_user, applied_by_tool, applied_by_tool_version, status, duration_ms, checksum, failed_script_path, failed_script_error, additional_artifacts FROM \"${YUNIQL_SCHEMA_NAME}\".\"${YUNIQL_TABLE_NAME}\" ORDER BY sequence_id ASC;",
    insert_version: "INSERT INTO \"${YUNIQL_SCHEMA_NAME}\".\"${YUNIQL_TABLE_NAME}\" (version, applied_on_utc, applied_by_user, applied_by_tool, applied_by_tool_version, status, duration_ms, checksum, failed_script_path, failed_script_error, additional_artifacts) VALUES ($1, now() AT TIME ZONE 'UTC', current_user, $2, $3, $4, $5, $6, $7, $8, $9);",
    update_version: "UPDATE \"${YUNIQL_SCHEMA_NAME}\".\"${YUNIQL_TABLE_NAME}\" SET applied_on_utc = now() AT TIME ZONE 'UTC', applied_by_user = current_user, applied_by_tool = $2, applied_by_tool_version = $3, status = $4, duration_ms = $5, checksum = $6, failed_script_path = $7, failed_script_error = $8, additional_artifacts = $9 WHERE version = $1;",
};

pub struct PostgresPlatform {
    config: PgConfig,
    split_strategy: SplitStrategy,
}

impl PostgresPlatform {
    /// Accepts key/value (`host=... dbname=...`) and URL (`postgresql://...`) forms.
    pub fn new(connection_string: &str) -> Result<Self, MigratorError> {
        let config = PgConfig::from_str(connection_string)
            .map_err(|e| MigratorError::ConnectionString(e.to_string()))?;
        if config.get_dbname().is_none() {
            return Err(MigratorError::ConnectionString(
                "missing database name (dbname)".to_string(),
            ));
        }
        Ok(PostgresPlatform {
            config,
            split_strategy: SplitStrategy::Identity,
        })
    }

    async fn open(config: &PgConfig) -> Result<Box<dyn Session>, MigratorError> {
        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("connection error: {}", e);
            }
        });
        Ok(Box::new(PostgresSession { client }))
    }
}

#[async_trait]
impl Platform for PostgresPlatform {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn connection_info(&self) -> ConnectionInfo {
        let data_source = match self.config.get_hosts().first() {
            Some(Host::Tcp(host)) => host.clone(),
            Some(other) => format!("{:?}", other),
            None => "localhost".to_string(),
        };
        ConnectionInfo {
            data_source,
            database: self.config.get_dbname().unwrap_or_default().to_string(),
            port: self.config.get_ports().first().copied(),
        }
    }

    fn default_schema(&self) -> Option<&'static str> {
        Some("public")
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
        PostgresPlatform::open(&self.config).await
    }

    async fn connect_admin(&self) -> Result<Box<dyn Session>, MigratorError> {
        let mut config = self.config.clone();
        config.dbname("postgres");
        PostgresPlatform::open(&config).await
    }

    fn try_parse_error(&self, err: &MigratorError) -> Option<String> {
        match err.root() {
            MigratorError::PgError(e) => e
                .as_db_error()
                .map(|db| format!("{}: {}", db.code().code(), db.message())),
            _ => None,
        }
    }
}

pub struct PostgresSession {
    client: Client,
}

fn pg_family(ty: &Type) -> Option<ColumnFamily> {
    let family = match ty {
        t if *t == Type::BOOL => ColumnFamily::Boolean,
        t if *t == Type::INT2 => ColumnFamily::SmallInt,
        t if *t == Type::INT4 => ColumnFamily::Integer,
        t if *t == Type::INT8 => ColumnFamily::BigInt,
        t if *t == Type::FLOAT4 => ColumnFamily::Real,
        t if *t == Type::FLOAT8 => ColumnFamily::Double,
        t if *t == Type::NUMERIC => ColumnFamily::Decimal,
        t if *t == Type::DATE => ColumnFamily::Date,
        t if *t == Type::TIME => ColumnFamily::Time,
        t if *t == Type::TIMESTAMP => ColumnFamily::Timestamp,
        t if *t == Type::TIMESTAMPTZ => ColumnFamily::TimestampTz,
        t if *t == Type::UUID => ColumnFamily::Uuid,
        t if *t == Type::TEXT
            || *t == Type::VARCHAR
            || *t == Type::BPCHAR
            || *t == Type::NAME =>
        {
            ColumnFamily::Text
        }
        _ => return None,
    };
    Some(family)
}

fn pg_value(value: CellValue) -> Box<dyn ToSql + Sync + Send> {
    match value {
        CellValue::Boolean(v) => Box::new(v),
        CellValue::TinyInt(v) => Box::new(v.map(i16::from)),
        CellValue::SmallInt(v) => Box::new(v),
        CellValue::Integer(v) => Box::new(v),
        CellValue::BigInt(v) => Box::new(v),
        CellValue::Real(v) => Box::new(v),
        CellValue::Double(v) => Box::new(v),
        CellValue::Decimal(v) => Box::new(v),
        CellValue::Date(v) => Box::new(v),
        CellValue::Time(v) => Box::new(v),
        CellValue::Timestamp(v) => Box::new(v),
        CellValue::TimestampTz(v) => Box::new(v),
        CellValue::Uuid(v) => Box::new(v),
        CellValue::Text(v) => Box::new(v),
    }
}

/// Map "no such table/column" to bulk errors, pass everything else through.
fn bulk_error(e: tokio_postgres::Error, table: &TableName, data: &CsvData) -> MigratorError {
    let source = match e.as_db_error() {
        Some(db) if *db.code() == SqlState::UNDEFINED_TABLE => BulkImportError::TableNotFound {
            table: table.to_string(),
        },
        Some(db) if *db.code() == SqlState::UNDEFINED_COLUMN => BulkImportError::UnknownColumn {
            table: table.to_string(),
            column: db
                .message()
                .split('"')
                .nth(1)
                .unwrap_or(db.message())
                .to_string(),
        },
        _ => return MigratorError::PgError(e),
    };
    MigratorError::BulkImport {
        path: data.path.clone(),
        source,
    }
}

#[async_trait]
impl Session for PostgresSession {
    async fn execute(&mut self, sql: &str) -> Result<(), MigratorError> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn exists(&mut self, sql: &str) -> Result<bool, MigratorError> {
        let rows = self.client.query(sql, &[]).await?;
        Ok(!rows.is_empty())
    }

    async fn query_string(&mut self, sql: &str) -> Result<Option<String>, MigratorError> {
        match self.client.query_opt(sql, &[]).await? {
            Some(row) => Ok(row.try_get::<usize, Option<String>>(0)?),
            None => Ok(None),
        }
    }

    async fn query_versions(&mut self, sql: &str) -> Result<Vec<DbVersion>, MigratorError> {
        let rows = self.client.query(sql, &[]).await?;
        let mut versions = Vec::with_capacity(rows.len());
        for row in rows.into_iter() {
            let status: String = row.try_get(6)?;
            versions.push(DbVersion {
                sequence_id: row.try_get(0)?,
                version: row.try_get(1)?,
                applied_on_utc: row.try_get::<usize, Option<PrimitiveDateTime>>(2)?,
                applied_by_user: row.try_get(3)?,
                applied_by_tool: row.try_get(4)?,
                applied_by_tool_version: row.try_get(5)?,
                status: status.parse()?,
                duration_ms: row.try_get(7)?,
                checksum: row.try_get(8)?,
                failed_script_path: row.try_get(9)?,
                failed_script_error: row.try_get(10)?,
                additional_artifacts: row.try_get(11)?,
            });
        }
        Ok(versions)
    }

    async fn write_version(&mut self, sql: &str, version: &DbVersion) -> Result<(), MigratorError> {
        let status = version.status.to_string();
        self.client
            .execute(
                sql,
                &[
                    &version.version,
                    &version.applied_by_tool,
                    &version.applied_by_tool_version,
                    &status,
                    &version.duration_ms,
                    &version.checksum,
                    &version.failed_script_path,
                    &version.failed_script_error,
                    &version.additional_artifacts,
                ],
            )
            .await?;
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), MigratorError> {
        self.client.batch_execute("BEGIN;").await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), MigratorError> {
        self.client.batch_execute("COMMIT;").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), MigratorError> {
        self.client.batch_execute("ROLLBACK;").await?;
        Ok(())
    }

    async fn bulk_import(
        &mut self,
        table: &TableName,
        data: &CsvData,
        _batch_size: usize,
    ) -> Result<u64, MigratorError> {
        if data.headers.is_empty() {
            return Ok(0);
        }
        let columns = data.headers.join(", ");

        // Column types come from the destination, not from the file.
        let probe = self
            .client
            .prepare(&format!("SELECT {} FROM {} LIMIT 0", columns, table))
            .await
            .map_err(|e| bulk_error(e, table, data))?;
        let types: Vec<Type> = probe.columns().iter().map(|c| c.type_().clone()).collect();
        let mut families = Vec::with_capacity(types.len());
        for (ty, column) in types.iter().zip(&data.headers) {
            match pg_family(ty) {
                Some(family) => families.push(family),
                None => {
                    return Err(MigratorError::BulkImport {
                        path: data.path.clone(),
                        source: BulkImportError::UnsupportedColumnType {
                            column: column.clone(),
                            data_type: ty.name().to_string(),
                        },
                    })
                }
            }
        }

        let copy = format!("COPY {} ({}) FROM STDIN (FORMAT BINARY)", table, columns);
        let sink = self.client.copy_in(copy.as_str()).await?;
        let writer = BinaryCopyInWriter::new(sink, &types);
        pin_mut!(writer);
        for (index, row) in data.rows.iter().enumerate() {
            let mut values = Vec::with_capacity(row.len());
            for ((cell, family), column) in row.iter().zip(&families).zip(&data.headers) {
                let value = coerce(*family, column, index + 1, cell.as_deref()).map_err(|source| {
                    MigratorError::BulkImport {
                        path: data.path.clone(),
                        source,
                    }
                })?;
                values.push(pg_value(value));
            }
            let params: Vec<&(dyn ToSql + Sync)> = values
                .iter()
                .map(|v| v.as_ref() as &(dyn ToSql + Sync))
                .collect();
            writer.as_mut().write(&params).await?;
        }
        Ok(writer.finish().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use yuniql_core::replace_tokens;

    #[test]
    fn metadata_identifiers_keep_their_case() {
        let tokens: BTreeMap<String, String> = [
            ("YUNIQL_DB_NAME", "shop"),
            ("YUNIQL_SCHEMA_NAME", "Audit"),
            ("YUNIQL_TABLE_NAME", "SchemaHistory"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let check = replace_tokens(&tokens, TEMPLATES.check_metadata_exists);
        assert!(check.contains("schemaname = 'Audit' AND tablename = 'SchemaHistory'"));

        let create = replace_tokens(&tokens, TEMPLATES.create_metadata);
        assert!(create.contains("CREATE SCHEMA IF NOT EXISTS \"Audit\";"));
        assert!(create.contains("CREATE TABLE \"Audit\".\"SchemaHistory\"("));
        assert!(create.contains("CONSTRAINT \"ix_SchemaHistory\" UNIQUE"));

        for template in [
            TEMPLATES.get_current_version,
            TEMPLATES.get_all_versions,
            TEMPLATES.insert_version,
            TEMPLATES.update_version,
        ] {
            let sql = replace_tokens(&tokens, template);
            assert!(sql.contains("\"Audit\".\"SchemaHistory\""), "{}", sql);
        }
    }
}
