/*!
Versioned SQL workspace migrations for Rust.

`yuniql` applies the scripts of a workspace directory to a database and records every
applied version in a schema version table, so running it again only applies what is new.
Platforms are selected with cargo features:
[`tokio-postgres`](https://crates.io/crates/tokio-postgres) (`postgresql`),
[`tiberius`](https://crates.io/crates/tiberius) (`sqlserver`) and
[`mysql_async`](https://crates.io/crates/mysql_async) (`mysql`).

## Workspace

```text
db/
├── _init/        once, when the schema version table is created
├── _pre/         every run, first
├── v0.00/        baseline
├── v1.00/        one directory per version, applied in numeric order
│   ├── tables/   subdirectories run before the version's own scripts
│   ├── 01.sql
│   └── dbo.Visitor.csv
├── _draft/       every run, after the versions
├── _post/        every run, last
└── _erase/       only with `erase`
```

Script text may contain `${KEY}` placeholders, replaced from [`Config::tokens`].
CSV files are bulk loaded into the table named by the file after the version's scripts.

### Example
```rust,ignore
use yuniql::{Config, Migrator};

let config = Config {
    workspace: "./db".into(),
    platform: "postgresql".to_string(),
    connection_string: "host=localhost user=app dbname=shop".to_string(),
    auto_create_database: true,
    ..Config::default()
};
let migrator = Migrator::from_config(config)?;
let report = migrator.run().await?;
println!("applied {:?}", report.applied_versions);
```
*/

mod bulk;
mod drivers;
mod migrator;
mod version_log;

pub use bulk::{
    coerce, read_csv, table_name_for, BulkImportError, CellValue, ColumnFamily, CsvData,
    TableName,
};
#[cfg(feature = "mysql_async")]
pub use drivers::MySqlPlatform;
#[cfg(feature = "tokio-postgres")]
pub use drivers::PostgresPlatform;
#[cfg(feature = "tiberius")]
pub use drivers::SqlServerPlatform;
pub use drivers::{create_platform, ConnectionInfo, Platform, Session, SqlTemplates};
pub use migrator::{Config, Migrator, MigratorError, RunReport, DEFAULT_META_TABLE_NAME};
pub use version_log::{DbVersion, VersionStatus};

pub use yuniql_core::splitter::{BlockSyntax, SplitStrategy};
pub use yuniql_core::tokens::{parse_token, replace_tokens};
pub use yuniql_core::version::{
    increment_major_version, increment_minor_version, latest_version, LocalVersion,
    VersionDirectory,
};
pub use yuniql_core::workspace::{self as workspace, ScriptFile, StructureReport, WorkspaceError};
