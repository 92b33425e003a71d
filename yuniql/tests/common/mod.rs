//! In-memory platform recording what a migration run does to a fake database.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use yuniql::{
    BulkImportError, ConnectionInfo, CsvData, DbVersion, MigratorError, Platform, Session,
    SplitStrategy, SqlTemplates, TableName, VersionStatus,
};

static TEMPLATES: SqlTemplates = SqlTemplates {
    check_database_exists: "CHECK DATABASE ${YUNIQL_DB_NAME}",
    create_database: "CREATE DATABASE ${YUNIQL_DB_NAME}",
    check_metadata_exists: "CHECK METADATA ${YUNIQL_SCHEMA_NAME}.${YUNIQL_TABLE_NAME}",
    create_metadata: "CREATE METADATA ${YUNIQL_SCHEMA_NAME}.${YUNIQL_TABLE_NAME}",
    get_current_version: "CURRENT VERSION ${YUNIQL_SCHEMA_NAME}.${YUNIQL_TABLE_NAME}",
    get_all_versions: "ALL VERSIONS ${YUNIQL_SCHEMA_NAME}.${YUNIQL_TABLE_NAME}",
    insert_version: "INSERT VERSION ${YUNIQL_SCHEMA_NAME}.${YUNIQL_TABLE_NAME}",
    update_version: "UPDATE VERSION ${YUNIQL_SCHEMA_NAME}.${YUNIQL_TABLE_NAME}",
};

/// Everything a transaction can roll back.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryState {
    pub database_exists: bool,
    pub metadata_table: Option<String>,
    pub versions: Vec<DbVersion>,
    pub objects: Vec<String>,
    pub bulk: Vec<(String, usize)>,
    pub next_sequence: i64,
}

#[derive(Debug, Default)]
struct Shared {
    state: MemoryState,
    executed: Vec<String>,
    connections: usize,
}

#[derive(Clone)]
pub struct MemoryPlatform {
    shared: Arc<Mutex<Shared>>,
    transactional: bool,
    split_strategy: SplitStrategy,
}

impl MemoryPlatform {
    pub fn new(transactional: bool) -> Self {
        MemoryPlatform {
            shared: Arc::new(Mutex::new(Shared::default())),
            transactional,
            split_strategy: SplitStrategy::go(),
        }
    }

    pub fn with_database(transactional: bool) -> Self {
        let platform = MemoryPlatform::new(transactional);
        platform.lock().state.database_exists = true;
        platform
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    pub fn state(&self) -> MemoryState {
        self.lock().state.clone()
    }

    /// Statements executed so far, including rolled back ones.
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Connections opened so far, admin connections included.
    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    pub fn has_object(&self, name: &str) -> bool {
        self.lock().state.objects.iter().any(|o| o == name)
    }

    fn session(&self) -> Box<dyn Session> {
        self.lock().connections += 1;
        Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            snapshot: None,
        })
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            data_source: "memory".to_string(),
            database: "memdb".to_string(),
            port: None,
        }
    }

    fn default_schema(&self) -> Option<&'static str> {
        Some("dbo")
    }

    fn is_transactional_ddl_supported(&self) -> bool {
        self.transactional
    }

    fn split_strategy(&self) -> &SplitStrategy {
        &self.split_strategy
    }

    fn templates(&self) -> &'static SqlTemplates {
        &TEMPLATES
    }

    async fn connect(&self) -> Result<Box<dyn Session>, MigratorError> {
        if !self.lock().state.database_exists {
            return Err(MigratorError::Database(
                "database memdb does not exist".to_string(),
            ));
        }
        Ok(self.session())
    }

    async fn connect_admin(&self) -> Result<Box<dyn Session>, MigratorError> {
        Ok(self.session())
    }

    fn try_parse_error(&self, err: &MigratorError) -> Option<String> {
        match err.root() {
            MigratorError::Database(message) => Some(format!("MEM01: {}", message)),
            _ => None,
        }
    }
}

pub struct MemorySession {
    shared: Arc<Mutex<Shared>>,
    snapshot: Option<MemoryState>,
}

impl MemorySession {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }
}

fn words(sql: &str) -> Vec<&str> {
    sql.split(|c: char| c.is_whitespace() || "();,".contains(c))
        .filter(|w| !w.is_empty())
        .collect()
}

/// Apply a script statement: `CREATE TABLE`, `CREATE VIEW ... FROM t` and `DROP` are
/// tracked, a statement mentioning `FAIL` errors, anything else is accepted.
fn apply(state: &mut MemoryState, sql: &str) -> Result<(), MigratorError> {
    if sql.to_ascii_uppercase().contains("FAIL") {
        return Err(MigratorError::Database("injected failure".to_string()));
    }
    let words = words(sql);
    let is = |index: usize, keyword: &str| {
        words
            .get(index)
            .is_some_and(|w| w.eq_ignore_ascii_case(keyword))
    };
    if is(0, "CREATE") && is(1, "DATABASE") {
        state.database_exists = true;
    } else if is(0, "CREATE") && is(1, "METADATA") {
        state.metadata_table = words.get(2).map(|w| w.to_string());
    } else if is(0, "CREATE") && is(1, "TABLE") {
        if let Some(name) = words.get(2) {
            if !state.objects.iter().any(|o| o == name) {
                state.objects.push(name.to_string());
            }
        }
    } else if is(0, "CREATE") && is(1, "VIEW") {
        if let Some(from) = words.iter().position(|w| w.eq_ignore_ascii_case("FROM")) {
            let source = words.get(from + 1).copied().unwrap_or_default();
            if !state.objects.iter().any(|o| o == source) {
                return Err(MigratorError::Database(format!(
                    "invalid object name {}",
                    source
                )));
            }
        }
        if let Some(name) = words.get(2) {
            state.objects.push(name.to_string());
        }
    } else if is(0, "DROP") {
        if let Some(name) = words.get(2) {
            state.objects.retain(|o| o != name);
        }
    }
    Ok(())
}

#[async_trait]
impl Session for MemorySession {
    async fn execute(&mut self, sql: &str) -> Result<(), MigratorError> {
        if sql.contains("SLEEP") {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        let mut shared = self.lock();
        shared.executed.push(sql.to_string());
        apply(&mut shared.state, sql)
    }

    async fn exists(&mut self, sql: &str) -> Result<bool, MigratorError> {
        let shared = self.lock();
        let state = &shared.state;
        match sql.split_once(' ') {
            Some(("CHECK", rest)) if rest.starts_with("DATABASE") => Ok(state.database_exists),
            Some(("CHECK", rest)) if rest.starts_with("METADATA") => {
                let table = rest.trim_start_matches("METADATA").trim();
                Ok(state.metadata_table.as_deref() == Some(table))
            }
            _ => Err(MigratorError::Database(format!("unexpected query {}", sql))),
        }
    }

    async fn query_string(&mut self, sql: &str) -> Result<Option<String>, MigratorError> {
        assert!(sql.starts_with("CURRENT VERSION"), "unexpected query {}", sql);
        Ok(self
            .lock()
            .state
            .versions
            .iter()
            .filter(|v| v.status == VersionStatus::Successful)
            .max_by_key(|v| v.sequence_id)
            .map(|v| v.version.clone()))
    }

    async fn query_versions(&mut self, sql: &str) -> Result<Vec<DbVersion>, MigratorError> {
        assert!(sql.starts_with("ALL VERSIONS"), "unexpected query {}", sql);
        Ok(self.lock().state.versions.clone())
    }

    async fn write_version(&mut self, sql: &str, version: &DbVersion) -> Result<(), MigratorError> {
        let mut shared = self.lock();
        let state = &mut shared.state;
        let existing = state.versions.iter().position(|v| v.version == version.version);
        match (sql.starts_with("INSERT VERSION"), existing) {
            (true, None) => {
                state.next_sequence += 1;
                let mut row = version.clone();
                row.sequence_id = state.next_sequence;
                row.applied_by_user = "tester".to_string();
                state.versions.push(row);
                Ok(())
            }
            (true, Some(_)) => Err(MigratorError::Database(format!(
                "duplicate version {}",
                version.version
            ))),
            (false, Some(index)) => {
                let mut row = version.clone();
                row.sequence_id = state.versions[index].sequence_id;
                row.applied_by_user = "tester".to_string();
                state.versions[index] = row;
                Ok(())
            }
            (false, None) => Err(MigratorError::Database(format!(
                "no row for version {}",
                version.version
            ))),
        }
    }

    async fn begin(&mut self) -> Result<(), MigratorError> {
        let state = self.lock().state.clone();
        self.snapshot = Some(state);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), MigratorError> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), MigratorError> {
        if let Some(snapshot) = self.snapshot.take() {
            self.lock().state = snapshot;
        }
        Ok(())
    }

    async fn bulk_import(
        &mut self,
        table: &TableName,
        data: &CsvData,
        _batch_size: usize,
    ) -> Result<u64, MigratorError> {
        let mut shared = self.lock();
        if !shared.state.objects.iter().any(|o| *o == table.table) {
            return Err(MigratorError::BulkImport {
                path: data.path.clone(),
                source: BulkImportError::TableNotFound {
                    table: table.to_string(),
                },
            });
        }
        shared.state.bulk.push((table.to_string(), data.rows.len()));
        Ok(data.rows.len() as u64)
    }
}
