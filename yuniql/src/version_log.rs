use crate::migrator::MigratorError;
use std::fmt;
use std::str::FromStr;
use time::PrimitiveDateTime;
use yuniql_core::LocalVersion;

/// Outcome recorded for a version in the schema version table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionStatus {
    Successful,
    Failed,
}

impl FromStr for VersionStatus {
    type Err = MigratorError;

    fn from_str(s: &str) -> Result<VersionStatus, MigratorError> {
        match s {
            "Successful" => Ok(VersionStatus::Successful),
            "Failed" => Ok(VersionStatus::Failed),
            _ => Err(MigratorError::InvalidVersionRow(format!(
                "unknown status `{}`",
                s
            ))),
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionStatus::Successful => write!(f, "Successful"),
            VersionStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// One row of the schema version table.
///
/// `sequence_id`, `applied_on_utc` and `applied_by_user` are assigned by the database;
/// the remaining fields are bound by the platform's insert/update templates.
#[derive(Clone, Debug, PartialEq)]
pub struct DbVersion {
    pub sequence_id: i64,
    pub version: String,
    pub applied_on_utc: Option<PrimitiveDateTime>,
    pub applied_by_user: String,
    pub applied_by_tool: String,
    pub applied_by_tool_version: String,
    pub status: VersionStatus,
    pub duration_ms: i64,
    pub checksum: String,
    pub failed_script_path: Option<String>,
    pub failed_script_error: Option<String>,
    pub additional_artifacts: Option<String>,
}

impl DbVersion {
    /// A row to be written for `version`.
    pub fn new(
        version: impl Into<String>,
        status: VersionStatus,
        applied_by_tool: impl Into<String>,
        applied_by_tool_version: impl Into<String>,
    ) -> Self {
        DbVersion {
            sequence_id: 0,
            version: version.into(),
            applied_on_utc: None,
            applied_by_user: String::new(),
            applied_by_tool: applied_by_tool.into(),
            applied_by_tool_version: applied_by_tool_version.into(),
            status,
            duration_ms: 0,
            checksum: String::new(),
            failed_script_path: None,
            failed_script_error: None,
            additional_artifacts: None,
        }
    }

    pub fn local_version(&self) -> Result<LocalVersion, MigratorError> {
        Ok(LocalVersion::from_str(&self.version)?)
    }

    pub fn is_successful(&self) -> bool {
        self.status == VersionStatus::Successful
    }

    pub fn checksum32(&self) -> &str {
        self.checksum.get(0..8).unwrap_or(&self.checksum)
    }
}

impl fmt::Display for DbVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "#{} {} {} ({}), {} ms",
            self.sequence_id,
            self.version,
            self.status,
            self.checksum32(),
            self.duration_ms
        )?;
        if let Some(ref applied_on_utc) = self.applied_on_utc {
            write!(f, ", applied: {} by {}", applied_on_utc, self.applied_by_user)?;
        }
        if let Some(ref path) = self.failed_script_path {
            write!(f, ", failed script: {}", path)?;
        }
        Ok(())
    }
}
