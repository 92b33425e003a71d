use crate::workspace::{walk_error, WorkspaceError};
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use walkdir::WalkDir;

static VERSION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v(\d+)\.(\d+)$").expect("valid version pattern"));

/// A `v{major}.{minor}` version.
///
/// Ordering is by the numeric pair, so `v1.9 < v1.10` and `v1.0 == v1.00`.
/// Zero padding of the minor part is cosmetic only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalVersion {
    major: u32,
    minor: u32,
}

impl LocalVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        LocalVersion { major, minor }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn next_major(&self) -> Result<Self, WorkspaceError> {
        match self.major.checked_add(1) {
            Some(major) => Ok(LocalVersion::new(major, 0)),
            None => Err(self.overflow()),
        }
    }

    pub fn next_minor(&self) -> Result<Self, WorkspaceError> {
        match self.minor.checked_add(1) {
            Some(minor) => Ok(LocalVersion::new(self.major, minor)),
            None => Err(self.overflow()),
        }
    }

    fn overflow(&self) -> WorkspaceError {
        WorkspaceError::VersionParsing {
            name: format!("{} (no next version)", self),
        }
    }
}

impl FromStr for LocalVersion {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<LocalVersion, WorkspaceError> {
        let err = || WorkspaceError::VersionParsing { name: s.to_string() };
        let caps = VERSION_PATTERN.captures(s).ok_or_else(err)?;
        Ok(LocalVersion {
            major: caps[1].parse().map_err(|_| err())?,
            minor: caps[2].parse().map_err(|_| err())?,
        })
    }
}

impl fmt::Display for LocalVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{:02}", self.major, self.minor)
    }
}

/// A version directory found in the workspace root.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionDirectory {
    pub version: LocalVersion,
    /// Directory name exactly as found on disk, e.g. `v1.0` or `v1.00`.
    pub name: String,
    pub path: PathBuf,
}

/// Scan `workspace` for `v*.*` directories, ordered by numeric version.
///
/// Any directory matching the `v*.*` glob that does not parse as a version is an error,
/// so a typo such as `v1.x` surfaces instead of being skipped silently.
pub fn version_directories(workspace: &Path) -> Result<Vec<VersionDirectory>, WorkspaceError> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(workspace).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| walk_error(workspace, e))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !name.starts_with('v') || !name.contains('.') {
            continue;
        }
        let version = LocalVersion::from_str(name)?;
        dirs.push(VersionDirectory {
            version,
            name: name.to_string(),
            path: entry.into_path(),
        });
    }
    dirs.sort_by(|a, b| a.version.cmp(&b.version).then_with(|| a.name.cmp(&b.name)));
    Ok(dirs)
}

/// Latest local version, or `None` when the workspace has no version directory yet.
pub fn latest_version(workspace: &Path) -> Result<Option<LocalVersion>, WorkspaceError> {
    Ok(version_directories(workspace)?
        .last()
        .map(|dir| dir.version))
}

/// Create `v{major+1}.00`, optionally seeding it with an empty script file.
pub fn increment_major_version(
    workspace: &Path,
    file_name: Option<&str>,
) -> Result<String, WorkspaceError> {
    let next = latest_version(workspace)?
        .map(|v| v.next_major())
        .transpose()?
        .unwrap_or_else(|| LocalVersion::new(1, 0));
    create_version(workspace, next, file_name)
}

/// Create `v{major}.{minor+1}`, optionally seeding it with an empty script file.
pub fn increment_minor_version(
    workspace: &Path,
    file_name: Option<&str>,
) -> Result<String, WorkspaceError> {
    let next = latest_version(workspace)?
        .map(|v| v.next_minor())
        .transpose()?
        .unwrap_or_else(|| LocalVersion::new(0, 1));
    create_version(workspace, next, file_name)
}

fn create_version(
    workspace: &Path,
    version: LocalVersion,
    file_name: Option<&str>,
) -> Result<String, WorkspaceError> {
    let name = version.to_string();
    let dir = workspace.join(&name);
    fs::create_dir_all(&dir).map_err(|e| WorkspaceError::io(&dir, e))?;
    if let Some(file_name) = file_name {
        let file = dir.join(file_name);
        if !file.exists() {
            fs::write(&file, "").map_err(|e| WorkspaceError::io(&file, e))?;
        }
    }
    log::info!("Created version directory {}", dir.display());
    Ok(name)
}
