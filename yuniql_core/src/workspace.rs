use crate::version::version_directories;
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

pub const INIT_DIR: &str = "_init";
pub const PRE_DIR: &str = "_pre";
pub const DRAFT_DIR: &str = "_draft";
pub const POST_DIR: &str = "_post";
pub const ERASE_DIR: &str = "_erase";
pub const BASELINE_DIR: &str = "v0.00";

/// An error occurred while reading or preparing the workspace
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace structure is invalid, required directories are missing:\n{report}")]
    Structure { report: StructureReport },

    #[error("invalid version directory name `{name}` (expected `v{{major}}.{{minor}}`)")]
    VersionParsing { name: String },

    #[error("invalid token `{token}` (expected `KEY=VALUE`)")]
    InvalidToken { token: String },

    #[error("io error on `{path}`")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl WorkspaceError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Found/Missing status of every required workspace directory.
#[derive(Clone, Debug, PartialEq)]
pub struct StructureReport {
    pub entries: Vec<(String, bool)>,
}

impl StructureReport {
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|(_, found)| *found)
    }

    pub fn missing(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, found)| !found)
            .map(|(name, _)| name.as_str())
    }
}

impl fmt::Display for StructureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, found) in &self.entries {
            writeln!(
                f,
                "  {:<8} {}",
                if *found { "Found" } else { "Missing" },
                name
            )?;
        }
        Ok(())
    }
}

/// Check every required directory and report all of them at once.
pub fn structure_report(workspace: &Path) -> Result<StructureReport, WorkspaceError> {
    let mut entries = Vec::with_capacity(6);
    for dir in [INIT_DIR, PRE_DIR] {
        entries.push((dir.to_string(), workspace.join(dir).is_dir()));
    }
    let has_version = workspace.is_dir() && !version_directories(workspace)?.is_empty();
    entries.push(("v{major}.{minor}".to_string(), has_version));
    for dir in [DRAFT_DIR, POST_DIR, ERASE_DIR] {
        entries.push((dir.to_string(), workspace.join(dir).is_dir()));
    }
    Ok(StructureReport { entries })
}

/// Pre-flight check run before any database connection is opened.
pub fn validate(workspace: &Path) -> Result<(), WorkspaceError> {
    let report = structure_report(workspace)?;
    if report.is_complete() {
        Ok(())
    } else {
        Err(WorkspaceError::Structure { report })
    }
}

const README: &str = "# yuniql workspace

| directory | when it runs |
|-----------|--------------|
| `_init`   | once, when the schema version table is first created |
| `_pre`    | every run, before version directories |
| `vX.YY`   | once per version, in numeric order |
| `_draft`  | every run, after version directories |
| `_post`   | every run, last |
| `_erase`  | only with the `erase` command |
";

const DOCKERFILE: &str = "FROM yuniql/yuniql:latest
COPY . ./db
";

const GITIGNORE: &str = ".yuniql/
*.log
";

/// Scaffold a workspace. Existing directories and files are left untouched,
/// so calling it repeatedly is harmless.
pub fn init(workspace: &Path) -> Result<(), WorkspaceError> {
    fs::create_dir_all(workspace).map_err(|e| WorkspaceError::io(workspace, e))?;
    for dir in [INIT_DIR, PRE_DIR, BASELINE_DIR, DRAFT_DIR, POST_DIR, ERASE_DIR] {
        let path = workspace.join(dir);
        fs::create_dir_all(&path).map_err(|e| WorkspaceError::io(&path, e))?;
        write_if_missing(&path.join("README.md"), &format!("# {}\n", dir))?;
    }
    write_if_missing(&workspace.join("README.md"), README)?;
    write_if_missing(&workspace.join("Dockerfile"), DOCKERFILE)?;
    write_if_missing(&workspace.join(".gitignore"), GITIGNORE)?;
    log::info!("Initialized workspace {}", workspace.display());
    Ok(())
}

fn write_if_missing(path: &Path, content: &str) -> Result<(), WorkspaceError> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, content).map_err(|e| WorkspaceError::io(path, e))
}

/// A script file and its raw text.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptFile {
    pub path: PathBuf,
    pub sql: String,
}

impl ScriptFile {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let path = path.into();
        let sql = fs::read_to_string(&path).map_err(|e| WorkspaceError::io(&path, e))?;
        Ok(ScriptFile { path, sql })
    }
}

/// Files with the given extension directly inside `dir`, ordered by file name.
pub fn find_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, WorkspaceError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| walk_error(dir, e))?;
        let path = entry.into_path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(OsStr::new(extension)))
        {
            files.push(path);
        }
    }
    Ok(files)
}

/// Load the `.sql` scripts directly inside `dir`, ordered by file name.
pub fn load_sql_scripts(dir: &Path) -> Result<Vec<ScriptFile>, WorkspaceError> {
    find_files(dir, "sql")?
        .into_iter()
        .map(ScriptFile::load)
        .collect()
}

/// Every directory below `version_dir`, depth-first with siblings in name order.
///
/// The version directory itself is not included: its own scripts run after all of
/// these, see [`version_script_groups`].
pub fn version_subdirectories(version_dir: &Path) -> Result<Vec<PathBuf>, WorkspaceError> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(version_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(version_dir, e))?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}

/// Scripts of one version grouped by directory, in execution order.
///
/// NOTE: subdirectories come first and the version root comes last. Existing
/// workspaces rely on this order (objects in `v1.00/tables/` are referenced by
/// scripts in `v1.00/`), so it must not be flipped.
pub fn version_script_groups(
    version_dir: &Path,
) -> Result<Vec<(PathBuf, Vec<ScriptFile>)>, WorkspaceError> {
    let mut groups = Vec::new();
    for dir in version_subdirectories(version_dir)? {
        let scripts = load_sql_scripts(&dir)?;
        groups.push((dir, scripts));
    }
    groups.push((version_dir.to_path_buf(), load_sql_scripts(version_dir)?));
    Ok(groups)
}

/// SHA-256 over the text of the given scripts, in order.
///
/// Each text is prefixed with its byte length so script boundaries count.
pub fn checksum<'a>(scripts: impl IntoIterator<Item = &'a ScriptFile>) -> String {
    let mut hasher = Sha256::new();
    for script in scripts {
        hasher.update((script.sql.len() as u64).to_le_bytes());
        hasher.update(script.sql.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

pub(crate) fn walk_error(dir: &Path, err: walkdir::Error) -> WorkspaceError {
    let path = err.path().unwrap_or(dir).to_path_buf();
    WorkspaceError::Io {
        path,
        source: err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("db");
        init(&root).unwrap();
        fs::write(root.join("README.md"), "custom").unwrap();
        init(&root).unwrap();

        for dir in [INIT_DIR, PRE_DIR, BASELINE_DIR, DRAFT_DIR, POST_DIR, ERASE_DIR] {
            assert!(root.join(dir).is_dir(), "{dir} should exist");
        }
        assert_eq!(fs::read_to_string(root.join("README.md")).unwrap(), "custom");
        assert!(root.join("Dockerfile").is_file());
        assert!(root.join(".gitignore").is_file());
        validate(&root).unwrap();
    }

    #[test]
    fn validate_reports_every_missing_directory() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join(INIT_DIR)).unwrap();
        fs::create_dir(tmp.path().join(POST_DIR)).unwrap();

        match validate(tmp.path()) {
            Err(WorkspaceError::Structure { report }) => {
                let missing: Vec<&str> = report.missing().collect();
                assert_eq!(
                    missing,
                    vec![PRE_DIR, "v{major}.{minor}", DRAFT_DIR, ERASE_DIR]
                );
                let text = report.to_string();
                assert!(text.contains("Found    _init"));
                assert!(text.contains("Missing  _pre"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn validate_missing_workspace() {
        let tmp = TempDir::new().unwrap();
        let err = validate(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, WorkspaceError::Structure { .. }));
    }

    #[test]
    fn find_files_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        for name in ["b.sql", "a.sql", "c.txt", "10.sql", "d.SQL"] {
            fs::write(tmp.path().join(name), "").unwrap();
        }
        fs::create_dir(tmp.path().join("e.sql")).unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub").join("nested.sql"), "").unwrap();

        let names: Vec<String> = find_files(tmp.path(), "sql")
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["10.sql", "a.sql", "b.sql", "d.SQL"]);
    }

    #[test]
    fn subdirectories_run_before_version_root() {
        let tmp = TempDir::new().unwrap();
        let v = tmp.path().join("v1.00");
        fs::create_dir_all(v.join("b")).unwrap();
        fs::create_dir_all(v.join("a").join("deep")).unwrap();
        fs::write(v.join("root.sql"), "root").unwrap();
        fs::write(v.join("a").join("a.sql"), "a").unwrap();
        fs::write(v.join("a").join("deep").join("deep.sql"), "deep").unwrap();
        fs::write(v.join("b").join("b.sql"), "b").unwrap();

        let order: Vec<String> = version_script_groups(&v)
            .unwrap()
            .into_iter()
            .flat_map(|(_, scripts)| scripts.into_iter().map(|s| s.sql))
            .collect();
        assert_eq!(order, vec!["a", "deep", "b", "root"]);
    }

    #[test]
    fn checksum_depends_on_content_and_order() {
        let a = ScriptFile {
            path: PathBuf::from("a.sql"),
            sql: "CREATE TABLE a(id INT);".to_string(),
        };
        let b = ScriptFile {
            path: PathBuf::from("b.sql"),
            sql: "CREATE TABLE b(id INT);".to_string(),
        };
        let ab = checksum([&a, &b]);
        assert_eq!(ab.len(), 64);
        assert_eq!(ab, checksum([&a, &b]));
        assert_ne!(ab, checksum([&b, &a]));
    }

    #[test]
    fn checksum_respects_script_boundaries() {
        let script = |name: &str, sql: &str| ScriptFile {
            path: PathBuf::from(name),
            sql: sql.to_string(),
        };
        let split_late = [script("1.sql", "ab"), script("2.sql", "c")];
        let split_early = [script("1.sql", "a"), script("2.sql", "bc")];
        assert_ne!(checksum(&split_late), checksum(&split_early));
    }
}
