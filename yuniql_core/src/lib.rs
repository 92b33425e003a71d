//! Filesystem and text building blocks shared by the `yuniql` engine and CLI.
//!
//! Nothing in this crate talks to a database: it resolves version directories,
//! validates and scaffolds the workspace layout, splits script text into
//! executable statements and substitutes `${KEY}` tokens.

pub mod splitter;
pub mod tokens;
pub mod version;
pub mod workspace;

pub use splitter::{BlockSyntax, SplitStrategy};
pub use tokens::{parse_token, replace_tokens};
pub use version::{LocalVersion, VersionDirectory};
pub use workspace::{ScriptFile, WorkspaceError};
