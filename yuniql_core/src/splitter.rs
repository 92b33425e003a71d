//! Splitting script text into independently executable statements.
//!
//! Every strategy keeps statement order, drops empty or whitespace-only
//! statements and never emits the terminator lines themselves.

use regex::Regex;
use std::sync::LazyLock;

static PLSQL_BLOCK_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*CREATE\s+(OR\s+REPLACE\s+)?(PROCEDURE|PACKAGE|TRIGGER)\b")
        .expect("valid block start pattern")
});

/// Statement splitting strategy selected by a platform.
#[derive(Clone, Debug)]
pub enum SplitStrategy {
    /// The driver accepts a whole multi-statement script in one submission.
    Identity,
    /// A line holding only the terminator keyword (case-insensitive) ends a statement.
    LineTerminator(String),
    /// Line terminator outside of procedural blocks, block terminator inside.
    Block(BlockSyntax),
}

impl SplitStrategy {
    /// `GO` separated batches.
    pub fn go() -> Self {
        SplitStrategy::LineTerminator("GO".to_string())
    }

    pub fn split(&self, sql: &str) -> Vec<String> {
        match self {
            SplitStrategy::Identity => {
                if sql.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![sql.to_string()]
                }
            }
            SplitStrategy::LineTerminator(terminator) => split_lines(sql, terminator),
            SplitStrategy::Block(syntax) => syntax.split(sql),
        }
    }
}

fn is_terminator(line: &str, terminator: &str) -> bool {
    line.trim().eq_ignore_ascii_case(terminator)
}

fn flush(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

fn split_lines(sql: &str, terminator: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    for line in sql.lines() {
        if is_terminator(line, terminator) {
            flush(&mut statements, &mut current);
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    flush(&mut statements, &mut current);
    statements
}

/// Syntax of scripts that mix plain statements with procedural blocks, such as
/// PL/SQL bodies closed by `;` and a lone `/` line.
#[derive(Clone, Debug)]
pub struct BlockSyntax {
    /// Whole-line terminator used outside of blocks.
    pub terminator: String,
    /// Line pattern that opens a block.
    pub block_start: Regex,
    /// Whole-line marker that closes a block when the previous text ends with `;`.
    pub block_end: String,
    /// Lines starting with this marker are kept verbatim inside a block.
    pub comment_marker: String,
}

impl BlockSyntax {
    /// `CREATE [OR REPLACE] {PROCEDURE|PACKAGE|TRIGGER}` blocks ended by `;` + `/`,
    /// plain statements separated by `/` lines.
    pub fn plsql() -> Self {
        BlockSyntax {
            terminator: "/".to_string(),
            block_start: PLSQL_BLOCK_START.clone(),
            block_end: "/".to_string(),
            comment_marker: "--".to_string(),
        }
    }

    pub fn split(&self, sql: &str) -> Vec<String> {
        let mut statements = Vec::new();
        let mut current = String::new();
        let mut in_block = false;

        for line in sql.lines() {
            if in_block {
                if line.trim_start().starts_with(&self.comment_marker) {
                    current.push_str(line);
                    current.push('\n');
                } else if is_terminator(line, &self.block_end)
                    && current.trim_end().ends_with(';')
                {
                    flush(&mut statements, &mut current);
                    in_block = false;
                } else {
                    current.push_str(line);
                    current.push('\n');
                }
                continue;
            }

            if self.block_start.is_match(line) {
                in_block = true;
                current.push_str(line);
                current.push('\n');
            } else if is_terminator(line, &self.terminator) {
                flush(&mut statements, &mut current);
            } else {
                current.push_str(line);
                current.push('\n');
            }
        }
        flush(&mut statements, &mut current);
        statements
    }
}
