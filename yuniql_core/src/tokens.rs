use crate::workspace::WorkspaceError;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("valid token pattern"));

/// Replace every `${KEY}` in `text` with its value.
///
/// Keys are made of ASCII letters, digits, `_`, `.` and `-`, so a stray `${` never
/// captures a later placeholder. Placeholders without a matching token are left as
/// they are. The text is scanned once, so a value that itself contains `${...}` is
/// never expanded again.
pub fn replace_tokens(tokens: &BTreeMap<String, String>, text: &str) -> String {
    if tokens.is_empty() {
        return text.to_string();
    }
    TOKEN_PATTERN
        .replace_all(text, |caps: &Captures| match tokens.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Parse a `KEY=VALUE` pair. Only the first `=` separates key from value.
pub fn parse_token(token: &str) -> Result<(String, String), WorkspaceError> {
    match token.split_once('=') {
        Some((key, value)) if is_token_key(key.trim()) => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(WorkspaceError::InvalidToken {
            token: token.to_string(),
        }),
    }
}

fn is_token_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}
