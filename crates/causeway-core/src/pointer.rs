//! JSON Pointer (RFC 6901) tokenizing and formatting.
//!
//! `""` addresses the whole document; every other pointer starts with `/`
//! and separates reference tokens with `/`. Inside a token `~1` stands for
//! `/` and `~0` for `~`.

use crate::error::CoreError;

/// Escape a single reference token.
pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Unescape a single reference token.
pub fn unescape_token(token: &str) -> Result<String, CoreError> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => return Err(CoreError::InvalidPointer(token.to_string())),
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Split a pointer into unescaped reference tokens.
pub fn parse(pointer: &str) -> Result<Vec<String>, CoreError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let rest = pointer
        .strip_prefix('/')
        .ok_or_else(|| CoreError::InvalidPointer(pointer.to_string()))?;
    rest.split('/').map(unescape_token).collect()
}

/// Build a pointer from unescaped tokens.
pub fn format<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut out = String::new();
    for token in tokens {
        out.push('/');
        out.push_str(&escape_token(token.as_ref()));
    }
    out
}

/// Append an unescaped token to an existing pointer.
pub fn child(pointer: &str, token: &str) -> String {
    format!("{}/{}", pointer, escape_token(token))
}

/// True when `ancestor` addresses a strict ancestor of `descendant`.
pub fn is_strict_ancestor(ancestor: &str, descendant: &str) -> bool {
    if ancestor == descendant {
        return false;
    }
    if ancestor.is_empty() {
        return true;
    }
    descendant
        .strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// True when the two pointers address the same node or one contains the other.
pub fn overlaps(a: &str, b: &str) -> bool {
    a == b || is_strict_ancestor(a, b) || is_strict_ancestor(b, a)
}

/// Parse an array index token. `-` is handled by callers.
pub fn parse_index(token: &str) -> Option<usize> {
    if token.is_empty() || (token.len() > 1 && token.starts_with('0')) {
        return None;
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}
