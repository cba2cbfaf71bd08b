//! Subject validation and wildcard matching.
//!
//! Subjects are `.`-separated tokens. Subscription patterns may use `*` to
//! match exactly one token and a trailing `>` to match one or more tokens.
//! Publish subjects must be literal.

use crate::error::{Error, Result};

/// Single-token wildcard.
pub const WILDCARD_ONE: &str = "*";
/// Trailing multi-token wildcard.
pub const WILDCARD_TAIL: &str = ">";

fn check_tokens(subject: &str) -> Result<()> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(Error::InvalidSubject(subject.to_owned()));
    }
    if subject.split('.').any(str::is_empty) {
        return Err(Error::InvalidSubject(subject.to_owned()));
    }
    Ok(())
}

/// Validate a literal subject used for publishing.
pub fn validate_subject(subject: &str) -> Result<()> {
    check_tokens(subject)?;
    if subject
        .split('.')
        .any(|t| t == WILDCARD_ONE || t == WILDCARD_TAIL)
    {
        return Err(Error::InvalidSubject(subject.to_owned()));
    }
    Ok(())
}

/// Validate a subscription pattern.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    check_tokens(pattern)?;
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;
    for (i, token) in tokens.iter().enumerate() {
        if token.len() > 1 && (token.contains('*') || token.contains('>')) {
            return Err(Error::InvalidSubject(pattern.to_owned()));
        }
        if *token == WILDCARD_TAIL && i != last {
            return Err(Error::InvalidSubject(pattern.to_owned()));
        }
    }
    Ok(())
}

/// Validate a queue group name. Same character rules as a subject token.
pub fn validate_queue(queue: &str) -> Result<()> {
    if queue.is_empty() || queue.chars().any(char::is_whitespace) {
        return Err(Error::InvalidSubject(queue.to_owned()));
    }
    Ok(())
}

/// Returns true if `subject` is matched by `pattern`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_parts = pattern.split('.');
    let mut subject_parts = subject.split('.');

    loop {
        match (pattern_parts.next(), subject_parts.next()) {
            // `>` needs at least one remaining token, which we just consumed
            (Some(WILDCARD_TAIL), Some(_)) => return true,
            (Some(WILDCARD_ONE), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
