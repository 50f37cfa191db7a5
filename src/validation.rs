//! Named predicates and aggregated validation reports
//!
//! Requests and storage-engine commands are validated the same way: every
//! predicate in a list is evaluated and each failing one is recorded by name,
//! so a caller sees all violations in a single report.

use std::fmt;

use thiserror::Error;

/// A named check over a value of type `T`
pub struct Predicate<T> {
    name: &'static str,
    check: fn(&T) -> bool,
}

impl<T> Predicate<T> {
    /// Create a predicate with a human-readable name
    pub const fn new(name: &'static str, check: fn(&T) -> bool) -> Self {
        Self { name, check }
    }

    /// Name reported when the predicate fails
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Evaluate the predicate
    pub fn holds(&self, value: &T) -> bool {
        (self.check)(value)
    }
}

impl<T> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Predicate<T> {}

impl<T> fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Predicate").field(&self.name).finish()
    }
}

/// Every predicate that failed for one validated subject
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{subject} validation failed: {}", .violations.join(", "))]
pub struct ValidationReport {
    /// What was validated (an operation or request kind)
    pub subject: &'static str,
    /// Names of the failed predicates, in evaluation order
    pub violations: Vec<&'static str>,
}

impl ValidationReport {
    /// Whether the named predicate is among the violations
    pub fn contains(&self, name: &str) -> bool {
        self.violations.iter().any(|v| *v == name)
    }
}

/// Run every predicate against `value`, collecting all failures
pub fn run_checks<'a, T: 'a>(
    subject: &'static str,
    value: &T,
    checks: impl IntoIterator<Item = &'a Predicate<T>>,
) -> Result<(), ValidationReport> {
    let violations: Vec<&'static str> = checks
        .into_iter()
        .filter(|p| !p.holds(value))
        .map(Predicate::name)
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationReport {
            subject,
            violations,
        })
    }
}

/// Whether `token` is safe to pass as a positional argument.
///
/// Rejects empty strings, a leading `-` (would be parsed as an option) and
/// whitespace or NUL characters.
pub fn is_safe_token(token: &str) -> bool {
    !token.is_empty()
        && !token.starts_with('-')
        && !token.chars().any(|c| c.is_whitespace() || c == '\0')
}
