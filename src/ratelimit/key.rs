//! Subjects and counter keys.

use std::fmt;
use std::net::IpAddr;

use crate::error::{BouncerError, Result};

/// Longest identifier accepted for any subject (the RFC 5321 address limit).
const MAX_SUBJECT_LEN: usize = 320;

/// What a subject identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    /// Network origin
    Ip,
    /// Email address
    Email,
    /// Account or user identifier
    Account,
}

impl SubjectKind {
    /// Short name used inside counter keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Ip => "ip",
            SubjectKind::Email => "email",
            SubjectKind::Account => "user",
        }
    }
}

/// The identity a rate limit is scoped to. Always validated and normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    kind: SubjectKind,
    id: String,
}

impl Subject {
    /// An IP address subject.
    ///
    /// `::1` is folded into `127.0.0.1` and IPv4-mapped IPv6 addresses lose
    /// their `::ffff:` prefix, so both stacks share one counter.
    pub fn ip(raw: &str) -> Result<Self> {
        let trimmed = check_raw("IP address", raw)?;

        let folded = if trimmed == "::1" {
            "127.0.0.1"
        } else {
            trimmed
                .strip_prefix("::ffff:")
                .or_else(|| trimmed.strip_prefix("::FFFF:"))
                .unwrap_or(trimmed)
        };

        let addr: IpAddr = folded
            .parse()
            .map_err(|_| BouncerError::InvalidSubject(format!("'{}' is not an IP address", trimmed)))?;

        Ok(Self {
            kind: SubjectKind::Ip,
            id: addr.to_string(),
        })
    }

    /// An email subject. Case is folded.
    pub fn email(raw: &str) -> Result<Self> {
        let trimmed = check_raw("email", raw)?;

        let mut parts = trimmed.split('@');
        let valid = match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(domain), None) => !local.is_empty() && !domain.is_empty(),
            _ => false,
        };
        if !valid {
            return Err(BouncerError::InvalidSubject(
                "email must have the form local@domain".to_string(),
            ));
        }

        Ok(Self {
            kind: SubjectKind::Email,
            id: trimmed.to_lowercase(),
        })
    }

    /// An account identifier subject.
    pub fn account(raw: &str) -> Result<Self> {
        let trimmed = check_raw("account id", raw)?;
        Ok(Self {
            kind: SubjectKind::Account,
            id: trimmed.to_string(),
        })
    }

    /// The subject kind.
    pub fn kind(&self) -> SubjectKind {
        self.kind
    }

    /// The normalized identifier.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Shared checks for every subject kind. Returns the trimmed identifier.
fn check_raw<'a>(what: &str, raw: &'a str) -> Result<&'a str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BouncerError::InvalidSubject(format!("{} is empty", what)));
    }
    if trimmed.len() > MAX_SUBJECT_LEN {
        return Err(BouncerError::InvalidSubject(format!("{} is too long", what)));
    }
    if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(BouncerError::InvalidSubject(format!(
            "{} contains whitespace or control characters",
            what
        )));
    }
    Ok(trimmed)
}

/// A key identifying one (class, subject) counter in the store.
///
/// Rendered as `ratelimit:{class}:{kind}:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    /// Create the key for a subject under a class.
    pub fn new(class: &str, subject: &Subject) -> Self {
        Self(format!(
            "ratelimit:{}:{}:{}",
            class,
            subject.kind.as_str(),
            subject.id
        ))
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
