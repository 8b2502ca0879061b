//! Subject naming for data-plane endpoints and control-plane discovery.
//!
//! Endpoint subjects are the `.`-joined chain of group prefixes followed by
//! the endpoint's explicit subject (or its name). Segments are never escaped,
//! so every segment is validated before it is joined.
//!
//! Control subjects live under a reserved root (`$SRV` by default) and come in
//! three scopes per verb: broadcast, per-service, and per-instance.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Root token of all control subjects.
pub const API_PREFIX: &str = "$SRV";

/// Queue group used by endpoints that do not name one.
pub const DEFAULT_QUEUE_GROUP: &str = "q";

/// Token separator.
pub const SEPARATOR: char = '.';

/// Single-token wildcard.
pub const WILDCARD_ONE: &str = "*";

/// Tail wildcard, matches one or more trailing tokens.
pub const WILDCARD_TAIL: &str = ">";

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex is valid"));

// Semantic Versioning 2.0.0 reference pattern.
static SEMVER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-((?:0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*)(?:\.(?:0|[1-9]\d*|\d*[a-zA-Z-][0-9a-zA-Z-]*))*))?(?:\+([0-9a-zA-Z-]+(?:\.[0-9a-zA-Z-]+)*))?$",
    )
    .expect("static regex is valid")
});

/// Errors produced while validating identifiers and subject segments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectError {
    #[error("invalid {kind} name {name:?}: only A-Z, a-z, 0-9, '-' and '_' are allowed")]
    InvalidName { kind: &'static str, name: String },
    #[error("invalid version {0:?}: expected a semantic version")]
    InvalidVersion(String),
    #[error("invalid subject segment {segment:?}: {reason}")]
    InvalidSegment {
        segment: String,
        reason: &'static str,
    },
    #[error("invalid queue group {0:?}")]
    InvalidQueueGroup(String),
}

// ---------------------------------------------------------------------------
// Verb
// ---------------------------------------------------------------------------

/// Discovery verbs answered by every running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Ping,
    Info,
    Stats,
}

impl Verb {
    /// All verbs, in subscription order.
    pub const ALL: [Verb; 3] = [Verb::Ping, Verb::Info, Verb::Stats];

    /// The wire token of the verb.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Ping => "PING",
            Verb::Info => "INFO",
            Verb::Stats => "STATS",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Control subjects
// ---------------------------------------------------------------------------

/// Builds a control subject for `verb`.
///
/// `id` is only used when `service` is present: an instance is always
/// addressed through its service name.
///
/// ```
/// use micro_core::subject::{control_subject, Verb, API_PREFIX};
///
/// assert_eq!(control_subject(API_PREFIX, Verb::Ping, None, None), "$SRV.PING");
/// assert_eq!(
///     control_subject(API_PREFIX, Verb::Stats, Some("demo"), Some("abc")),
///     "$SRV.STATS.demo.abc"
/// );
/// ```
#[must_use]
pub fn control_subject(prefix: &str, verb: Verb, service: Option<&str>, id: Option<&str>) -> String {
    match (service, id) {
        (Some(service), Some(id)) => format!("{prefix}.{verb}.{service}.{id}"),
        (Some(service), None) => format!("{prefix}.{verb}.{service}"),
        (None, _) => format!("{prefix}.{verb}"),
    }
}

/// The three subjects a service instance listens on for `verb`:
/// broadcast, per-service and per-instance.
#[must_use]
pub fn control_subjects(prefix: &str, verb: Verb, service: &str, id: &str) -> [String; 3] {
    [
        control_subject(prefix, verb, None, None),
        control_subject(prefix, verb, Some(service), None),
        control_subject(prefix, verb, Some(service), Some(id)),
    ]
}

// ---------------------------------------------------------------------------
// Endpoint subjects
// ---------------------------------------------------------------------------

/// Joins a group prefix chain and a leaf segment into a fully-qualified subject.
///
/// Every prefix must be a plain token. The leaf may additionally be a bare
/// `*` or `>` wildcard.
///
/// # Errors
///
/// Returns [`SubjectError::InvalidSegment`] for the first segment that is
/// empty, contains the separator, whitespace, or a misplaced wildcard.
///
/// ```
/// use micro_core::subject::endpoint_subject;
///
/// assert_eq!(endpoint_subject(&["demo"], "ECHO").unwrap(), "demo.ECHO");
/// assert!(endpoint_subject(&["a.b"], "c").is_err());
/// ```
pub fn endpoint_subject<S: AsRef<str>>(prefixes: &[S], leaf: &str) -> Result<String, SubjectError> {
    let mut subject = String::new();
    for prefix in prefixes {
        let prefix = prefix.as_ref();
        validate_prefix(prefix)?;
        subject.push_str(prefix);
        subject.push(SEPARATOR);
    }
    validate_leaf(leaf)?;
    subject.push_str(leaf);
    Ok(subject)
}

/// Validates a group prefix token.
///
/// # Errors
///
/// Returns [`SubjectError::InvalidSegment`] when the token is not a plain token.
pub fn validate_prefix(segment: &str) -> Result<(), SubjectError> {
    check_token(segment)?;
    if segment.contains(['*', '>']) {
        return Err(invalid(segment, "wildcards are not allowed in group prefixes"));
    }
    Ok(())
}

/// Validates the last segment of an endpoint subject.
///
/// # Errors
///
/// Returns [`SubjectError::InvalidSegment`] when the token is neither a plain
/// token nor a bare wildcard.
pub fn validate_leaf(segment: &str) -> Result<(), SubjectError> {
    check_token(segment)?;
    if segment == WILDCARD_ONE || segment == WILDCARD_TAIL {
        return Ok(());
    }
    if segment.contains(['*', '>']) {
        return Err(invalid(segment, "wildcards must stand alone"));
    }
    Ok(())
}

fn check_token(segment: &str) -> Result<(), SubjectError> {
    if segment.is_empty() {
        return Err(invalid(segment, "segment is empty"));
    }
    if segment.contains(SEPARATOR) {
        return Err(invalid(segment, "segment contains the '.' separator"));
    }
    if segment.chars().any(char::is_whitespace) {
        return Err(invalid(segment, "segment contains whitespace"));
    }
    Ok(())
}

fn invalid(segment: &str, reason: &'static str) -> SubjectError {
    SubjectError::InvalidSegment {
        segment: segment.to_string(),
        reason,
    }
}

// ---------------------------------------------------------------------------
// Identifier validation
// ---------------------------------------------------------------------------

/// Validates a service or endpoint name. `kind` names the identifier in the error.
///
/// # Errors
///
/// Returns [`SubjectError::InvalidName`] when `name` is empty or has characters
/// outside `[A-Za-z0-9_-]`.
pub fn validate_name(kind: &'static str, name: &str) -> Result<(), SubjectError> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(SubjectError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

/// Validates a semantic version string.
///
/// # Errors
///
/// Returns [`SubjectError::InvalidVersion`] when `version` is not semver.
pub fn validate_version(version: &str) -> Result<(), SubjectError> {
    if SEMVER_RE.is_match(version) {
        Ok(())
    } else {
        Err(SubjectError::InvalidVersion(version.to_string()))
    }
}

/// Validates a queue group label.
///
/// # Errors
///
/// Returns [`SubjectError::InvalidQueueGroup`] when the label is empty or
/// contains whitespace.
pub fn validate_queue_group(queue_group: &str) -> Result<(), SubjectError> {
    if queue_group.is_empty() || queue_group.chars().any(char::is_whitespace) {
        return Err(SubjectError::InvalidQueueGroup(queue_group.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Returns `true` if `subject` is matched by the subscription `pattern`.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
///
/// ```
/// use micro_core::subject::matches;
///
/// assert!(matches("$SRV.PING", "$SRV.PING"));
/// assert!(matches("demo.*", "demo.ECHO"));
/// assert!(matches("demo.>", "demo.a.b"));
/// assert!(!matches("demo.>", "demo"));
/// ```
#[must_use]
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split(SEPARATOR);
    for token in pattern.split(SEPARATOR) {
        if token == WILDCARD_TAIL {
            return subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(candidate) if token == WILDCARD_ONE || token == candidate => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}
