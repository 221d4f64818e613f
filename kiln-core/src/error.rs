//! Typed error taxonomy for the build engine.
//!
//! Internal plumbing within a single component favors `anyhow` for
//! convenience; errors are converted to [`BuildError`] at component
//! boundaries so callers can match on [`ErrorKind`] to decide retry or exit
//! behavior, per the classification in the specification's error handling
//! design.

use std::fmt;

use thiserror::Error;

/// Coarse classification of a [`BuildError`], used by the solver to decide
/// whether a failure is retryable and by callers to render remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Lex,
    Parse,
    Validation,
    Context,
    Resolve,
    Dependency,
    Permission,
    Network,
    Cache,
    Resource,
    Execution,
    Configuration,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    /// Whether the solver should retry a node that failed with this kind,
    /// per the propagation policy: only `Network` and `Resource` failures
    /// are retried, and `Cancelled` is never retried.
    #[must_use]
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Resource)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Lex => "lex",
            ErrorKind::Parse => "parse",
            ErrorKind::Validation => "validation",
            ErrorKind::Context => "context",
            ErrorKind::Resolve => "resolve",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Permission => "permission",
            ErrorKind::Network => "network",
            ErrorKind::Cache => "cache",
            ErrorKind::Resource => "resource",
            ErrorKind::Execution => "execution",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A build-time error: kind, message, optional cause, the step it occurred
/// in, and remediation suggestions.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct BuildError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    /// Name of the node/step this error occurred in, when applicable.
    pub step: Option<String>,
    pub remediation: Vec<String>,
}

impl BuildError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), cause: None, step: None, remediation: vec![] }
    }

    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    #[must_use]
    pub fn with_remediation(mut self, suggestion: impl Into<String>) -> Self {
        self.remediation.push(suggestion.into());
        self
    }

    #[must_use]
    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    #[must_use]
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    #[must_use]
    pub fn lex(line: usize, col: usize, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Lex, format!("{}:{}: {}", line, col, reason.into()))
    }

    #[must_use]
    pub fn parse(line: usize, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, format!("line {line}: {}", reason.into()))
    }

    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, reason)
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "build was cancelled")
    }

    /// A `Clone`-like copy dropping `cause` (which isn't `Clone`), for
    /// contexts that need to fan an error out to multiple holders, such as
    /// the Solver's shared per-node futures.
    #[must_use]
    pub fn shallow_clone(&self) -> Self {
        Self { kind: self.kind, message: self.message.clone(), cause: None, step: self.step.clone(), remediation: self.remediation.clone() }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Aggregates every leaf error surfaced by a failed solve. The first error in
/// stable order (step index, then node declaration order) is `primary`;
/// the rest are attached as `secondary` for machine consumers.
#[derive(Debug)]
pub struct BuildFailure {
    pub primary: BuildError,
    pub secondary: Vec<BuildError>,
}

impl BuildFailure {
    #[must_use]
    pub fn from_many(mut errors: Vec<BuildError>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let primary = errors.remove(0);
        Some(Self { primary, secondary: errors })
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        if !self.secondary.is_empty() {
            write!(f, " (+{} more error(s))", self.secondary.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildFailure {}
