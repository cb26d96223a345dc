//! Script errors
//!
//! Every failure the engine can report is an [`Error`]. Errors have a stable
//! script-visible name (see [`Error::name`]) that `catch` clauses match
//! against. `SyntaxError` is the parent of its specific subtypes, and the
//! generic name `Error` matches everything.

use quill_core::CodecError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntaxErrorKind {
    General,
    UnexpectedToken,
    MissingToken,
    MissingColon,
}

impl SyntaxErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            SyntaxErrorKind::General => "SyntaxError",
            SyntaxErrorKind::UnexpectedToken => "UnexpectedTokenError",
            SyntaxErrorKind::MissingToken => "MissingTokenError",
            SyntaxErrorKind::MissingColon => "MissingColonError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("line {line}: {message}")]
    Syntax {
        kind: SyntaxErrorKind,
        message: String,
        line: usize,
    },

    #[error("{0}")]
    Type(String),

    #[error("{0}")]
    Arithmetic(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    WrongArguments(String),

    #[error("{0}")]
    ReadOnly(String),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    Deserialization(String),

    /// A record reference whose record no longer exists.
    #[error("{0}")]
    Null(String),

    /// Engine contract violation detected at run time.
    #[error("{0}")]
    Illegal(String),

    /// Raised by a script `throw` statement.
    #[error("{0}")]
    Thrown(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn syntax(kind: SyntaxErrorKind, line: usize, message: impl Into<String>) -> Self {
        Error::Syntax {
            kind,
            message: message.into(),
            line,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Error::Syntax { kind, .. } => kind.name(),
            Error::Type(_) => "TypeError",
            Error::Arithmetic(_) => "ArithmeticError",
            Error::NotFound(_) => "NotFoundError",
            Error::WrongArguments(_) => "WrongArgumentsError",
            Error::ReadOnly(_) => "ReadOnlyError",
            Error::Invalid(_) => "InvalidError",
            Error::Deserialization(_) => "DeserializationError",
            Error::Null(_) => "NullError",
            Error::Illegal(_) => "IllegalError",
            Error::Thrown(_) => "Error",
        }
    }

    /// Whether a `catch <name>` clause handles this error.
    pub fn matches(&self, name: &str) -> bool {
        name == "Error"
            || name == self.name()
            || (name == "SyntaxError" && matches!(self, Error::Syntax { .. }))
    }

    /// Source line carried by syntax errors.
    pub fn line(&self) -> Option<usize> {
        match self {
            Error::Syntax { line, .. } => Some(*line),
            _ => None,
        }
    }

    /// `Name: message`, as shown to script authors.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.name(), self)
    }
}

impl From<CodecError> for Error {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::TooLong { .. } => Error::Invalid(error.to_string()),
            other => Error::Deserialization(other.to_string()),
        }
    }
}

/// An uncaught error at the process boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub error: Error,
    /// Line of the statement that raised the error.
    pub line: usize,
    /// The failing statement, pretty-printed.
    pub statement: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Error::Syntax { kind, message, line } => {
                write!(f, "line {}: {}: {}", line, kind.name(), message)
            }
            error => write!(f, "line {}: {}", self.line, error.describe()),
        }
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_matching() {
        let missing = Error::syntax(SyntaxErrorKind::MissingColon, 3, "expected ':'");
        assert!(missing.matches("MissingColonError"));
        assert!(missing.matches("SyntaxError"));
        assert!(missing.matches("Error"));
        assert!(!missing.matches("TypeError"));

        let thrown = Error::Thrown("boom".into());
        assert_eq!(thrown.name(), "Error");
        assert!(!thrown.matches("TypeError"));
    }

    #[test]
    fn test_failure_display() {
        let failure = Failure {
            error: Error::Type("cannot add Number and Text".into()),
            line: 4,
            statement: "a = 1 + 'x'".into(),
        };
        assert_eq!(
            failure.to_string(),
            "line 4: TypeError: cannot add Number and Text"
        );
    }

    #[test]
    fn test_codec_errors_become_deserialization() {
        let error: Error = CodecError::UnsupportedVersion(7).into();
        assert_eq!(error.name(), "DeserializationError");
        let error: Error = CodecError::TooLong { len: 1 << 40 }.into();
        assert_eq!(error.name(), "InvalidError");
    }
}
