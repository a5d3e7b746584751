//! Rewrite-session errors.
//!
//! Fatal conditions abort the session and carry the textual form of
//! the offending node. Non-fatal conditions never surface here: they
//! are recorded as notes in the session log and the pass returns with
//! partial progress.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Non-affine loop bounds, unknown pragma, writer without an
    /// enclosing loop.
    MalformedInput,
    /// A symbol referenced without a declaration.
    MissingDecl,
    /// The scalar type of a subtree could not be inferred.
    UntypedExpression,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedInput => "malformed input",
            ErrorKind::MissingDecl => "missing declaration",
            ErrorKind::UntypedExpression => "untyped expression",
        }
    }
}

/// A fatal rewrite error with the offending node's textual form.
#[derive(Clone, Debug)]
pub struct RewriteError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: Option<String>,
}

impl RewriteError {
    pub fn malformed(message: impl Into<String>) -> Self {
        RewriteError {
            kind: ErrorKind::MalformedInput,
            message: message.into(),
            context: None,
        }
    }

    pub fn missing_decl(name: &str) -> Self {
        RewriteError {
            kind: ErrorKind::MissingDecl,
            message: format!("symbol `{}` referenced without a declaration", name),
            context: None,
        }
    }

    pub fn untyped(message: impl Into<String>) -> Self {
        RewriteError {
            kind: ErrorKind::UntypedExpression,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, node_repr: impl Into<String>) -> Self {
        self.context = Some(node_repr.into());
        self
    }
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)?;
        if let Some(ctx) = &self.context {
            write!(f, "\n  in: {}", ctx)?;
        }
        Ok(())
    }
}

impl std::error::Error for RewriteError {}

pub type Result<T> = std::result::Result<T, RewriteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RewriteError::missing_decl("X").with_context("A[i][j] += X[i] * Y[j];");
        let text = format!("{}", e);
        assert!(text.contains("missing declaration"));
        assert!(text.contains("symbol `X`"));
        assert!(text.contains("in: A[i][j]"));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ErrorKind::MalformedInput.as_str(), "malformed input");
        assert_eq!(RewriteError::malformed("x").kind, ErrorKind::MalformedInput);
        assert_eq!(RewriteError::untyped("x").kind, ErrorKind::UntypedExpression);
    }
}
