use std::error::Error as StdError;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Any failure that cannot be confidently attributed to any other error
    /// category in this enum.
    ///
    /// In particular this means that use of Internal is never a guarantee
    /// the error is not, for example, due to a user error - merely that it
    /// cannot be confidently determined by the code.
    Internal,

    /// The user provided invalid input, asked for the operation to stop,
    /// or performed an action that is unsupported or impossible to complete.
    User,
}

/// Fine-grained condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The container header is malformed (bad magic, bad field values).
    Format,
    /// The input carries our magic but a version we do not understand.
    UnsupportedVersion,
    /// Input data ended before the expected component could be read.
    TruncatedInput,
    /// Additional bytes were present after the ciphertext (and tag).
    TrailingData,
    /// Password, salt, iteration count or option values have an invalid shape.
    InvalidInput,
    /// The authentication tag of a version 2 container did not match. Either
    /// the password is wrong or the file was tampered with or corrupted.
    IntegrityFailed,
    /// The decrypted bytes do not look like the declared media type, which
    /// almost always means the password is wrong.
    WrongPasswordSuspected,
    /// The caller cancelled the operation. Not a failure.
    Cancelled,
    /// A usable password could not be obtained from the configured reader.
    PasswordUnavailable,
    /// Unexpected state reached within secure-media logic.
    InternalInvariant,
    /// Interaction with the filesystem, stdin/stdout, or other I/O failed.
    Io,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct SecureMediaError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Optional specific condition tag for consumers that need to
    /// branch their behavior. Any code consuming errors MUST handle
    /// the absence of a defined kind.
    pub kind: Option<ErrorKind>,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl SecureMediaError {
    /// Creates a new error with a required category and display message.
    pub fn new(category: ErrorCategory, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: None,
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that also tags the failure with a kind.
    pub fn with_kind(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that retains the originating source error.
    pub fn with_source(
        category: ErrorCategory,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: None,
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// Creates a new error that carries both a kind tag and the originating source error.
    pub fn with_kind_and_source(
        category: ErrorCategory,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind: Some(kind),
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// Shorthand for a user-caused header problem.
    pub(crate) fn format(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorCategory::User, kind, msg)
    }

    /// Shorthand for an argument with an invalid shape.
    pub(crate) fn invalid_input(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorCategory::User, ErrorKind::InvalidInput, msg)
    }

    pub(crate) fn cancelled() -> Self {
        Self::with_kind(
            ErrorCategory::User,
            ErrorKind::Cancelled,
            "operation cancelled",
        )
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// The kind tag. `with_context` carries it over from the wrapped error.
    pub fn kind(&self) -> Option<ErrorKind> {
        self.kind
    }

    /// True if the error only records that the caller cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        self.kind == Some(ErrorKind::Cancelled)
    }

    /// Wraps the current error with a higher-level message while preserving the original as source.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        Self {
            category,
            kind,
            source: Some(Box::new(self)),
            msg: msg.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, SecureMediaError>;
