//! Error types for persistor
//!
//! Every persistor operation fails with one of three kinds: the object is
//! missing, a read failed, or a write/delete failed. Each error keeps the
//! original cause and the `(location, key)` it was raised for.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed cause carried by every error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Structured context attached to an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub location: Option<String>,
    pub key: Option<String>,
    pub info: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new(location: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            key: Some(key.into()),
            info: BTreeMap::new(),
        }
    }

    pub fn location(location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Self::default()
        }
    }

    pub fn with_info(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.info.insert(name.into(), value.to_string());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "location={} key={}",
            self.location.as_deref().unwrap_or("-"),
            self.key.as_deref().unwrap_or("-")
        )?;
        for (name, value) in &self.info {
            write!(f, " {}={}", name, value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Read,
    Write,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{message} ({context})")]
    NotFound {
        message: String,
        context: ErrorContext,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{message} ({context})")]
    Read {
        message: String,
        context: ErrorContext,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{message} ({context})")]
    Write {
        message: String,
        context: ErrorContext,
        #[source]
        source: Option<BoxError>,
    },
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>, context: ErrorContext) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotFound => Error::NotFound {
                message,
                context,
                source: None,
            },
            ErrorKind::Read => Error::Read {
                message,
                context,
                source: None,
            },
            ErrorKind::Write => Error::Write {
                message,
                context,
                source: None,
            },
        }
    }

    pub fn not_found(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::new(ErrorKind::NotFound, message, context)
    }

    pub fn read(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::new(ErrorKind::Read, message, context)
    }

    pub fn write(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::new(ErrorKind::Write, message, context)
    }

    /// Wrap `cause` as an error of `kind`.
    ///
    /// A cause that is itself a not-found condition (a persistor
    /// `NotFound`, a [`BackendError`] of kind `NotFound`, or an
    /// `io::ErrorKind::NotFound`) always yields `NotFound`, whatever `kind`
    /// the call site asked for.
    pub fn wrap(
        kind: ErrorKind,
        message: impl Into<String>,
        cause: impl Into<BoxError>,
        context: ErrorContext,
    ) -> Self {
        let cause = cause.into();
        let kind = if is_not_found(cause.as_ref()) {
            ErrorKind::NotFound
        } else {
            kind
        };
        Self::new(kind, message, context).caused_by(cause)
    }

    /// Attach `cause` without reclassifying.
    pub fn caused_by(mut self, cause: impl Into<BoxError>) -> Self {
        let cause = cause.into();
        match &mut self {
            Error::NotFound { source, .. }
            | Error::Read { source, .. }
            | Error::Write { source, .. } => *source = Some(cause),
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Read { .. } => ErrorKind::Read,
            Error::Write { .. } => ErrorKind::Write,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn message(&self) -> &str {
        match self {
            Error::NotFound { message, .. }
            | Error::Read { message, .. }
            | Error::Write { message, .. } => message,
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            Error::NotFound { context, .. }
            | Error::Read { context, .. }
            | Error::Write { context, .. } => context,
        }
    }

    /// The wrapped cause, if any.
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Error::NotFound { source, .. }
            | Error::Read { source, .. }
            | Error::Write { source, .. } => source.as_deref(),
        }
    }
}

fn is_not_found(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
    if let Some(err) = err.downcast_ref::<Error>() {
        return err.is_not_found();
    }
    if let Some(err) = err.downcast_ref::<BackendError>() {
        return err.kind == BackendErrorKind::NotFound;
    }
    if let Some(err) = err.downcast_ref::<std::io::Error>() {
        return err.kind() == std::io::ErrorKind::NotFound;
    }
    false
}

/// How a cloud transport classified a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    NotFound,
    AccessDenied,
    Other,
}

/// Failure reported by a cloud transport (`S3Api`, `GcsApi`).
#[derive(Error, Debug)]
#[error("{kind:?}: {source}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    #[source]
    pub source: BoxError,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn not_found(source: impl Into<BoxError>) -> Self {
        Self::new(BackendErrorKind::NotFound, source)
    }

    pub fn other(source: impl Into<BoxError>) -> Self {
        Self::new(BackendErrorKind::Other, source)
    }

    /// Not-found on a read path; forbidden responses count as missing.
    pub fn is_missing(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::NotFound | BackendErrorKind::AccessDenied
        )
    }

    /// Map onto the taxonomy for a read-path operation.
    pub fn into_read_error(self, message: &str, context: ErrorContext) -> Error {
        let kind = if self.is_missing() {
            ErrorKind::NotFound
        } else {
            ErrorKind::Read
        };
        Error::new(kind, message, context).caused_by(self)
    }

    /// Map onto the taxonomy for a write/delete-path operation.
    pub fn into_write_error(self, message: &str, context: ErrorContext) -> Error {
        Error::wrap(ErrorKind::Write, message, self, context)
    }
}
