//! Caller-facing errors of the coordination engine.

use std::{fmt, io};

use thiserror::Error;

use crate::{
    bundle::BundleError,
    integrity::IntegrityError,
    store::StoreError,
    supervisor::SupervisorError,
};

#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The request is invalid for the current state.
    #[error("{0}")]
    Validation(String),
    /// A system-wide invariant would be violated.
    #[error("{0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<BundleError> for CoordinationError {
    fn from(err: BundleError) -> Self {
        match err {
            BundleError::Io(err) => Self::Io(err),
            invalid => Self::Validation(invalid.to_string()),
        }
    }
}

impl CoordinationError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn not_found(what: impl fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::Supervisor(SupervisorError::DependencyInstall(_)) => {
                ErrorKind::DependencyInstall
            }
            Self::Supervisor(_) => ErrorKind::Supervisor,
            Self::Store(_) | Self::Io(_) => ErrorKind::Store,
        }
    }
}

/// The category of a [`CoordinationError`] as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Integrity,
    DependencyInstall,
    Supervisor,
    Store,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Integrity => "integrity",
            Self::DependencyInstall => "dependency_install",
            Self::Supervisor => "supervisor",
            Self::Store => "store",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_errors_are_validation_errors() {
        let err = CoordinationError::from(BundleError::MissingFile("pyproject.toml"));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "missing required file: pyproject.toml");

        let err = CoordinationError::from(BundleError::Io(io::ErrorKind::Other.into()));
        assert_eq!(err.kind(), ErrorKind::Store);
    }

    #[test]
    fn test_dependency_install_has_its_own_kind() {
        let err = CoordinationError::from(SupervisorError::DependencyInstall("boom".into()));
        assert_eq!(err.kind(), ErrorKind::DependencyInstall);
        let err = CoordinationError::from(SupervisorError::Unsupported);
        assert_eq!(err.kind(), ErrorKind::Supervisor);
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_value(ErrorKind::NotFound).unwrap(),
            serde_json::json!("not_found")
        );
    }
}
