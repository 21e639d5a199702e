//! Error taxonomy for deployment attempts and the step engine.

use crate::remote::RemoteError;

/// Failure of a deployment operation.
///
/// Every variant is reported through the response channel; none of them is
/// fatal to the process and all of them leave the orchestrator resumable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeployError {
    /// A precondition was violated by the caller. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A persisted setting the request depends on has never been configured.
    #[error("setting '{0}' is not configured")]
    SettingNotFound(String),

    /// The configured region is not a region the provider knows.
    #[error("'{0}' is not a valid region")]
    InvalidRegion(String),

    /// The remote provider rejected a call.
    #[error("remote call failed ({code}): {message}")]
    RemoteCallFailed { code: String, message: String },

    /// The change set was described successfully but cannot be executed.
    #[error("change set is not usable, execution status is {status}")]
    ChangeSetNotUsable { status: String },

    /// The user declined the change set or abandoned the operation.
    #[error("operation cancelled")]
    OperationCancelled,

    /// A bounded wait ran out of time.
    #[error("timed out after {seconds}s waiting for {what}")]
    PollTimeout { what: String, seconds: u64 },

    /// The operation is not valid in the current state.
    #[error("operation is not valid in the current state: {0}")]
    OperationInvalid(String),

    /// The stack settled in a terminal status that is not a success.
    #[error("the '{stack}' stack status is {status}")]
    StackStatusInvalid { stack: String, status: String },

    /// The persistent store could not be read or written.
    #[error("settings store error: {0}")]
    Store(String),

    /// A local file the operation depends on could not be read or written.
    #[error("file access failed: {0}")]
    FileAccess(String),

    /// An external build or push process reported a failure.
    #[error("external process failed: {0}")]
    ProcessFailed(String),
}

impl DeployError {
    /// Stable error code, suitable for lookups in a localized text table.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::SettingNotFound(_) => "NoSettingKeyFound",
            Self::InvalidRegion(_) => "InvalidRegion",
            Self::RemoteCallFailed { code, .. } => code,
            Self::ChangeSetNotUsable { .. } => "ChangeSetStatusInvalid",
            Self::OperationCancelled => "OperationCancelled",
            Self::PollTimeout { .. } => "PollTimeout",
            Self::OperationInvalid(_) => "OperationInvalid",
            Self::StackStatusInvalid { .. } => "StackStatusInvalid",
            Self::Store(_) => "StoreFailed",
            Self::FileAccess(_) => "FileAccessFailed",
            Self::ProcessFailed(_) => "ProcessFailed",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::OperationCancelled)
    }

    pub(crate) fn invalid_argument(what: impl Into<String>) -> Self {
        Self::InvalidArgument(what.into())
    }
}

impl From<RemoteError> for DeployError {
    fn from(err: RemoteError) -> Self {
        Self::RemoteCallFailed {
            code: err.code,
            message: err.message,
        }
    }
}

/// Result alias used across the crate.
pub type DeployResult<T> = Result<T, DeployError>;
