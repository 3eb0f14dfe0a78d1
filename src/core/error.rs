use crate::core::constants::status;
use crate::engine::{CallFault, EntryPoint};
use thiserror::Error;

/// Core error types for wfpctl
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-provided value violates a precondition
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The operation is illegal in the current manager or builder state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The engine returned a non-zero status
    #[error("{entry} returned engine status {code:#010X} ({})", describe_status(.code))]
    Backend { entry: EntryPoint, code: u32 },

    /// The call mechanism failed before the engine produced a status
    #[error("{entry} transport failure: {message}")]
    Transport { entry: EntryPoint, message: String },

    /// An unwinding fault was caught at the engine boundary
    #[error("{entry} raised a fault: {message}")]
    Fault { entry: EntryPoint, message: String },

    /// The loaded engine does not export the needed entry point
    #[error("Not implemented by the loaded engine: {0}")]
    NotImplemented(String),

    /// Another error with a short description of what was being attempted
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    /// I/O operation failed (configuration files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed (configuration files)
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reported error kind, independent of how many context layers wrap it
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    InvalidInput,
    InvalidState,
    Backend(u32),
    Transport,
    Fault,
    NotImplemented,
    Config,
}

impl Error {
    /// Returns the kind of the innermost error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Backend { code, .. } => ErrorKind::Backend(*code),
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Fault { .. } => ErrorKind::Fault,
            Error::NotImplemented(_) => ErrorKind::NotImplemented,
            Error::Context { source, .. } => source.kind(),
            Error::Io(_) | Error::Serialization(_) => ErrorKind::Config,
        }
    }

    /// Engine status carried by this error, if it came from the engine.
    pub fn status(&self) -> Option<u32> {
        match self.kind() {
            ErrorKind::Backend(code) => Some(code),
            _ => None,
        }
    }

    /// Faults after which the engine session can no longer be trusted.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fault | ErrorKind::Transport)
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Normalizes a raw engine outcome into the crate taxonomy.
    pub fn from_call(entry: EntryPoint, fault: CallFault) -> Self {
        match fault {
            CallFault::Status(code) => Error::Backend { entry, code },
            CallFault::Transport(message) => Error::Transport { entry, message },
            CallFault::Missing(export) => {
                Error::NotImplemented(format!("{entry} (export `{export}` not found)"))
            }
        }
    }
}

/// Adds a contextual prefix to the error of a `Result`.
pub trait ResultExt<T> {
    fn context(self, context: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}

/// Short description of a well-known engine status.
///
/// Unknown codes are described generically; the numeric value is always
/// part of the rendered error so nothing is lost.
pub fn describe_status(code: &u32) -> &'static str {
    match *code {
        status::CALLOUT_NOT_FOUND => "callout not found",
        status::CONDITION_NOT_FOUND => "condition not found",
        status::FILTER_NOT_FOUND => "filter not found",
        status::LAYER_NOT_FOUND => "layer not found",
        status::PROVIDER_NOT_FOUND => "provider not found",
        status::PROVIDER_CONTEXT_NOT_FOUND => "provider context not found",
        status::SUBLAYER_NOT_FOUND => "sublayer not found",
        status::NOT_FOUND => "object not found",
        status::ALREADY_EXISTS => "object already exists",
        status::IN_USE => "object is referenced by other objects",
        status::WRONG_SESSION => "object belongs to another session",
        status::NO_TXN_IN_PROGRESS => "no transaction in progress",
        status::TXN_IN_PROGRESS => "a transaction is already in progress",
        status::TXN_ABORTED => "transaction was aborted",
        status::SESSION_ABORTED => "session was aborted",
        status::INVALID_HANDLE => "invalid handle",
        status::INVALID_ARGUMENT => "invalid argument",
        status::ACCESS_DENIED => "access denied (administrator rights required)",
        _ => "unrecognized engine status",
    }
}

pub type Result<T> = std::result::Result<T, Error>;
