//! # Error Handling
//!
//! Error types for the gatehouse control plane, built with `thiserror`.
//!
//! Stream-level failures (serialization, send, unknown type URL) end one
//! stream only. Cancellation is modelled as an error value so the stream loop
//! can return it, but [`Error::is_cancellation`] lets callers treat it as a
//! normal termination.

use tonic::{Code, Status};

/// Custom result type for gatehouse operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gatehouse control plane
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network transport errors (gRPC listener, bind failures)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A resource could not be encoded into its wire envelope
    #[error("Serialization error for {type_url}: {source}")]
    Serialization {
        type_url: &'static str,
        #[source]
        source: prost::EncodeError,
    },

    /// A discovery request named a type this server does not serve
    #[error("no resource registered for type URL {0:?}")]
    UnknownTypeUrl(String),

    /// The response side of a stream went away while sending
    #[error("Stream closed: {0}")]
    StreamClosed(String),

    /// The stream's lifetime ended (client disconnect or server shutdown)
    #[error("stream cancelled")]
    Cancelled,

    /// Recording a derived status against a source object failed
    #[error("Status update failed for {object}: {message}")]
    Status { object: String, message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Create a status propagation error for the given object
    pub fn status<O: Into<String>, S: Into<String>>(object: O, message: S) -> Self {
        Self::Status { object: object.into(), message: message.into() }
    }

    /// Whether this error represents a normal end of a stream's lifetime.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Config(errors.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(error: tonic::transport::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<Error> for Status {
    fn from(error: Error) -> Self {
        let code = match &error {
            Error::Config(_) => Code::FailedPrecondition,
            Error::UnknownTypeUrl(_) => Code::InvalidArgument,
            Error::Cancelled => Code::Cancelled,
            Error::StreamClosed(_) => Code::Unavailable,
            Error::Serialization { .. }
            | Error::Transport(_)
            | Error::Status { .. }
            | Error::Io(_)
            | Error::Internal(_) => Code::Internal,
        };
        Status::new(code, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_build_expected_variants() {
        assert!(matches!(Error::config("bad port"), Error::Config(msg) if msg == "bad port"));
        assert!(matches!(Error::internal("boom"), Error::Internal(_)));
        assert!(matches!(Error::transport("bind"), Error::Transport(_)));

        let err = Error::status("default/www", "conflict");
        assert_eq!(err.to_string(), "Status update failed for default/www: conflict");
    }

    #[test]
    fn only_cancelled_counts_as_cancellation() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(!Error::StreamClosed("receiver dropped".into()).is_cancellation());
        assert!(!Error::UnknownTypeUrl("type.googleapis.com/foo".into()).is_cancellation());
    }

    #[test]
    fn errors_map_onto_grpc_codes() {
        let status: Status = Error::UnknownTypeUrl("type.googleapis.com/foo".into()).into();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("type.googleapis.com/foo"));

        let status: Status = Error::Cancelled.into();
        assert_eq!(status.code(), Code::Cancelled);

        let status: Status = Error::internal("oops").into();
        assert_eq!(status.code(), Code::Internal);
    }
}
