//! Error taxonomy for the compiler host.
//!
//! Three kinds of protocol error exist on the wire: `PARSE` (malformed
//! inbound frame or unset union), `PARAMS` (well-formed but semantically
//! invalid), and `INTERNAL` (any unexpected failure inside the host). All
//! three are fatal: the dispatcher emits one final `Error` frame and tears
//! the process down with exit code 76.

use thiserror::Error;

use crate::proto;

/// Sentinel id for errors not attributable to a specific request.
pub const ERROR_ID: u32 = 0xFFFF_FFFF;

/// Process exit codes.
pub mod exit {
    /// Clean stdin EOF.
    pub const OK: i32 = 0;
    /// CLI misuse.
    pub const USAGE: i32 = 64;
    /// Fatal protocol error.
    pub const PROTOCOL: i32 = 76;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Params,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Parse => "parse",
            ErrorKind::Params => "params",
            ErrorKind::Internal => "internal",
        }
    }

    fn to_proto(self) -> proto::ErrorType {
        match self {
            ErrorKind::Parse => proto::ErrorType::Parse,
            ErrorKind::Params => proto::ErrorType::Params,
            ErrorKind::Internal => proto::ErrorType::Internal,
        }
    }
}

/// A fatal protocol error, labelled with the id of the request that caused
/// it when one is known.
#[derive(Debug, Clone, Error)]
#[error("{} error: {message}", .kind.as_str())]
pub struct ProtocolError {
    pub kind: ErrorKind,
    pub id: u32,
    pub message: String,
}

impl ProtocolError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Parse,
            id: ERROR_ID,
            message: message.into(),
        }
    }

    pub fn params(id: u32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Params,
            id,
            message: message.into(),
        }
    }

    pub fn internal(id: u32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            id,
            message: message.into(),
        }
    }

    pub fn to_proto(&self) -> proto::ProtocolError {
        proto::ProtocolError {
            r#type: self.kind.to_proto() as i32,
            id: self.id,
            message: self.message.clone(),
        }
    }

    /// The diagnostic line written to stderr before the process exits.
    pub fn stderr_line(&self) -> String {
        match self.kind {
            ErrorKind::Internal => format!("Internal compiler error: {}", self.message),
            kind if self.id == ERROR_ID => {
                format!("Host caused {} error: {}", kind.as_str(), self.message)
            }
            kind => format!(
                "Host caused {} error with request {}: {}",
                kind.as_str(),
                self.id,
                self.message
            ),
        }
    }
}

impl From<prost::DecodeError> for ProtocolError {
    fn from(err: prost::DecodeError) -> Self {
        ProtocolError::parse(format!("Invalid protocol buffer: {err}"))
    }
}

/// Umbrella error for the host runtime.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl HostError {
    /// The exit code the process should terminate with.
    pub fn exit_code(&self) -> i32 {
        exit::PROTOCOL
    }
}

pub type HostResult<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_line_includes_request_id_when_known() {
        let err = ProtocolError::params(42, "bad response");
        assert_eq!(
            err.stderr_line(),
            "Host caused params error with request 42: bad response"
        );
    }

    #[test]
    fn stderr_line_omits_sentinel_id() {
        let err = ProtocolError::parse("truncated frame");
        assert_eq!(err.stderr_line(), "Host caused parse error: truncated frame");
    }

    #[test]
    fn internal_errors_use_compiler_error_line() {
        let err = ProtocolError::internal(ERROR_ID, "boom");
        assert_eq!(err.stderr_line(), "Internal compiler error: boom");
    }

    #[test]
    fn proto_conversion_carries_kind_and_id() {
        let err = ProtocolError::params(7, "x");
        let wire = err.to_proto();
        assert_eq!(wire.r#type, proto::ErrorType::Params as i32);
        assert_eq!(wire.id, 7);
    }
}
