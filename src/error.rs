//! Crate-wide error taxonomy.
//!
//! Every fallible operation in `cellbroker` returns [`Error`]. Transport and
//! codec layers produce their own leaf error types and convert into this one
//! with `?`, the same shape the driver this crate grew out of used for its
//! `Error` enum, generalized from a hand-rolled `no_std` enum to a
//! `thiserror`-derived one now that the crate targets `std`.

use thiserror::Error as ThisError;

use crate::at::AtError;
use crate::pdu::PduError;
use crate::qmi::QmiError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: code {code}")]
    ProtocolError { code: i32 },

    #[error("operation unsupported")]
    Unsupported,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("wrong state: {0}")]
    WrongState(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("too many: {0}")]
    TooMany(String),

    #[error("dispatcher failed: {reason}")]
    DispatcherFailed { reason: String },

    #[error("sim failure: {0}")]
    SimFailure(String),

    #[error(transparent)]
    At(#[from] AtError),

    #[error(transparent)]
    Qmi(#[from] QmiError),

    #[error(transparent)]
    Pdu(#[from] PduError),
}

impl Error {
    /// Annotate an error with the ladder step name it occurred in, per the
    /// propagation rule: "errors from a step are annotated with the step
    /// name (via prefixing) and returned up the ladder."
    pub fn step(name: &str, err: Error) -> Error {
        match err {
            Error::Transport(msg) => Error::Transport(format!("{name}: {msg}")),
            Error::WrongState(msg) => Error::WrongState(format!("{name}: {msg}")),
            Error::SimFailure(msg) => Error::SimFailure(format!("{name}: {msg}")),
            other => other,
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Error {
        Error::NotFound(msg.into())
    }
}
