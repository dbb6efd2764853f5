//! Result taxonomy of the kernel.
//!
//! Every engine operation either succeeds or reports one of three kinds of
//! interruption:
//! - [`InternalError`]: argument, configuration or invariant violations. Always fatal.
//! - [`Outcome`]: user facing result that ends the card session.
//! - [`Soft`]: degraded but recoverable result, the transaction may continue.

use thiserror::Error;

/// Fatal, non user facing failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InternalError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("mandatory configuration tag {0:02X} missing or malformed")]
    MissingConfiguration(u32),

    #[error("mandatory transaction parameter {0:02X} missing or malformed")]
    MissingParameter(u32),

    #[error("buffer capacity exceeded")]
    BufferOverflow,

    #[error("offline data authentication method {0:?} selected but not implemented")]
    UnsupportedOdaMethod(crate::oda::OdaMethod),
}

/// User facing results that terminate the session.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    #[error("card error")]
    CardError,

    #[error("card blocked")]
    CardBlocked,

    #[error("not accepted")]
    NotAccepted,

    #[error("try again")]
    TryAgain,

    #[error("processing options not accepted")]
    GpoNotAccepted,
}

/// Results that by EMV rules allow the transaction to carry on.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Soft {
    #[error("payment system environment not available")]
    PseNotFound,

    #[error("application not selectable, try next candidate")]
    TryNextCandidate,

    #[error("conditions of use not satisfied")]
    GpoConditionsNotSatisfied,

    #[error("no supported offline data authentication method")]
    OdaNotSupported,

    #[error("offline data authentication failed")]
    OdaFailed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("internal error: {0}")]
    Internal(#[from] InternalError),

    #[error("{0}")]
    Outcome(#[from] Outcome),

    #[error("{0}")]
    Continue(#[from] Soft),
}

impl KernelError {
    /// Soft results are the only ones a transaction may proceed after.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, KernelError::Continue(_))
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Failures of the raw APDU channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("interface error: {0}")]
    Interface(String),

    #[error("response too short ({0} bytes)")]
    ShortResponse(usize),
}
