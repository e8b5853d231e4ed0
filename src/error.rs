//! # Status Taxonomy and Public Errors
//!
//! Internally streekv propagates `eyre::Result` like the rest of its
//! storage layer; this module is the boundary where those faults become the
//! stable, binding-friendly status taxonomy. Every [`Status`] discriminant
//! is a wire value that must never change: language bindings return the
//! integer as-is.
//!
//! The mapping policy is deliberately coarse (see the engine): a typed
//! pool-exhaustion fault becomes `OUT_OF_MEMORY`, everything else that
//! escapes a transactional write becomes `UNKNOWN_ERROR`, and the
//! config/open path assigns its own statuses while parsing.
//!
//! `errormsg()` keeps the most recent error rendering, process-local, for
//! callers (and bindings) that only see the integer status.

use std::fmt;

use parking_lot::Mutex;

/// Operation status exposed to callers and language bindings.
///
/// Discriminants are stable wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    UnknownError = 1,
    NotFound = 2,
    NotSupported = 3,
    InvalidArgument = 4,
    ConfigParsingError = 5,
    ConfigTypeError = 6,
    StoppedByCallback = 7,
    OutOfMemory = 8,
    WrongEngineName = 9,
    TransactionScopeError = 10,
    DefragError = 11,
}

impl Status {
    /// The wire value carried across the binding ABI.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::UnknownError => "UNKNOWN_ERROR",
            Status::NotFound => "NOT_FOUND",
            Status::NotSupported => "NOT_SUPPORTED",
            Status::InvalidArgument => "INVALID_ARGUMENT",
            Status::ConfigParsingError => "CONFIG_PARSING_ERROR",
            Status::ConfigTypeError => "CONFIG_TYPE_ERROR",
            Status::StoppedByCallback => "STOPPED_BY_CB",
            Status::OutOfMemory => "OUT_OF_MEMORY",
            Status::WrongEngineName => "WRONG_ENGINE_NAME",
            Status::TransactionScopeError => "TRANSACTION_SCOPE_ERROR",
            Status::DefragError => "DEFRAG_ERROR",
        };
        f.write_str(name)
    }
}

/// Error type of every public engine operation.
#[derive(Debug, thiserror::Error)]
#[error("{status}: {message}")]
pub struct KvError {
    status: Status,
    message: String,
}

impl KvError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        let err = Self {
            status,
            message: message.into(),
        };
        // NOT_FOUND and callback stops are ordinary outcomes, not faults.
        if !matches!(
            err.status,
            Status::NotFound | Status::StoppedByCallback
        ) {
            set_last_error(&err.to_string());
        }
        err
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

static LAST_ERROR: Mutex<String> = Mutex::new(String::new());

fn set_last_error(msg: &str) {
    *LAST_ERROR.lock() = msg.to_string();
}

/// Human-readable rendering of the most recent error, process-local.
pub fn errormsg() -> String {
    LAST_ERROR.lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::UnknownError.code(), 1);
        assert_eq!(Status::NotFound.code(), 2);
        assert_eq!(Status::NotSupported.code(), 3);
        assert_eq!(Status::InvalidArgument.code(), 4);
        assert_eq!(Status::ConfigParsingError.code(), 5);
        assert_eq!(Status::ConfigTypeError.code(), 6);
        assert_eq!(Status::StoppedByCallback.code(), 7);
        assert_eq!(Status::OutOfMemory.code(), 8);
        assert_eq!(Status::WrongEngineName.code(), 9);
        assert_eq!(Status::TransactionScopeError.code(), 10);
        assert_eq!(Status::DefragError.code(), 11);
    }

    // Single test: errormsg is process-global, so parallel test threads
    // would race over it.
    #[test]
    fn errormsg_tracks_real_errors_only() {
        let _ = KvError::new(Status::InvalidArgument, "bad size");
        assert_eq!(errormsg(), "INVALID_ARGUMENT: bad size");

        let _ = KvError::new(Status::NotFound, "key absent");
        assert_eq!(errormsg(), "INVALID_ARGUMENT: bad size");

        let _ = KvError::new(Status::StoppedByCallback, "stopped");
        assert_eq!(errormsg(), "INVALID_ARGUMENT: bad size");
    }

    #[test]
    fn display_uses_wire_spelling() {
        // NOT_FOUND so this test does not write the global errormsg cell
        // while errormsg_tracks_real_errors_only is running.
        let err = KvError::new(Status::NotFound, "key absent");
        assert_eq!(err.to_string(), "NOT_FOUND: key absent");
        assert_eq!(Status::WrongEngineName.to_string(), "WRONG_ENGINE_NAME");
    }
}
