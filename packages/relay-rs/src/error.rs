//! Structured error types for the dispatch engine.
//!
//! `RelayError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! - `anyhow` is internal transport: handlers and stages return
//!   `anyhow::Result` for ergonomics, and pipeline errors bubble outward
//!   unchanged until an exception handler consumes them or they exit to the
//!   caller.
//! - Engine-originated failures (missing handler, bad erased value,
//!   cancellation, fan-out aggregation) are always a `RelayError`, so callers
//!   can downcast and match.
//!
//! Construction errors — a null erased input or an unregistered handler —
//! surface before the handler layer is reached and are therefore never
//! offered to user exception handlers.
//!
//! # Example
//!
//! ```ignore
//! let result = relay.send(ping).await;
//! if let Err(e) = result {
//!     match e.downcast_ref::<RelayError>() {
//!         Some(RelayError::UnregisteredHandler { request_type }) => {
//!             eprintln!("no handler for {request_type}");
//!         }
//!         Some(RelayError::Cancelled) => eprintln!("caller gave up"),
//!         _ => eprintln!("handler failure: {e}"),
//!     }
//! }
//! ```

use thiserror::Error;

/// Structured error type for relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The erased entry point received no value at all.
    #[error("request value is missing")]
    NullInput,

    /// No handler is installed for the given request or stream request type.
    #[error("no handler registered for request type {request_type}")]
    UnregisteredHandler {
        /// Human-readable request type name.
        request_type: &'static str,
    },

    /// A value reached the engine in a shape the contract forbids: an erased
    /// value that is not a registered request, or an open stage substituting
    /// a response of the wrong type.
    #[error("contract violation: {message}")]
    ContractViolation {
        /// What was violated.
        message: String,
    },

    /// A handler is already installed for this request type.
    #[error("handler already registered for request type {request_type}")]
    HandlerAlreadyRegistered {
        /// Human-readable request type name.
        request_type: &'static str,
    },

    /// One or more notification handlers failed under the parallel publisher.
    ///
    /// Every inner failure is preserved, in no particular order.
    #[error("{} notification handler(s) failed", failures.len())]
    AggregatedFailure {
        /// The individual handler failures.
        failures: Vec<anyhow::Error>,
    },

    /// The caller's cancellation was observed.
    ///
    /// Inside the request pipeline this is an error like any other: an
    /// exception handler may choose to recover from it.
    #[error("operation was cancelled")]
    Cancelled,

    /// The startup validation walk found request types with no handler.
    #[error("invalid configuration: {} request type(s) without a handler: {}", missing.len(), missing.join(", "))]
    InvalidConfiguration {
        /// Names of the request types missing a handler.
        missing: Vec<String>,
    },
}

impl RelayError {
    /// Returns true if this error is the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayError::Cancelled)
    }

    /// Build the contract-violation raised when an open stage substitutes a
    /// value of the wrong type for a typed pipeline.
    pub(crate) fn bad_substitution(expected: &'static str) -> Self {
        RelayError::ContractViolation {
            message: format!("open stage substituted a value that is not a {expected}"),
        }
    }
}

/// Returns true if the given error chain is a relay cancellation.
///
/// Convenience for callers holding an `anyhow::Error`.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RelayError>()
        .is_some_and(RelayError::is_cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_handler_display() {
        let err = RelayError::UnregisteredHandler {
            request_type: "MyRequest",
        };
        assert!(err.to_string().contains("no handler registered"));
        assert!(err.to_string().contains("MyRequest"));
    }

    #[test]
    fn test_null_input_display() {
        assert!(RelayError::NullInput.to_string().contains("missing"));
    }

    #[test]
    fn test_aggregated_failure_display_counts_inner() {
        let err = RelayError::AggregatedFailure {
            failures: vec![anyhow::anyhow!("one"), anyhow::anyhow!("two")],
        };
        assert!(err.to_string().contains("2 notification handler(s)"));
    }

    #[test]
    fn test_invalid_configuration_lists_missing() {
        let err = RelayError::InvalidConfiguration {
            missing: vec!["A".into(), "B".into()],
        };
        let display = err.to_string();
        assert!(display.contains("2 request type(s)"));
        assert!(display.contains("A, B"));
    }

    #[test]
    fn test_error_is_pattern_matchable() {
        let err = RelayError::UnregisteredHandler {
            request_type: "TestRequest",
        };

        match &err {
            RelayError::UnregisteredHandler { request_type } => {
                assert_eq!(*request_type, "TestRequest");
            }
            _ => panic!("expected UnregisteredHandler"),
        }
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = RelayError::Cancelled.into();

        let relay_err = err.downcast_ref::<RelayError>();
        assert!(relay_err.is_some());
        assert!(relay_err.unwrap().is_cancelled());
        assert!(is_cancellation(&err));
    }

    #[test]
    fn test_is_cancellation_rejects_other_errors() {
        let err = anyhow::anyhow!("plain failure");
        assert!(!is_cancellation(&err));

        let err: anyhow::Error = RelayError::NullInput.into();
        assert!(!is_cancellation(&err));
    }

    #[test]
    fn test_bad_substitution_mentions_expected_type() {
        let err = RelayError::bad_substitution("alloc::string::String");
        assert!(err.to_string().contains("String"));
    }
}
