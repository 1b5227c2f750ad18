//! Types for working with errors produced by plccore.

use std::io::{Error as IOError, ErrorKind};
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure the coordination layer can report.
///
/// The type is `Clone` so a single failure reason can be handed to every
/// waiter or pending exchange of a connection that is being torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// IO error of the underlying transport
    #[error("IO Error: {0}")]
    IO(ErrorKind),
    /// The driver could not open or reopen a physical connection
    #[error("Connection Error: {0}")]
    Connection(String),
    /// The caller gave up waiting for a lease
    #[error("Gave up waiting for a lease on '{endpoint}' after {waited:?}")]
    LeaseWaitTimeout {
        /// Endpoint the lease was requested for
        endpoint: String,
        /// Time spent waiting
        waited: Duration,
    },
    /// The caller gave up waiting for a transaction slot
    #[error("Transaction {id} was not admitted within {waited:?}")]
    AdmissionTimeout {
        /// Id of the waiting transaction
        id: u64,
        /// Time spent waiting
        waited: Duration,
    },
    /// The device did not answer an exchange before its deadline
    #[error("No response for correlation key {key} within {timeout:?}")]
    ExchangeTimeout {
        /// Correlation key of the exchange
        key: String,
        /// Deadline the exchange was registered with
        timeout: Duration,
    },
    /// A leased operation failed (transport, decode or negative protocol status)
    #[error("Operation failed: {0}")]
    Operation(String),
    /// The connection was torn down while work was pending on it
    #[error("Connection to '{0}' was invalidated")]
    ConnectionInvalidated(String),
    /// A lease was used after it had been closed or had expired
    #[error("Lease on '{0}' was used after it was closed")]
    LeaseClosed(String),
    /// `end_request` was called on a transaction that already ended
    #[error("Transaction {0} has already ended")]
    TransactionEnded(u64),
    /// `submit` was called twice on one transaction
    #[error("Transaction {0} was already submitted")]
    AlreadySubmitted(u64),
    /// A correlation key was registered while still pending
    #[error("Correlation key {0} is already pending")]
    DuplicateKey(String),
    /// Every key of the sequence is taken by a pending exchange
    #[error("No free correlation key left")]
    KeySpaceExhausted,
    /// The driver could not extract a correlation key from a frame
    #[error("Frame does not carry a correlation key")]
    MissingCorrelationKey,
    /// The pool has been closed
    #[error("The connection pool is closed")]
    PoolClosed,
    /// The transaction manager has been shut down
    #[error("The transaction manager is shut down")]
    AdmissionClosed,
    /// The registry went away before the exchange was resolved
    #[error("The exchange was abandoned before it was resolved")]
    ExchangeAbandoned,
    /// Rejected configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// Timeout while pushing or pulling a frame on the TCP transport
    #[error("Timeout during data exchange")]
    DataExchangeTimedOut,
}

impl From<IOError> for Error {
    fn from(e: IOError) -> Self {
        Error::IO(e.kind())
    }
}

impl Error {
    /// `true` for every kind of expired wait, be it for a lease, a slot or a response.
    pub fn is_timeout(&self) -> bool {
        self.is_wait_timeout()
            || matches!(self, Self::ExchangeTimeout { .. } | Self::DataExchangeTimedOut)
    }

    /// `true` if the caller gave up waiting for a lease or a transaction slot.
    ///
    /// This separates "we gave up waiting for a connection" from "the device never answered".
    pub fn is_wait_timeout(&self) -> bool {
        matches!(
            self,
            Self::LeaseWaitTimeout { .. } | Self::AdmissionTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use error_stack::{Report, ResultExt};

    use super::*;

    #[test]
    fn error_stack() {
        let report = create_error_stack().unwrap_err();
        assert_eq!(
            report.current_context(),
            &Error::ConnectionInvalidated("dev-A".to_string())
        );
        println!("{report:?}");
    }

    #[test]
    fn timeouts_are_told_apart() {
        let waited = Error::LeaseWaitTimeout {
            endpoint: "dev-A".to_string(),
            waited: Duration::from_millis(50),
        };
        let unanswered = Error::ExchangeTimeout {
            key: "42".to_string(),
            timeout: Duration::from_millis(100),
        };

        assert!(waited.is_timeout() && waited.is_wait_timeout());
        assert!(unanswered.is_timeout() && !unanswered.is_wait_timeout());
        assert!(!Error::PoolClosed.is_timeout());
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let err: Error = IOError::new(ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(err, Error::IO(ErrorKind::ConnectionReset));
        assert_eq!(err.to_string(), "IO Error: connection reset");
    }

    fn create_error_stack() -> std::result::Result<(), Report<Error>> {
        create_error().change_context(Error::ConnectionInvalidated("dev-A".to_string()))
    }

    fn create_error() -> std::result::Result<(), Report<Error>> {
        Err(Report::new(Error::Operation("negative acknowledge".to_string())))
    }
}
