//! Failure taxonomy for composition chains.
//!
//! Three kinds of terminal failure flow through stage registries:
//!
//! - [`Failure::Cancelled`]: the stage was cancelled, directly or through a
//!   dependency walk
//! - [`Failure::Faulted`]: the composition envelope around an error returned
//!   by a user computation, callback, or a rejecting executor
//! - [`Failure::Panicked`]: a panic caught at the transition boundary
//!
//! Errors are wrapped into the envelope exactly once: a failure that is
//! already a [`Failure`] is never re-wrapped. The blocking accessors strip
//! the envelope one level so callers see the original cause (see
//! [`GetError`]).

use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Boxed error type accepted from user computations and callbacks.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Terminal outcome of a stage: the shared success value or the failure
/// that terminated the chain.
///
/// Success values are behind an `Arc` so that multi-consumer fan-out and
/// the combine/either wirings share one allocation instead of requiring
/// `Clone` from user types.
pub type StageResult<T> = Result<Arc<T>, Failure>;

/// Payload from a panic caught at a stage transition boundary.
#[derive(Debug, Clone)]
pub struct PanicPayload {
    message: String,
}

impl PanicPayload {
    /// Creates a new panic payload with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Extracts a printable message from a caught panic value.
    #[must_use]
    pub fn from_caught(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self { message }
    }

    /// Returns the panic message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// A failure propagated through a combinator chain.
///
/// Downstream callbacks always observe user errors through the
/// [`Faulted`](Self::Faulted) envelope; the envelope is applied at most
/// once per cause.
#[derive(Debug, Clone)]
pub enum Failure {
    /// The stage was cancelled.
    Cancelled,
    /// Envelope around the error that failed the chain.
    Faulted(Arc<dyn Error + Send + Sync + 'static>),
    /// A user computation or callback panicked.
    Panicked(PanicPayload),
}

impl Failure {
    /// Wraps a user error into the composition envelope.
    ///
    /// An error that already is a [`Failure`] is passed through unchanged
    /// rather than wrapped a second time.
    #[must_use]
    pub fn wrap(err: BoxError) -> Self {
        match err.downcast::<Failure>() {
            Ok(already) => *already,
            Err(err) => Self::Faulted(Arc::from(err)),
        }
    }

    /// Returns true if this failure represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the wrapped cause, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Faulted(cause) => Some(cause.as_ref()),
            Self::Cancelled | Self::Panicked(_) => None,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "stage was cancelled"),
            Self::Faulted(cause) => write!(f, "composition failed: {cause}"),
            Self::Panicked(payload) => write!(f, "{payload}"),
        }
    }
}

impl Error for Failure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause()
    }
}

/// Error returned by the blocking accessors [`get`](crate::Stage::get) and
/// [`get_timeout`](crate::Stage::get_timeout).
///
/// One level of the composition envelope is stripped: a chain that failed
/// with a wrapped user error surfaces that error as
/// [`Failed`](Self::Failed), not the envelope around it.
#[derive(Debug, Clone)]
pub enum GetError {
    /// The stage was cancelled.
    Cancelled,
    /// The stage failed; carries the original cause with the envelope
    /// stripped.
    Failed(Arc<dyn Error + Send + Sync + 'static>),
    /// The stage panicked.
    Panicked(PanicPayload),
    /// The timeout elapsed before the stage reached a terminal state.
    Timeout,
}

impl GetError {
    pub(crate) fn from_failure(failure: Failure) -> Self {
        match failure {
            Failure::Cancelled => Self::Cancelled,
            Failure::Faulted(cause) => Self::Failed(cause),
            Failure::Panicked(payload) => Self::Panicked(payload),
        }
    }

    /// Returns the underlying cause for a failed stage, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Failed(cause) => Some(cause.as_ref()),
            Self::Cancelled | Self::Panicked(_) | Self::Timeout => None,
        }
    }
}

impl fmt::Display for GetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "stage was cancelled"),
            Self::Failed(cause) => write!(f, "stage failed: {cause}"),
            Self::Panicked(payload) => write!(f, "{payload}"),
            Self::Timeout => write!(f, "timed out waiting for stage"),
        }
    }
}

impl Error for GetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause()
    }
}

/// An executor refused to accept work, typically because it was shut down.
#[derive(Debug, Clone, thiserror::Error)]
#[error("executor rejected work: {reason}")]
pub struct RejectedError {
    /// Human-readable refusal reason.
    pub reason: String,
}

impl RejectedError {
    /// Creates a rejection with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn wrap_envelopes_plain_errors() {
        let failure = Failure::wrap(Box::new(Boom));
        match &failure {
            Failure::Faulted(cause) => assert_eq!(cause.to_string(), "boom"),
            other => panic!("expected Faulted, got {other:?}"),
        }
        assert!(failure.source().is_some());
    }

    #[test]
    fn wrap_does_not_rewrap() {
        let inner = Failure::wrap(Box::new(Boom));
        let outer = Failure::wrap(Box::new(inner));
        match outer {
            Failure::Faulted(cause) => {
                assert!(cause.downcast_ref::<Failure>().is_none());
                assert_eq!(cause.to_string(), "boom");
            }
            other => panic!("expected Faulted, got {other:?}"),
        }
    }

    #[test]
    fn get_error_strips_one_level() {
        let failure = Failure::wrap(Box::new(Boom));
        match GetError::from_failure(failure) {
            GetError::Failed(cause) => assert!(cause.downcast_ref::<Boom>().is_some()),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_maps_to_cancelled() {
        assert!(matches!(
            GetError::from_failure(Failure::Cancelled),
            GetError::Cancelled
        ));
    }

    #[test]
    fn panic_payload_from_caught_str() {
        let caught = std::panic::catch_unwind(|| panic!("kapow")).unwrap_err();
        let payload = PanicPayload::from_caught(caught.as_ref());
        assert_eq!(payload.message(), "kapow");
    }
}
