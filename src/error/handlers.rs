//! Standardized error classification patterns.
//!
//! Centralizes the handful of decisions the transfer engine repeatedly has
//! to make about an error: is it retry-eligible, and should it be
//! deprioritized in the final fallback report.

use super::TransferError;

/// Classifies how the endpoint-iteration loop (spec.md §4.5) and the v1
/// retry loop (spec.md §4.5.3) should react to a given [`TransferError`].
pub struct TransferErrorHandler;

impl TransferErrorHandler {
    /// `true` when a per-layer network failure is eligible for the v1
    /// retry schedule (spec.md §4.5.3: `sleep = j * 500ms`, `j = 1..5`).
    /// Digest mismatches and signature failures are never retried.
    pub fn is_retryable(err: &TransferError) -> bool {
        matches!(err, TransferError::LayerTransferFailed { .. })
    }

    /// `NoSupport` errors are only reported as the final failure if every
    /// endpoint agreed; this picks the error to surface for a list of
    /// per-endpoint failures collected during iteration. When more than one
    /// endpoint failed for a real reason, the most recently observed one
    /// wins (spec.md §4.5.3 / §7: "only the last error is surfaced").
    pub fn summarize<'a>(errors: &'a [TransferError]) -> Option<&'a TransferError> {
        if errors.is_empty() {
            return None;
        }
        if errors.iter().all(|e| matches!(e, TransferError::NoSupport(_))) {
            return errors.last();
        }
        errors
            .iter()
            .rev()
            .find(|e| !matches!(e, TransferError::NoSupport(_)))
            .or_else(|| errors.last())
    }
}
