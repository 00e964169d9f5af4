//! Error taxonomy with stable wire codes.

use thiserror::Error;

/// Typed error surfaced by the engine; `code()` is the stable wire string.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ViaError {
    /// Malformed event; dropped and counted, never fatal for the batch.
    #[error("bad event: {0}")]
    BadEvent(String),

    /// Malformed request from an external caller.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Ingest back-pressure; the caller should throttle and retry.
    #[error("ingest queue over high-water mark")]
    Overloaded,

    /// The embedder's bounded queue is full; transient.
    #[error("embedder request queue is full")]
    EmbedderBusy,

    /// The vector backend cannot be reached.
    #[error("vector backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A federated partition missed its deadline; reported in `warnings[]`.
    #[error("partition timed out: {0}")]
    PartitionTimeout(String),

    /// Promotion exhausted its retry budget; Tier-1 keeps serving.
    #[error("promotion degraded: {0}")]
    PromotionDegraded(String),

    /// A core invariant no longer holds; the process must exit.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl ViaError {
    /// Stable machine-readable code, surfaced in the HTTP `code` field.
    pub fn code(&self) -> &'static str {
        match self {
            ViaError::BadEvent(_) => "BAD_EVENT",
            ViaError::BadRequest(_) => "BAD_REQUEST",
            ViaError::Overloaded => "OVERLOADED",
            ViaError::EmbedderBusy => "EMBEDDER_BUSY",
            ViaError::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            ViaError::PartitionTimeout(_) => "PARTITION_TIMEOUT",
            ViaError::PromotionDegraded(_) => "PROMOTION_DEGRADED",
            ViaError::InvariantViolation(_) => "INVARIANT_VIOLATION",
        }
    }

    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ViaError::EmbedderBusy | ViaError::Overloaded | ViaError::BackendUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ViaError::Overloaded.code(), "OVERLOADED");
        assert_eq!(ViaError::EmbedderBusy.code(), "EMBEDDER_BUSY");
        assert_eq!(ViaError::BadEvent("x".into()).code(), "BAD_EVENT");
        assert_eq!(
            ViaError::PartitionTimeout("forensic_2026_08_01".into()).code(),
            "PARTITION_TIMEOUT"
        );
    }

    #[test]
    fn transience_classification() {
        assert!(ViaError::EmbedderBusy.is_transient());
        assert!(ViaError::BackendUnavailable("down".into()).is_transient());
        assert!(!ViaError::BadEvent("x".into()).is_transient());
        assert!(!ViaError::InvariantViolation("x".into()).is_transient());
    }
}
