// Error classification shared by the Dispatcher, WebhookIntake, and
// MetricsFetcher: each only ever translates an outcome into a state
// transition through this enum, never a bare string, so the three
// failure lanes (retryable, permanent, protocol violation) cannot be
// conflated at a call site.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanErrorClass {
    Retryable,
    Permanent,
    ProtocolViolation,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("checkout failed: {0}")]
    CheckoutIo(String),
    #[error("commit not found: {0}")]
    CommitMissing(String),
    #[error("repository unreachable: {0}")]
    RepositoryUnreachable(String),
    #[error("malformed configuration: {0}")]
    MalformedConfig(String),
    #[error("scanner produced no submission id")]
    SubmissionIdMissing,
    #[error("scan timed out")]
    ScanTimeout,
    #[error("no analysis-server slot available")]
    NoSlotAvailable,
    #[error("lease expired before completion")]
    LeaseExpired,
    #[error("analysis server reported failure: {0}")]
    AnalysisFailed(String),
    #[error("metrics endpoint returned {0}")]
    MetricsHttpStatus(u16),
    #[error("metrics endpoint timed out")]
    MetricsTimeout,
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
    #[error("store write conflict")]
    StoreConflict,
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScanError {
    pub fn class(&self) -> ScanErrorClass {
        match self {
            ScanError::CheckoutIo(_)
            | ScanError::ScanTimeout
            | ScanError::NoSlotAvailable
            | ScanError::LeaseExpired
            | ScanError::AnalysisFailed(_)
            | ScanError::MetricsTimeout
            | ScanError::BrokerUnavailable(_)
            | ScanError::StoreConflict => ScanErrorClass::Retryable,

            ScanError::MetricsHttpStatus(status) if *status == 404 || *status >= 500 => {
                ScanErrorClass::Retryable
            }
            ScanError::MetricsHttpStatus(_) => ScanErrorClass::Permanent,

            ScanError::CommitMissing(_)
            | ScanError::RepositoryUnreachable(_)
            | ScanError::MalformedConfig(_)
            | ScanError::SubmissionIdMissing => ScanErrorClass::Permanent,

            ScanError::InvalidSignature => ScanErrorClass::ProtocolViolation,

            ScanError::Other(_) => ScanErrorClass::Retryable,
        }
    }

    /// Machine-readable error class persisted alongside the job's last error.
    pub fn code(&self) -> &'static str {
        match self {
            ScanError::CheckoutIo(_) => "CHECKOUT_IO",
            ScanError::CommitMissing(_) => "COMMIT_MISSING",
            ScanError::RepositoryUnreachable(_) => "REPOSITORY_UNREACHABLE",
            ScanError::MalformedConfig(_) => "MALFORMED_CONFIG",
            ScanError::SubmissionIdMissing => "SUBMISSION_ID_MISSING",
            ScanError::ScanTimeout => "SCAN_TIMEOUT",
            ScanError::NoSlotAvailable => "NO_SLOT_AVAILABLE",
            ScanError::LeaseExpired => "LEASE_EXPIRED",
            ScanError::AnalysisFailed(_) => "ANALYSIS_FAILED",
            ScanError::MetricsHttpStatus(404) => "METRICS_NOT_INDEXED",
            ScanError::MetricsHttpStatus(_) => "METRICS_HTTP_ERROR",
            ScanError::MetricsTimeout => "METRICS_TIMEOUT",
            ScanError::BrokerUnavailable(_) => "BROKER_UNAVAILABLE",
            ScanError::StoreConflict => "STORE_CONFLICT",
            ScanError::InvalidSignature => "INVALID_SIGNATURE",
            ScanError::Other(_) => "UNKNOWN",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_commit_errors_never_get_reclassified_as_retryable() {
        assert_eq!(ScanError::CommitMissing("x".into()).class(), ScanErrorClass::Permanent);
        assert_eq!(ScanError::RepositoryUnreachable("x".into()).class(), ScanErrorClass::Permanent);
        assert_eq!(ScanError::MalformedConfig("x".into()).class(), ScanErrorClass::Permanent);
        assert_eq!(ScanError::SubmissionIdMissing.class(), ScanErrorClass::Permanent);
    }

    #[test]
    fn metrics_404_and_5xx_are_retryable_but_4xx_other_than_404_is_permanent() {
        assert_eq!(ScanError::MetricsHttpStatus(404).class(), ScanErrorClass::Retryable);
        assert_eq!(ScanError::MetricsHttpStatus(500).class(), ScanErrorClass::Retryable);
        assert_eq!(ScanError::MetricsHttpStatus(502).class(), ScanErrorClass::Retryable);
        assert_eq!(ScanError::MetricsHttpStatus(503).class(), ScanErrorClass::Retryable);
        assert_eq!(ScanError::MetricsHttpStatus(400).class(), ScanErrorClass::Permanent);
        assert_eq!(ScanError::MetricsHttpStatus(403).class(), ScanErrorClass::Permanent);
    }

    #[test]
    fn invalid_signature_is_a_protocol_violation_not_a_retry_or_permanent_failure() {
        assert_eq!(ScanError::InvalidSignature.class(), ScanErrorClass::ProtocolViolation);
    }

    #[test]
    fn every_variant_has_a_distinct_persisted_code() {
        let codes = [
            ScanError::CheckoutIo("x".into()).code(),
            ScanError::CommitMissing("x".into()).code(),
            ScanError::RepositoryUnreachable("x".into()).code(),
            ScanError::MalformedConfig("x".into()).code(),
            ScanError::SubmissionIdMissing.code(),
            ScanError::ScanTimeout.code(),
            ScanError::NoSlotAvailable.code(),
            ScanError::LeaseExpired.code(),
            ScanError::AnalysisFailed("x".into()).code(),
            ScanError::MetricsHttpStatus(404).code(),
            ScanError::MetricsHttpStatus(500).code(),
            ScanError::MetricsTimeout.code(),
            ScanError::BrokerUnavailable("x".into()).code(),
            ScanError::StoreConflict.code(),
            ScanError::InvalidSignature.code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len(), "duplicate error code would conflate distinct failure reasons");
    }
}
