use http::StatusCode;

/// The failure taxonomy every component reports in. Variants map 1:1 to the
/// HTTP status surfaced to clients; internal recovery (retries, degraded
/// steps) happens below this boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("missing or invalid authorization token")]
    Unauthorized,
    #[error("access to this resource is forbidden")]
    Forbidden,
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("circuit open for upstream endpoint {0}")]
    CircuitOpen(String),
    #[error("upstream endpoint {endpoint} returned status {status}")]
    UpstreamError { endpoint: String, status: u16 },
    #[error("deadline expired during {0}")]
    Timeout(String),
    #[error("worker pool exhausted for kind {0}")]
    PoolExhausted(String),
    #[error("quality {score:.2} below threshold {threshold:.2} after {iterations} reflections")]
    QualityBelowThreshold {
        score: f64,
        threshold: f64,
        iterations: u32,
    },
    // Never surfaced as an error to clients: the orchestrator converts it
    // into the `cancelled` investigation status.
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Validation(_) => "validation",
            ErrorKind::NotFound(_) => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimited { .. } => "rate_limited",
            ErrorKind::CircuitOpen(_) => "circuit_open",
            ErrorKind::UpstreamError { .. } => "upstream_error",
            ErrorKind::Timeout(_) => "timeout",
            ErrorKind::PoolExhausted(_) => "pool_exhausted",
            ErrorKind::QualityBelowThreshold { .. } => "quality_below_threshold",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal(_) => "internal",
        }
    }

    /// Whether a step hitting this error may be retried within its remaining
    /// deadline budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout(_)
                | ErrorKind::PoolExhausted(_)
                | ErrorKind::UpstreamError { status: 500..=599, .. }
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Validation(_) => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound(_) => StatusCode::NOT_FOUND,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorKind;

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::Timeout("fetch".into()).is_transient());
        assert!(ErrorKind::UpstreamError {
            endpoint: "contracts".into(),
            status: 502
        }
        .is_transient());

        assert!(!ErrorKind::UpstreamError {
            endpoint: "contracts".into(),
            status: 403
        }
        .is_transient());
        assert!(!ErrorKind::Validation("bad".into()).is_transient());
        assert!(!ErrorKind::CircuitOpen("contracts".into()).is_transient());
    }
}
