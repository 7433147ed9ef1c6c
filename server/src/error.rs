use shared::{fetcher::FetchError, Provider};

/// Another operation holds a lock this one needs. Always retryable once the
/// holder finishes or its TTL runs out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("a refresh is already in progress for {provider}, try again shortly")]
pub struct ConflictError {
    pub key: String,
    pub provider: Provider,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("lock backend failure: {0:#}")]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// Rejected before any side effect.
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("{0:#}")]
    Fatal(#[from] anyhow::Error),
}

impl RefreshError {
    pub fn usage(message: impl Into<String>) -> Self {
        RefreshError::Usage(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RefreshError::Conflict(_))
    }
}

impl From<LockError> for RefreshError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Conflict(conflict) => RefreshError::Conflict(conflict),
            LockError::Backend(e) => RefreshError::Fatal(e),
        }
    }
}

impl From<shared::DayRangeError> for RefreshError {
    fn from(error: shared::DayRangeError) -> Self {
        RefreshError::Usage(error.to_string())
    }
}

/// Non-fatal failure of one provider inside a refresh.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderError {
    #[schema(value_type = String)]
    pub provider: Provider,
    pub message: String,
}

impl From<&FetchError> for ProviderError {
    fn from(error: &FetchError) -> Self {
        Self {
            provider: error.provider(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_provider() {
        let error = RefreshError::from(LockError::from(ConflictError {
            key: "lock:backfill:gitlab:1".to_string(),
            provider: Provider::Gitlab,
        }));
        assert!(error.is_retryable());
        assert_eq!(
            error.to_string(),
            "a refresh is already in progress for gitlab, try again shortly"
        );
    }

    #[test]
    fn backend_failures_are_fatal() {
        let error = RefreshError::from(LockError::Backend(anyhow::anyhow!("redis down")));
        assert!(matches!(error, RefreshError::Fatal(_)));
        assert!(!error.is_retryable());
    }
}
