use std::time::Duration;

use thiserror::Error;

/// An error that happens when loading an asset.
///
/// Listeners only ever observe this type, never the raw error of a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The asset does not exist at the remote location.
    #[error("not found")]
    NotFound,
    /// The asset could not be fetched due to a network problem, like connection loss,
    /// DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the innermost error message.
    #[error("download failed: {0}")]
    Network(String),
    /// The asset could not be fetched in time.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The asset was fetched successfully, but could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The load was abandoned before it could complete, for example during shutdown.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in the engine itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<tokio::task::JoinError> for CacheError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    /// Whether trying the same request again may succeed.
    ///
    /// Only transient transport failures are retryable.
    pub fn can_retry(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// A short name used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Malformed(_) => "malformed",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internalerror",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of loading an asset: either `Ok(T)` or the reason it is unusable.
pub type CacheContents<T = ()> = Result<T, CacheError>;
