//! Fetch collaborator seam
//!
//! The [`SeriesProvider`] trait abstracts over upstream data sources so the
//! orchestrator never sees transport or auth details, and tests can run
//! against scripted providers.

use crate::error::FetchError;
use crate::types::{PricePoint, Snapshot, Subject};
use async_trait::async_trait;

/// Upstream data source for both series kinds
///
/// Implementations handle the specifics of a particular vendor (HTTP API,
/// flat-file drop, test double). The cache and retry layers sit above this
/// trait - providers know nothing about either.
#[async_trait]
pub trait SeriesProvider: Send + Sync {
    /// Human-readable name of this provider
    fn name(&self) -> &str;

    /// Fetch up to `window` daily bars for a subject, ordered by date ascending
    ///
    /// Transient failures should map to [`FetchError::Timeout`],
    /// [`FetchError::Throttled`], or [`FetchError::Network`] so the retry
    /// layer can classify them.
    async fn fetch_continuous(
        &self,
        subject: &Subject,
        window: usize,
    ) -> Result<Vec<PricePoint>, FetchError>;

    /// Fetch the current fundamentals snapshot for a subject
    async fn fetch_periodic(&self, subject: &Subject) -> Result<Snapshot, FetchError>;
}
