//! Source feed contracts plus the paginated HTTP feed and a fixture-first feed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use workload_core::feed::{decode_record, FeedItem, FeedOpportunity, FeedProduct};

mod current;
mod fixture;
pub mod http;

pub use current::{CurrentRmsConfig, CurrentRmsFeed, FeedMeta};
pub use fixture::{FixtureBundle, FixtureFeed};
pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, StatusAction};

pub const CRATE_NAME: &str = "workload-feed";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed page from {url}: {reason}")]
    MalformedPage { url: String, reason: String },
    #[error("feed unavailable: {0}")]
    Unavailable(String),
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        match self {
            FeedError::Fetch(err) => err.is_transient(),
            FeedError::MalformedPage { .. } => false,
            FeedError::Unavailable(_) => true,
        }
    }

    /// Rejected credentials; every other request of the pass would fail the same way.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, FeedError::Fetch(err) if err.is_unauthorized())
    }
}

/// One pipeline state the opportunity collection is queried for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityFilter {
    pub name: String,
    pub state: i64,
    pub status: i64,
}

impl OpportunityFilter {
    pub fn new(name: impl Into<String>, state: i64, status: i64) -> Self {
        Self {
            name: name.into(),
            state,
            status,
        }
    }

    /// Provisional, reserved and confirmed bookings.
    pub fn pipeline_defaults() -> Vec<Self> {
        vec![
            Self::new("provisional", 2, 1),
            Self::new("reserved", 2, 5),
            Self::new("confirmed", 3, 0),
        ]
    }
}

/// Decoded records of one collection plus the count of records that failed to decode.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedBatch<T> {
    pub records: Vec<T>,
    pub rejected: usize,
}

impl<T> Default for FeedBatch<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            rejected: 0,
        }
    }
}

impl<T: serde::de::DeserializeOwned> FeedBatch<T> {
    /// Decode raw records one at a time; malformed ones are logged and skipped.
    pub fn decode(record: &'static str, raw: Vec<JsonValue>) -> Self {
        let mut batch = Self::default();
        for value in raw {
            match decode_record(record, value) {
                Ok(decoded) => batch.records.push(decoded),
                Err(err) => {
                    warn!(record = err.record, id = %err.id, reason = %err.reason, "skipping feed record");
                    batch.rejected += 1;
                }
            }
        }
        batch
    }
}

#[async_trait]
pub trait SourceFeed: Send + Sync {
    fn name(&self) -> &'static str;

    async fn active_products(&self) -> Result<FeedBatch<FeedProduct>, FeedError>;

    async fn opportunities(
        &self,
        filter: &OpportunityFilter,
    ) -> Result<FeedBatch<FeedOpportunity>, FeedError>;

    async fn opportunity_items(&self, opportunity_id: i64) -> Result<FeedBatch<FeedItem>, FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_skips_malformed_records() {
        let batch: FeedBatch<FeedProduct> = FeedBatch::decode(
            "product",
            vec![
                json!({"id": 1, "name": "Flat"}),
                json!({"name": "no id"}),
                json!({"id": 2, "name": "Truss"}),
            ],
        );
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.rejected, 1);
    }

    #[test]
    fn default_filters_cover_the_booking_pipeline() {
        let filters = OpportunityFilter::pipeline_defaults();
        let pairs: Vec<_> = filters.iter().map(|f| (f.state, f.status)).collect();
        assert_eq!(pairs, vec![(2, 1), (2, 5), (3, 0)]);
    }
}
