use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;
use workload_core::feed::{FeedItem, FeedOpportunity, FeedProduct};

use crate::http::HttpFetcher;
use crate::{FeedBatch, FeedError, OpportunityFilter, SourceFeed};

/// Pagination block every collection response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FeedMeta {
    pub page: u64,
    pub per_page: u64,
    pub total_row_count: u64,
}

impl FeedMeta {
    pub fn has_more(&self) -> bool {
        self.total_row_count > self.per_page.saturating_mul(self.page)
    }
}

#[derive(Debug, Clone)]
pub struct CurrentRmsConfig {
    pub opportunities_url: String,
    pub products_url: String,
    pub per_page: u32,
    pub products_per_page: u32,
    pub product_group: String,
}

/// Paginated rental-management API feed.
#[derive(Debug)]
pub struct CurrentRmsFeed {
    http: HttpFetcher,
    config: CurrentRmsConfig,
}

impl CurrentRmsFeed {
    pub fn new(http: HttpFetcher, config: CurrentRmsConfig) -> Self {
        Self { http, config }
    }

    /// Walk every page of `collection` until the meta block says there is no more or a page
    /// comes back empty.
    async fn fetch_all(
        &self,
        url: &str,
        collection: &str,
        per_page: u32,
        filters: &[(String, String)],
    ) -> Result<Vec<JsonValue>, FeedError> {
        let mut out = Vec::new();
        let mut page = 1u64;
        loop {
            let mut query = vec![
                ("page".to_string(), page.to_string()),
                ("per_page".to_string(), per_page.to_string()),
            ];
            query.extend(filters.iter().cloned());

            let mut body = self.http.get_json(url, &query).await?;
            let records = match body.get_mut(collection).map(JsonValue::take) {
                Some(JsonValue::Array(records)) => records,
                _ => {
                    return Err(FeedError::MalformedPage {
                        url: url.to_string(),
                        reason: format!("missing `{collection}` array"),
                    })
                }
            };
            let meta: Option<FeedMeta> = body
                .get("meta")
                .cloned()
                .and_then(|m| serde_json::from_value(m).ok());

            debug!(url, page, records = records.len(), "fetched feed page");
            if records.is_empty() {
                break;
            }
            out.extend(records);

            match meta {
                Some(meta) if meta.has_more() => page += 1,
                _ => break,
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceFeed for CurrentRmsFeed {
    fn name(&self) -> &'static str {
        "current-rms"
    }

    async fn active_products(&self) -> Result<FeedBatch<FeedProduct>, FeedError> {
        let filters = vec![
            ("filtermode".to_string(), "active".to_string()),
            (
                "q[product_group_name_eq]".to_string(),
                self.config.product_group.clone(),
            ),
        ];
        let raw = self
            .fetch_all(
                &self.config.products_url,
                "products",
                self.config.products_per_page,
                &filters,
            )
            .await?;
        Ok(FeedBatch::decode("product", raw))
    }

    async fn opportunities(
        &self,
        filter: &OpportunityFilter,
    ) -> Result<FeedBatch<FeedOpportunity>, FeedError> {
        let filters = vec![
            ("q[state_eq]".to_string(), filter.state.to_string()),
            ("q[status_eq]".to_string(), filter.status.to_string()),
            ("q[s][]".to_string(), "starts_at asc".to_string()),
        ];
        let raw = self
            .fetch_all(
                &self.config.opportunities_url,
                "opportunities",
                self.config.per_page,
                &filters,
            )
            .await?;
        Ok(FeedBatch::decode("opportunity", raw))
    }

    async fn opportunity_items(&self, opportunity_id: i64) -> Result<FeedBatch<FeedItem>, FeedError> {
        let url = format!(
            "{}/{opportunity_id}/opportunity_items",
            self.config.opportunities_url.trim_end_matches('/')
        );
        let raw = self
            .fetch_all(&url, "opportunity_items", self.config.per_page, &[])
            .await?;
        Ok(FeedBatch::decode("opportunity_item", raw))
    }
}
