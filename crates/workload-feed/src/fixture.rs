use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use workload_core::feed::{FeedItem, FeedOpportunity, FeedProduct};

use crate::{FeedBatch, FeedError, OpportunityFilter, SourceFeed};

/// Captured feed snapshot: raw product and opportunity records plus line items per opportunity id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    #[serde(default)]
    pub products: Vec<JsonValue>,
    #[serde(default)]
    pub opportunities: Vec<JsonValue>,
    #[serde(default)]
    pub items: BTreeMap<String, Vec<JsonValue>>,
}

/// Serves a [`FixtureBundle`] through the same trait as the live feed.
#[derive(Debug, Clone, Default)]
pub struct FixtureFeed {
    bundle: FixtureBundle,
    unreachable_items: BTreeSet<i64>,
}

impl FixtureFeed {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self {
            bundle,
            unreachable_items: BTreeSet::new(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let bundle =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(bundle))
    }

    /// Make the line-item endpoint fail for these opportunities, as an unreachable feed would.
    pub fn with_unreachable_items(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.unreachable_items.extend(ids);
        self
    }

    pub fn bundle(&self) -> &FixtureBundle {
        &self.bundle
    }
}

fn matches_filter(raw: &JsonValue, filter: &OpportunityFilter) -> bool {
    let field = |name: &str| raw.get(name).and_then(JsonValue::as_i64);
    field("state") == Some(filter.state) && field("status") == Some(filter.status)
}

#[async_trait]
impl SourceFeed for FixtureFeed {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn active_products(&self) -> Result<FeedBatch<FeedProduct>, FeedError> {
        Ok(FeedBatch::decode("product", self.bundle.products.clone()))
    }

    async fn opportunities(
        &self,
        filter: &OpportunityFilter,
    ) -> Result<FeedBatch<FeedOpportunity>, FeedError> {
        let raw = self
            .bundle
            .opportunities
            .iter()
            .filter(|raw| matches_filter(raw, filter))
            .cloned()
            .collect();
        Ok(FeedBatch::decode("opportunity", raw))
    }

    async fn opportunity_items(&self, opportunity_id: i64) -> Result<FeedBatch<FeedItem>, FeedError> {
        if self.unreachable_items.contains(&opportunity_id) {
            return Err(FeedError::Unavailable(format!(
                "items for opportunity {opportunity_id}"
            )));
        }
        let raw = self
            .bundle
            .items
            .get(&opportunity_id.to_string())
            .cloned()
            .unwrap_or_default();
        Ok(FeedBatch::decode("opportunity_item", raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn bundle() -> FixtureBundle {
        serde_json::from_value(json!({
            "products": [{"id": 7, "name": "Flat", "type": "Product"}],
            "opportunities": [
                {"id": 1, "state": 2, "status": 1, "subject": "A", "starts_at": "2024-01-01T00:00:00Z", "ends_at": "2024-01-02T00:00:00Z"},
                {"id": 2, "state": 3, "status": 0, "subject": "B", "starts_at": "2024-01-01T00:00:00Z", "ends_at": "2024-01-02T00:00:00Z"}
            ],
            "items": {"1": [{"id": 10, "item_id": 7, "quantity": "4"}]}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn serves_filtered_opportunities_and_items() {
        let feed = FixtureFeed::new(bundle());
        let provisional = feed
            .opportunities(&OpportunityFilter::new("provisional", 2, 1))
            .await
            .unwrap();
        assert_eq!(provisional.records.len(), 1);
        assert_eq!(provisional.records[0].id, 1);

        let items = feed.opportunity_items(1).await.unwrap();
        assert_eq!(items.records.len(), 1);
        assert!(feed.opportunity_items(2).await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn unreachable_items_surface_as_errors() {
        let feed = FixtureFeed::new(bundle()).with_unreachable_items([1]);
        let err = feed.opportunity_items(1).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn loads_bundle_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(serde_json::to_string(&bundle()).unwrap().as_bytes())
            .unwrap();
        let feed = FixtureFeed::load(file.path()).unwrap();
        assert_eq!(feed.bundle().products.len(), 1);
        assert!(FixtureFeed::load(file.path().with_extension("missing")).is_err());
    }
}
