//! Core domain model and history-tracking types for workshop workload sync.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub mod aggregate;
pub mod entities;
pub mod feed;
pub mod reconcile;
pub mod run;
pub mod schedule;
pub mod tags;
pub mod weights;

pub use entities::{
    ActiveProduct, Client, CustomInput, CustomInputFields, CustomInputPatch, Item, ItemFields,
    ItemGroup, ItemGroupFields, ItemGroupTotal, ItemGroupTotalFields, Opportunity,
    OpportunityIncoming, Owner, Venue,
};
pub use reconcile::{reconcile, Reconciled};
pub use run::{RunStatus, RunSummary};
pub use weights::{weight_totals, PipelineState, WeightTotals};

/// Audited field: the current value plus the value it held before the latest reconciliation.
///
/// `previous` stays `None` until the first update; afterwards it is rewritten on every pass,
/// even when the incoming value equals the stored one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Tracked<T> {
    pub value: T,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub previous: Option<T>,
}

impl<T> Tracked<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            previous: None,
        }
    }

    /// Move the current value into the shadow slot and install `next`.
    pub fn shadow(&mut self, next: T) {
        let old = std::mem::replace(&mut self.value, next);
        self.previous = Some(old);
    }
}

impl<T: PartialEq> Tracked<T> {
    /// True when the latest reconciliation wrote back the value it found.
    pub fn is_unchanged(&self) -> bool {
        self.previous.as_ref() == Some(&self.value)
    }
}

// A present key always means "shadowed", including an explicit `null` for optional values.
pub(crate) fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Owner,
    Client,
    Venue,
    Opportunity,
    ItemGroup,
    Item,
    ItemGroupTotal,
    CustomInput,
    ActiveProduct,
}

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        EntityKind::Owner,
        EntityKind::Client,
        EntityKind::Venue,
        EntityKind::Opportunity,
        EntityKind::ItemGroup,
        EntityKind::Item,
        EntityKind::ItemGroupTotal,
        EntityKind::CustomInput,
        EntityKind::ActiveProduct,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Owner => "owner",
            EntityKind::Client => "client",
            EntityKind::Venue => "venue",
            EntityKind::Opportunity => "opportunity",
            EntityKind::ItemGroup => "item_group",
            EntityKind::Item => "item",
            EntityKind::ItemGroupTotal => "item_group_total",
            EntityKind::CustomInput => "custom_input",
            EntityKind::ActiveProduct => "active_product",
        }
    }

    /// Backing table name; every entity table shares the same column layout.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Owner => "owners",
            EntityKind::Client => "clients",
            EntityKind::Venue => "venues",
            EntityKind::Opportunity => "opportunities",
            EntityKind::ItemGroup => "item_groups",
            EntityKind::Item => "items",
            EntityKind::ItemGroupTotal => "item_group_totals",
            EntityKind::CustomInput => "custom_inputs",
            EntityKind::ActiveProduct => "active_products",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable lookup key of an entity. `Display` renders the stored key text.
pub trait EntityKey: Clone + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Owning opportunity id for opportunity-scoped children.
    fn scope(&self) -> Option<i64> {
        None
    }
}

/// External identifier of a top-level entity (owner, client, venue, opportunity, product).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalId(pub i64);

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl EntityKey for ExternalId {}

/// Key of a one-per-opportunity record (totals, custom input).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpportunityScoped(pub i64);

impl fmt::Display for OpportunityScoped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl EntityKey for OpportunityScoped {
    fn scope(&self) -> Option<i64> {
        Some(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemGroupKey {
    pub opportunity_id: i64,
    pub product_id: i64,
}

impl fmt::Display for ItemGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.opportunity_id, self.product_id)
    }
}

impl EntityKey for ItemGroupKey {
    fn scope(&self) -> Option<i64> {
        Some(self.opportunity_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub opportunity_id: i64,
    pub line_id: i64,
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.opportunity_id, self.line_id)
    }
}

impl EntityKey for ItemKey {
    fn scope(&self) -> Option<i64> {
        Some(self.opportunity_id)
    }
}

/// Schema of one reconciled entity type: its lookup key, incoming field set and audited fields.
pub trait Entity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: EntityKind;
    /// Names of the audited fields, each carried as a [`Tracked`] value.
    const TRACKED: &'static [&'static str];

    type Key: EntityKey;
    type Incoming: Clone + fmt::Debug + Send + Sync + 'static;

    /// Build a first-sighting entity. No shadow values are set.
    fn create(key: &Self::Key, incoming: Self::Incoming) -> Self;

    /// Shadow every tracked field, then apply the remaining incoming fields directly.
    fn absorb(&mut self, incoming: Self::Incoming);
}

/// Persisted entity plus the metadata every table carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<E> {
    pub id: Uuid,
    pub lookup_key: String,
    pub scope: Option<i64>,
    pub is_active: bool,
    pub last_seen_run: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub previously_updated_at: Option<DateTime<Utc>>,
    pub fields: E,
}

/// Entity a tag set hangs off.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagOwner {
    pub kind: EntityKind,
    pub key: String,
}

impl TagOwner {
    pub fn owner(id: i64) -> Self {
        Self {
            kind: EntityKind::Owner,
            key: ExternalId(id).to_string(),
        }
    }

    pub fn client(id: i64) -> Self {
        Self {
            kind: EntityKind::Client,
            key: ExternalId(id).to_string(),
        }
    }

    pub fn opportunity(id: i64) -> Self {
        Self {
            kind: EntityKind::Opportunity,
            key: ExternalId(id).to_string(),
        }
    }
}

/// Round to two decimal places, the precision every stored quantity uses.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn shadow_moves_current_into_previous() {
        let mut field = Tracked::new("Stage set".to_string());
        assert!(field.previous.is_none());
        field.shadow("Stage set v2".to_string());
        assert_eq!(field.value, "Stage set v2");
        assert_eq!(field.previous.as_deref(), Some("Stage set"));
        assert!(!field.is_unchanged());
        field.shadow("Stage set v2".to_string());
        assert!(field.is_unchanged());
    }

    #[test]
    fn shadowed_null_survives_json() {
        let mut field: Tracked<Option<NaiveDate>> = Tracked::new(None);
        field.shadow(None);
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json, serde_json::json!({"value": null, "previous": null}));
        let back: Tracked<Option<NaiveDate>> = serde_json::from_value(json).unwrap();
        assert_eq!(back.previous, Some(None));
        assert!(back.is_unchanged());

        let fresh: Tracked<Option<NaiveDate>> =
            serde_json::from_value(serde_json::json!({"value": null})).unwrap();
        assert_eq!(fresh.previous, None);
        assert!(!fresh.is_unchanged());
    }

    #[test]
    fn child_keys_render_with_scope() {
        let group = ItemGroupKey {
            opportunity_id: 12,
            product_id: 7,
        };
        assert_eq!(group.to_string(), "12:7");
        assert_eq!(group.scope(), Some(12));
        assert_eq!(ExternalId(12).scope(), None);
        assert_eq!(OpportunityScoped(12).to_string(), "12");
    }

    #[test]
    fn rounds_to_cents() {
        assert_eq!(round2(2.345_000_1), 2.35);
        assert_eq!(round2(10.0), 10.0);
    }
}
