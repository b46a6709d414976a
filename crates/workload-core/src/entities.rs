//! Canonical persisted entities and their incoming field sets.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::{
    Entity, EntityKind, ExternalId, ItemGroupKey, ItemKey, OpportunityScoped, Tracked,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    pub current_id: i64,
    pub current_uuid: Option<Uuid>,
    pub name: String,
    pub description: String,
    pub active: bool,
    pub bookable: bool,
    pub membership_id: Option<i64>,
    pub membership_type: Option<String>,
    pub lawful_basis_id: Option<i64>,
    pub lawful_basis_type_name: Option<String>,
}

impl Entity for Owner {
    const KIND: EntityKind = EntityKind::Owner;
    const TRACKED: &'static [&'static str] = &[];

    type Key = ExternalId;
    type Incoming = Owner;

    fn create(_key: &ExternalId, incoming: Owner) -> Self {
        incoming
    }

    fn absorb(&mut self, incoming: Owner) {
        *self = incoming;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub current_id: i64,
    pub current_uuid: Option<Uuid>,
    pub name: String,
    pub description: String,
    pub active: bool,
}

impl Entity for Client {
    const KIND: EntityKind = EntityKind::Client;
    const TRACKED: &'static [&'static str] = &[];

    type Key = ExternalId;
    type Incoming = Client;

    fn create(_key: &ExternalId, incoming: Client) -> Self {
        incoming
    }

    fn absorb(&mut self, incoming: Client) {
        *self = incoming;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub current_id: i64,
    pub name: Option<String>,
    pub street: Option<String>,
    pub postcode: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub country: Option<String>,
}

impl Entity for Venue {
    const KIND: EntityKind = EntityKind::Venue;
    const TRACKED: &'static [&'static str] = &[];

    type Key = ExternalId;
    type Incoming = Venue;

    fn create(_key: &ExternalId, incoming: Venue) -> Self {
        incoming
    }

    fn absorb(&mut self, incoming: Venue) {
        *self = incoming;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveProduct {
    pub current_id: i64,
    pub name: String,
    pub product_type: Option<String>,
    pub description: Option<String>,
}

impl Entity for ActiveProduct {
    const KIND: EntityKind = EntityKind::ActiveProduct;
    const TRACKED: &'static [&'static str] = &[];

    type Key = ExternalId;
    type Incoming = ActiveProduct;

    fn create(_key: &ExternalId, incoming: ActiveProduct) -> Self {
        incoming
    }

    fn absorb(&mut self, incoming: ActiveProduct) {
        *self = incoming;
    }
}

/// Normalized feed values for one opportunity.
#[derive(Debug, Clone, PartialEq)]
pub struct OpportunityIncoming {
    pub owner_id: Option<i64>,
    pub client_id: Option<i64>,
    pub venue_id: Option<i64>,
    pub order_number: String,
    pub name: String,
    pub dry_hire: bool,
    pub dry_hire_transport: bool,
    pub state: i32,
    pub status: i32,
    pub status_name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub load_starts_at: Option<DateTime<Utc>>,
    pub load_ends_at: Option<DateTime<Utc>>,
    pub deliver_starts_at: Option<DateTime<Utc>>,
    pub deliver_ends_at: Option<DateTime<Utc>>,
    pub setup_starts_at: Option<DateTime<Utc>>,
    pub setup_ends_at: Option<DateTime<Utc>>,
    pub show_starts_at: Option<DateTime<Utc>>,
    pub show_ends_at: Option<DateTime<Utc>>,
    pub takedown_starts_at: Option<DateTime<Utc>>,
    pub takedown_ends_at: Option<DateTime<Utc>>,
    pub collect_starts_at: Option<DateTime<Utc>>,
    pub collect_ends_at: Option<DateTime<Utc>>,
    pub unload_starts_at: Option<DateTime<Utc>>,
    pub unload_ends_at: Option<DateTime<Utc>>,
    pub weight_total: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub current_id: i64,
    pub owner_id: Option<i64>,
    pub client_id: Option<i64>,
    pub venue_id: Option<i64>,
    pub order_number: String,
    pub name: Tracked<String>,
    pub dry_hire: bool,
    pub dry_hire_transport: bool,
    #[serde(default)]
    pub state: i32,
    pub status: i32,
    pub status_name: Tracked<String>,
    pub starts_at: Tracked<DateTime<Utc>>,
    pub ends_at: Tracked<DateTime<Utc>>,
    pub load_starts_at: Tracked<Option<DateTime<Utc>>>,
    pub load_ends_at: Tracked<Option<DateTime<Utc>>>,
    pub deliver_starts_at: Tracked<Option<DateTime<Utc>>>,
    pub deliver_ends_at: Tracked<Option<DateTime<Utc>>>,
    pub setup_starts_at: Tracked<Option<DateTime<Utc>>>,
    pub setup_ends_at: Tracked<Option<DateTime<Utc>>>,
    pub show_starts_at: Tracked<Option<DateTime<Utc>>>,
    pub show_ends_at: Tracked<Option<DateTime<Utc>>>,
    pub takedown_starts_at: Tracked<Option<DateTime<Utc>>>,
    pub takedown_ends_at: Tracked<Option<DateTime<Utc>>>,
    pub collect_starts_at: Tracked<Option<DateTime<Utc>>>,
    pub collect_ends_at: Tracked<Option<DateTime<Utc>>>,
    pub unload_starts_at: Tracked<Option<DateTime<Utc>>>,
    pub unload_ends_at: Tracked<Option<DateTime<Utc>>>,
    pub weight_total: Option<f64>,
}

impl Opportunity {
    /// First scheduled movement: load, then deliver, then the booking start.
    pub fn effective_start(&self) -> DateTime<Utc> {
        self.load_starts_at
            .value
            .or(self.deliver_starts_at.value)
            .unwrap_or(self.starts_at.value)
    }
}

impl Entity for Opportunity {
    const KIND: EntityKind = EntityKind::Opportunity;
    const TRACKED: &'static [&'static str] = &[
        "name",
        "status_name",
        "starts_at",
        "ends_at",
        "load_starts_at",
        "load_ends_at",
        "deliver_starts_at",
        "deliver_ends_at",
        "setup_starts_at",
        "setup_ends_at",
        "show_starts_at",
        "show_ends_at",
        "takedown_starts_at",
        "takedown_ends_at",
        "collect_starts_at",
        "collect_ends_at",
        "unload_starts_at",
        "unload_ends_at",
    ];

    type Key = ExternalId;
    type Incoming = OpportunityIncoming;

    fn create(key: &ExternalId, incoming: OpportunityIncoming) -> Self {
        Self {
            current_id: key.0,
            owner_id: incoming.owner_id,
            client_id: incoming.client_id,
            venue_id: incoming.venue_id,
            order_number: incoming.order_number,
            name: Tracked::new(incoming.name),
            dry_hire: incoming.dry_hire,
            dry_hire_transport: incoming.dry_hire_transport,
            state: incoming.state,
            status: incoming.status,
            status_name: Tracked::new(incoming.status_name),
            starts_at: Tracked::new(incoming.starts_at),
            ends_at: Tracked::new(incoming.ends_at),
            load_starts_at: Tracked::new(incoming.load_starts_at),
            load_ends_at: Tracked::new(incoming.load_ends_at),
            deliver_starts_at: Tracked::new(incoming.deliver_starts_at),
            deliver_ends_at: Tracked::new(incoming.deliver_ends_at),
            setup_starts_at: Tracked::new(incoming.setup_starts_at),
            setup_ends_at: Tracked::new(incoming.setup_ends_at),
            show_starts_at: Tracked::new(incoming.show_starts_at),
            show_ends_at: Tracked::new(incoming.show_ends_at),
            takedown_starts_at: Tracked::new(incoming.takedown_starts_at),
            takedown_ends_at: Tracked::new(incoming.takedown_ends_at),
            collect_starts_at: Tracked::new(incoming.collect_starts_at),
            collect_ends_at: Tracked::new(incoming.collect_ends_at),
            unload_starts_at: Tracked::new(incoming.unload_starts_at),
            unload_ends_at: Tracked::new(incoming.unload_ends_at),
            weight_total: incoming.weight_total,
        }
    }

    fn absorb(&mut self, incoming: OpportunityIncoming) {
        self.name.shadow(incoming.name);
        self.status_name.shadow(incoming.status_name);
        self.starts_at.shadow(incoming.starts_at);
        self.ends_at.shadow(incoming.ends_at);
        self.load_starts_at.shadow(incoming.load_starts_at);
        self.load_ends_at.shadow(incoming.load_ends_at);
        self.deliver_starts_at.shadow(incoming.deliver_starts_at);
        self.deliver_ends_at.shadow(incoming.deliver_ends_at);
        self.setup_starts_at.shadow(incoming.setup_starts_at);
        self.setup_ends_at.shadow(incoming.setup_ends_at);
        self.show_starts_at.shadow(incoming.show_starts_at);
        self.show_ends_at.shadow(incoming.show_ends_at);
        self.takedown_starts_at.shadow(incoming.takedown_starts_at);
        self.takedown_ends_at.shadow(incoming.takedown_ends_at);
        self.collect_starts_at.shadow(incoming.collect_starts_at);
        self.collect_ends_at.shadow(incoming.collect_ends_at);
        self.unload_starts_at.shadow(incoming.unload_starts_at);
        self.unload_ends_at.shadow(incoming.unload_ends_at);

        self.owner_id = incoming.owner_id;
        self.client_id = incoming.client_id;
        self.venue_id = incoming.venue_id;
        self.order_number = incoming.order_number;
        self.dry_hire = incoming.dry_hire;
        self.dry_hire_transport = incoming.dry_hire_transport;
        self.state = incoming.state;
        self.status = incoming.status;
        self.weight_total = incoming.weight_total;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemGroupFields {
    pub name: String,
    pub item_total: f64,
}

/// Per-product aggregate of an opportunity's lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemGroup {
    pub opportunity_id: i64,
    pub product_id: i64,
    pub name: String,
    pub item_total: Tracked<f64>,
}

impl Entity for ItemGroup {
    const KIND: EntityKind = EntityKind::ItemGroup;
    const TRACKED: &'static [&'static str] = &["item_total"];

    type Key = ItemGroupKey;
    type Incoming = ItemGroupFields;

    fn create(key: &ItemGroupKey, incoming: ItemGroupFields) -> Self {
        Self {
            opportunity_id: key.opportunity_id,
            product_id: key.product_id,
            name: incoming.name,
            item_total: Tracked::new(incoming.item_total),
        }
    }

    fn absorb(&mut self, incoming: ItemGroupFields) {
        self.item_total.shadow(incoming.item_total);
        self.name = incoming.name;
    }
}

/// One feed line with a product id, quantity still in raw feed units.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFields {
    pub product_id: i64,
    pub item_type: Option<String>,
    pub opportunity_item_type: Option<i32>,
    pub opportunity_item_type_name: Option<String>,
    pub name: String,
    pub description: String,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub opportunity_id: i64,
    pub line_id: i64,
    pub product_id: i64,
    pub item_type: Option<String>,
    pub opportunity_item_type: Option<i32>,
    pub opportunity_item_type_name: Option<String>,
    pub name: String,
    pub description: String,
    pub quantity: Tracked<f64>,
}

impl Item {
    pub fn group_key(&self) -> ItemGroupKey {
        ItemGroupKey {
            opportunity_id: self.opportunity_id,
            product_id: self.product_id,
        }
    }
}

impl Entity for Item {
    const KIND: EntityKind = EntityKind::Item;
    const TRACKED: &'static [&'static str] = &["quantity"];

    type Key = ItemKey;
    type Incoming = ItemFields;

    fn create(key: &ItemKey, incoming: ItemFields) -> Self {
        Self {
            opportunity_id: key.opportunity_id,
            line_id: key.line_id,
            product_id: incoming.product_id,
            item_type: incoming.item_type,
            opportunity_item_type: incoming.opportunity_item_type,
            opportunity_item_type_name: incoming.opportunity_item_type_name,
            name: incoming.name,
            description: incoming.description,
            quantity: Tracked::new(incoming.quantity),
        }
    }

    fn absorb(&mut self, incoming: ItemFields) {
        self.quantity.shadow(incoming.quantity);
        self.product_id = incoming.product_id;
        self.item_type = incoming.item_type;
        self.opportunity_item_type = incoming.opportunity_item_type;
        self.opportunity_item_type_name = incoming.opportunity_item_type_name;
        self.name = incoming.name;
        self.description = incoming.description;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemGroupTotalFields {
    pub grand_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemGroupTotal {
    pub opportunity_id: i64,
    pub grand_total: Tracked<f64>,
}

impl Entity for ItemGroupTotal {
    const KIND: EntityKind = EntityKind::ItemGroupTotal;
    const TRACKED: &'static [&'static str] = &["grand_total"];

    type Key = OpportunityScoped;
    type Incoming = ItemGroupTotalFields;

    fn create(key: &OpportunityScoped, incoming: ItemGroupTotalFields) -> Self {
        Self {
            opportunity_id: key.0,
            grand_total: Tracked::new(incoming.grand_total),
        }
    }

    fn absorb(&mut self, incoming: ItemGroupTotalFields) {
        self.grand_total.shadow(incoming.grand_total);
    }
}

/// Operator scheduling inputs plus the figures derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomInputFields {
    pub include_weekends: bool,
    pub carpenter_count: i32,
    pub planned_finish_date: Option<NaiveDate>,
    pub built: bool,
    pub working_days: Option<f64>,
    pub start_build_date: Option<NaiveDate>,
    pub date_out: Option<NaiveDate>,
    pub time_out: Option<NaiveTime>,
}

impl CustomInputFields {
    pub fn defaults(carpenter_count: i32) -> Self {
        Self {
            include_weekends: false,
            carpenter_count,
            planned_finish_date: None,
            built: false,
            working_days: None,
            start_build_date: None,
            date_out: None,
            time_out: None,
        }
    }
}

impl From<&CustomInput> for CustomInputFields {
    fn from(input: &CustomInput) -> Self {
        Self {
            include_weekends: input.include_weekends.value,
            carpenter_count: input.carpenter_count.value,
            planned_finish_date: input.planned_finish_date.value,
            built: input.built,
            working_days: input.working_days.value,
            start_build_date: input.start_build_date.value,
            date_out: input.date_out.value,
            time_out: input.time_out.value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomInput {
    pub opportunity_id: i64,
    pub include_weekends: Tracked<bool>,
    pub carpenter_count: Tracked<i32>,
    pub planned_finish_date: Tracked<Option<NaiveDate>>,
    pub built: bool,
    pub working_days: Tracked<Option<f64>>,
    pub start_build_date: Tracked<Option<NaiveDate>>,
    pub date_out: Tracked<Option<NaiveDate>>,
    pub time_out: Tracked<Option<NaiveTime>>,
}

impl Entity for CustomInput {
    const KIND: EntityKind = EntityKind::CustomInput;
    const TRACKED: &'static [&'static str] = &[
        "include_weekends",
        "carpenter_count",
        "planned_finish_date",
        "working_days",
        "start_build_date",
        "date_out",
        "time_out",
    ];

    type Key = OpportunityScoped;
    type Incoming = CustomInputFields;

    fn create(key: &OpportunityScoped, incoming: CustomInputFields) -> Self {
        Self {
            opportunity_id: key.0,
            include_weekends: Tracked::new(incoming.include_weekends),
            carpenter_count: Tracked::new(incoming.carpenter_count),
            planned_finish_date: Tracked::new(incoming.planned_finish_date),
            built: incoming.built,
            working_days: Tracked::new(incoming.working_days),
            start_build_date: Tracked::new(incoming.start_build_date),
            date_out: Tracked::new(incoming.date_out),
            time_out: Tracked::new(incoming.time_out),
        }
    }

    fn absorb(&mut self, incoming: CustomInputFields) {
        self.include_weekends.shadow(incoming.include_weekends);
        self.carpenter_count.shadow(incoming.carpenter_count);
        self.planned_finish_date.shadow(incoming.planned_finish_date);
        self.working_days.shadow(incoming.working_days);
        self.start_build_date.shadow(incoming.start_build_date);
        self.date_out.shadow(incoming.date_out);
        self.time_out.shadow(incoming.time_out);
        self.built = incoming.built;
    }
}

/// Partial operator update of a custom input. Absent keys are left alone;
/// `planned_finish_date: null` clears the date.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomInputPatch {
    #[serde(default)]
    pub carpenter_count: Option<i32>,
    #[serde(default)]
    pub include_weekends: Option<bool>,
    #[serde(default, deserialize_with = "crate::present")]
    pub planned_finish_date: Option<Option<NaiveDate>>,
    #[serde(default)]
    pub built: Option<bool>,
    #[serde(default, deserialize_with = "crate::present")]
    pub working_days: Option<Option<f64>>,
    #[serde(default, deserialize_with = "crate::present")]
    pub start_build_date: Option<Option<NaiveDate>>,
}

impl CustomInputPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Write the present keys into `fields` and report them back as applied.
    pub fn apply(&self, fields: &mut CustomInputFields) -> Map<String, JsonValue> {
        let mut applied = Map::new();
        if let Some(count) = self.carpenter_count {
            fields.carpenter_count = count;
            applied.insert("carpenter_count".into(), count.into());
        }
        if let Some(include) = self.include_weekends {
            fields.include_weekends = include;
            applied.insert("include_weekends".into(), include.into());
        }
        if let Some(date) = self.planned_finish_date {
            fields.planned_finish_date = date;
            applied.insert("planned_finish_date".into(), date_json(date));
        }
        if let Some(built) = self.built {
            fields.built = built;
            applied.insert("built".into(), built.into());
        }
        if let Some(days) = self.working_days {
            fields.working_days = days;
            applied.insert("working_days".into(), days.into());
        }
        if let Some(date) = self.start_build_date {
            fields.start_build_date = date;
            applied.insert("start_build_date".into(), date_json(date));
        }
        applied
    }
}

fn date_json(date: Option<NaiveDate>) -> JsonValue {
    date.map(|d| JsonValue::String(d.to_string()))
        .unwrap_or(JsonValue::Null)
}
