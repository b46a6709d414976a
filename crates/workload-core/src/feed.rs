//! Source-feed payload contracts and their conversion into entity field sets.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

use crate::schedule::{dispatch_datetime, ScheduleError};
use crate::{ActiveProduct, Client, ItemFields, OpportunityIncoming, Owner, Venue};

/// A feed record that could not be turned into an entity.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{record} {id}: {reason}")]
pub struct DataShapeError {
    pub record: &'static str,
    pub id: String,
    pub reason: String,
}

impl DataShapeError {
    fn new(record: &'static str, id: impl ToString, reason: impl Into<String>) -> Self {
        Self {
            record,
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Decode one raw record, keeping its id (when readable) for the error.
pub fn decode_record<T: DeserializeOwned>(
    record: &'static str,
    value: JsonValue,
) -> Result<T, DataShapeError> {
    let id = value
        .get("id")
        .map(|v| v.to_string())
        .unwrap_or_else(|| "<no id>".to_string());
    serde_json::from_value(value).map_err(|err| DataShapeError::new(record, id, err.to_string()))
}

/// Numeric field the feed sends as either a JSON number or a numeric string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedNumber {
    Number(f64),
    Text(String),
}

impl FeedNumber {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeedNumber::Number(n) => Some(*n).filter(|n| n.is_finite()),
            FeedNumber::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedOwner {
    pub id: i64,
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub bookable: Option<bool>,
    #[serde(default)]
    pub membership_id: Option<i64>,
    #[serde(default)]
    pub membership_type: Option<String>,
    #[serde(default)]
    pub lawful_basis_type_id: Option<i64>,
    #[serde(default)]
    pub lawful_basis_type_name: Option<String>,
    #[serde(default)]
    pub tag_list: Vec<String>,
}

impl FeedOwner {
    pub fn to_owner(&self) -> Owner {
        Owner {
            current_id: self.id,
            current_uuid: self.uuid,
            name: self.name.clone(),
            description: self.description.clone().unwrap_or_default(),
            active: self.active.unwrap_or(true),
            bookable: self.bookable.unwrap_or(false),
            membership_id: self.membership_id,
            membership_type: self.membership_type.clone(),
            lawful_basis_id: self.lawful_basis_type_id,
            lawful_basis_type_name: self.lawful_basis_type_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMember {
    pub id: i64,
    #[serde(default)]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub tag_list: Vec<String>,
}

impl FeedMember {
    pub fn to_client(&self) -> Client {
        Client {
            current_id: self.id,
            current_uuid: self.uuid,
            name: self.name.clone(),
            description: self.description.clone().unwrap_or_default(),
            active: self.active.unwrap_or(true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedVenue {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub county: Option<String>,
    #[serde(default, alias = "country_name")]
    pub country: Option<String>,
}

impl FeedVenue {
    pub fn to_venue(&self) -> Venue {
        Venue {
            current_id: self.id,
            name: self.name.clone(),
            street: self.street.clone(),
            postcode: self.postcode.clone(),
            city: self.city.clone(),
            county: self.county.clone(),
            country: self.country.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedOpportunity {
    pub id: i64,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub owner: Option<FeedOwner>,
    #[serde(default)]
    pub member: Option<FeedMember>,
    #[serde(default)]
    pub venue: Option<FeedVenue>,
    #[serde(default)]
    pub state: i32,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub status_name: String,
    #[serde(default)]
    pub starts_at: Option<String>,
    #[serde(default)]
    pub ends_at: Option<String>,
    #[serde(default)]
    pub load_starts_at: Option<String>,
    #[serde(default)]
    pub load_ends_at: Option<String>,
    #[serde(default)]
    pub deliver_starts_at: Option<String>,
    #[serde(default)]
    pub deliver_ends_at: Option<String>,
    #[serde(default)]
    pub setup_starts_at: Option<String>,
    #[serde(default)]
    pub setup_ends_at: Option<String>,
    #[serde(default)]
    pub show_starts_at: Option<String>,
    #[serde(default)]
    pub show_ends_at: Option<String>,
    #[serde(default)]
    pub takedown_starts_at: Option<String>,
    #[serde(default)]
    pub takedown_ends_at: Option<String>,
    #[serde(default)]
    pub collect_starts_at: Option<String>,
    #[serde(default)]
    pub collect_ends_at: Option<String>,
    #[serde(default)]
    pub unload_starts_at: Option<String>,
    #[serde(default)]
    pub unload_ends_at: Option<String>,
    #[serde(default)]
    pub weight_total: Option<FeedNumber>,
    #[serde(default)]
    pub tag_list: Vec<String>,
    #[serde(default)]
    pub custom_fields: Map<String, JsonValue>,
}

impl FeedOpportunity {
    fn shape_error(&self, reason: impl Into<String>) -> DataShapeError {
        DataShapeError::new("opportunity", self.id, reason)
    }

    fn required(&self, field: &str, raw: &Option<String>) -> Result<DateTime<Utc>, DataShapeError> {
        self.optional(field, raw)?
            .ok_or_else(|| self.shape_error(format!("missing `{field}`")))
    }

    fn optional(
        &self,
        field: &str,
        raw: &Option<String>,
    ) -> Result<Option<DateTime<Utc>>, DataShapeError> {
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => parse_timestamp(text)
                .map(Some)
                .ok_or_else(|| self.shape_error(format!("unparsable `{field}`: {text}"))),
        }
    }

    /// Parsed booking start, when present and valid.
    pub fn starts_at_utc(&self) -> Option<DateTime<Utc>> {
        self.starts_at.as_deref().and_then(parse_timestamp)
    }

    fn custom_flag(&self, name: &str) -> bool {
        matches!(self.custom_fields.get(name), Some(JsonValue::String(s)) if s == "Yes")
    }

    pub fn to_incoming(&self) -> Result<OpportunityIncoming, DataShapeError> {
        Ok(OpportunityIncoming {
            owner_id: self.owner.as_ref().map(|o| o.id),
            client_id: self.member.as_ref().map(|m| m.id),
            venue_id: self.venue.as_ref().map(|v| v.id),
            order_number: self.number.clone().unwrap_or_default(),
            name: self.subject.clone(),
            dry_hire: self.custom_flag("dry_hire"),
            dry_hire_transport: self.custom_flag("dry_hire_transport"),
            state: self.state,
            status: self.status,
            status_name: self.status_name.clone(),
            starts_at: self.required("starts_at", &self.starts_at)?,
            ends_at: self.required("ends_at", &self.ends_at)?,
            load_starts_at: self.optional("load_starts_at", &self.load_starts_at)?,
            load_ends_at: self.optional("load_ends_at", &self.load_ends_at)?,
            deliver_starts_at: self.optional("deliver_starts_at", &self.deliver_starts_at)?,
            deliver_ends_at: self.optional("deliver_ends_at", &self.deliver_ends_at)?,
            setup_starts_at: self.optional("setup_starts_at", &self.setup_starts_at)?,
            setup_ends_at: self.optional("setup_ends_at", &self.setup_ends_at)?,
            show_starts_at: self.optional("show_starts_at", &self.show_starts_at)?,
            show_ends_at: self.optional("show_ends_at", &self.show_ends_at)?,
            takedown_starts_at: self.optional("takedown_starts_at", &self.takedown_starts_at)?,
            takedown_ends_at: self.optional("takedown_ends_at", &self.takedown_ends_at)?,
            collect_starts_at: self.optional("collect_starts_at", &self.collect_starts_at)?,
            collect_ends_at: self.optional("collect_ends_at", &self.collect_ends_at)?,
            unload_starts_at: self.optional("unload_starts_at", &self.unload_starts_at)?,
            unload_ends_at: self.optional("unload_ends_at", &self.unload_ends_at)?,
            weight_total: self
                .weight_total
                .as_ref()
                .and_then(FeedNumber::as_f64)
                .map(crate::round2),
        })
    }

    pub fn dispatch(&self) -> Result<(NaiveDate, NaiveTime), ScheduleError> {
        dispatch_datetime(
            self.load_starts_at.as_deref(),
            self.deliver_starts_at.as_deref(),
            self.starts_at.as_deref(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: i64,
    #[serde(default)]
    pub item_id: Option<i64>,
    #[serde(default)]
    pub item_type: Option<String>,
    #[serde(default)]
    pub opportunity_item_type: Option<i32>,
    #[serde(default)]
    pub opportunity_item_type_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub quantity: Option<FeedNumber>,
}

impl FeedItem {
    /// `None` for lines that carry no product (group headers, text lines).
    pub fn to_fields(&self) -> Result<Option<ItemFields>, DataShapeError> {
        let Some(product_id) = self.item_id else {
            return Ok(None);
        };
        let quantity = self
            .quantity
            .as_ref()
            .and_then(FeedNumber::as_f64)
            .ok_or_else(|| DataShapeError::new("opportunity_item", self.id, "bad `quantity`"))?;
        Ok(Some(ItemFields {
            product_id,
            item_type: self.item_type.clone(),
            opportunity_item_type: self.opportunity_item_type,
            opportunity_item_type_name: self.opportunity_item_type_name.clone(),
            name: self.name.clone().unwrap_or_default(),
            description: self.description.clone().unwrap_or_default(),
            quantity,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedProduct {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "type")]
    pub product_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl FeedProduct {
    pub fn to_product(&self) -> ActiveProduct {
        ActiveProduct {
            current_id: self.id,
            name: self.name.clone(),
            product_type: self.product_type.clone(),
            description: self.description.clone(),
        }
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_opportunity() -> JsonValue {
        json!({
            "id": 501,
            "number": "0501",
            "subject": "Gala dinner",
            "owner": {"id": 3, "name": "Sam", "tag_list": ["Crew"]},
            "member": {"id": 9, "name": "Acme Events"},
            "venue": null,
            "status": 1,
            "status_name": "Provisional",
            "starts_at": "2024-05-10T09:00:00.000Z",
            "ends_at": "2024-05-11T18:00:00.000Z",
            "load_starts_at": "",
            "deliver_starts_at": "2024-05-09T06:30:00.000Z",
            "weight_total": "1250.456",
            "tag_list": ["SCENIC"],
            "custom_fields": {"dry_hire": "No", "dry_hire_transport": "Yes"}
        })
    }

    #[test]
    fn converts_opportunity_payload() {
        let opp: FeedOpportunity = decode_record("opportunity", raw_opportunity()).unwrap();
        let incoming = opp.to_incoming().unwrap();
        assert_eq!(incoming.owner_id, Some(3));
        assert_eq!(incoming.client_id, Some(9));
        assert_eq!(incoming.venue_id, None);
        assert!(!incoming.dry_hire);
        assert!(incoming.dry_hire_transport);
        assert_eq!(incoming.load_starts_at, None);
        assert_eq!(incoming.weight_total, Some(1250.46));
        let (date, _) = opp.dispatch().unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 5, 9).unwrap());
    }

    #[test]
    fn missing_start_is_a_shape_error() {
        let mut raw = raw_opportunity();
        raw["starts_at"] = JsonValue::Null;
        let opp: FeedOpportunity = decode_record("opportunity", raw).unwrap();
        let err = opp.to_incoming().unwrap_err();
        assert_eq!(err.id, "501");
        assert!(err.reason.contains("starts_at"));
    }

    #[test]
    fn malformed_record_reports_its_id() {
        let err = decode_record::<FeedOpportunity>("opportunity", json!({"id": "x"})).unwrap_err();
        assert_eq!(err.record, "opportunity");
        assert_eq!(err.id, "\"x\"");
    }

    #[test]
    fn item_quantities_accept_strings_and_skip_headers() {
        let item: FeedItem = serde_json::from_value(json!({
            "id": 1, "item_id": 7, "name": "Flat - 8x4", "quantity": "6.0"
        }))
        .unwrap();
        assert_eq!(item.to_fields().unwrap().map(|f| f.quantity), Some(6.0));

        let header: FeedItem =
            serde_json::from_value(json!({"id": 2, "item_id": null, "name": "Group"})).unwrap();
        assert_eq!(header.to_fields().unwrap(), None);

        let broken: FeedItem =
            serde_json::from_value(json!({"id": 3, "item_id": 7, "quantity": "lots"})).unwrap();
        assert!(broken.to_fields().is_err());
    }

    #[test]
    fn product_accepts_type_alias() {
        let product: FeedProduct =
            serde_json::from_value(json!({"id": 4, "name": "Flat", "type": "Product"})).unwrap();
        assert_eq!(product.to_product().product_type.as_deref(), Some("Product"));
    }
}
