//! Booked weight per pipeline state, the figures behind the workload traffic light.

use serde::{Deserialize, Serialize};

use crate::{round2, Opportunity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Provisional,
    Reserved,
    Confirmed,
}

impl PipelineState {
    /// Map a feed `(state, status)` pair. Anything else (quotes, cancelled, completed) is `None`.
    pub fn classify(state: i32, status: i32) -> Option<Self> {
        match (state, status) {
            (2, 1) => Some(Self::Provisional),
            (2, 5) => Some(Self::Reserved),
            (3, 0) => Some(Self::Confirmed),
            _ => None,
        }
    }

    pub fn of(opportunity: &Opportunity) -> Option<Self> {
        Self::classify(opportunity.state, opportunity.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightTotals {
    pub provisional_weight: f64,
    pub reserved_weight: f64,
    pub confirmed_weight: f64,
    /// Opportunities in one of the three states with no usable weight.
    pub unweighed: usize,
}

impl WeightTotals {
    fn slot(&mut self, state: PipelineState) -> &mut f64 {
        match state {
            PipelineState::Provisional => &mut self.provisional_weight,
            PipelineState::Reserved => &mut self.reserved_weight,
            PipelineState::Confirmed => &mut self.confirmed_weight,
        }
    }
}

/// Sum each opportunity's weight, rounded to cents, into its pipeline state.
pub fn weight_totals<'a>(opportunities: impl IntoIterator<Item = &'a Opportunity>) -> WeightTotals {
    let mut totals = WeightTotals::default();
    for opportunity in opportunities {
        let Some(state) = PipelineState::of(opportunity) else {
            continue;
        };
        match opportunity.weight_total.filter(|w| w.is_finite()) {
            Some(weight) => *totals.slot(state) += round2(weight),
            None => totals.unweighed += 1,
        }
    }
    for state in [
        PipelineState::Provisional,
        PipelineState::Reserved,
        PipelineState::Confirmed,
    ] {
        let slot = totals.slot(state);
        *slot = round2(*slot);
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::OpportunityIncoming;
    use crate::{Entity, ExternalId};
    use chrono::{TimeZone, Utc};

    fn opportunity(id: i64, state: i32, status: i32, weight: Option<f64>) -> Opportunity {
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).single().unwrap();
        Opportunity::create(
            &ExternalId(id),
            OpportunityIncoming {
                owner_id: None,
                client_id: None,
                venue_id: None,
                order_number: String::new(),
                name: format!("Job {id}"),
                dry_hire: false,
                dry_hire_transport: false,
                state,
                status,
                status_name: String::new(),
                starts_at: at,
                ends_at: at,
                load_starts_at: None,
                load_ends_at: None,
                deliver_starts_at: None,
                deliver_ends_at: None,
                setup_starts_at: None,
                setup_ends_at: None,
                show_starts_at: None,
                show_ends_at: None,
                takedown_starts_at: None,
                takedown_ends_at: None,
                collect_starts_at: None,
                collect_ends_at: None,
                unload_starts_at: None,
                unload_ends_at: None,
                weight_total: weight,
            },
        )
    }

    #[test]
    fn classifies_the_three_booking_states() {
        assert_eq!(PipelineState::classify(2, 1), Some(PipelineState::Provisional));
        assert_eq!(PipelineState::classify(2, 5), Some(PipelineState::Reserved));
        assert_eq!(PipelineState::classify(3, 0), Some(PipelineState::Confirmed));
        assert_eq!(PipelineState::classify(1, 0), None);
        assert_eq!(PipelineState::classify(3, 20), None);
    }

    #[test]
    fn weights_are_summed_per_state() {
        let opps = [
            opportunity(1, 2, 1, Some(10.004)),
            opportunity(2, 2, 1, Some(5.5)),
            opportunity(3, 2, 5, Some(1.25)),
            opportunity(4, 3, 0, Some(100.0)),
            opportunity(5, 3, 0, None),
            opportunity(6, 1, 0, Some(999.0)),
        ];
        let totals = weight_totals(&opps);
        assert_eq!(totals.provisional_weight, 15.5);
        assert_eq!(totals.reserved_weight, 1.25);
        assert_eq!(totals.confirmed_weight, 100.0);
        assert_eq!(totals.unweighed, 1);
    }

    #[test]
    fn no_opportunities_weigh_nothing() {
        assert_eq!(weight_totals(&Vec::<Opportunity>::new()), WeightTotals::default());
    }
}
