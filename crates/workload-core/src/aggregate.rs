//! Per-product grouping of opportunity lines and grand-total selection.

use std::collections::{BTreeMap, BTreeSet};

use crate::{round2, ItemFields};

/// Feed quantities arrive in half-day units.
pub const QUANTITY_DIVISOR: f64 = 2.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub quantity_by_product: BTreeMap<i64, f64>,
    pub name_by_product: BTreeMap<i64, String>,
}

/// Display name up to the first `-`, trimmed.
pub fn normalize_item_name(name: &str) -> String {
    name.split('-').next().unwrap_or_default().trim().to_string()
}

pub fn aggregate(items: &[ItemFields]) -> Aggregation {
    let mut out = Aggregation::default();
    for item in items {
        *out.quantity_by_product.entry(item.product_id).or_insert(0.0) +=
            item.quantity / QUANTITY_DIVISOR;
        out.name_by_product
            .entry(item.product_id)
            .or_insert_with(|| normalize_item_name(&item.name));
    }
    for qty in out.quantity_by_product.values_mut() {
        *qty = round2(*qty);
    }
    out
}

/// Sum of quantities for active products other than `excluded`.
pub fn grand_total(
    quantity_by_product: &BTreeMap<i64, f64>,
    active_product_ids: &BTreeSet<i64>,
    excluded: Option<i64>,
) -> f64 {
    let total: f64 = quantity_by_product
        .iter()
        .filter(|(id, _)| active_product_ids.contains(id) && Some(**id) != excluded)
        .map(|(_, qty)| *qty)
        .sum();
    round2(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(product_id: i64, quantity: f64, name: &str) -> ItemFields {
        ItemFields {
            product_id,
            item_type: Some("Product".into()),
            opportunity_item_type: Some(1),
            opportunity_item_type_name: Some("Principal".into()),
            name: name.into(),
            description: String::new(),
            quantity,
        }
    }

    #[test]
    fn halves_and_sums_per_product() {
        let agg = aggregate(&[line(7, 4.0, "Flat"), line(7, 6.0, "Flat")]);
        assert_eq!(agg.quantity_by_product.get(&7), Some(&5.0));
    }

    #[test]
    fn first_name_wins_and_is_truncated() {
        let agg = aggregate(&[
            line(3, 1.0, " Truss - 3m section "),
            line(3, 1.0, "Something else"),
            line(4, 3.0, "Rostra"),
        ]);
        assert_eq!(agg.name_by_product[&3], "Truss");
        assert_eq!(agg.name_by_product[&4], "Rostra");
        assert_eq!(agg.quantity_by_product[&4], 1.5);
    }

    #[test]
    fn total_skips_inactive_and_excluded_products() {
        let agg = aggregate(&[
            line(1, 10.0, "A"),
            line(2, 4.0, "B"),
            line(3, 2.0, "C"),
        ]);
        let active: BTreeSet<i64> = [1, 2].into_iter().collect();
        assert_eq!(grand_total(&agg.quantity_by_product, &active, None), 7.0);
        assert_eq!(grand_total(&agg.quantity_by_product, &active, Some(2)), 5.0);
        assert_eq!(agg.quantity_by_product.len(), 3);
    }
}
