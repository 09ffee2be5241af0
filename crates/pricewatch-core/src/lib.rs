//! Core domain model for the price watcher.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pricewatch-core";

/// URL template the marketplace uses for product detail pages.
pub const PRODUCT_LINK_TEMPLATE: &str =
    "https://www.wildberries.ru/catalog/{id}/detail.aspx?targetUrl=BP";

/// Derive the canonical product page link from a product id.
pub fn product_link(id: u64) -> String {
    PRODUCT_LINK_TEMPLATE.replace("{id}", &id.to_string())
}

/// One product listing at one point in time. `id` is the join key across
/// snapshots; prices are already normalized out of minor units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: u64,
    pub name: String,
    pub price: i64,
    pub sale_price: i64,
    pub sale_fraction: Option<f64>,
    pub brand: Option<String>,
    pub rating: Option<f64>,
    pub supplier_id: Option<u64>,
    pub supplier_rating: Option<f64>,
    pub feedback_count: Option<u64>,
    pub review_rating: Option<f64>,
    pub promo_text_card: Option<String>,
    pub promo_text_category: Option<String>,
    pub link: String,
}

/// Routing tokens for a resolved category. `shard` and `query` are opaque
/// and pass through into listing URLs untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRef {
    pub name: String,
    pub shard: String,
    pub query: String,
}

/// One qualifying row of the current/previous join: the current-side fields
/// with the side suffix already stripped, plus the previous sale price and
/// the computed percent change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: u64,
    pub name: String,
    pub price: i64,
    pub sale_price: i64,
    pub sale_price_previous: i64,
    pub sale_fraction: Option<f64>,
    pub brand: Option<String>,
    pub rating: Option<f64>,
    pub supplier_id: Option<u64>,
    pub supplier_rating: Option<f64>,
    pub feedback_count: Option<u64>,
    pub review_rating: Option<f64>,
    pub promo_text_card: Option<String>,
    pub promo_text_category: Option<String>,
    pub link: String,
    pub percent_change: f64,
}

impl ChangeRecord {
    /// Column allow-list of persisted change files, in serialization order.
    pub const COLUMNS: [&'static str; 16] = [
        "id",
        "name",
        "price",
        "sale_price",
        "sale_price_previous",
        "sale_fraction",
        "brand",
        "rating",
        "supplier_id",
        "supplier_rating",
        "feedback_count",
        "review_rating",
        "promo_text_card",
        "promo_text_category",
        "link",
        "percent_change",
    ];

    pub fn from_join(current: &ProductRecord, sale_price_previous: i64, percent_change: f64) -> Self {
        Self {
            id: current.id,
            name: current.name.clone(),
            price: current.price,
            sale_price: current.sale_price,
            sale_price_previous,
            sale_fraction: current.sale_fraction,
            brand: current.brand.clone(),
            rating: current.rating,
            supplier_id: current.supplier_id,
            supplier_rating: current.supplier_rating,
            feedback_count: current.feedback_count,
            review_rating: current.review_rating,
            promo_text_card: current.promo_text_card.clone(),
            promo_text_category: current.promo_text_category.clone(),
            link: current.link.clone(),
            percent_change,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_link_embeds_id() {
        assert_eq!(
            product_link(123456),
            "https://www.wildberries.ru/catalog/123456/detail.aspx?targetUrl=BP"
        );
    }

    #[test]
    fn change_record_carries_current_side_fields() {
        let current = ProductRecord {
            id: 7,
            name: "Jacket".into(),
            price: 4500,
            sale_price: 2990,
            sale_fraction: Some(33.0),
            brand: Some("Acme".into()),
            rating: Some(4.6),
            supplier_id: Some(991),
            supplier_rating: Some(4.8),
            feedback_count: Some(120),
            review_rating: Some(4.5),
            promo_text_card: None,
            promo_text_category: None,
            link: product_link(7),
        };
        let change = ChangeRecord::from_join(&current, 3500, -14.57);
        assert_eq!(change.id, 7);
        assert_eq!(change.sale_price, 2990);
        assert_eq!(change.sale_price_previous, 3500);
        assert_eq!(change.link, current.link);
    }
}
