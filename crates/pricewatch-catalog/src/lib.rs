//! Catalog resolution + listing fetch for the marketplace endpoints.

use std::sync::Arc;

use pricewatch_core::{product_link, CategoryRef, ProductRecord};
use pricewatch_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info};

pub const CRATE_NAME: &str = "pricewatch-catalog";

/// Main-menu document listing the whole catalog tree.
pub const CATALOG_URL: &str =
    "https://static-basket-01.wbbasket.ru/vol0/data/main-menu-ru-ru-v2.json";
/// Site root stripped off user-facing category URLs before lookup.
pub const SITE_ROOT: &str = "https://www.wildberries.ru";
/// Listing endpoint; the category shard is templated into the path.
pub const LISTING_BASE_URL: &str = "https://catalog.wb.ru/catalog";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("category not found in catalog for {url}")]
    NotFound { url: String },
    #[error("category {url} has no shard/query routing tokens")]
    MissingRouting { url: String },
}

/// One leaf of the flattened catalog tree. `shard`/`query` may be absent on
/// landing-page leaves that cannot be queried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEntry {
    pub name: String,
    pub url: String,
    pub shard: Option<String>,
    pub query: Option<String>,
}

/// Flatten the catalog tree with an explicit worklist. A node carrying
/// `childs` contributes only its children; everything else is a leaf.
pub fn flatten_categories(root: &JsonValue) -> Vec<CategoryEntry> {
    let mut entries = Vec::new();
    let mut worklist = vec![root];

    while let Some(node) = worklist.pop() {
        match node {
            JsonValue::Array(children) => worklist.extend(children.iter()),
            JsonValue::Object(map) => {
                if let Some(childs) = map.get("childs") {
                    worklist.push(childs);
                    continue;
                }
                let Some(url) = map.get("url").and_then(JsonValue::as_str) else {
                    continue;
                };
                entries.push(CategoryEntry {
                    name: map
                        .get("name")
                        .and_then(JsonValue::as_str)
                        .unwrap_or("unknown category")
                        .to_string(),
                    url: url.to_string(),
                    shard: map
                        .get("shard")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                    query: map
                        .get("query")
                        .and_then(JsonValue::as_str)
                        .map(str::to_string),
                });
            }
            _ => {}
        }
    }

    entries
}

/// Look up a user-facing category URL in the flattened tree.
pub fn resolve_category(entries: &[CategoryEntry], url: &str) -> Result<CategoryRef, CatalogError> {
    let path = url.strip_prefix(SITE_ROOT).unwrap_or(url);
    let entry = entries
        .iter()
        .find(|entry| entry.url == path)
        .ok_or_else(|| CatalogError::NotFound {
            url: url.to_string(),
        })?;

    match (&entry.shard, &entry.query) {
        (Some(shard), Some(query)) => {
            info!(category = %entry.name, "resolved category");
            Ok(CategoryRef {
                name: entry.name.clone(),
                shard: shard.clone(),
                query: query.clone(),
            })
        }
        _ => Err(CatalogError::MissingRouting {
            url: url.to_string(),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: Arc<HttpFetcher>,
    catalog_url: String,
}

impl CatalogClient {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            catalog_url: CATALOG_URL.to_string(),
        }
    }

    pub fn with_catalog_url(mut self, url: impl Into<String>) -> Self {
        self.catalog_url = url.into();
        self
    }

    /// Fetch and flatten the full catalog tree.
    pub async fn fetch_tree(&self) -> Result<Vec<CategoryEntry>, CatalogError> {
        let tree = self.http.get_json(&self.catalog_url).await?;
        let entries = flatten_categories(&tree);
        info!(categories = entries.len(), "catalog tree fetched");
        Ok(entries)
    }
}

/// Filter window for one listing page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParams {
    pub page: u32,
    pub low_price: u64,
    pub top_price: u64,
    pub discount: Option<u32>,
}

/// Listing URL for one category page. The category query string is appended
/// verbatim ahead of the fixed filter parameters.
pub fn listing_url(base_url: &str, category: &CategoryRef, params: &PageParams) -> String {
    let mut url = format!(
        "{base}/{shard}/catalog?{query}&appType=1&curr=rub&dest=-1257786&locale=ru&page={page}&priceU={low};{top}&sort=popular&spp=0",
        base = base_url,
        shard = category.shard,
        query = category.query,
        page = params.page,
        low = params.low_price * 100,
        top = params.top_price * 100,
    );
    if let Some(discount) = params.discount {
        url.push_str(&format!("&discount={discount}"));
    }
    url
}

/// Map one raw listing document into flat product records. Missing `data`
/// or `products` keys yield an empty list; entries without an id are
/// dropped since they can never join across snapshots.
pub fn normalize_listing(listing: &JsonValue) -> Vec<ProductRecord> {
    let Some(products) = listing
        .get("data")
        .and_then(|data| data.get("products"))
        .and_then(JsonValue::as_array)
    else {
        return Vec::new();
    };

    products
        .iter()
        .filter_map(|raw| {
            let id = raw.get("id").and_then(JsonValue::as_u64)?;
            Some(ProductRecord {
                id,
                name: raw
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string(),
                price: minor_units(raw.get("priceU")),
                sale_price: minor_units(raw.get("salePriceU")),
                sale_fraction: raw.get("sale").and_then(JsonValue::as_f64),
                brand: raw
                    .get("brand")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
                rating: raw.get("rating").and_then(JsonValue::as_f64),
                supplier_id: raw.get("supplier").and_then(JsonValue::as_u64),
                supplier_rating: raw.get("supplierRating").and_then(JsonValue::as_f64),
                feedback_count: raw.get("feedbacks").and_then(JsonValue::as_u64),
                review_rating: raw.get("reviewRating").and_then(JsonValue::as_f64),
                promo_text_card: raw
                    .get("promoTextCard")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
                promo_text_category: raw
                    .get("promoTextCat")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
                link: product_link(id),
            })
        })
        .collect()
}

fn minor_units(value: Option<&JsonValue>) -> i64 {
    value.and_then(JsonValue::as_i64).unwrap_or(0) / 100
}

/// Fetches one listing page at a time. Page fetches are independent units
/// of work; a page that keeps failing degrades to zero records instead of
/// failing the category.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl PageFetcher {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            base_url: LISTING_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub async fn fetch_page(&self, category: &CategoryRef, params: PageParams) -> Vec<ProductRecord> {
        let url = listing_url(&self.base_url, category, &params);
        match self.http.get_json(&url).await {
            Ok(listing) => {
                let records = normalize_listing(&listing);
                debug!(category = %category.name, page = params.page, records = records.len(), "page collected");
                records
            }
            Err(err) => {
                error!(category = %category.name, page = params.page, error = %err, "page fetch failed, degrading to empty page");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tree() -> JsonValue {
        json!([
            {
                "name": "Women",
                "url": "/catalog/zhenshchinam",
                "childs": [
                    {
                        "name": "Dresses",
                        "url": "/catalog/zhenshchinam/platya",
                        "shard": "dresses_shard",
                        "query": "cat=8126"
                    },
                    {
                        "name": "Suits",
                        "url": "/catalog/zhenshchinam/kostyumy",
                        "shard": "suits_shard",
                        "query": "cat=8127"
                    }
                ]
            },
            {
                "name": "Promo landing",
                "url": "/promo/landing"
            }
        ])
    }

    #[test]
    fn flatten_keeps_only_leaves() {
        let entries = flatten_categories(&sample_tree());
        let urls: Vec<&str> = entries.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(entries.len(), 3);
        assert!(urls.contains(&"/catalog/zhenshchinam/platya"));
        assert!(urls.contains(&"/promo/landing"));
        assert!(!urls.contains(&"/catalog/zhenshchinam"));
    }

    #[test]
    fn resolve_strips_site_root() {
        let entries = flatten_categories(&sample_tree());
        let category = resolve_category(
            &entries,
            "https://www.wildberries.ru/catalog/zhenshchinam/platya",
        )
        .expect("resolved");
        assert_eq!(category.name, "Dresses");
        assert_eq!(category.shard, "dresses_shard");
        assert_eq!(category.query, "cat=8126");
    }

    #[test]
    fn resolve_reports_unknown_category() {
        let entries = flatten_categories(&sample_tree());
        let err = resolve_category(&entries, "https://www.wildberries.ru/catalog/unknown")
            .expect_err("not found");
        assert!(matches!(err, CatalogError::NotFound { .. }));
    }

    #[test]
    fn resolve_rejects_leaves_without_routing_tokens() {
        let entries = flatten_categories(&sample_tree());
        let err = resolve_category(&entries, "https://www.wildberries.ru/promo/landing")
            .expect_err("missing routing");
        assert!(matches!(err, CatalogError::MissingRouting { .. }));
    }

    #[test]
    fn listing_url_carries_query_and_minor_unit_price_window() {
        let category = CategoryRef {
            name: "Dresses".into(),
            shard: "dresses_shard".into(),
            query: "cat=8126".into(),
        };
        let params = PageParams {
            page: 3,
            low_price: 100,
            top_price: 1_000_000,
            discount: Some(30),
        };
        assert_eq!(
            listing_url(LISTING_BASE_URL, &category, &params),
            "https://catalog.wb.ru/catalog/dresses_shard/catalog?cat=8126&appType=1&curr=rub&dest=-1257786&locale=ru&page=3&priceU=10000;100000000&sort=popular&spp=0&discount=30"
        );
    }

    #[test]
    fn listing_url_omits_absent_discount() {
        let category = CategoryRef {
            name: "Dresses".into(),
            shard: "s".into(),
            query: "q=1".into(),
        };
        let params = PageParams {
            page: 1,
            low_price: 1,
            top_price: 2,
            discount: None,
        };
        assert!(!listing_url(LISTING_BASE_URL, &category, &params).contains("discount"));
    }

    #[test]
    fn normalize_floors_minor_units_and_defaults_optionals() {
        let listing = json!({
            "data": {
                "products": [
                    {
                        "id": 42,
                        "name": "Coat",
                        "priceU": 123_99,
                        "salePriceU": 99_99,
                        "sale": 20,
                        "brand": "Acme",
                        "supplier": 7,
                        "supplierRating": 4.8,
                        "feedbacks": 55
                    },
                    { "id": 43 }
                ]
            }
        });
        let records = normalize_listing(&listing);
        assert_eq!(records.len(), 2);

        let coat = &records[0];
        assert_eq!(coat.price, 123);
        assert_eq!(coat.sale_price, 99);
        assert_eq!(coat.sale_fraction, Some(20.0));
        assert_eq!(coat.supplier_id, Some(7));
        assert_eq!(coat.feedback_count, Some(55));
        assert_eq!(
            coat.link,
            "https://www.wildberries.ru/catalog/42/detail.aspx?targetUrl=BP"
        );

        let bare = &records[1];
        assert_eq!(bare.name, "");
        assert_eq!(bare.price, 0);
        assert_eq!(bare.sale_price, 0);
        assert_eq!(bare.brand, None);
        assert_eq!(bare.rating, None);
    }

    #[test]
    fn normalize_skips_entries_without_an_id() {
        let listing = json!({
            "data": { "products": [ { "name": "no id" }, { "id": 1 } ] }
        });
        let records = normalize_listing(&listing);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 1);
    }

    #[test]
    fn normalize_tolerates_malformed_documents() {
        assert!(normalize_listing(&json!({})).is_empty());
        assert!(normalize_listing(&json!({ "data": {} })).is_empty());
        assert!(normalize_listing(&json!({ "data": { "products": "nope" } })).is_empty());
        assert!(normalize_listing(&json!(null)).is_empty());
    }
}
