//! Uniform view over the legacy catalog: either live queries against the
//! legacy store or a pre-exported JSON snapshot, selected by snapshot-file
//! presence. Both backends yield records in a deterministic order so
//! `[start_offset, end_offset)` windows line up across workers.

pub mod snapshot;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::MigrateError;
use crate::util::env::snapshot_path;

pub use snapshot::SnapshotReader;
pub use store::{LegacyStore, StoreReader};

/// One legacy product, as exported or as read from the legacy store.
/// Snapshot files use the legacy snake_case shape; aliases accept the
/// camelCase spelling some older exports carry.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceProduct {
    #[serde(alias = "sourceId", alias = "_id")]
    pub source_id: String,
    #[serde(default, alias = "externalId")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "platformName")]
    pub platform_name: Option<String>,
    #[serde(default, alias = "countryCode")]
    pub country_code: Option<String>,
    #[serde(default, alias = "salePrice")]
    pub sale_price: Option<f64>,
    #[serde(default, alias = "suggestedPrice")]
    pub suggested_price: Option<f64>,
    #[serde(default, alias = "totalSoldUnits")]
    pub total_sold_units: Option<i64>,
    #[serde(default, alias = "soldUnitsLast7Days")]
    pub sold_units_last_7_days: Option<i64>,
    #[serde(default, alias = "soldUnitsLast30Days")]
    pub sold_units_last_30_days: Option<i64>,
    #[serde(default, alias = "totalBilling")]
    pub total_billing: Option<f64>,
    #[serde(default, alias = "billingLast7Days")]
    pub billing_last_7_days: Option<f64>,
    #[serde(default, alias = "billingLast30Days")]
    pub billing_last_30_days: Option<f64>,
    #[serde(default)]
    pub stock: Option<i64>,
    #[serde(default, alias = "variationsAmount")]
    pub variations_amount: Option<i64>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub visible: Option<bool>,
    /// Ordered list of `{name, external_id?}`; kept raw because legacy rows
    /// occasionally hold malformed blobs.
    #[serde(default)]
    pub categories: Option<Value>,
    /// Embedded `{name?, external_id?, verified?}` blob; may be absent,
    /// unparseable, or a JSON-encoded string.
    #[serde(default)]
    pub provider: Option<Value>,
    /// Ordered gallery; string-JSON or native array.
    #[serde(default)]
    pub gallery: Option<Value>,
    #[serde(default, alias = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "updatedAt")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceCategory {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "externalId")]
    pub external_id: Option<String>,
}

/// One daily time-series row from the legacy store.
#[derive(Debug, Clone)]
pub struct SourceHistory {
    pub external_product_id: String,
    pub platform_name: String,
    pub country_code: String,
    /// ISO `yyyy-mm-dd`, stored as text in the legacy schema.
    pub date: String,
    pub stock: Option<i64>,
    pub sale_price: Option<f64>,
    pub sold_units: Option<i64>,
    pub sales_amount: Option<f64>,
    pub stock_adjustment: bool,
    pub stock_adjustment_reason: Option<String>,
}

impl SourceProduct {
    /// Lenient category decode; malformed blobs read as no categories.
    pub fn category_list(&self) -> Vec<SourceCategory> {
        let Some(raw) = &self.categories else {
            return Vec::new();
        };
        match decode_maybe_stringified::<Vec<SourceCategory>>(raw) {
            Some(cats) => cats,
            None => {
                warn!(source_id = %self.source_id, "unparseable categories blob; treating as empty");
                Vec::new()
            }
        }
    }

    /// First usable category name, if any.
    pub fn primary_category_name(&self) -> Option<String> {
        self.category_list()
            .into_iter()
            .find_map(|c| c.name.filter(|n| !n.trim().is_empty()))
    }
}

/// Decode a JSON value that may itself be a JSON-encoded string (a common
/// artifact of the legacy ORM double-serializing embedded documents).
pub(crate) fn decode_maybe_stringified<T: serde::de::DeserializeOwned>(raw: &Value) -> Option<T> {
    match raw {
        Value::String(s) => serde_json::from_str(s).ok(),
        other => serde_json::from_value(other.clone()).ok(),
    }
}

/// Read contract shared by both backends.
#[async_trait]
pub trait SourceRead: Send + Sync {
    async fn count(&self) -> Result<u64, MigrateError>;
    /// Records in `[skip, skip+take)` of the deterministic source order.
    async fn read(&self, skip: u64, take: u64) -> Result<Vec<SourceProduct>, MigrateError>;
}

/// Pick the backend: the snapshot file wins when present, otherwise live
/// queries against the legacy store.
pub async fn select_reader(legacy: &LegacyStore) -> Result<Arc<dyn SourceRead>, MigrateError> {
    let path = snapshot_path();
    if Path::new(&path).exists() {
        info!(path = %path, "snapshot file present; reading products from snapshot");
        let reader = SnapshotReader::open(&path).await?;
        Ok(Arc::new(reader))
    } else {
        info!("no snapshot file; reading products from the legacy store");
        Ok(Arc::new(StoreReader::new(legacy.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_snake_case_record() {
        let p: SourceProduct = serde_json::from_value(json!({
            "source_id": "P1",
            "external_id": "X1",
            "name": "Widget",
            "platform_name": "dropi",
            "country_code": "CO",
            "sale_price": 19900.0,
            "total_sold_units": 12,
            "visible": true,
            "categories": [{"name": "tecnologia"}],
            "created_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(p.source_id, "P1");
        assert_eq!(p.external_id.as_deref(), Some("X1"));
        assert_eq!(p.primary_category_name().as_deref(), Some("tecnologia"));
    }

    #[test]
    fn accepts_camel_case_aliases() {
        let p: SourceProduct = serde_json::from_value(json!({
            "sourceId": "P2",
            "externalId": "X2",
            "platformName": "dropi",
            "countryCode": "CO",
            "soldUnitsLast7Days": 3
        }))
        .unwrap();
        assert_eq!(p.source_id, "P2");
        assert_eq!(p.sold_units_last_7_days, Some(3));
    }

    #[test]
    fn stringified_categories_decode() {
        let p: SourceProduct = serde_json::from_value(json!({
            "source_id": "P3",
            "categories": "[{\"name\": \"hogar\"}]"
        }))
        .unwrap();
        assert_eq!(p.primary_category_name().as_deref(), Some("hogar"));
    }

    #[test]
    fn malformed_categories_read_as_empty() {
        let p: SourceProduct = serde_json::from_value(json!({
            "source_id": "P4",
            "categories": "{broken"
        }))
        .unwrap();
        assert!(p.category_list().is_empty());
        assert!(p.primary_category_name().is_none());
    }
}
