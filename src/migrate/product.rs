//! Product upsert keyed by stable identity: the target row id IS the legacy
//! source id, which is what makes re-runs idempotent at the row level.

use std::sync::Arc;

use chrono::Utc;
use sqlx::Row;
use tracing::{debug, instrument};

use crate::error::MigrateError;
use crate::resolve::{Platform, ReferenceResolver};
use crate::source::SourceProduct;
use crate::store::Db;

/// Placeholder for legacy rows that lost their name.
const UNNAMED_PRODUCT: &str = "Sin nombre";

pub fn display_name(name: Option<&str>) -> String {
    match name {
        Some(n) if !n.trim().is_empty() => n.to_string(),
        _ => UNNAMED_PRODUCT.to_string(),
    }
}

pub fn status_of(visible: Option<bool>) -> &'static str {
    if visible.unwrap_or(false) {
        "ACTIVE"
    } else {
        "INACTIVE"
    }
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub product_id: String,
    pub created: bool,
}

pub struct ProductUpserter {
    target: Db,
    resolver: Arc<ReferenceResolver>,
}

impl ProductUpserter {
    pub fn new(target: Db, resolver: Arc<ReferenceResolver>) -> Self {
        Self { target, resolver }
    }

    /// Insert-or-update the target product for this source record.
    ///
    /// On update, `created_at`, `external_id`, `platform_country_id` and the
    /// id itself are immutable; everything else is last-writer-wins with a
    /// fresh `updated_at`.
    #[instrument(skip(self, product, provider_id), fields(source_id = %product.source_id))]
    pub async fn upsert(
        &self,
        product: &SourceProduct,
        provider_id: &str,
    ) -> Result<UpsertOutcome, MigrateError> {
        let platform_name = product.platform_name.as_deref().unwrap_or("");
        let platform = Platform::resolve(platform_name);
        let platform_country_id = self
            .resolver
            .resolve_platform_country(platform_name, product.country_code.as_deref().unwrap_or(""))
            .await?;
        // Some legacy exports carry the base-category id in the category's
        // external_id; use it as a hint and fall back to name resolution.
        let category_hint = product
            .category_list()
            .first()
            .and_then(|c| c.external_id.as_deref())
            .and_then(|v| v.trim().parse::<i64>().ok());
        let base_category_id = self
            .resolver
            .resolve_valid_base_category_id(
                category_hint,
                product.primary_category_name().as_deref(),
                Some(platform),
            )
            .await?;

        let name = display_name(product.name.as_deref());
        let status = status_of(product.visible);
        let now = Utc::now();

        let existing: Option<String> = sqlx::query("SELECT id FROM products WHERE id = $1")
            .persistent(false)
            .bind(&product.source_id)
            .fetch_optional(&self.target.pool)
            .await?
            .map(|row| row.get("id"));

        let Some(product_id) = existing else {
            let created_at = product.created_at.unwrap_or(now);
            sqlx::query(
                "INSERT INTO products (
                    id, external_id, name, description,
                    sale_price, suggested_price,
                    total_sold_units, sold_units_last_7_days, sold_units_last_30_days,
                    total_billing, billing_last_7_days, billing_last_30_days,
                    stock, variations_amount, score, status,
                    platform_country_id, provider_id, base_category_id,
                    created_at, updated_at
                 ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21
                 )",
            )
            .persistent(false)
            .bind(&product.source_id)
            .bind(&product.external_id)
            .bind(&name)
            .bind(&product.description)
            .bind(product.sale_price)
            .bind(product.suggested_price)
            .bind(product.total_sold_units.unwrap_or(0))
            .bind(product.sold_units_last_7_days.unwrap_or(0))
            .bind(product.sold_units_last_30_days.unwrap_or(0))
            .bind(product.total_billing.unwrap_or(0.0))
            .bind(product.billing_last_7_days.unwrap_or(0.0))
            .bind(product.billing_last_30_days.unwrap_or(0.0))
            .bind(product.stock.unwrap_or(0))
            .bind(product.variations_amount.unwrap_or(0))
            .bind(product.score)
            .bind(status)
            .bind(platform_country_id)
            .bind(provider_id)
            .bind(base_category_id)
            .bind(created_at)
            .bind(now)
            .execute(&self.target.pool)
            .await?;
            debug!(product_id = %product.source_id, "product inserted");
            return Ok(UpsertOutcome {
                product_id: product.source_id.clone(),
                created: true,
            });
        };

        sqlx::query(
            "UPDATE products SET
                name = $1, description = $2,
                sale_price = $3, suggested_price = $4,
                total_sold_units = $5, sold_units_last_7_days = $6, sold_units_last_30_days = $7,
                total_billing = $8, billing_last_7_days = $9, billing_last_30_days = $10,
                stock = $11, variations_amount = $12, score = $13, status = $14,
                provider_id = $15, base_category_id = $16, updated_at = $17
             WHERE id = $18",
        )
        .persistent(false)
        .bind(&name)
        .bind(&product.description)
        .bind(product.sale_price)
        .bind(product.suggested_price)
        .bind(product.total_sold_units.unwrap_or(0))
        .bind(product.sold_units_last_7_days.unwrap_or(0))
        .bind(product.sold_units_last_30_days.unwrap_or(0))
        .bind(product.total_billing.unwrap_or(0.0))
        .bind(product.billing_last_7_days.unwrap_or(0.0))
        .bind(product.billing_last_30_days.unwrap_or(0.0))
        .bind(product.stock.unwrap_or(0))
        .bind(product.variations_amount.unwrap_or(0))
        .bind(product.score)
        .bind(status)
        .bind(provider_id)
        .bind(base_category_id)
        .bind(now)
        .bind(&product_id)
        .execute(&self.target.pool)
        .await?;
        debug!(product_id = %product_id, "product updated");
        Ok(UpsertOutcome {
            product_id,
            created: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_names_default_to_placeholder() {
        assert_eq!(display_name(None), "Sin nombre");
        assert_eq!(display_name(Some("")), "Sin nombre");
        assert_eq!(display_name(Some("   ")), "Sin nombre");
        assert_eq!(display_name(Some("Licuadora 700W")), "Licuadora 700W");
    }

    #[test]
    fn visibility_maps_to_status() {
        assert_eq!(status_of(Some(true)), "ACTIVE");
        assert_eq!(status_of(Some(false)), "INACTIVE");
        assert_eq!(status_of(None), "INACTIVE");
    }
}
