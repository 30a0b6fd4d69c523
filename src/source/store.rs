//! Live legacy-store backend: paginated product reads plus the time-series
//! queries the gap filler needs. Read-only.

use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

use crate::error::MigrateError;
use crate::source::{SourceHistory, SourceProduct, SourceRead};
use crate::store::Db;

/// Internal marketplace excluded from every migration run.
const EXCLUDED_PLATFORM: &str = "rocketfy";

#[derive(Clone)]
pub struct LegacyStore {
    db: Db,
}

impl LegacyStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn count_products(&self) -> Result<u64, MigrateError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM products WHERE platform_name IS DISTINCT FROM $1",
        )
        .persistent(false)
        .bind(EXCLUDED_PLATFORM)
        .fetch_one(&self.db.pool)
        .await?;
        Ok(n as u64)
    }

    /// Page of products in `(created_at, id)` order, which is the canonical
    /// chunk-window ordering shared with the snapshot export.
    #[instrument(skip(self))]
    pub async fn read_products(
        &self,
        skip: u64,
        take: u64,
    ) -> Result<Vec<SourceProduct>, MigrateError> {
        let rows = sqlx::query(
            "SELECT id, external_id, name, description, platform_name, country_code,
                    sale_price, suggested_price, total_sold_units,
                    sold_units_last_7_days, sold_units_last_30_days,
                    total_billing, billing_last_7_days, billing_last_30_days,
                    stock, variations_amount, score, visible,
                    categories, provider, gallery, created_at, updated_at
             FROM products
             WHERE platform_name IS DISTINCT FROM $1
             ORDER BY created_at ASC, id ASC
             OFFSET $2 LIMIT $3",
        )
        .persistent(false)
        .bind(EXCLUDED_PLATFORM)
        .bind(skip as i64)
        .bind(take as i64)
        .fetch_all(&self.db.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(SourceProduct {
                source_id: r.try_get::<String, _>("id")?,
                external_id: r.try_get("external_id")?,
                name: r.try_get("name")?,
                description: r.try_get("description")?,
                platform_name: r.try_get("platform_name")?,
                country_code: r.try_get("country_code")?,
                sale_price: r.try_get("sale_price")?,
                suggested_price: r.try_get("suggested_price")?,
                total_sold_units: r.try_get("total_sold_units")?,
                sold_units_last_7_days: r.try_get("sold_units_last_7_days")?,
                sold_units_last_30_days: r.try_get("sold_units_last_30_days")?,
                total_billing: r.try_get("total_billing")?,
                billing_last_7_days: r.try_get("billing_last_7_days")?,
                billing_last_30_days: r.try_get("billing_last_30_days")?,
                stock: r.try_get("stock")?,
                variations_amount: r.try_get("variations_amount")?,
                score: r.try_get("score")?,
                visible: r.try_get("visible")?,
                categories: r.try_get("categories")?,
                provider: r.try_get("provider")?,
                gallery: r.try_get("gallery")?,
                created_at: r.try_get("created_at")?,
                updated_at: r.try_get("updated_at")?,
            });
        }
        Ok(out)
    }

    /// Distinct history dates present in the source for one product.
    pub async fn history_dates(
        &self,
        external_product_id: &str,
        platform_name: &str,
        country_code: &str,
    ) -> Result<Vec<String>, MigrateError> {
        let dates: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT date FROM product_histories
             WHERE external_product_id = $1 AND platform_name = $2 AND country_code = $3",
        )
        .persistent(false)
        .bind(external_product_id)
        .bind(platform_name)
        .bind(country_code)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(dates)
    }

    /// Full history rows for an explicit set of dates (the gap set).
    #[instrument(skip(self, dates), fields(dates = dates.len()))]
    pub async fn histories_for_dates(
        &self,
        external_product_id: &str,
        platform_name: &str,
        country_code: &str,
        dates: &[String],
    ) -> Result<Vec<SourceHistory>, MigrateError> {
        if dates.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT external_product_id, platform_name, country_code, date,
                    stock, sale_price, sold_units, sales_amount,
                    stock_adjustment, stock_adjustment_reason
             FROM product_histories
             WHERE external_product_id = $1 AND platform_name = $2 AND country_code = $3
               AND date = ANY($4)",
        )
        .persistent(false)
        .bind(external_product_id)
        .bind(platform_name)
        .bind(country_code)
        .bind(dates)
        .fetch_all(&self.db.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(SourceHistory {
                external_product_id: r.try_get("external_product_id")?,
                platform_name: r.try_get("platform_name")?,
                country_code: r.try_get("country_code")?,
                date: r.try_get("date")?,
                stock: r.try_get("stock")?,
                sale_price: r.try_get("sale_price")?,
                sold_units: r.try_get("sold_units")?,
                sales_amount: r.try_get("sales_amount")?,
                stock_adjustment: r.try_get::<Option<bool>, _>("stock_adjustment")?.unwrap_or(false),
                stock_adjustment_reason: r.try_get("stock_adjustment_reason")?,
            });
        }
        Ok(out)
    }
}

/// `SourceRead` adapter over the live store.
pub struct StoreReader {
    store: LegacyStore,
}

impl StoreReader {
    pub fn new(store: LegacyStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SourceRead for StoreReader {
    async fn count(&self) -> Result<u64, MigrateError> {
        self.store.count_products().await
    }

    async fn read(&self, skip: u64, take: u64) -> Result<Vec<SourceProduct>, MigrateError> {
        self.store.read_products(skip, take).await
    }
}
