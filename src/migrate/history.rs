//! Time-series gap fill: synthesize target history rows for dates present in
//! the source but absent in the target, without touching dates already there.
//!
//! The legacy schema has no windowed aggregates, so synthesized rows are
//! zero-filled except the most recent one, which carries the product's
//! current window aggregates ("most recent summary available" semantics).

use std::collections::HashSet;

use chrono::{NaiveDate, Utc};
use sqlx::QueryBuilder;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::MigrateError;
use crate::source::{LegacyStore, SourceHistory, SourceProduct};
use crate::store::Db;

/// Upper bound on the gap set per invocation; keeps the IN-list bounded. A
/// product with more missing dates converges across successive runs.
pub const MAX_GAP_DATES_PER_RUN: usize = 1000;

/// Sub-batch size for bulk inserts.
const INSERT_BATCH: usize = 50;

/// Dates in `source` but not in `existing`, ascending, capped.
pub fn missing_dates(source: &[String], existing: &[String], cap: usize) -> Vec<String> {
    let have: HashSet<&str> = existing.iter().map(String::as_str).collect();
    let mut gap: Vec<String> = source
        .iter()
        .filter(|d| !have.contains(d.as_str()))
        .cloned()
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    gap.sort();
    gap.truncate(cap);
    gap
}

#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub id: String,
    pub date: NaiveDate,
    pub product_id: String,
    pub stock: i64,
    pub sale_price: f64,
    pub sold_units: i64,
    pub sales_amount: f64,
    pub sold_units_last_7_days: i64,
    pub sold_units_last_30_days: i64,
    pub total_sold_units: i64,
    pub billing_last_7_days: f64,
    pub billing_last_30_days: f64,
    pub total_billing: f64,
    pub suggested_price: f64,
}

/// Map fetched source rows (any order) to target rows, date-ascending, with
/// last-row aggregate enrichment from the product's current counters.
/// Rows whose date fails to parse are dropped with a warning.
pub fn build_rows(
    product: &SourceProduct,
    product_id: &str,
    mut source_rows: Vec<SourceHistory>,
) -> Vec<HistoryRow> {
    source_rows.sort_by(|a, b| a.date.cmp(&b.date));
    let last_index = source_rows.len().saturating_sub(1);

    let mut out = Vec::with_capacity(source_rows.len());
    for (i, row) in source_rows.into_iter().enumerate() {
        let date = match NaiveDate::parse_from_str(&row.date, "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => {
                warn!(date = %row.date, product_id, "unparseable history date; row dropped");
                continue;
            }
        };
        let newest = i == last_index;
        out.push(HistoryRow {
            id: Uuid::new_v4().to_string(),
            date,
            product_id: product_id.to_string(),
            stock: row.stock.unwrap_or(0),
            sale_price: row.sale_price.unwrap_or(0.0),
            sold_units: row.sold_units.unwrap_or(0),
            sales_amount: row.sales_amount.unwrap_or(0.0),
            sold_units_last_7_days: if newest {
                product.sold_units_last_7_days.unwrap_or(0)
            } else {
                0
            },
            sold_units_last_30_days: if newest {
                product.sold_units_last_30_days.unwrap_or(0)
            } else {
                0
            },
            total_sold_units: if newest {
                product.total_sold_units.unwrap_or(0)
            } else {
                0
            },
            billing_last_7_days: if newest {
                product.billing_last_7_days.unwrap_or(0.0)
            } else {
                0.0
            },
            billing_last_30_days: if newest {
                product.billing_last_30_days.unwrap_or(0.0)
            } else {
                0.0
            },
            total_billing: if newest {
                product.total_billing.unwrap_or(0.0)
            } else {
                0.0
            },
            suggested_price: if newest {
                product.suggested_price.unwrap_or(0.0)
            } else {
                0.0
            },
        });
    }
    out
}

pub struct HistoryGapFiller {
    target: Db,
    legacy: LegacyStore,
}

impl HistoryGapFiller {
    pub fn new(target: Db, legacy: LegacyStore) -> Self {
        Self { target, legacy }
    }

    /// Fill the product's history gaps; returns rows successfully inserted.
    #[instrument(skip(self, product), fields(source_id = %product.source_id))]
    pub async fn fill(
        &self,
        product: &SourceProduct,
        product_id: &str,
    ) -> Result<u64, MigrateError> {
        let Some(external_id) = product
            .external_id
            .as_deref()
            .filter(|v| !v.trim().is_empty())
        else {
            return Ok(0);
        };
        let platform_name = product.platform_name.as_deref().unwrap_or("");
        let country_code = product.country_code.as_deref().unwrap_or("");

        let existing: Vec<NaiveDate> =
            sqlx::query_scalar("SELECT date FROM histories WHERE product_id = $1")
                .persistent(false)
                .bind(product_id)
                .fetch_all(&self.target.pool)
                .await?;
        let existing: Vec<String> = existing
            .into_iter()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect();

        let source_dates = self
            .legacy
            .history_dates(external_id, platform_name, country_code)
            .await?;

        let gap = missing_dates(&source_dates, &existing, MAX_GAP_DATES_PER_RUN);
        if gap.is_empty() {
            return Ok(0);
        }
        debug!(
            product_id,
            missing = gap.len(),
            source_total = source_dates.len(),
            "history gap detected"
        );

        let source_rows = self
            .legacy
            .histories_for_dates(external_id, platform_name, country_code, &gap)
            .await?;
        let rows = build_rows(product, product_id, source_rows);

        let mut inserted = 0u64;
        for batch in rows.chunks(INSERT_BATCH) {
            match self.insert_batch(batch).await {
                Ok(()) => inserted += batch.len() as u64,
                Err(e) => {
                    // Isolate the bad row(s); everything else still lands.
                    warn!(product_id, error = %e, "history batch insert failed; retrying row-by-row");
                    for row in batch {
                        match self.insert_one(row).await {
                            Ok(()) => inserted += 1,
                            Err(e) => {
                                warn!(product_id, date = %row.date, error = %e, "history row insert failed; skipped");
                            }
                        }
                    }
                }
            }
        }
        Ok(inserted)
    }

    async fn insert_batch(&self, rows: &[HistoryRow]) -> Result<(), MigrateError> {
        if rows.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO histories (
                id, date, product_id, stock, sale_price, sold_units, sales_amount,
                sold_units_last_7_days, sold_units_last_30_days, total_sold_units,
                billing_last_7_days, billing_last_30_days, total_billing,
                suggested_price, created_at, updated_at) ",
        );
        qb.push_values(rows, |mut b, r| {
            b.push_bind(&r.id)
                .push_bind(r.date)
                .push_bind(&r.product_id)
                .push_bind(r.stock)
                .push_bind(r.sale_price)
                .push_bind(r.sold_units)
                .push_bind(r.sales_amount)
                .push_bind(r.sold_units_last_7_days)
                .push_bind(r.sold_units_last_30_days)
                .push_bind(r.total_sold_units)
                .push_bind(r.billing_last_7_days)
                .push_bind(r.billing_last_30_days)
                .push_bind(r.total_billing)
                .push_bind(r.suggested_price)
                .push_bind(now)
                .push_bind(now);
        });
        qb.build().persistent(false).execute(&self.target.pool).await?;
        Ok(())
    }

    async fn insert_one(&self, row: &HistoryRow) -> Result<(), MigrateError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO histories (
                id, date, product_id, stock, sale_price, sold_units, sales_amount,
                sold_units_last_7_days, sold_units_last_30_days, total_sold_units,
                billing_last_7_days, billing_last_30_days, total_billing,
                suggested_price, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15)",
        )
        .persistent(false)
        .bind(&row.id)
        .bind(row.date)
        .bind(&row.product_id)
        .bind(row.stock)
        .bind(row.sale_price)
        .bind(row.sold_units)
        .bind(row.sales_amount)
        .bind(row.sold_units_last_7_days)
        .bind(row.sold_units_last_30_days)
        .bind(row.total_sold_units)
        .bind(row.billing_last_7_days)
        .bind(row.billing_last_30_days)
        .bind(row.total_billing)
        .bind(row.suggested_price)
        .bind(now)
        .execute(&self.target.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hist(date: &str, sold: i64) -> SourceHistory {
        SourceHistory {
            external_product_id: "X1".into(),
            platform_name: "dropi".into(),
            country_code: "CO".into(),
            date: date.into(),
            stock: Some(5),
            sale_price: Some(19900.0),
            sold_units: Some(sold),
            sales_amount: Some(sold as f64 * 19900.0),
            stock_adjustment: false,
            stock_adjustment_reason: None,
        }
    }

    fn product() -> SourceProduct {
        serde_json::from_value(serde_json::json!({
            "source_id": "P1",
            "external_id": "X1",
            "sold_units_last_7_days": 7,
            "sold_units_last_30_days": 30,
            "total_sold_units": 100,
            "billing_last_7_days": 70.0,
            "billing_last_30_days": 300.0,
            "total_billing": 1000.0,
            "suggested_price": 25000.0
        }))
        .unwrap()
    }

    #[test]
    fn missing_dates_is_a_sorted_capped_difference() {
        let source = vec![
            "2024-01-03".to_string(),
            "2024-01-01".to_string(),
            "2024-01-02".to_string(),
            "2024-01-02".to_string(),
        ];
        let existing = vec!["2024-01-01".to_string()];
        assert_eq!(
            missing_dates(&source, &existing, 1000),
            vec!["2024-01-02".to_string(), "2024-01-03".to_string()]
        );
        assert_eq!(
            missing_dates(&source, &existing, 1),
            vec!["2024-01-02".to_string()]
        );
        assert!(missing_dates(&source, &source, 1000).is_empty());
    }

    #[test]
    fn only_the_newest_row_carries_current_aggregates() {
        let rows = build_rows(
            &product(),
            "P1",
            vec![hist("2024-01-02", 2), hist("2024-01-01", 1), hist("2024-01-03", 3)],
        );
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(rows[2].date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());

        for earlier in &rows[..2] {
            assert_eq!(earlier.sold_units_last_7_days, 0);
            assert_eq!(earlier.total_sold_units, 0);
            assert_eq!(earlier.total_billing, 0.0);
            assert_eq!(earlier.suggested_price, 0.0);
        }
        let newest = &rows[2];
        assert_eq!(newest.sold_units_last_7_days, 7);
        assert_eq!(newest.sold_units_last_30_days, 30);
        assert_eq!(newest.total_sold_units, 100);
        assert_eq!(newest.total_billing, 1000.0);
        assert_eq!(newest.suggested_price, 25000.0);
        // Per-day figures still come from the source row itself.
        assert_eq!(newest.sold_units, 3);
    }

    #[test]
    fn unparseable_dates_are_dropped() {
        let rows = build_rows(
            &product(),
            "P1",
            vec![hist("2024-01-01", 1), hist("not-a-date", 2)],
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn single_row_gets_the_enrichment() {
        let rows = build_rows(&product(), "P1", vec![hist("2024-02-01", 4)]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_sold_units, 100);
    }
}
