//! Gallery reconciliation: parse the legacy gallery blob, complete relative
//! URLs against the per-country CDN host, classify image/video, then update
//! existing target rows in order and append whatever is left over.
//!
//! The `extracted` flag on a multimedia row is flipped by a separate
//! extraction service; this system only ever writes `false`.

use chrono::Utc;
use serde::Deserialize;
use sqlx::{QueryBuilder, Row};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::MigrateError;
use crate::source::{decode_maybe_stringified, SourceProduct};
use crate::store::Db;

/// Per-country CDN hosts for completing relative gallery paths. Argentina
/// and Guatemala run dedicated distributions; everyone else shares the
/// default one.
const CDN_HOST_DEFAULT: &str = "d39ru7awumhhs2.cloudfront.net";
const CDN_HOST_AR: &str = "d2w6ep9cbmjrje.cloudfront.net";
const CDN_HOST_GT: &str = "d1q6v3w4sghrk2.cloudfront.net";

const VIDEO_SUFFIXES: &[&str] = &[".mp4", ".mov", ".avi", ".webm"];
const IMAGE_SUFFIXES: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg"];

/// Append batch size for new rows.
const INSERT_BATCH: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct GalleryEntry {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "ownImage")]
    pub own_image: Option<String>,
    #[serde(default, alias = "sourceUrl")]
    pub source_url: Option<String>,
    #[serde(default, alias = "originalUrl")]
    pub original_url: Option<String>,
    #[serde(default, rename = "type")]
    pub media_type: Option<String>,
}

impl GalleryEntry {
    /// Preferred usable URL: `url`, then `own_image`, `source_url`,
    /// `original_url`.
    pub fn usable_url(&self) -> Option<&str> {
        [
            self.url.as_deref(),
            self.own_image.as_deref(),
            self.source_url.as_deref(),
            self.original_url.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|u| !u.is_empty())
    }
}

/// Lenient gallery decode; a malformed blob reads as an empty gallery.
pub fn parse_gallery(raw: Option<&serde_json::Value>) -> Vec<GalleryEntry> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match decode_maybe_stringified::<Vec<GalleryEntry>>(raw) {
        Some(entries) => entries,
        None => {
            warn!("unparseable gallery blob; treating as empty");
            Vec::new()
        }
    }
}

pub fn cdn_host(country_code: &str) -> &'static str {
    match country_code.trim().to_ascii_uppercase().as_str() {
        "AR" => CDN_HOST_AR,
        "GT" => CDN_HOST_GT,
        _ => CDN_HOST_DEFAULT,
    }
}

/// Absolute URLs pass through untouched; relative paths are completed with
/// the country's CDN host. Stable under re-application.
pub fn normalize_url(raw: &str, country_code: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return trimmed.to_string();
    }
    format!(
        "https://{}/{}",
        cdn_host(country_code),
        trimmed.trim_start_matches('/')
    )
}

/// Suffix-based media classification; the entry's explicit type only decides
/// when the suffix is inconclusive.
pub fn classify_media(url: &str, explicit: Option<&str>) -> &'static str {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .to_ascii_lowercase();
    if VIDEO_SUFFIXES.iter().any(|s| path.ends_with(s)) {
        return "video";
    }
    if IMAGE_SUFFIXES.iter().any(|s| path.ends_with(s)) {
        return "image";
    }
    match explicit.map(str::trim).map(str::to_ascii_lowercase) {
        Some(t) if t == "video" => "video",
        _ => "image",
    }
}

#[derive(Debug, Clone)]
struct NormalizedEntry {
    url: String,
    media_type: &'static str,
}

/// Kept gallery entries with completed URLs, in gallery order.
fn normalized_entries(product: &SourceProduct) -> Vec<NormalizedEntry> {
    let country = product.country_code.as_deref().unwrap_or("");
    parse_gallery(product.gallery.as_ref())
        .iter()
        .filter_map(|entry| {
            let raw = entry.usable_url()?;
            let url = normalize_url(raw, country);
            let media_type = classify_media(&url, entry.media_type.as_deref());
            Some(NormalizedEntry { url, media_type })
        })
        .collect()
}

pub struct MultimediaReconciler {
    target: Db,
}

impl MultimediaReconciler {
    pub fn new(target: Db) -> Self {
        Self { target }
    }

    /// Returns updated + inserted row count.
    #[instrument(skip(self, product), fields(source_id = %product.source_id))]
    pub async fn reconcile(
        &self,
        product: &SourceProduct,
        product_id: &str,
    ) -> Result<u64, MigrateError> {
        let valid = normalized_entries(product);
        if valid.is_empty() {
            return Ok(0);
        }

        let existing: Vec<String> = sqlx::query(
            "SELECT id FROM multimedia WHERE product_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .persistent(false)
        .bind(product_id)
        .fetch_all(&self.target.pool)
        .await?
        .iter()
        .map(|r| r.get::<String, _>("id"))
        .collect();

        let now = Utc::now();
        let mut touched = 0u64;

        // Pairwise refresh of rows we already have, in stable order.
        let pairs = existing.len().min(valid.len());
        for (row_id, entry) in existing.iter().zip(valid.iter()).take(pairs) {
            sqlx::query("UPDATE multimedia SET original_url = $1, updated_at = $2 WHERE id = $3")
                .persistent(false)
                .bind(&entry.url)
                .bind(now)
                .bind(row_id)
                .execute(&self.target.pool)
                .await?;
            touched += 1;
        }

        // Anything beyond the existing rows is appended.
        let remainder = &valid[pairs..];
        if !remainder.is_empty() {
            debug!(
                product_id,
                updates = pairs,
                appends = remainder.len(),
                "appending new multimedia rows"
            );
            touched += self.insert_entries(product_id, remainder).await?;
        }
        Ok(touched)
    }

    async fn insert_entries(
        &self,
        product_id: &str,
        entries: &[NormalizedEntry],
    ) -> Result<u64, MigrateError> {
        let mut inserted = 0u64;
        for batch in entries.chunks(INSERT_BATCH) {
            match self.insert_batch(product_id, batch).await {
                Ok(()) => inserted += batch.len() as u64,
                Err(e) => {
                    warn!(product_id, error = %e, "multimedia batch insert failed; retrying row-by-row");
                    for entry in batch {
                        match self.insert_one(product_id, entry).await {
                            Ok(()) => inserted += 1,
                            Err(e) => {
                                warn!(product_id, url = %entry.url, error = %e, "multimedia row insert failed; skipped");
                            }
                        }
                    }
                }
            }
        }
        Ok(inserted)
    }

    async fn insert_batch(
        &self,
        product_id: &str,
        entries: &[NormalizedEntry],
    ) -> Result<(), MigrateError> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO multimedia (id, product_id, url, original_url, type, extracted, created_at, updated_at) ",
        );
        qb.push_values(entries, |mut b, e| {
            b.push_bind(Uuid::new_v4().to_string())
                .push_bind(product_id)
                .push_bind(&e.url)
                .push_bind(&e.url)
                .push_bind(e.media_type)
                .push_bind(false)
                .push_bind(now)
                .push_bind(now);
        });
        qb.build().persistent(false).execute(&self.target.pool).await?;
        Ok(())
    }

    async fn insert_one(
        &self,
        product_id: &str,
        entry: &NormalizedEntry,
    ) -> Result<(), MigrateError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO multimedia (id, product_id, url, original_url, type, extracted, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, false, $6, $6)",
        )
        .persistent(false)
        .bind(Uuid::new_v4().to_string())
        .bind(product_id)
        .bind(&entry.url)
        .bind(&entry.url)
        .bind(entry.media_type)
        .bind(now)
        .execute(&self.target.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absolute_urls_pass_through() {
        assert_eq!(
            normalize_url("https://cdn.x/a.png", "CO"),
            "https://cdn.x/a.png"
        );
        assert_eq!(
            normalize_url("http://cdn.x/a.png", "AR"),
            "http://cdn.x/a.png"
        );
    }

    #[test]
    fn relative_urls_get_the_country_host() {
        assert_eq!(
            normalize_url("products/b.jpg", "CO"),
            format!("https://{CDN_HOST_DEFAULT}/products/b.jpg")
        );
        assert_eq!(
            normalize_url("/products/c.mp4", "AR"),
            format!("https://{CDN_HOST_AR}/products/c.mp4")
        );
        assert_eq!(
            normalize_url("x.png", "GT"),
            format!("https://{CDN_HOST_GT}/x.png")
        );
    }

    #[test]
    fn normalization_is_stable() {
        for (raw, country) in [
            ("products/b.jpg", "CO"),
            ("/products/c.mp4", "AR"),
            ("https://cdn.x/a.png", "GT"),
        ] {
            let once = normalize_url(raw, country);
            assert_eq!(normalize_url(&once, country), once);
        }
    }

    #[test]
    fn classification_by_suffix_then_explicit_type() {
        assert_eq!(classify_media("https://c/x.mp4", None), "video");
        assert_eq!(classify_media("https://c/x.MOV", None), "video");
        assert_eq!(classify_media("https://c/x.webp", Some("video")), "image");
        assert_eq!(classify_media("https://c/x.png?w=300", None), "image");
        assert_eq!(classify_media("https://c/stream", Some("video")), "video");
        assert_eq!(classify_media("https://c/stream", Some("VIDEO")), "video");
        assert_eq!(classify_media("https://c/stream", None), "image");
        assert_eq!(classify_media("https://c/stream", Some("gif")), "image");
    }

    #[test]
    fn gallery_parsing_is_lenient() {
        assert!(parse_gallery(None).is_empty());
        assert!(parse_gallery(Some(&json!("{broken"))).is_empty());
        assert!(parse_gallery(Some(&json!({"not": "an array"}))).is_empty());

        let native = json!([{"url": "a.jpg"}, {"ownImage": "b.jpg"}]);
        assert_eq!(parse_gallery(Some(&native)).len(), 2);

        let stringified = json!("[{\"url\": \"a.jpg\"}]");
        assert_eq!(parse_gallery(Some(&stringified)).len(), 1);
    }

    #[test]
    fn usable_url_preference_order() {
        let entry: GalleryEntry = serde_json::from_value(json!({
            "url": "  ",
            "ownImage": "own.jpg",
            "sourceUrl": "source.jpg"
        }))
        .unwrap();
        assert_eq!(entry.usable_url(), Some("own.jpg"));

        let entry: GalleryEntry =
            serde_json::from_value(json!({"originalUrl": "orig.jpg"})).unwrap();
        assert_eq!(entry.usable_url(), Some("orig.jpg"));

        let entry: GalleryEntry = serde_json::from_value(json!({})).unwrap();
        assert_eq!(entry.usable_url(), None);
    }

    #[test]
    fn entries_without_urls_are_dropped() {
        let product: SourceProduct = serde_json::from_value(json!({
            "source_id": "P1",
            "country_code": "AR",
            "gallery": [
                {"url": "products/a.jpg"},
                {"type": "image"},
                {"url": "/products/c.mp4"}
            ]
        }))
        .unwrap();
        let entries = normalized_entries(&product);
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].url,
            format!("https://{CDN_HOST_AR}/products/a.jpg")
        );
        assert_eq!(entries[0].media_type, "image");
        assert_eq!(entries[1].media_type, "video");
    }
}
