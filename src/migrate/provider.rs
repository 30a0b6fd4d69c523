//! Provider reconciliation: every product must point at a real provider row,
//! however broken the embedded provider blob is. Legacy data carries missing,
//! malformed and colliding blobs, so the reconciliation runs as a fixed
//! ladder: lookup by name+external -> collision check -> safe or full update;
//! lookup by natural key -> adopt name; create; or synthesize a fallback row
//! named "null". Synthetic rows are cleaned up by an external process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Deserialize;
use sqlx::Row;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::MigrateError;
use crate::resolve::ReferenceResolver;
use crate::source::{decode_maybe_stringified, SourceProduct};
use crate::store::Db;

/// Name recorded on providers whose blob carried no usable name. Kept as the
/// literal string the downstream cleanup job filters on.
const FALLBACK_PROVIDER_NAME: &str = "null";

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderBlob {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "externalId")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub verified: Option<bool>,
}

/// Usable identity extracted from a provider blob, or None when the blob is
/// absent, unparseable, or lacks an external id.
pub fn provider_identity(raw: Option<&serde_json::Value>) -> Option<(String, String, bool)> {
    let blob = decode_maybe_stringified::<ProviderBlob>(raw?)?;
    let external_id = blob.external_id.filter(|v| !v.trim().is_empty())?;
    let name = blob
        .name
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_PROVIDER_NAME.to_string());
    Some((name, external_id, blob.verified.unwrap_or(false)))
}

#[derive(Debug, Clone)]
pub struct ProviderOutcome {
    pub provider_id: String,
    pub created: bool,
}

pub struct ProviderReconciler {
    target: Db,
    resolver: Arc<ReferenceResolver>,
    /// Read-through `(external_id, platform_country_id) -> provider id`;
    /// entries are only added once this worker owns that natural key.
    cache: Mutex<HashMap<(String, i64), String>>,
}

impl ProviderReconciler {
    pub fn new(target: Db, resolver: Arc<ReferenceResolver>) -> Self {
        Self {
            target,
            resolver,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Produce a stable provider id for the product; never returns "no
    /// provider". Record-scoped failures (`ReferenceMissing`,
    /// `SourceDataMalformed`) surface only when even the fallback path is
    /// impossible.
    #[instrument(skip(self, product), fields(source_id = %product.source_id))]
    pub async fn resolve(&self, product: &SourceProduct) -> Result<ProviderOutcome, MigrateError> {
        let Some((name, external_id, verified)) = provider_identity(product.provider.as_ref())
        else {
            debug!("provider blob unusable; synthesizing fallback provider");
            return self.create_fallback_provider(product).await;
        };

        let platform_country_id = match self.platform_country_of(product).await {
            Ok(id) => id,
            Err(MigrateError::ReferenceMissing(what)) => {
                warn!(reference = %what, "platform-country unresolved; using fallback provider");
                return self.create_fallback_provider(product).await;
            }
            Err(e) => return Err(e),
        };

        if let Some(id) = self.cached(&external_id, platform_country_id) {
            return Ok(ProviderOutcome {
                provider_id: id,
                created: false,
            });
        }

        // Step 1: match on (name, external_id) as the legacy rows spelled it.
        let by_name = sqlx::query(
            "SELECT id FROM providers WHERE name ILIKE $1 AND external_id = $2 LIMIT 1",
        )
        .persistent(false)
        .bind(&name)
        .bind(&external_id)
        .fetch_optional(&self.target.pool)
        .await?;

        if let Some(row) = by_name {
            let found_id: String = row.get("id");
            let collision = sqlx::query(
                "SELECT id FROM providers
                 WHERE external_id = $1 AND platform_country_id = $2 AND id <> $3
                 LIMIT 1",
            )
            .persistent(false)
            .bind(&external_id)
            .bind(platform_country_id)
            .bind(&found_id)
            .fetch_optional(&self.target.pool)
            .await?;

            if let Some(other) = collision {
                // Another provider already owns this natural key; touching
                // external_id would violate uniqueness. Update safe fields only.
                let other_id: String = other.get("id");
                warn!(
                    provider_id = %found_id,
                    holder = %other_id,
                    external_id = %external_id,
                    "natural-key collision; updating safe fields only"
                );
                sqlx::query("UPDATE providers SET verified = $1, updated_at = $2 WHERE id = $3")
                    .persistent(false)
                    .bind(verified)
                    .bind(Utc::now())
                    .bind(&found_id)
                    .execute(&self.target.pool)
                    .await?;
            } else {
                sqlx::query(
                    "UPDATE providers SET external_id = $1, verified = $2, updated_at = $3
                     WHERE id = $4",
                )
                .persistent(false)
                .bind(&external_id)
                .bind(verified)
                .bind(Utc::now())
                .bind(&found_id)
                .execute(&self.target.pool)
                .await?;
                self.remember(&external_id, platform_country_id, &found_id);
            }
            return Ok(ProviderOutcome {
                provider_id: found_id,
                created: false,
            });
        }

        // Step 2: match on the natural key and adopt the incoming name.
        let by_key = sqlx::query(
            "SELECT id FROM providers WHERE external_id = $1 AND platform_country_id = $2 LIMIT 1",
        )
        .persistent(false)
        .bind(&external_id)
        .bind(platform_country_id)
        .fetch_optional(&self.target.pool)
        .await?;

        if let Some(row) = by_key {
            let found_id: String = row.get("id");
            sqlx::query(
                "UPDATE providers SET name = $1, verified = $2, updated_at = $3 WHERE id = $4",
            )
            .persistent(false)
            .bind(&name)
            .bind(verified)
            .bind(Utc::now())
            .bind(&found_id)
            .execute(&self.target.pool)
            .await?;
            self.remember(&external_id, platform_country_id, &found_id);
            return Ok(ProviderOutcome {
                provider_id: found_id,
                created: false,
            });
        }

        // Step 3: brand new provider.
        let id = self
            .insert_provider(&name, &external_id, verified, platform_country_id)
            .await?;
        self.remember(&external_id, platform_country_id, &id);
        Ok(ProviderOutcome {
            provider_id: id,
            created: true,
        })
    }

    /// Synthetic provider for products with unusable provider data:
    /// `name = "null"`, `external_id =` the product's external id. Idempotent
    /// on the natural key.
    #[instrument(skip(self, product), fields(source_id = %product.source_id))]
    pub async fn create_fallback_provider(
        &self,
        product: &SourceProduct,
    ) -> Result<ProviderOutcome, MigrateError> {
        // Fail fast here: without a platform-country even a synthetic row
        // would dangle.
        let platform_country_id = self.platform_country_of(product).await?;

        let external_id = product
            .external_id
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                MigrateError::SourceDataMalformed(format!(
                    "product {} has no external_id for fallback provider",
                    product.source_id
                ))
            })?;

        if let Some(id) = self.cached(external_id, platform_country_id) {
            return Ok(ProviderOutcome {
                provider_id: id,
                created: false,
            });
        }

        let existing = sqlx::query(
            "SELECT id FROM providers WHERE external_id = $1 AND platform_country_id = $2 LIMIT 1",
        )
        .persistent(false)
        .bind(external_id)
        .bind(platform_country_id)
        .fetch_optional(&self.target.pool)
        .await?;

        if let Some(row) = existing {
            let id: String = row.get("id");
            self.remember(external_id, platform_country_id, &id);
            return Ok(ProviderOutcome {
                provider_id: id,
                created: false,
            });
        }

        let id = self
            .insert_provider(FALLBACK_PROVIDER_NAME, external_id, false, platform_country_id)
            .await?;
        info!(provider_id = %id, external_id, "fallback provider created");
        self.remember(external_id, platform_country_id, &id);
        Ok(ProviderOutcome {
            provider_id: id,
            created: true,
        })
    }

    async fn insert_provider(
        &self,
        name: &str,
        external_id: &str,
        verified: bool,
        platform_country_id: i64,
    ) -> Result<String, MigrateError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO providers (id, name, external_id, verified, platform_country_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6)",
        )
        .persistent(false)
        .bind(&id)
        .bind(name)
        .bind(external_id)
        .bind(verified)
        .bind(platform_country_id)
        .bind(now)
        .execute(&self.target.pool)
        .await?;

        // Read back to verify the insert landed.
        let check = sqlx::query("SELECT id FROM providers WHERE id = $1")
            .persistent(false)
            .bind(&id)
            .fetch_optional(&self.target.pool)
            .await?;
        if check.is_none() {
            return Err(MigrateError::CorruptState(format!(
                "provider {id} missing immediately after insert"
            )));
        }
        debug!(provider_id = %id, name, external_id, "provider created");
        Ok(id)
    }

    async fn platform_country_of(&self, product: &SourceProduct) -> Result<i64, MigrateError> {
        self.resolver
            .resolve_platform_country(
                product.platform_name.as_deref().unwrap_or(""),
                product.country_code.as_deref().unwrap_or(""),
            )
            .await
    }

    fn cached(&self, external_id: &str, platform_country_id: i64) -> Option<String> {
        self.cache
            .lock()
            .expect("provider cache poisoned")
            .get(&(external_id.to_string(), platform_country_id))
            .cloned()
    }

    fn remember(&self, external_id: &str, platform_country_id: i64, provider_id: &str) {
        self.cache
            .lock()
            .expect("provider cache poisoned")
            .insert(
                (external_id.to_string(), platform_country_id),
                provider_id.to_string(),
            );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_from_well_formed_blob() {
        let raw = json!({"name": "Acme", "external_id": "AC1", "verified": true});
        let (name, ext, verified) = provider_identity(Some(&raw)).unwrap();
        assert_eq!(name, "Acme");
        assert_eq!(ext, "AC1");
        assert!(verified);
    }

    #[test]
    fn identity_accepts_camel_case_and_stringified_blobs() {
        let raw = json!({"name": "Acme", "externalId": "AC1"});
        let (_, ext, verified) = provider_identity(Some(&raw)).unwrap();
        assert_eq!(ext, "AC1");
        assert!(!verified);

        let stringified = json!("{\"name\": \"Acme\", \"external_id\": \"AC2\"}");
        let (_, ext, _) = provider_identity(Some(&stringified)).unwrap();
        assert_eq!(ext, "AC2");
    }

    #[test]
    fn identity_defaults_missing_name_to_null_literal() {
        let raw = json!({"external_id": "AC1"});
        let (name, _, _) = provider_identity(Some(&raw)).unwrap();
        assert_eq!(name, "null");

        let raw = json!({"name": "  ", "external_id": "AC1"});
        let (name, _, _) = provider_identity(Some(&raw)).unwrap();
        assert_eq!(name, "null");
    }

    #[test]
    fn identity_rejects_unusable_blobs() {
        assert!(provider_identity(None).is_none());
        assert!(provider_identity(Some(&json!(null))).is_none());
        assert!(provider_identity(Some(&json!({"name": "Acme"}))).is_none());
        assert!(provider_identity(Some(&json!({"external_id": "  "}))).is_none());
        assert!(provider_identity(Some(&json!("{broken"))).is_none());
    }
}
