//! Read-through reference resolution against the target store.
//!
//! Countries, platforms, platform-countries and base categories are read-only
//! for the duration of a run, so every cache is process-lifetime with no
//! invalidation. The base-category universe is closed: resolution may fall
//! back to the designated "other" id but never creates a row.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use sqlx::Row;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::error::MigrateError;
use crate::resolve::platform::{normalize_country_code, Platform};
use crate::store::Db;

/// The designated "other" base category, seeded as part of the target schema.
pub const FALLBACK_BASE_CATEGORY_ID: i64 = 1;

/// Hand-curated legacy-name synonyms for category labels the automatic
/// strategies miss.
const CATEGORY_SYNONYMS: &[(&str, &str)] = &[
    ("bienestar y salud", "salud"),
    ("salud y belleza", "belleza"),
    ("hogar y decoracion", "hogar"),
    ("tecnologia y electronica", "tecnologia"),
    ("deportes y aire libre", "deportes"),
    ("ropa y accesorios", "moda"),
    ("mascotas y animales", "mascotas"),
];

/// Closed universe of base categories, loaded once per process.
pub struct BaseCategoryCache {
    /// `(name, id)` pairs in deterministic (name ASC) order.
    entries: Vec<(String, i64)>,
    by_exact: HashMap<String, i64>,
    by_lower: HashMap<String, i64>,
    ids: HashSet<i64>,
}

impl BaseCategoryCache {
    pub fn new(mut pairs: Vec<(String, i64)>) -> Self {
        pairs.sort();
        let by_exact = pairs.iter().cloned().collect();
        let by_lower = pairs
            .iter()
            .map(|(name, id)| (name.trim().to_lowercase(), *id))
            .collect();
        let ids = pairs.iter().map(|(_, id)| *id).collect();
        Self {
            entries: pairs,
            by_exact,
            by_lower,
            ids,
        }
    }

    pub fn contains_id(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// The "other" bucket: prefer the cached row named `otros`, fall back to
    /// the schema constant.
    pub fn fallback_id(&self) -> i64 {
        self.by_lower
            .get("otros")
            .copied()
            .unwrap_or(FALLBACK_BASE_CATEGORY_ID)
    }

    pub fn exact(&self, name: &str) -> Option<i64> {
        self.by_exact.get(name).copied()
    }

    pub fn case_normalized(&self, name: &str) -> Option<i64> {
        self.by_lower.get(&name.trim().to_lowercase()).copied()
    }

    /// Substring containment either way, over lowercased names; first match
    /// in name order wins.
    pub fn containment(&self, name: &str) -> Option<i64> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        for (cached, id) in &self.entries {
            let cached_lower = cached.to_lowercase();
            if cached_lower.contains(&needle) || needle.contains(&cached_lower) {
                return Some(*id);
            }
        }
        None
    }

    pub fn synonym(&self, name: &str) -> Option<i64> {
        let needle = name.trim().to_lowercase();
        let target = CATEGORY_SYNONYMS
            .iter()
            .find(|(from, _)| *from == needle)
            .map(|(_, to)| *to)?;
        self.case_normalized(target)
            .or_else(|| self.containment(target))
    }
}

pub struct ReferenceResolver {
    target: Db,
    countries: Mutex<HashMap<String, i64>>,
    platforms: Mutex<HashMap<&'static str, i64>>,
    platform_countries: Mutex<HashMap<(i64, i64), i64>>,
    base_categories: OnceCell<BaseCategoryCache>,
}

impl ReferenceResolver {
    pub fn new(target: Db) -> Self {
        Self {
            target,
            countries: Mutex::new(HashMap::new()),
            platforms: Mutex::new(HashMap::new()),
            platform_countries: Mutex::new(HashMap::new()),
            base_categories: OnceCell::new(),
        }
    }

    /// `(platform_name, country_code) -> platform_country.id`.
    ///
    /// This system never creates platform-countries; a miss anywhere in the
    /// chain is a `ReferenceMissing` record failure.
    #[instrument(skip(self))]
    pub async fn resolve_platform_country(
        &self,
        platform_name: &str,
        country_code: &str,
    ) -> Result<i64, MigrateError> {
        let platform = Platform::resolve(platform_name);
        let code = normalize_country_code(country_code);

        let country_id = self.country_id(&code).await?;
        let platform_id = self.platform_id(platform).await?;

        if let Some(id) = self
            .platform_countries
            .lock()
            .expect("platform-country cache poisoned")
            .get(&(platform_id, country_id))
        {
            return Ok(*id);
        }

        let row = sqlx::query(
            "SELECT id FROM platform_countries WHERE platform_id = $1 AND country_id = $2",
        )
        .persistent(false)
        .bind(platform_id)
        .bind(country_id)
        .fetch_optional(&self.target.pool)
        .await?;

        let id: i64 = row
            .ok_or_else(|| {
                MigrateError::ReferenceMissing(format!(
                    "platform_country for ({}, {})",
                    platform.token(),
                    code
                ))
            })?
            .get("id");

        self.platform_countries
            .lock()
            .expect("platform-country cache poisoned")
            .insert((platform_id, country_id), id);
        Ok(id)
    }

    async fn country_id(&self, code: &str) -> Result<i64, MigrateError> {
        if let Some(id) = self
            .countries
            .lock()
            .expect("country cache poisoned")
            .get(code)
        {
            return Ok(*id);
        }
        let row = sqlx::query("SELECT id FROM countries WHERE code = $1")
            .persistent(false)
            .bind(code)
            .fetch_optional(&self.target.pool)
            .await?;
        let id: i64 = row
            .ok_or_else(|| MigrateError::ReferenceMissing(format!("country {code}")))?
            .get("id");
        self.countries
            .lock()
            .expect("country cache poisoned")
            .insert(code.to_string(), id);
        Ok(id)
    }

    async fn platform_id(&self, platform: Platform) -> Result<i64, MigrateError> {
        if let Some(id) = self
            .platforms
            .lock()
            .expect("platform cache poisoned")
            .get(platform.token())
        {
            return Ok(*id);
        }
        let row = sqlx::query("SELECT id FROM platforms WHERE LOWER(name) = $1")
            .persistent(false)
            .bind(platform.token())
            .fetch_optional(&self.target.pool)
            .await?;
        let id: i64 = row
            .ok_or_else(|| {
                MigrateError::ReferenceMissing(format!("platform {}", platform.token()))
            })?
            .get("id");
        self.platforms
            .lock()
            .expect("platform cache poisoned")
            .insert(platform.token(), id);
        Ok(id)
    }

    async fn base_category_cache(&self) -> Result<&BaseCategoryCache, MigrateError> {
        self.base_categories
            .get_or_try_init(|| async {
                let rows =
                    sqlx::query("SELECT id, name FROM base_categories ORDER BY name ASC")
                        .persistent(false)
                        .fetch_all(&self.target.pool)
                        .await?;
                let pairs = rows
                    .iter()
                    .map(|r| (r.get::<String, _>("name"), r.get::<i64, _>("id")))
                    .collect::<Vec<_>>();
                debug!(base_categories = pairs.len(), "base-category cache loaded");
                Ok(BaseCategoryCache::new(pairs))
            })
            .await
    }

    /// Name-based category resolution; always lands on a real id, falling
    /// through exact -> case-normalized -> platform-category mapping ->
    /// containment -> synonyms -> the "other" bucket.
    #[instrument(skip(self))]
    pub async fn resolve_base_category_by_name(
        &self,
        name: &str,
        platform: Option<Platform>,
    ) -> Result<i64, MigrateError> {
        let cache = self.base_category_cache().await?;

        if let Some(id) = cache.exact(name) {
            return Ok(id);
        }
        if let Some(id) = cache.case_normalized(name) {
            return Ok(id);
        }
        if let Some(platform) = platform {
            if let Some(id) = self.platform_category_mapping(platform, name).await? {
                if cache.contains_id(id) {
                    return Ok(id);
                }
                warn!(
                    name,
                    mapped = id,
                    "platform-category mapping points outside the base-category universe; ignoring"
                );
            }
        }
        if let Some(id) = cache.containment(name) {
            return Ok(id);
        }
        if let Some(id) = cache.synonym(name) {
            return Ok(id);
        }

        debug!(name, "no category strategy matched; using fallback");
        Ok(cache.fallback_id())
    }

    async fn platform_category_mapping(
        &self,
        platform: Platform,
        name: &str,
    ) -> Result<Option<i64>, MigrateError> {
        let platform_id = match self.platform_id(platform).await {
            Ok(id) => id,
            // A missing platform row degrades this strategy, not the record.
            Err(MigrateError::ReferenceMissing(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let row = sqlx::query(
            "SELECT base_category_id FROM platform_categories
             WHERE platform_id = $1 AND LOWER(name) = LOWER($2)",
        )
        .persistent(false)
        .bind(platform_id)
        .bind(name)
        .fetch_optional(&self.target.pool)
        .await?;
        Ok(row.map(|r| r.get::<i64, _>("base_category_id")))
    }

    /// Validate-or-resolve: a known-good existing id wins, then the name
    /// strategies, then the fallback.
    pub async fn resolve_valid_base_category_id(
        &self,
        existing_id: Option<i64>,
        name: Option<&str>,
        platform: Option<Platform>,
    ) -> Result<i64, MigrateError> {
        let cache = self.base_category_cache().await?;
        if let Some(id) = existing_id {
            if cache.contains_id(id) {
                return Ok(id);
            }
        }
        if let Some(name) = name {
            if !name.trim().is_empty() {
                return self.resolve_base_category_by_name(name, platform).await;
            }
        }
        Ok(cache.fallback_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> BaseCategoryCache {
        BaseCategoryCache::new(vec![
            ("tecnologia".into(), 3),
            ("salud".into(), 4),
            ("hogar".into(), 5),
            ("Belleza".into(), 6),
            ("otros".into(), 9),
        ])
    }

    #[test]
    fn exact_and_case_normalized_lookups() {
        let c = cache();
        assert_eq!(c.exact("tecnologia"), Some(3));
        assert_eq!(c.exact("TECNOLOGIA"), None);
        assert_eq!(c.case_normalized("TECNOLOGIA"), Some(3));
        assert_eq!(c.case_normalized("  belleza "), Some(6));
    }

    #[test]
    fn containment_matches_either_direction() {
        let c = cache();
        // Cached name contained in the query...
        assert_eq!(c.containment("tecnologia y gadgets"), Some(3));
        // ...and query contained in a cached name.
        assert_eq!(c.containment("tecno"), Some(3));
        assert_eq!(c.containment("juguetes"), None);
        assert_eq!(c.containment("   "), None);
    }

    #[test]
    fn synonyms_map_through_the_curated_table() {
        let c = cache();
        assert_eq!(c.synonym("bienestar y salud"), Some(4));
        assert_eq!(c.synonym("Bienestar y Salud"), Some(4));
        assert_eq!(c.synonym("no such label"), None);
    }

    #[test]
    fn fallback_prefers_the_otros_row() {
        let c = cache();
        assert_eq!(c.fallback_id(), 9);

        let without_otros = BaseCategoryCache::new(vec![("salud".into(), 4)]);
        assert_eq!(without_otros.fallback_id(), FALLBACK_BASE_CATEGORY_ID);
    }

    #[test]
    fn id_membership() {
        let c = cache();
        assert!(c.contains_id(5));
        assert!(!c.contains_id(42));
    }
}
