use strsim::jaro_winkler;
use tracing::warn;

/// Minimum similarity score (Jaro-Winkler) required for an unknown platform
/// label to be snapped onto a known token instead of the default.
pub const MIN_PLATFORM_SIMILARITY: f64 = 0.85;

/// The closed set of marketplace platforms. This system never creates
/// platforms; anything unrecognized degrades to `Dropi` with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Dropi,
    Aliclick,
    Droplatam,
    SeventyBlock,
    Wimpy,
    Easydrop,
    Mastershop,
    Dropea,
}

impl Platform {
    pub const ALL: [Platform; 8] = [
        Platform::Dropi,
        Platform::Aliclick,
        Platform::Droplatam,
        Platform::SeventyBlock,
        Platform::Wimpy,
        Platform::Easydrop,
        Platform::Mastershop,
        Platform::Dropea,
    ];

    /// Lowercase token as stored in the target `platforms` table.
    pub fn token(&self) -> &'static str {
        match self {
            Platform::Dropi => "dropi",
            Platform::Aliclick => "aliclick",
            Platform::Droplatam => "droplatam",
            Platform::SeventyBlock => "seventy block",
            Platform::Wimpy => "wimpy",
            Platform::Easydrop => "easydrop",
            Platform::Mastershop => "mastershop",
            Platform::Dropea => "dropea",
        }
    }

    /// Map a raw legacy platform label onto the closed token set.
    ///
    /// Exact (case/whitespace-insensitive) match first, then a fuzzy pass for
    /// misspellings, then the default with a warning. The comparison key
    /// drops everything but ASCII alphanumerics so "Seventy-Block" and
    /// "seventy block" collide.
    pub fn resolve(raw: &str) -> Platform {
        let key = comparison_key(raw);
        if key.is_empty() {
            warn!(platform = %raw, "empty platform label; defaulting to dropi");
            return Platform::Dropi;
        }

        for p in Platform::ALL {
            if comparison_key(p.token()) == key {
                return p;
            }
        }

        let mut best: Option<(Platform, f64)> = None;
        for p in Platform::ALL {
            let score = jaro_winkler(&key, &comparison_key(p.token()));
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((p, score));
            }
        }
        if let Some((p, score)) = best {
            if score >= MIN_PLATFORM_SIMILARITY {
                warn!(platform = %raw, matched = p.token(), score, "fuzzy platform match");
                return p;
            }
        }

        warn!(platform = %raw, "unknown platform; defaulting to dropi");
        Platform::Dropi
    }
}

fn comparison_key(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Normalize legacy country-code aliases to their canonical ISO form.
/// `CO1` was a secondary Colombian tenant in the legacy store.
pub fn normalize_country_code(raw: &str) -> String {
    let code = raw.trim().to_ascii_uppercase();
    match code.as_str() {
        "CO1" => "CO".to_string(),
        _ => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_exact_tokens_any_case() {
        assert_eq!(Platform::resolve("Dropi"), Platform::Dropi);
        assert_eq!(Platform::resolve("MASTERSHOP"), Platform::Mastershop);
        assert_eq!(Platform::resolve(" seventy block "), Platform::SeventyBlock);
        assert_eq!(Platform::resolve("Seventy-Block"), Platform::SeventyBlock);
    }

    #[test]
    fn fuzzy_matches_misspellings() {
        assert_eq!(Platform::resolve("dropii"), Platform::Dropi);
        assert_eq!(Platform::resolve("mastersho"), Platform::Mastershop);
        assert_eq!(Platform::resolve("easydropp"), Platform::Easydrop);
    }

    #[test]
    fn unknown_defaults_to_dropi() {
        assert_eq!(Platform::resolve("shopify"), Platform::Dropi);
        assert_eq!(Platform::resolve(""), Platform::Dropi);
    }

    #[test]
    fn country_alias_normalization() {
        assert_eq!(normalize_country_code("co1"), "CO");
        assert_eq!(normalize_country_code("CO1"), "CO");
        assert_eq!(normalize_country_code("ar"), "AR");
        assert_eq!(normalize_country_code(" gt "), "GT");
    }
}
