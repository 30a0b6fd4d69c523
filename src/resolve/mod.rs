pub mod platform;
pub mod references;

pub use platform::{normalize_country_code, Platform};
pub use references::{BaseCategoryCache, ReferenceResolver, FALLBACK_BASE_CATEGORY_ID};
