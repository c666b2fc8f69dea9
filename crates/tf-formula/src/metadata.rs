//! Series metadata records attached to formulas.

use serde_json::{Map, Value as Json};

use crate::FormulaError;

pub type Metadata = Map<String, Json>;

/// Keys derived by the engine at registration time.
pub const INTERNAL_KEYS: [&str; 5] = [
    "tzaware",
    "index_type",
    "index_dtype",
    "value_type",
    "value_dtype",
];

/// Metadata of a formula whose leaves resolved to `tzaware`.
#[must_use]
pub fn default_metadata(tzaware: bool) -> Metadata {
    let (index_type, index_dtype) = if tzaware {
        ("datetime64[ns, UTC]", "|M8[ns]")
    } else {
        ("datetime64[ns]", "<M8[ns]")
    };
    let mut meta = Metadata::new();
    meta.insert("tzaware".to_owned(), Json::Bool(tzaware));
    meta.insert("index_type".to_owned(), Json::from(index_type));
    meta.insert("index_dtype".to_owned(), Json::from(index_dtype));
    meta.insert("value_type".to_owned(), Json::from("float64"));
    meta.insert("value_dtype".to_owned(), Json::from("<f8"));
    meta
}

#[must_use]
pub fn is_internal(key: &str) -> bool {
    INTERNAL_KEYS.contains(&key)
}

/// Fresh internal keys, with every user key of `previous` carried over.
#[must_use]
pub fn merge_preserved(fresh: Metadata, previous: Option<&Metadata>) -> Metadata {
    let mut merged = fresh;
    if let Some(previous) = previous {
        for (key, value) in previous {
            if !is_internal(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Applies user `updates` on top of `meta`; internal keys are refused.
pub fn apply_update(meta: &mut Metadata, updates: Metadata) -> Result<(), FormulaError> {
    if let Some(key) = updates.keys().find(|key| is_internal(key)) {
        return Err(FormulaError::ProtectedMetadata(key.clone()));
    }
    meta.extend(updates);
    Ok(())
}

#[must_use]
pub fn tzaware(meta: &Metadata) -> Option<bool> {
    meta.get("tzaware").and_then(Json::as_bool)
}
