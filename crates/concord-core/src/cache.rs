//! Cross-reference and entity-remap caches.
//!
//! Caches are rebuilt from the remote service at the start of every operation
//! and live exactly as long as that operation. Nothing here is persisted.

use std::collections::HashMap;

use serde_json::Value;

use crate::models::{normalize_key, CustomFieldDefinition, EntityKind};
use crate::traits::RemoteApi;
use crate::AppError;

/// Type the remap field must have on the target instance.
pub const REMAP_FIELD_TYPE: &str = "text";

/// Secondary key (normalized domain or email) → remote identifier.
#[derive(Debug, Clone)]
pub struct CrossRefCache {
    kind: EntityKind,
    entries: HashMap<String, String>,
}

impl CrossRefCache {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Looks up a raw (un-normalized) key.
    pub fn get(&self, raw_key: &str) -> Option<&str> {
        self.entries
            .get(&normalize_key(self.kind, raw_key))
            .map(String::as_str)
    }

    /// Records `raw_key → id`, replacing any previous entry.
    pub fn insert(&mut self, raw_key: &str, id: impl Into<String>) {
        let key = normalize_key(self.kind, raw_key);
        if !key.is_empty() {
            self.entries.insert(key, id.into());
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Source-instance identifier → target-instance identifier.
///
/// An empty cache is a valid state: the remap field does not exist on the
/// target, so there is nothing to remap.
#[derive(Debug, Clone, Default)]
pub struct RemapCache {
    field_name: Option<String>,
    field_ids: HashMap<EntityKind, String>,
    entries: HashMap<String, String>,
}

impl RemapCache {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn field_name(&self) -> Option<&str> {
        self.field_name.as_deref()
    }

    /// Id of the remap field on `kind`, when the target declares it.
    pub fn field_id(&self, kind: EntityKind) -> Option<&str> {
        self.field_ids.get(&kind).map(String::as_str)
    }

    pub fn get(&self, source_id: &str) -> Option<&str> {
        self.entries.get(source_id.trim()).map(String::as_str)
    }

    pub fn insert(&mut self, source_id: &str, target_id: impl Into<String>) {
        self.entries
            .insert(source_id.trim().to_string(), target_id.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Custom-field definitions of one entity kind, addressable by name.
#[derive(Debug, Clone, Default)]
pub struct CustomFieldIndex {
    by_name: HashMap<String, CustomFieldDefinition>,
}

impl CustomFieldIndex {
    pub fn from_definitions(definitions: Vec<CustomFieldDefinition>) -> Self {
        Self {
            by_name: definitions
                .into_iter()
                .map(|d| (d.name.to_lowercase(), d))
                .collect(),
        }
    }

    /// Case-insensitive lookup by field name.
    pub fn get(&self, name: &str) -> Option<&CustomFieldDefinition> {
        self.by_name.get(&name.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Everything the reconciliation engine consults for one operation.
#[derive(Debug, Clone, Default)]
pub struct Caches {
    pub lookups: HashMap<EntityKind, CrossRefCache>,
    pub remap: RemapCache,
    pub fields: CustomFieldIndex,
}

impl Caches {
    pub fn lookup(&self, kind: EntityKind) -> Option<&CrossRefCache> {
        self.lookups.get(&kind)
    }

    /// Mutable cache for `kind`, created empty on first use.
    pub fn lookup_mut(&mut self, kind: EntityKind) -> &mut CrossRefCache {
        self.lookups
            .entry(kind)
            .or_insert_with(|| CrossRefCache::new(kind))
    }
}

fn string_field<'a>(record: &'a Value, name: &str) -> Option<&'a str> {
    record
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Drains the collection of `kind` into a [`CrossRefCache`].
///
/// Records without an id or without the secondary attribute are skipped. When
/// two records share a key, the first one seen wins.
pub async fn build_cross_ref_cache<A: RemoteApi>(
    api: &A,
    kind: EntityKind,
    cap: usize,
) -> Result<CrossRefCache, AppError> {
    let records = api.list_records(kind, cap).await?;
    let mut cache = CrossRefCache::new(kind);
    let mut skipped = 0usize;

    for record in records.iter().take(cap) {
        let (Some(id), Some(key)) = (
            string_field(record, "id"),
            string_field(record, kind.secondary_attribute()),
        ) else {
            skipped += 1;
            continue;
        };
        if cache.get(key).is_none() {
            cache.insert(key, id);
        }
    }

    tracing::info!(
        kind = %kind,
        entries = cache.len(),
        skipped,
        "Cross-reference cache built"
    );
    Ok(cache)
}

/// Loads custom-field definitions of `kind` into an index.
pub async fn build_custom_field_index<A: RemoteApi>(
    api: &A,
    kind: EntityKind,
) -> Result<CustomFieldIndex, AppError> {
    let definitions = api.custom_field_definitions(kind).await?;
    Ok(CustomFieldIndex::from_definitions(
        definitions
            .into_iter()
            .filter(|d| d.entity == kind)
            .collect(),
    ))
}

/// Builds the remap cache by reverse-indexing `field_name` over every entity
/// of `kinds` on the target instance.
///
/// A kind that does not declare a text field called `field_name` contributes
/// nothing. A failure to fetch definitions or records is returned as an error.
pub async fn build_remap_cache<A: RemoteApi>(
    api: &A,
    field_name: &str,
    kinds: &[EntityKind],
    cap: usize,
) -> Result<RemapCache, AppError> {
    let mut cache = RemapCache {
        field_name: Some(field_name.to_string()),
        ..RemapCache::default()
    };

    for &kind in kinds {
        let definitions = api.custom_field_definitions(kind).await?;
        let Some(field) = definitions.into_iter().find(|d| {
            d.entity == kind
                && d.name.eq_ignore_ascii_case(field_name)
                && d.field_type.eq_ignore_ascii_case(REMAP_FIELD_TYPE)
        }) else {
            tracing::info!(kind = %kind, field = field_name, "Remap field not declared");
            continue;
        };

        let records = api.list_records(kind, cap).await?;
        for record in records.iter().take(cap) {
            let Some(target_id) = string_field(record, "id") else {
                continue;
            };
            let source_id = record
                .get("custom_fields")
                .and_then(|fields| fields.get(&field.id))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty());
            if let Some(source_id) = source_id {
                cache.insert(source_id, target_id);
            }
        }
        cache.field_ids.insert(kind, field.id);
    }

    tracing::info!(
        field = field_name,
        entries = cache.len(),
        "Remap cache built"
    );
    Ok(cache)
}
