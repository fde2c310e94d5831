//! Per-row decision logic and operation statistics.
//!
//! This module holds the pure parts of reconciliation: which write a row maps
//! to, and how row outcomes add up to an [`OperationResult`]. It performs no
//! I/O.

use serde::{Deserialize, Serialize};

use crate::cache::CrossRefCache;
use crate::models::is_well_formed_identifier;

/// What the engine will do with a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No identifier and no cache match: create a new record.
    Create,
    /// Explicit identifier: update that record.
    UpdateById(String),
    /// Secondary key found in the cross-reference cache.
    UpdateBySecondaryKey(String),
    /// Nothing to update and creation is not allowed.
    Skip,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Create => "CREATE",
            Decision::UpdateById(_) => "UPDATE_BY_ID",
            Decision::UpdateBySecondaryKey(_) => "UPDATE_BY_SECONDARY_KEY",
            Decision::Skip => "SKIP",
        }
    }

    /// Target identifier of an update.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Decision::UpdateById(id) | Decision::UpdateBySecondaryKey(id) => Some(id.as_str()),
            Decision::Create | Decision::Skip => None,
        }
    }
}

/// Decides the primary write for a row.
///
/// A well-formed identifier always wins, even when the cache also knows the
/// secondary key and even if the identifier does not exist remotely; the
/// remote service reports that case. Otherwise the secondary key is looked up
/// in `cache`.
///
/// # Examples
///
/// ```
/// use concord_core::cache::CrossRefCache;
/// use concord_core::sync::{decide, Decision};
/// use concord_core::EntityKind;
///
/// let mut cache = CrossRefCache::new(EntityKind::Company);
/// cache.insert("acme.io", "a3c1e7a2-5d2b-4a44-9f0e-1c2d3e4f5a6b");
///
/// let decision = decide(None, Some("ACME.io"), &cache, false);
/// assert_eq!(decision.as_str(), "UPDATE_BY_SECONDARY_KEY");
/// assert_eq!(decide(None, Some("new.io"), &cache, false), Decision::Create);
/// ```
pub fn decide(
    identifier: Option<&str>,
    secondary_key: Option<&str>,
    cache: &CrossRefCache,
    update_only: bool,
) -> Decision {
    if let Some(id) = identifier.map(str::trim).filter(|id| is_well_formed_identifier(id)) {
        return Decision::UpdateById(id.to_string());
    }

    if let Some(existing) = secondary_key.and_then(|key| cache.get(key)) {
        return Decision::UpdateBySecondaryKey(existing.to_string());
    }

    if update_only {
        Decision::Skip
    } else {
        Decision::Create
    }
}

/// Outcome of processing a single row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Created,
    Updated,
    /// Update target does not exist remotely.
    SkippedNotFound,
    /// Decision was SKIP.
    Skipped,
    /// Delete succeeded, or the record was already absent.
    Deleted,
    /// Row was rejected locally or remotely.
    Failed,
}

/// Terminal summary of one operation run.
///
/// Serialized as the payload of the `complete` event.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub deleted: usize,
    pub stopped: bool,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl OperationResult {
    /// Creates an empty result for a run over `total` rows.
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Records an outcome, incrementing the appropriate counter.
    pub fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Created => self.created += 1,
            RowOutcome::Updated => self.updated += 1,
            RowOutcome::SkippedNotFound | RowOutcome::Skipped => self.skipped += 1,
            RowOutcome::Deleted => self.deleted += 1,
            RowOutcome::Failed => self.errors += 1,
        }
    }

    /// Rows that reached a terminal outcome.
    pub fn processed(&self) -> usize {
        self.created + self.updated + self.skipped + self.deleted + self.errors
    }

    /// Rows that did not fail.
    pub fn successful(&self) -> usize {
        self.processed() - self.errors
    }
}
