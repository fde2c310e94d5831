//! Offline preview validation.
//!
//! [`validate`] runs every check that would otherwise surface as a remote
//! rejection, without touching the network. The reconciliation engine reuses
//! [`Validator::check_row`] to reject rows before issuing any remote call.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::models::{
    is_well_formed_identifier, normalize_key, Dataset, EntityKind, FieldMapping, Row,
};

/// Largest value accepted for numeric attributes.
pub const MAX_NUMERIC_VALUE: u64 = 999_999_999_999;

static MARKUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<\s*/?\s*[A-Za-z!][^>]*>").expect("markup pattern is valid")
});

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is valid")
});

/// Whether `value` has the shape of an email address.
pub fn is_valid_email(value: &str) -> bool {
    EMAIL.is_match(value)
}

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)+$")
        .expect("domain pattern is valid")
});

/// One finding. `row` is the 1-based source line, or 0 for mapping-level
/// findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub row: usize,
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(row: usize, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            row,
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub total_rows: usize,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

/// Findings for a single row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFindings {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl RowFindings {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// All error messages joined for a log line.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Row and dataset checks for one entity kind.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    kind: EntityKind,
    migration_mode: bool,
}

impl Validator {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            migration_mode: false,
        }
    }

    /// In migration mode the identifier column holds source-instance ids,
    /// which are not required to be well-formed target identifiers.
    pub fn with_migration_mode(mut self, migration_mode: bool) -> Self {
        self.migration_mode = migration_mode;
        self
    }

    /// Checks the mapping itself against the dataset headers.
    pub fn check_mapping(&self, mapping: &FieldMapping, headers: &[String]) -> Vec<ValidationIssue> {
        let mut errors = Vec::new();
        let key_attribute = self.kind.secondary_attribute();

        if mapping.name.is_none() {
            errors.push(ValidationIssue::new(0, "name", "Name column is not mapped"));
        }
        if mapping.identifier.is_none() && mapping.secondary_key_column(self.kind).is_none() {
            errors.push(ValidationIssue::new(
                0,
                "identifier",
                format!("Map an identifier or a {} column", key_attribute),
            ));
        }
        for column in mapping.mapped_columns() {
            if !headers.iter().any(|h| h == column) {
                errors.push(ValidationIssue::new(
                    0,
                    column,
                    format!("Mapped column '{}' is not present in the dataset", column),
                ));
            }
        }
        errors
    }

    /// Checks one row in isolation.
    pub fn check_row(&self, row: &Row, mapping: &FieldMapping) -> RowFindings {
        let mut findings = RowFindings::default();
        let line = row.line;
        let key_attribute = self.kind.secondary_attribute();
        let identifier = row.value(mapping.identifier.as_deref());
        let secondary = row.value(mapping.secondary_key_column(self.kind));

        if row.value(mapping.name.as_deref()).is_none() {
            findings
                .errors
                .push(ValidationIssue::new(line, "name", "Name is required"));
        }

        if identifier.is_none() && secondary.is_none() {
            findings.errors.push(ValidationIssue::new(
                line,
                "identifier",
                format!("Either an identifier or a {} is required", key_attribute),
            ));
        }

        if let Some(id) = identifier {
            if !self.migration_mode && !is_well_formed_identifier(id) {
                findings.errors.push(ValidationIssue::new(
                    line,
                    "identifier",
                    format!("'{}' is not a valid identifier", id),
                ));
            }
        }

        if let Some(key) = secondary {
            let normalized = normalize_key(self.kind, key);
            let well_formed = match self.kind {
                EntityKind::Company => DOMAIN.is_match(&normalized),
                EntityKind::Person => EMAIL.is_match(&normalized),
            };
            if !well_formed {
                findings.errors.push(ValidationIssue::new(
                    line,
                    key_attribute,
                    format!("'{}' is not a valid {}", key, key_attribute),
                ));
            } else if normalized != key {
                findings.warnings.push(ValidationIssue::new(
                    line,
                    key_attribute,
                    format!("'{}' will be matched as '{}'", key, normalized),
                ));
            }
        }

        if let Some(owner) = row.value(mapping.owner_email.as_deref()) {
            if !EMAIL.is_match(owner) {
                findings.warnings.push(ValidationIssue::new(
                    line,
                    "owner_email",
                    format!("'{}' is not a valid email; the owner will not be set", owner),
                ));
            }
        }

        for (field, column) in mapping.free_text_columns() {
            if let Some(text) = row.value(Some(column)) {
                if MARKUP.is_match(text) {
                    findings.errors.push(ValidationIssue::new(
                        line,
                        field,
                        "HTML or other markup is not allowed",
                    ));
                }
            }
        }

        for (attribute, column) in &mapping.numeric_attributes {
            if let Some(raw) = row.value(Some(column.as_str())) {
                match raw.parse::<u64>() {
                    Ok(n) if n <= MAX_NUMERIC_VALUE => {}
                    _ => findings.errors.push(ValidationIssue::new(
                        line,
                        attribute.as_str(),
                        format!(
                            "'{}' must be a whole number between 0 and {}",
                            raw, MAX_NUMERIC_VALUE
                        ),
                    )),
                }
            }
        }

        findings
    }

    /// Validates a whole dataset.
    ///
    /// Beyond per-row checks, rows without an identifier that repeat a
    /// secondary key already seen on an earlier row are reported as duplicates.
    pub fn validate(&self, dataset: &Dataset, mapping: &FieldMapping) -> ValidationReport {
        let mut errors = self.check_mapping(mapping, &dataset.headers);
        let mut warnings = Vec::new();
        let mut first_seen: HashMap<String, usize> = HashMap::new();
        let key_attribute = self.kind.secondary_attribute();

        for row in &dataset.rows {
            let findings = self.check_row(row, mapping);
            errors.extend(findings.errors);
            warnings.extend(findings.warnings);

            if row.value(mapping.identifier.as_deref()).is_some() {
                continue;
            }
            let Some(key) = row.value(mapping.secondary_key_column(self.kind)) else {
                continue;
            };
            let normalized = normalize_key(self.kind, key);
            match first_seen.get(&normalized) {
                Some(first_line) => errors.push(ValidationIssue::new(
                    row.line,
                    key_attribute,
                    format!(
                        "Duplicate {} '{}' (first seen on row {})",
                        key_attribute, normalized, first_line
                    ),
                )),
                None => {
                    first_seen.insert(normalized, row.line);
                }
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            total_rows: dataset.rows.len(),
            errors,
            warnings,
        }
    }
}

/// Validates `dataset` against `mapping` for `kind` without any remote call.
pub fn validate(dataset: &Dataset, mapping: &FieldMapping, kind: EntityKind) -> ValidationReport {
    Validator::new(kind).validate(dataset, mapping)
}
