//! Domain types shared by the engine, the client and the CLI.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Kind of remote entity a dataset is reconciled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Company,
    Person,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Company => "company",
            Self::Person => "person",
        }
    }

    /// Remote collection path segment.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Company => "companies",
            Self::Person => "people",
        }
    }

    /// Name of the remote attribute used as secondary key.
    pub fn secondary_attribute(&self) -> &'static str {
        match self {
            Self::Company => "domain",
            Self::Person => "email",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "company" | "companies" => Ok(Self::Company),
            "person" | "people" => Ok(Self::Person),
            _ => Err(AppError::ConfigError(format!(
                "Unknown entity kind: '{}'. Valid options: company, person",
                s
            ))),
        }
    }
}

// =============================================================================
// Rows and datasets
// =============================================================================

/// One dataset row: column name → string value, in column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// 1-based line number in the source file (the header is line 1).
    pub line: usize,
    fields: Vec<(String, String)>,
}

impl Row {
    pub fn new(line: usize, fields: Vec<(String, String)>) -> Self {
        Self { line, fields }
    }

    /// Raw value of a column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    /// Trimmed, non-empty value of a mapped column.
    ///
    /// Returns `None` when the attribute is unmapped, the column is missing,
    /// or the cell is blank.
    pub fn value(&self, column: Option<&str>) -> Option<&str> {
        let value = self.get(column?)?.trim();
        (!value.is_empty()).then_some(value)
    }

    /// Sets a column, appending it when it does not exist yet.
    pub fn set(&mut self, column: &str, value: impl Into<String>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(name, _)| name == column) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((column.to_string(), value)),
        }
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }
}

/// A parsed CSV dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    pub headers: Vec<String>,
    pub rows: Vec<Row>,
}

impl Dataset {
    /// Parses CSV text with a header line. Short rows are padded with empty
    /// cells, surplus cells are dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use concord_core::models::Dataset;
    ///
    /// let dataset = Dataset::from_csv_str("name,domain\nAcme,acme.io\n").unwrap();
    /// assert_eq!(dataset.rows.len(), 1);
    /// assert_eq!(dataset.rows[0].get("domain"), Some("acme.io"));
    /// assert_eq!(dataset.rows[0].line, 2);
    /// ```
    pub fn from_csv_str(text: &str) -> Result<Self, AppError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
            .collect();

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record?;
            let fields = headers
                .iter()
                .enumerate()
                .map(|(i, header)| (header.clone(), record.get(i).unwrap_or("").to_string()))
                .collect();
            rows.push(Row::new(index + 2, fields));
        }

        Ok(Self { headers, rows })
    }

    /// Serializes rows back to CSV text under the given headers.
    pub fn to_csv_string<'a>(
        headers: &[String],
        rows: impl IntoIterator<Item = &'a Row>,
    ) -> Result<String, AppError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(headers)?;
        for row in rows {
            writer.write_record(headers.iter().map(|h| row.get(h).unwrap_or("")))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| AppError::Generic(format!("Failed to flush CSV output: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| AppError::Generic(e.to_string()))
    }
}

// =============================================================================
// Field mapping and options
// =============================================================================

/// Relationship link source: a column holding a reference to another entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMapping {
    pub column: String,
    pub target: EntityKind,
}

/// Which column supplies each logical attribute. `None` means unmapped.
///
/// Loaded from a TOML mapping file:
///
/// ```toml
/// name = "Company Name"
/// domain = "Website"
/// owner_email = "Owner"
///
/// [attributes]
/// industry = "Industry"
///
/// [custom_fields]
/// "Account Tier" = "Tier"
///
/// [links.parent]
/// column = "Parent Domain"
/// target = "company"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub name: Option<String>,
    pub identifier: Option<String>,
    pub domain: Option<String>,
    pub email: Option<String>,
    pub owner_email: Option<String>,
    /// Remote attribute → column, sent as strings.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Remote attribute → column, sent as non-negative integers.
    #[serde(default)]
    pub numeric_attributes: BTreeMap<String, String>,
    /// Custom-field name → column.
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
    /// Relation name → link source.
    #[serde(default)]
    pub links: BTreeMap<String, LinkMapping>,
}

impl FieldMapping {
    /// Column of the secondary key for `kind`.
    pub fn secondary_key_column(&self, kind: EntityKind) -> Option<&str> {
        match kind {
            EntityKind::Company => self.domain.as_deref(),
            EntityKind::Person => self.email.as_deref(),
        }
    }

    /// Columns holding free text that the remote renders (name, string
    /// attributes, custom fields).
    pub fn free_text_columns(&self) -> Vec<(&str, &str)> {
        let mut columns = Vec::new();
        if let Some(name) = self.name.as_deref() {
            columns.push(("name", name));
        }
        for (attribute, column) in &self.attributes {
            columns.push((attribute.as_str(), column.as_str()));
        }
        for (field, column) in &self.custom_fields {
            columns.push((field.as_str(), column.as_str()));
        }
        columns
    }

    /// Every column the mapping refers to.
    pub fn mapped_columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = [
            self.name.as_deref(),
            self.identifier.as_deref(),
            self.domain.as_deref(),
            self.email.as_deref(),
            self.owner_email.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        columns.extend(self.attributes.values().map(String::as_str));
        columns.extend(self.numeric_attributes.values().map(String::as_str));
        columns.extend(self.custom_fields.values().map(String::as_str));
        columns.extend(self.links.values().map(|l| l.column.as_str()));
        columns
    }
}

/// Per-operation switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportOptions {
    /// Identifier column holds source-instance ids to remap.
    pub migration_mode: bool,
    /// On UPDATE, send `null` for mapped attributes with blank cells.
    pub clear_empty_fields: bool,
    /// Custom field that stores the source-instance id on the target.
    pub remap_field_name: Option<String>,
    /// Never create; rows without a match are skipped.
    pub update_only: bool,
}

/// Custom-field definition as exposed by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldDefinition {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub entity: EntityKind,
}

impl CustomFieldDefinition {
    /// Reference fields link to another entity and need the record to be
    /// visible on the v2 API before they can be written.
    pub fn is_reference(&self) -> bool {
        self.field_type.eq_ignore_ascii_case("reference")
    }
}

// =============================================================================
// Key normalization
// =============================================================================

/// Returns true when `value` is a well-formed remote identifier (UUID).
pub fn is_well_formed_identifier(value: &str) -> bool {
    Uuid::parse_str(value.trim()).is_ok()
}

/// Normalizes a domain: lower-cased, without scheme, `www.` or path.
///
/// # Examples
///
/// ```
/// use concord_core::models::normalize_domain;
///
/// assert_eq!(normalize_domain("https://WWW.Acme.io/about"), "acme.io");
/// assert_eq!(normalize_domain(" acme.io "), "acme.io");
/// ```
pub fn normalize_domain(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let without_scheme = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let without_www = without_scheme
        .strip_prefix("www.")
        .unwrap_or(without_scheme);
    without_www
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Normalizes a secondary key for `kind`.
pub fn normalize_key(kind: EntityKind, raw: &str) -> String {
    match kind {
        EntityKind::Company => normalize_domain(raw),
        EntityKind::Person => normalize_email(raw),
    }
}
