use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod diff;
mod query;

pub use diff::{diff, Change, Delta};
pub use query::{
    CompiledQuery, FilterConfig, FilterRegistry, KeywordQuery, MatchPolicy, RECORD_ID_KEYWORD,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid comparison: {0}")]
    InvalidComparison(String),
    #[error("validation error: {0}")]
    Validation(String),
}

impl MetadataError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidComparison(_) => "invalid_comparison",
            Self::Validation(_) => "validation",
        }
    }

    /// Human-readable message without the error-kind prefix.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::NotFound(detail) | Self::InvalidComparison(detail) | Self::Validation(detail) => {
                detail
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a 26-character ULID.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] when `raw` is not a valid ULID.
    pub fn parse(raw: &str) -> Result<Self, MetadataError> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|err| MetadataError::Validation(format!("invalid ULID {raw:?}: {err}")))
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HistoryId(pub Ulid);

impl HistoryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for HistoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for HistoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Contact,
    Subject,
    Library,
    Sample,
    Individual,
}

impl EntityKind {
    pub const ALL: [Self; 6] = [
        Self::Project,
        Self::Contact,
        Self::Subject,
        Self::Library,
        Self::Sample,
        Self::Individual,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Contact => "contact",
            Self::Subject => "subject",
            Self::Library => "library",
            Self::Sample => "sample",
            Self::Individual => "individual",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "project" => Some(Self::Project),
            "contact" => Some(Self::Contact),
            "subject" => Some(Self::Subject),
            "library" => Some(Self::Library),
            "sample" => Some(Self::Sample),
            "individual" => Some(Self::Individual),
            _ => None,
        }
    }

    /// Capitalized name used in user-facing messages ("Project not found.").
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Project => "Project",
            Self::Contact => "Contact",
            Self::Subject => "Subject",
            Self::Library => "Library",
            Self::Sample => "Sample",
            Self::Individual => "Individual",
        }
    }

    #[must_use]
    pub fn schema(self) -> EntitySchema {
        let fields = match self {
            Self::Project => PROJECT_FIELDS,
            Self::Contact => CONTACT_FIELDS,
            Self::Subject => SUBJECT_FIELDS,
            Self::Library => LIBRARY_FIELDS,
            Self::Sample => SAMPLE_FIELDS,
            Self::Individual => INDIVIDUAL_FIELDS,
        };
        EntitySchema { kind: self, fields }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FieldType {
    /// External identifier; matched exactly.
    Identifier,
    Text,
    Enum(&'static [&'static str]),
    Integer,
    Number,
    Boolean,
    Reference(EntityKind),
}

impl FieldType {
    #[must_use]
    pub fn is_textual(self) -> bool {
        matches!(self, Self::Identifier | Self::Text | Self::Enum(_))
    }

    /// Parse a raw string (CLI argument or query parameter) into a typed value.
    ///
    /// Enum values are matched case-insensitively and stored in their canonical spelling.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] when `raw` does not parse as this type.
    pub fn parse_value(self, raw: &str) -> Result<FieldValue, MetadataError> {
        match self {
            Self::Identifier => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(MetadataError::Validation(
                        "identifier values MUST be non-empty".to_string(),
                    ));
                }
                Ok(FieldValue::Text(trimmed.to_string()))
            }
            Self::Text => Ok(FieldValue::Text(raw.to_string())),
            Self::Enum(allowed) => allowed
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(raw.trim()))
                .map(|canonical| FieldValue::Text((*canonical).to_string()))
                .ok_or_else(|| {
                    MetadataError::Validation(format!(
                        "{raw:?} is not one of: {}",
                        allowed.join(", ")
                    ))
                }),
            Self::Integer => raw.trim().parse::<i64>().map(FieldValue::Integer).map_err(|err| {
                MetadataError::Validation(format!("invalid integer {raw:?}: {err}"))
            }),
            Self::Number => {
                let parsed = raw.trim().parse::<f64>().map_err(|err| {
                    MetadataError::Validation(format!("invalid number {raw:?}: {err}"))
                })?;
                if !parsed.is_finite() {
                    return Err(MetadataError::Validation(format!(
                        "number MUST be finite (received {raw:?})"
                    )));
                }
                Ok(FieldValue::Number(parsed))
            }
            Self::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(FieldValue::Boolean(true)),
                "false" => Ok(FieldValue::Boolean(false)),
                _ => Err(MetadataError::Validation(format!(
                    "invalid boolean {raw:?}; expected true or false"
                ))),
            },
            Self::Reference(_) => RecordId::parse(raw).map(FieldValue::Reference),
        }
    }

    #[must_use]
    pub fn accepts(self, value: &FieldValue) -> bool {
        match (self, value) {
            (Self::Identifier | Self::Text, FieldValue::Text(_))
            | (Self::Integer, FieldValue::Integer(_))
            | (Self::Boolean, FieldValue::Boolean(_))
            | (Self::Reference(_), FieldValue::Reference(_)) => true,
            (Self::Number, FieldValue::Number(number)) => number.is_finite(),
            (Self::Enum(allowed), FieldValue::Text(text)) => allowed.contains(&text.as_str()),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldSpec {
    const fn required(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type, required: true }
    }

    const fn optional(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type, required: false }
    }
}

const SAMPLE_SOURCES: &[&str] = &[
    "ascites",
    "blood",
    "bone-marrow",
    "buccal",
    "cell-line",
    "cfDNA",
    "cyst-fluid",
    "DNA",
    "eyebrow-hair",
    "FFPE",
    "FNA",
    "OCT",
    "organoid",
    "PDX-tissue",
    "plasma-serum",
    "RNA",
    "tissue",
    "skin",
    "water",
];

const LIBRARY_PHENOTYPES: &[&str] = &["normal", "tumor", "negative-control"];

const LIBRARY_WORKFLOWS: &[&str] = &["clinical", "research", "qc", "control", "bcl", "manual"];

const LIBRARY_QUALITIES: &[&str] = &["very-poor", "poor", "good", "borderline"];

const LIBRARY_TYPES: &[&str] = &[
    "10X", "BiModal", "ctDNA", "ctTSO", "exome", "MeDIP", "Metagenm", "MethylSeq", "TSO-DNA",
    "TSO-RNA", "WGS", "WTS", "other",
];

const PROJECT_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("project_id", FieldType::Identifier),
    FieldSpec::optional("name", FieldType::Text),
    FieldSpec::optional("description", FieldType::Text),
];

const CONTACT_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("contact_id", FieldType::Identifier),
    FieldSpec::optional("name", FieldType::Text),
    FieldSpec::optional("description", FieldType::Text),
    FieldSpec::optional("email", FieldType::Text),
];

const INDIVIDUAL_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("individual_id", FieldType::Identifier),
    FieldSpec::optional("source", FieldType::Text),
];

const SUBJECT_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("subject_id", FieldType::Identifier),
    FieldSpec::optional("individual", FieldType::Reference(EntityKind::Individual)),
];

const SAMPLE_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("sample_id", FieldType::Identifier),
    FieldSpec::optional("external_sample_id", FieldType::Identifier),
    FieldSpec::optional("source", FieldType::Enum(SAMPLE_SOURCES)),
];

const LIBRARY_FIELDS: &[FieldSpec] = &[
    FieldSpec::required("library_id", FieldType::Identifier),
    FieldSpec::optional("phenotype", FieldType::Enum(LIBRARY_PHENOTYPES)),
    FieldSpec::optional("workflow", FieldType::Enum(LIBRARY_WORKFLOWS)),
    FieldSpec::optional("quality", FieldType::Enum(LIBRARY_QUALITIES)),
    FieldSpec::optional("type", FieldType::Enum(LIBRARY_TYPES)),
    FieldSpec::optional("assay", FieldType::Text),
    FieldSpec::optional("coverage", FieldType::Number),
    FieldSpec::optional("override_cycles", FieldType::Text),
    FieldSpec::optional("sample", FieldType::Reference(EntityKind::Sample)),
    FieldSpec::optional("subject", FieldType::Reference(EntityKind::Subject)),
];

/// Declared field layout of one entity kind. Field order is significant.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EntitySchema {
    pub kind: EntityKind,
    pub fields: &'static [FieldSpec],
}

impl EntitySchema {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|spec| spec.name == name)
    }

    #[must_use]
    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|spec| spec.name).collect()
    }

    /// The required external identifier field (`project_id`, `library_id`, ...).
    #[must_use]
    pub fn identifier_field(&self) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|spec| spec.required && spec.field_type == FieldType::Identifier)
    }

    #[must_use]
    pub fn external_id<'a>(&self, fields: &'a FieldMap) -> Option<&'a str> {
        self.identifier_field().and_then(|spec| fields.get(spec.name)).and_then(FieldValue::as_text)
    }

    /// Check a full field state against the declared layout.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] for undeclared fields, type mismatches,
    /// or missing/blank required fields.
    pub fn validate_fields(&self, fields: &FieldMap) -> Result<(), MetadataError> {
        for (name, value) in fields {
            let spec = self.field(name).ok_or_else(|| {
                MetadataError::Validation(format!("{} has no field named {name:?}", self.kind))
            })?;
            if !spec.field_type.accepts(value) {
                return Err(MetadataError::Validation(format!(
                    "{}.{name} does not accept {value:?}",
                    self.kind
                )));
            }
        }

        for spec in self.fields.iter().filter(|spec| spec.required) {
            match fields.get(spec.name) {
                Some(FieldValue::Text(text)) if text.trim().is_empty() => {
                    return Err(MetadataError::Validation(format!(
                        "{}.{} MUST be non-empty",
                        self.kind, spec.name
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(MetadataError::Validation(format!(
                        "{}.{} MUST be provided",
                        self.kind, spec.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Parse `name=value` style assignments into typed field values.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] for undeclared fields or unparsable values.
    pub fn parse_fields<'a, I>(&self, assignments: I) -> Result<FieldMap, MetadataError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut fields = FieldMap::new();
        for (name, raw) in assignments {
            let spec = self.field(name).ok_or_else(|| {
                MetadataError::Validation(format!("{} has no field named {name:?}", self.kind))
            })?;
            fields.insert(spec.name.to_string(), spec.field_type.parse_value(raw)?);
        }
        Ok(fields)
    }

    /// Field references (`Reference` fields) present in `fields`, in declaration order.
    #[must_use]
    pub fn references(&self, fields: &FieldMap) -> Vec<(&'static str, EntityKind, RecordId)> {
        self.fields
            .iter()
            .filter_map(|spec| match (spec.field_type, fields.get(spec.name)) {
                (FieldType::Reference(kind), Some(FieldValue::Reference(id))) => {
                    Some((spec.name, kind, *id))
                }
                _ => None,
            })
            .collect()
    }

    /// Union of field names from two states, ordered by declaration, with undeclared
    /// names afterwards in lexical order.
    #[must_use]
    pub fn ordered_union<'a>(&self, lhs: &'a FieldMap, rhs: &'a FieldMap) -> Vec<&'a str> {
        let mut remaining =
            lhs.keys().chain(rhs.keys()).map(String::as_str).collect::<BTreeSet<_>>();
        let mut ordered = Vec::with_capacity(remaining.len());
        for spec in self.fields {
            if let Some(name) = remaining.take(spec.name) {
                ordered.push(name);
            }
        }
        ordered.extend(remaining);
        ordered
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    Reference(RecordId),
}

impl FieldValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Number(value) => write!(f, "{value}"),
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Reference(id) => write!(f, "{id}"),
        }
    }
}

pub type FieldMap = BTreeMap<String, FieldValue>;

/// Field-level patch: `Some` sets a value, `None` unsets the field.
pub type FieldPatch = BTreeMap<String, Option<FieldValue>>;

/// Apply `patch` on top of `current`, returning the merged state.
#[must_use]
pub fn merge_fields(current: &FieldMap, patch: &FieldPatch) -> FieldMap {
    let mut merged = current.clone();
    for (name, value) in patch {
        match value {
            Some(value) => {
                merged.insert(name.clone(), value.clone());
            }
            None => {
                merged.remove(name);
            }
        }
    }
    merged
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub kind: EntityKind,
    pub fields: FieldMap,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Record {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Validate the record's field state against its kind's schema.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] when any schema rule is violated.
    pub fn validate(&self) -> Result<(), MetadataError> {
        self.kind.schema().validate_fields(&self.fields)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HistoryType {
    Created,
    Updated,
}

impl HistoryType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            _ => None,
        }
    }
}

/// Immutable snapshot of a record's full field state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub history_id: HistoryId,
    pub record_id: RecordId,
    pub kind: EntityKind,
    pub position: u32,
    pub history_type: HistoryType,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub fields: FieldMap,
}

impl HistoryEntry {
    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.position == 1
    }
}
