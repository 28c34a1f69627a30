//! Keyword filtering over record collections.
//!
//! Each entity kind carries a [`FilterConfig`] that names the queryable fields and how
//! they match. Configs are validated against the entity schema when they are built, so
//! a request can only ever reach fields that exist.
//!
//! Keys that no config knows about (pagination, ordering, typos) are ignored. Values
//! given for typed fields must parse, otherwise compilation fails with a validation
//! error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{EntityKind, FieldType, FieldValue, MetadataError, Record, RecordId};

/// Query key that matches the record identifier itself.
pub const RECORD_ID_KEYWORD: &str = "orcabus_id";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    Exact,
    CaseInsensitiveExact,
    CaseInsensitiveContains,
}

impl MatchPolicy {
    fn supports(self, field_type: FieldType) -> bool {
        match self {
            Self::Exact => true,
            Self::CaseInsensitiveExact | Self::CaseInsensitiveContains => field_type.is_textual(),
        }
    }
}

/// Flat multimap of query keys to raw values.
///
/// Keys are normalized from camelCase to snake_case on insert. Repeating a key adds an
/// alternative value for the same field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordQuery {
    terms: BTreeMap<String, Vec<String>>,
}

impl KeywordQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut query = Self::new();
        for (key, value) in pairs {
            query.push(key.as_ref(), value);
        }
        query
    }

    pub fn push(&mut self, key: &str, value: impl Into<String>) {
        self.terms.entry(normalize_key(key)).or_default().push(value.into());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.terms.iter().map(|(key, values)| (key.as_str(), values.as_slice()))
    }
}

/// camelCase to snake_case. A run of capitals is one word, so `orcabusID` becomes
/// `orcabus_id` and `HTTPServer` becomes `http_server`.
fn normalize_key(raw: &str) -> String {
    let chars = raw.trim().chars().collect::<Vec<_>>();
    let mut normalized = String::with_capacity(chars.len() + 4);
    for (index, &ch) in chars.iter().enumerate() {
        if !ch.is_ascii_uppercase() {
            normalized.push(ch);
            continue;
        }
        let previous = index.checked_sub(1).and_then(|before| chars.get(before).copied());
        let next = chars.get(index + 1).copied();
        let starts_word = match previous {
            None | Some('_') => false,
            Some(previous) if previous.is_ascii_uppercase() => {
                next.is_some_and(|next| next.is_ascii_lowercase())
            }
            Some(_) => true,
        };
        if starts_word {
            normalized.push('_');
        }
        normalized.push(ch.to_ascii_lowercase());
    }
    normalized
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldRule {
    field: &'static str,
    field_type: FieldType,
    policy: MatchPolicy,
}

/// Queryable fields of one entity kind and their match policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    kind: EntityKind,
    rules: BTreeMap<&'static str, FieldRule>,
}

impl FilterConfig {
    /// Build a config from explicit `(field, policy)` entries.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] when a field is not declared by the kind's
    /// schema, is listed twice, or does not support the requested policy.
    pub fn new<'a, I>(kind: EntityKind, entries: I) -> Result<Self, MetadataError>
    where
        I: IntoIterator<Item = (&'a str, MatchPolicy)>,
    {
        let schema = kind.schema();
        let mut rules = BTreeMap::new();
        for (field, policy) in entries {
            let spec = schema.field(field).ok_or_else(|| {
                MetadataError::Validation(format!("{kind} has no queryable field {field:?}"))
            })?;
            if !policy.supports(spec.field_type) {
                return Err(MetadataError::Validation(format!(
                    "{kind}.{field} does not support {policy:?} matching"
                )));
            }
            let rule = FieldRule { field: spec.name, field_type: spec.field_type, policy };
            if rules.insert(spec.name, rule).is_some() {
                return Err(MetadataError::Validation(format!(
                    "{kind}.{field} is configured more than once"
                )));
            }
        }
        Ok(Self { kind, rules })
    }

    /// Every declared field, free text matched case-insensitively, everything else exactly.
    #[must_use]
    pub fn standard(kind: EntityKind) -> Self {
        let rules = kind
            .schema()
            .fields
            .iter()
            .map(|spec| {
                let policy = if spec.field_type == FieldType::Text {
                    MatchPolicy::CaseInsensitiveExact
                } else {
                    MatchPolicy::Exact
                };
                (spec.name, FieldRule { field: spec.name, field_type: spec.field_type, policy })
            })
            .collect();
        Self { kind, rules }
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    #[must_use]
    pub fn policy(&self, field: &str) -> Option<MatchPolicy> {
        self.rules.get(field).map(|rule| rule.policy)
    }

    /// Resolve `query` against this config.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] when a value for a known key does not parse
    /// as the field's type.
    pub fn compile(&self, query: &KeywordQuery) -> Result<CompiledQuery, MetadataError> {
        let mut matchers = Vec::new();
        let mut ignored_keys = Vec::new();

        for (key, values) in query.iter() {
            if key == RECORD_ID_KEYWORD {
                let ids = values.iter().map(|raw| RecordId::parse(raw)).collect::<Result<_, _>>()?;
                matchers.push(Matcher::RecordId(ids));
                continue;
            }

            let Some(rule) = self.rules.get(key) else {
                ignored_keys.push(key.to_string());
                continue;
            };

            let needles = values
                .iter()
                .map(|raw| Needle::parse(*rule, raw))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| {
                    MetadataError::Validation(format!(
                        "keyword {key:?} for {}: {}",
                        self.kind,
                        err.detail()
                    ))
                })?;
            matchers.push(Matcher::Field { field: rule.field, needles });
        }

        Ok(CompiledQuery { kind: self.kind, matchers, ignored_keys })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Needle {
    Exact(FieldValue),
    CaseInsensitiveExact(String),
    CaseInsensitiveContains(String),
}

impl Needle {
    fn parse(rule: FieldRule, raw: &str) -> Result<Self, MetadataError> {
        match rule.policy {
            MatchPolicy::Exact => rule.field_type.parse_value(raw).map(Self::Exact),
            MatchPolicy::CaseInsensitiveExact => Ok(Self::CaseInsensitiveExact(fold_text(raw))),
            MatchPolicy::CaseInsensitiveContains => {
                Ok(Self::CaseInsensitiveContains(fold_text(raw)))
            }
        }
    }

    /// Stored text is folded the same way as the needle: trimmed, then lowercased.
    fn matches(&self, value: &FieldValue) -> bool {
        match self {
            Self::Exact(expected) => expected == value,
            Self::CaseInsensitiveExact(expected) => {
                value.as_text().is_some_and(|text| fold_text(text) == *expected)
            }
            Self::CaseInsensitiveContains(expected) => {
                value.as_text().is_some_and(|text| fold_text(text).contains(expected.as_str()))
            }
        }
    }
}

fn fold_text(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq)]
enum Matcher {
    RecordId(Vec<RecordId>),
    Field { field: &'static str, needles: Vec<Needle> },
}

impl Matcher {
    fn matches(&self, record: &Record) -> bool {
        match self {
            Self::RecordId(ids) => ids.contains(&record.id),
            Self::Field { field, needles } => record
                .field(field)
                .is_some_and(|value| needles.iter().any(|needle| needle.matches(value))),
        }
    }
}

/// A keyword query resolved against one kind's [`FilterConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    kind: EntityKind,
    matchers: Vec<Matcher>,
    ignored_keys: Vec<String>,
}

impl CompiledQuery {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Keys dropped because no queryable field carries that name.
    #[must_use]
    pub fn ignored_keys(&self) -> &[String] {
        &self.ignored_keys
    }

    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.matchers.is_empty()
    }

    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        record.kind == self.kind && self.matchers.iter().all(|matcher| matcher.matches(record))
    }

    /// Lazily filter `records`, preserving their order. Clone the iterator to restart it.
    pub fn apply<'a>(
        &'a self,
        records: &'a [Record],
    ) -> impl Iterator<Item = &'a Record> + Clone + 'a {
        records.iter().filter(move |record| self.matches(record))
    }
}

/// One validated [`FilterConfig`] per entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRegistry {
    configs: BTreeMap<EntityKind, FilterConfig>,
}

impl FilterRegistry {
    #[must_use]
    pub fn standard() -> Self {
        let configs =
            EntityKind::ALL.into_iter().map(|kind| (kind, FilterConfig::standard(kind))).collect();
        Self { configs }
    }

    #[must_use]
    pub fn with_config(mut self, config: FilterConfig) -> Self {
        self.configs.insert(config.kind, config);
        self
    }

    #[must_use]
    pub fn config(&self, kind: EntityKind) -> Option<&FilterConfig> {
        self.configs.get(&kind)
    }

    /// Compile `query` with the config registered for `kind`.
    ///
    /// # Errors
    /// Returns [`MetadataError::Validation`] when no config is registered for `kind` or
    /// the query fails to compile.
    pub fn compile(
        &self,
        kind: EntityKind,
        query: &KeywordQuery,
    ) -> Result<CompiledQuery, MetadataError> {
        let config = self.config(kind).ok_or_else(|| {
            MetadataError::Validation(format!("no filter configuration for {kind}"))
        })?;
        config.compile(query)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
