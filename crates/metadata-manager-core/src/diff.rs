use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{EntityKind, FieldMap, FieldValue, HistoryEntry, MetadataError, RecordId};

/// One field whose value differs between two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    pub field: String,
    pub old: Option<FieldValue>,
    pub new: Option<FieldValue>,
}

impl Display for Change {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} changed from ", self.field)?;
        write_side(f, self.old.as_ref())?;
        f.write_str(" to ")?;
        write_side(f, self.new.as_ref())
    }
}

fn write_side(f: &mut Formatter<'_>, value: Option<&FieldValue>) -> std::fmt::Result {
    match value {
        Some(value) => write!(f, "{value}"),
        None => f.write_str("None"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delta {
    pub record_id: RecordId,
    pub kind: EntityKind,
    pub newer_position: u32,
    pub older_position: Option<u32>,
    pub changes: Vec<Change>,
}

impl Delta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn changed_fields(&self) -> Vec<&str> {
        self.changes.iter().map(|change| change.field.as_str()).collect()
    }
}

/// Compute the field-level delta from `older` to `newer`.
///
/// With `older = None` every field of `newer` is reported as newly set. Changes are
/// ordered by the schema declaration order of the record's kind.
///
/// # Errors
/// Returns [`MetadataError::InvalidComparison`] when `older` snapshots a different record
/// or does not precede `newer`.
pub fn diff(newer: &HistoryEntry, older: Option<&HistoryEntry>) -> Result<Delta, MetadataError> {
    let empty = FieldMap::new();
    let older_fields = match older {
        Some(older) => {
            if older.record_id != newer.record_id {
                return Err(MetadataError::InvalidComparison(format!(
                    "history entries belong to different records ({} vs {})",
                    newer.record_id, older.record_id
                )));
            }
            if older.position >= newer.position {
                return Err(MetadataError::InvalidComparison(format!(
                    "older entry position {} MUST precede newer position {}",
                    older.position, newer.position
                )));
            }
            &older.fields
        }
        None => &empty,
    };

    let schema = newer.kind.schema();
    let changes = schema
        .ordered_union(&newer.fields, older_fields)
        .into_iter()
        .filter_map(|field| {
            let old = older_fields.get(field);
            let new = newer.fields.get(field);
            (old != new).then(|| Change {
                field: field.to_string(),
                old: old.cloned(),
                new: new.cloned(),
            })
        })
        .collect();

    Ok(Delta {
        record_id: newer.record_id,
        kind: newer.kind,
        newer_position: newer.position,
        older_position: older.map(|entry| entry.position),
        changes,
    })
}
