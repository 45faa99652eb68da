//! Structural contract every decoded message must satisfy before reaching the sink
use std::{collections::BTreeMap, fmt};

use thiserror::Error;

use crate::record::{UserRecord, OPTIONAL_FIELDS, REQUIRED_FIELDS};

/// Decoded field value, independent of the wire codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Null,
    Text(String),
    /// Any non-text value; carries the wire type name for error reporting.
    Other(&'static str),
}

/// Field name to value, as produced by a codec.
pub type FieldMap = BTreeMap<String, Field>;

/// Wire names written by older producers, mapped to the canonical field name.
const ALIASES: [(&str, &str); 2] = [("picture", "picture_url"), ("dob", "date_of_birth")];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMismatch {
    pub field: String,
    pub found: String,
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: expected string, found {}", self.field, self.found)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema violation: missing {missing_fields:?}, mismatched [{}]", join(.type_mismatches))]
pub struct SchemaError {
    pub missing_fields: Vec<String>,
    pub type_mismatches: Vec<TypeMismatch>,
}

fn join(m: &[TypeMismatch]) -> String {
    m.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
}

/// Validates a decoded field map into a [UserRecord].
///
/// All problems are collected, so a rejected message reports every missing
/// field and every mismatch at once. Unknown fields are ignored.
pub fn validate(fields: &FieldMap) -> Result<UserRecord, SchemaError> {
    let mut missing = Vec::new();
    let mut mismatches = Vec::new();
    let mut values: BTreeMap<&str, String> = BTreeMap::new();

    for name in REQUIRED_FIELDS {
        match lookup(fields, name) {
            None | Some(Field::Null) => missing.push(name.to_string()),
            Some(Field::Text(s)) if name == "id" && s.trim().is_empty() => {
                mismatches.push(TypeMismatch {
                    field: name.to_string(),
                    found: "empty string".to_string(),
                })
            }
            Some(Field::Text(s)) => {
                values.insert(name, s.clone());
            }
            Some(Field::Other(t)) => mismatches.push(TypeMismatch {
                field: name.to_string(),
                found: t.to_string(),
            }),
        }
    }
    for name in OPTIONAL_FIELDS {
        match lookup(fields, name) {
            None | Some(Field::Null) => {}
            Some(Field::Text(s)) => {
                values.insert(name, s.clone());
            }
            Some(Field::Other(t)) => mismatches.push(TypeMismatch {
                field: name.to_string(),
                found: t.to_string(),
            }),
        }
    }

    if !missing.is_empty() || !mismatches.is_empty() {
        return Err(SchemaError {
            missing_fields: missing,
            type_mismatches: mismatches,
        });
    }

    let date_of_birth = values.remove("date_of_birth");
    let mut take = |name: &str| values.remove(name).unwrap_or_default();
    Ok(UserRecord {
        id: take("id"),
        first_name: take("first_name"),
        last_name: take("last_name"),
        gender: take("gender"),
        address: take("address"),
        post_code: take("post_code"),
        email: take("email"),
        username: take("username"),
        date_of_birth,
        registered_date: take("registered_date"),
        phone: take("phone"),
        picture_url: take("picture_url"),
    })
}

fn lookup<'a>(fields: &'a FieldMap, name: &str) -> Option<&'a Field> {
    fields.get(name).or_else(|| {
        ALIASES
            .iter()
            .find(|(_, canonical)| *canonical == name)
            .and_then(|(alias, _)| fields.get(*alias))
    })
}
