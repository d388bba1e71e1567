//! Record adapter contract
//!
//! The core never inspects a record: it consumes the primary key, a map of
//! indexed field values, and an opaque byte blob. Types implement `Record`
//! (hand-written or generated) and declare a schema that is validated once,
//! when the store is constructed.

use crate::{Result, StoreError};
use ahash::AHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Bool,
    Bytes,
}

/// Static description of a record type: which field is the key and which
/// fields feed secondary indexes.
#[derive(Debug, Clone)]
pub struct RecordSchema {
    pub key_field: &'static str,
    pub key_kind: FieldKind,
    pub indexed: &'static [(&'static str, FieldKind)],
}

impl RecordSchema {
    /// Construction-time checks. Ordered string indexes are the only
    /// supported kind; anything else is rejected here rather than silently
    /// producing an index with no entries.
    pub fn validate(&self) -> Result<()> {
        if self.key_field.is_empty() {
            return Err(StoreError::KeyFieldNotFound("<unnamed>".into()));
        }
        if self.key_kind != FieldKind::Text {
            return Err(StoreError::KeyFieldNotString(self.key_field.into()));
        }
        for (field, kind) in self.indexed {
            if *kind != FieldKind::Text {
                return Err(StoreError::IndexFieldType {
                    field: (*field).into(),
                    kind: *kind,
                });
            }
            if *field == crate::index::PRIMARY_KEY_INDEX {
                return Err(StoreError::InvalidConfig(format!(
                    "index name {:?} is reserved",
                    field
                )));
            }
        }
        Ok(())
    }

    pub fn indexed_field_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.indexed.iter().map(|(name, _)| *name)
    }
}

pub trait Record: Sized + Send {
    fn schema() -> RecordSchema;

    /// The primary key. Non-empty, at most `MAX_KEY_LEN` bytes.
    fn key(&self) -> String;

    /// Current value of every indexed field. An empty string means the
    /// record has no entry in that index.
    fn indexed_values(&self) -> AHashMap<String, String>;

    fn encode(&self) -> Result<Vec<u8>>;

    fn decode(bytes: &[u8]) -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_schema_passes() {
        let schema = RecordSchema {
            key_field: "UUID",
            key_kind: FieldKind::Text,
            indexed: &[("Name", FieldKind::Text), ("City", FieldKind::Text)],
        };
        assert!(schema.validate().is_ok());
    }

    #[test]
    fn test_non_string_key_rejected() {
        let schema = RecordSchema {
            key_field: "Id",
            key_kind: FieldKind::Integer,
            indexed: &[],
        };
        assert!(matches!(
            schema.validate(),
            Err(StoreError::KeyFieldNotString(_))
        ));
    }

    #[test]
    fn test_missing_key_field_rejected() {
        let schema = RecordSchema {
            key_field: "",
            key_kind: FieldKind::Text,
            indexed: &[],
        };
        assert!(matches!(
            schema.validate(),
            Err(StoreError::KeyFieldNotFound(_))
        ));
    }

    #[test]
    fn test_integer_index_rejected() {
        let schema = RecordSchema {
            key_field: "UUID",
            key_kind: FieldKind::Text,
            indexed: &[("Age", FieldKind::Integer)],
        };
        match schema.validate() {
            Err(StoreError::IndexFieldType { field, kind }) => {
                assert_eq!(field, "Age");
                assert_eq!(kind, FieldKind::Integer);
            }
            other => panic!("expected IndexFieldType, got {:?}", other),
        }
    }

    #[test]
    fn test_reserved_index_name_rejected() {
        let schema = RecordSchema {
            key_field: "UUID",
            key_kind: FieldKind::Text,
            indexed: &[("__primary_key", FieldKind::Text)],
        };
        assert!(schema.validate().is_err());
    }
}
