//! Row fingerprinting and state digests

use crate::config::EntitySchema;
use crate::row::Value;
use blake3::Hasher;
use indexmap::IndexMap;

/// A hash value represented as a hex string
pub type HashValue = String;

/// Computes content fingerprints for staging rows
///
/// A fingerprint covers the domain columns of an entity in schema order.
/// Each column name and value is written with a length prefix, and each
/// value carries a type tag, so no two distinct attribute maps share an
/// encoding. The primary key and positional metadata such as the source
/// line number never participate, so the same business content always
/// hashes the same no matter where in a file it appeared.
pub struct RowFingerprinter;

impl RowFingerprinter {
    pub fn fingerprint(schema: &EntitySchema, attrs: &IndexMap<String, Value>) -> HashValue {
        let mut hasher = Hasher::new();
        write_field(&mut hasher, schema.name.as_bytes());
        for column in schema.column_names() {
            let value = attrs.get(column).unwrap_or(&Value::Null);
            write_field(&mut hasher, column.as_bytes());
            hasher.update(&[type_tag(value)]);
            if !value.is_null() {
                write_field(&mut hasher, value.canonical().as_bytes());
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Digest of a whole staging state.
    ///
    /// Takes `(entity, pk, fingerprint)` triples in any order.
    pub fn state_digest<'a, I>(entries: I) -> HashValue
    where
        I: IntoIterator<Item = (&'a str, &'a str, &'a str)>,
    {
        let mut sorted: Vec<_> = entries.into_iter().collect();
        sorted.sort_unstable();

        let mut hasher = Hasher::new();
        for (entity, pk, fingerprint) in sorted {
            write_field(&mut hasher, entity.as_bytes());
            write_field(&mut hasher, pk.as_bytes());
            write_field(&mut hasher, fingerprint.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

fn write_field(hasher: &mut Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn type_tag(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) => 2,
        Value::Float(_) => 3,
        Value::Text(_) => 4,
        Value::Date(_) => 5,
    }
}
