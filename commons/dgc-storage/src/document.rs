use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{StorageError, StorageResult};

/// Opaque structured document: a mapping of field names to JSON values.
///
/// Equality is structural. An absent document is represented as
/// `Option<Document>::None` and is distinct from `Some(Document::new())`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Create an empty document
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Read a single field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Assign a single field, returning the previous value if any
    pub fn insert<K: Into<String>>(
        &mut self,
        field: K,
        value: Value,
    ) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    /// Apply a patch as shallow field assignment
    pub fn apply_patch(&mut self, patch: &Document) {
        for (field, value) in patch.0.iter() {
            self.0.insert(field.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Encode to the byte representation used at the store boundary
    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(StorageError::serialization)
    }

    /// Decode from the byte representation used at the store boundary
    pub fn from_slice(data: &[u8]) -> StorageResult<Self> {
        serde_json::from_slice(data).map_err(StorageError::serialization)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl TryFrom<Value> for Document {
    type Error = StorageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(StorageError::serialization(format!(
                "document must be a JSON object, got {}",
                other
            ))),
        }
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
