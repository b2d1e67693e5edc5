//! Document table with write execution
//!
//! Each write returns its `WriteResult` and the change records it produced,
//! one per document whose stored value changed.

use std::collections::BTreeMap;

use serde_json::Value;
use uuid::Uuid;

use crate::changefeed::{ChangeRecord, Document};
use crate::query::WriteResult;

/// Primary key field
pub const PRIMARY_KEY: &str = "id";

/// Outcome of one write
pub type WriteOutcome = (WriteResult, Vec<ChangeRecord>);

/// Stored form of a primary key: its JSON text, so `1` and `"1"` differ
fn key_of(key: &Value) -> Result<String, String> {
    match key {
        Value::String(_) | Value::Number(_) => Ok(key.to_string()),
        other => Err(format!(
            "Primary key must be a string or a number, got `{}`",
            other
        )),
    }
}

/// Recursively merge `patch` into `target`. Objects merge field by field;
/// anything else is replaced.
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (field, value) in patch {
                match target.get_mut(field) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(field.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[derive(Debug, Default)]
pub struct TableData {
    docs: BTreeMap<String, Document>,
}

impl TableData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Current documents, as initial values of a feed
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.docs.values()
    }

    pub fn get(&self, key: &Value) -> Option<&Document> {
        key_of(key).ok().and_then(|k| self.docs.get(&k))
    }

    /// Insert documents in order. A missing `id` is generated; an existing
    /// one is an error for that document only.
    pub fn insert(&mut self, documents: Vec<Document>) -> WriteOutcome {
        let mut result = WriteResult::default();
        let mut records = Vec::new();

        for mut document in documents {
            if !document.is_object() {
                result.record_error(format!("Expected type OBJECT but found {}", type_name(&document)));
                continue;
            }
            let Some(fields) = document.as_object_mut() else {
                continue;
            };

            let id = match fields.get(PRIMARY_KEY) {
                Some(id) => id.clone(),
                None => {
                    let generated = Uuid::new_v4().to_string();
                    fields.insert(PRIMARY_KEY.to_string(), Value::String(generated.clone()));
                    result.generated_keys.push(generated.clone());
                    Value::String(generated)
                }
            };

            let key = match key_of(&id) {
                Ok(key) => key,
                Err(e) => {
                    result.record_error(e);
                    continue;
                }
            };
            if self.docs.contains_key(&key) {
                result.record_error(format!("Duplicate primary key `{}`: {}", PRIMARY_KEY, id));
                continue;
            }

            self.docs.insert(key, document.clone());
            result.inserted += 1;
            records.push(ChangeRecord::insert(document));
        }

        (result, records)
    }

    /// Merge `patch` into the document stored under `key`
    pub fn update(&mut self, key: &Value, patch: &Document) -> WriteOutcome {
        let mut result = WriteResult::default();

        let stored = match key_of(key) {
            Ok(k) => k,
            Err(e) => {
                result.record_error(e);
                return (result, Vec::new());
            }
        };
        if !patch.is_object() {
            result.record_error(format!("Expected type OBJECT but found {}", type_name(patch)));
            return (result, Vec::new());
        }
        if let Some(id) = patch.get(PRIMARY_KEY) {
            if id != key {
                result.record_error(format!("Primary key `{}` cannot be changed", PRIMARY_KEY));
                return (result, Vec::new());
            }
        }

        let Some(current) = self.docs.get_mut(&stored) else {
            result.skipped += 1;
            return (result, Vec::new());
        };

        let old = current.clone();
        merge(current, patch);
        if *current == old {
            result.unchanged += 1;
            return (result, Vec::new());
        }

        result.replaced += 1;
        let record = ChangeRecord::update(old, current.clone());
        (result, vec![record])
    }

    /// Replace the document with the same `id`, inserting it when absent
    pub fn replace(&mut self, document: Document) -> WriteOutcome {
        let mut result = WriteResult::default();

        let key = match document.get(PRIMARY_KEY).map(key_of) {
            Some(Ok(key)) => key,
            Some(Err(e)) => {
                result.record_error(e);
                return (result, Vec::new());
            }
            None => {
                result.record_error(format!("Replaced document must have a `{}`", PRIMARY_KEY));
                return (result, Vec::new());
            }
        };

        match self.docs.insert(key, document.clone()) {
            Some(old) if old == document => {
                result.unchanged += 1;
                (result, Vec::new())
            }
            Some(old) => {
                result.replaced += 1;
                (result, vec![ChangeRecord::update(old, document)])
            }
            None => {
                result.inserted += 1;
                (result, vec![ChangeRecord::insert(document)])
            }
        }
    }

    pub fn delete(&mut self, key: &Value) -> WriteOutcome {
        let mut result = WriteResult::default();

        let removed = match key_of(key) {
            Ok(k) => self.docs.remove(&k),
            Err(e) => {
                result.record_error(e);
                return (result, Vec::new());
            }
        };

        match removed {
            Some(old) => {
                result.deleted += 1;
                (result, vec![ChangeRecord::delete(old)])
            }
            None => {
                result.skipped += 1;
                (result, Vec::new())
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NULL",
        Value::Bool(_) => "BOOL",
        Value::Number(_) => "NUMBER",
        Value::String(_) => "STRING",
        Value::Array(_) => "ARRAY",
        Value::Object(_) => "OBJECT",
    }
}
