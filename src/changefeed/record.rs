//! # Change Records
//!
//! One record per mutation: the document before and after the write.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// A stored document (JSON object keyed by `id`)
pub type Document = Value;

/// Kind of change a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// Document inserted (`old_val` absent)
    Insert,
    /// Document updated or replaced (both values present)
    Update,
    /// Document deleted (`new_val` absent)
    Delete,
    /// Control notification, carries no document
    State,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Insert => write!(f, "INSERT"),
            ChangeKind::Update => write!(f, "UPDATE"),
            ChangeKind::Delete => write!(f, "DELETE"),
            ChangeKind::State => write!(f, "STATE"),
        }
    }
}

/// Feed state marker emitted when states are requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Initial values are being sent
    Initializing,
    /// Live changes follow
    Ready,
}

/// Immutable change record
///
/// Data records serialize as the `{old_val, new_val}` pair with `null` for
/// the absent side; state markers serialize as `{state}` alone.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "WireRecord")]
pub struct ChangeRecord {
    /// Document before the write
    old_val: Option<Document>,

    /// Document after the write
    new_val: Option<Document>,

    /// Set only on control notifications
    state: Option<StreamState>,
}

/// Record as it appears on the wire, before shape checks
#[derive(Deserialize)]
struct WireRecord {
    #[serde(default)]
    old_val: Option<Document>,
    #[serde(default)]
    new_val: Option<Document>,
    #[serde(default)]
    state: Option<StreamState>,
}

impl TryFrom<WireRecord> for ChangeRecord {
    type Error = String;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        match (&wire.old_val, &wire.new_val, wire.state) {
            (None, None, None) => Err("change record has no values and no state".to_string()),
            (Some(_), _, Some(_)) | (_, Some(_), Some(_)) => {
                Err("state marker must not carry values".to_string())
            }
            _ => Ok(Self {
                old_val: wire.old_val,
                new_val: wire.new_val,
                state: wire.state,
            }),
        }
    }
}

impl Serialize for ChangeRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.state {
            Some(state) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("state", &state)?;
                map.end()
            }
            None => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("old_val", &self.old_val)?;
                map.serialize_entry("new_val", &self.new_val)?;
                map.end()
            }
        }
    }
}

impl ChangeRecord {
    /// Record for an inserted document
    pub fn insert(new_val: Document) -> Self {
        Self {
            old_val: None,
            new_val: Some(new_val),
            state: None,
        }
    }

    /// Record for an updated or replaced document
    pub fn update(old_val: Document, new_val: Document) -> Self {
        Self {
            old_val: Some(old_val),
            new_val: Some(new_val),
            state: None,
        }
    }

    /// Record for a deleted document
    pub fn delete(old_val: Document) -> Self {
        Self {
            old_val: Some(old_val),
            new_val: None,
            state: None,
        }
    }

    /// Control notification with no document
    pub fn state(state: StreamState) -> Self {
        Self {
            old_val: None,
            new_val: None,
            state: Some(state),
        }
    }

    /// Document before the write
    pub fn old_val(&self) -> Option<&Document> {
        self.old_val.as_ref()
    }

    /// Document after the write
    pub fn new_val(&self) -> Option<&Document> {
        self.new_val.as_ref()
    }

    /// State marker, if this is a control notification
    pub fn stream_state(&self) -> Option<StreamState> {
        self.state
    }

    /// True for records that carry document data
    pub fn is_data(&self) -> bool {
        self.kind() != ChangeKind::State
    }

    /// Classify the record
    pub fn kind(&self) -> ChangeKind {
        match (&self.old_val, &self.new_val, self.state) {
            (_, _, Some(_)) => ChangeKind::State,
            (None, Some(_), None) => ChangeKind::Insert,
            (Some(_), Some(_), None) => ChangeKind::Update,
            (Some(_), None, None) => ChangeKind::Delete,
            // Not constructible; decoding rejects this shape
            (None, None, None) => ChangeKind::State,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_display() {
        assert_eq!(ChangeKind::Insert.to_string(), "INSERT");
        assert_eq!(ChangeKind::Delete.to_string(), "DELETE");
    }

    #[test]
    fn test_insert_record() {
        let rec = ChangeRecord::insert(json!({"id": 1, "title": "Hello"}));
        assert_eq!(rec.kind(), ChangeKind::Insert);
        assert!(rec.old_val().is_none());
        assert_eq!(rec.new_val().unwrap()["title"], "Hello");
        assert!(rec.is_data());
    }

    #[test]
    fn test_update_and_delete_records() {
        let upd = ChangeRecord::update(json!({"id": 1, "n": 1}), json!({"id": 1, "n": 2}));
        assert_eq!(upd.kind(), ChangeKind::Update);

        let del = ChangeRecord::delete(json!({"id": 1, "n": 2}));
        assert_eq!(del.kind(), ChangeKind::Delete);
        assert!(del.new_val().is_none());
    }

    #[test]
    fn test_state_marker_distinguishable() {
        let marker = ChangeRecord::state(StreamState::Ready);
        assert_eq!(marker.kind(), ChangeKind::State);
        assert!(!marker.is_data());
        assert!(marker.old_val().is_none() && marker.new_val().is_none());

        let wire = serde_json::to_value(&marker).unwrap();
        assert_eq!(wire, json!({"state": "ready"}));
    }

    #[test]
    fn test_wire_shape() {
        let rec = ChangeRecord::delete(json!({"id": "a"}));
        let wire = serde_json::to_value(&rec).unwrap();
        assert_eq!(wire, json!({"old_val": {"id": "a"}, "new_val": null}));

        let back: ChangeRecord = serde_json::from_value(wire).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn test_insert_serializes_null_old_val() {
        let rec = ChangeRecord::insert(json!({"id": 1}));
        let wire = serde_json::to_string(&rec).unwrap();
        assert_eq!(wire, r#"{"old_val":null,"new_val":{"id":1}}"#);
    }

    #[test]
    fn test_decode_rejects_empty_record() {
        let decoded = serde_json::from_str::<ChangeRecord>(r#"{"old_val":null,"new_val":null}"#);
        assert!(decoded.is_err());
        assert!(serde_json::from_str::<ChangeRecord>("{}").is_err());
    }

    #[test]
    fn test_decode_rejects_state_with_values() {
        let decoded =
            serde_json::from_value::<ChangeRecord>(json!({"new_val": {"id": 1}, "state": "ready"}));
        assert!(decoded.is_err());
    }

    #[test]
    fn test_kind_and_is_data_agree() {
        let records = [
            ChangeRecord::insert(json!({"id": 1})),
            ChangeRecord::update(json!({"id": 1}), json!({"id": 1, "n": 1})),
            ChangeRecord::delete(json!({"id": 1})),
            ChangeRecord::state(StreamState::Initializing),
        ];
        for rec in records {
            assert_eq!(rec.is_data(), rec.kind() != ChangeKind::State);
        }
    }
}
