//! # Transport Frames
//!
//! Messages exchanged over a session's connection. Every frame carries the
//! token of the request or subscription it belongs to.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::changefeed::{ChangeRecord, FeedError};
use crate::query::Query;

/// Frame sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Run a query; for `changes` the token becomes the subscription id
    Start { token: u64, query: Query },

    /// Stop a running feed
    Stop { token: u64 },

    /// Liveness probe
    Ping { token: u64 },
}

impl ClientFrame {
    /// Token the frame belongs to
    pub fn token(&self) -> u64 {
        match self {
            ClientFrame::Start { token, .. }
            | ClientFrame::Stop { token }
            | ClientFrame::Ping { token } => *token,
        }
    }
}

/// Category of a server-side failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The watched resource is gone
    ResourceGone,
    /// The query could not be executed
    QueryFailed,
    /// Server bug
    Internal,
}

impl ErrorKind {
    /// Convert into the client error taxonomy
    pub fn into_error(self, message: String) -> FeedError {
        match self {
            ErrorKind::ResourceGone => FeedError::ResourceGone(message),
            ErrorKind::QueryFailed => FeedError::Query(message),
            ErrorKind::Internal => FeedError::Internal(message),
        }
    }
}

/// Frame sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Query result
    Success { token: u64, payload: Value },

    /// A feed is open; batches with the same token follow
    FeedStarted { token: u64 },

    /// Change records of a feed, in emission order
    FeedBatch { token: u64, records: Vec<ChangeRecord> },

    /// A feed was stopped on request
    FeedEnded { token: u64 },

    /// Query or feed failure
    RuntimeError {
        token: u64,
        kind: ErrorKind,
        message: String,
    },

    /// Probe reply
    Pong { token: u64 },
}

impl ServerFrame {
    /// Token the frame belongs to
    pub fn token(&self) -> u64 {
        match self {
            ServerFrame::Success { token, .. }
            | ServerFrame::FeedStarted { token }
            | ServerFrame::FeedBatch { token, .. }
            | ServerFrame::FeedEnded { token }
            | ServerFrame::RuntimeError { token, .. }
            | ServerFrame::Pong { token } => *token,
        }
    }

    /// Build a runtime error frame
    pub fn error(token: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerFrame::RuntimeError {
            token,
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_parse() {
        let json = r#"{"type": "stop", "token": 7}"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame, ClientFrame::Stop { token: 7 });
        assert_eq!(frame.token(), 7);
    }

    #[test]
    fn test_server_batch_serialize() {
        let frame = ServerFrame::FeedBatch {
            token: 3,
            records: vec![ChangeRecord::insert(json!({"id": 1}))],
        };

        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["type"], "feed_batch");
        assert_eq!(wire["records"][0]["new_val"]["id"], 1);
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            ErrorKind::ResourceGone.into_error("dropped".into()),
            FeedError::ResourceGone("dropped".into())
        );
        assert_eq!(
            ErrorKind::QueryFailed.into_error("no table".into()),
            FeedError::Query("no table".into())
        );
    }
}
