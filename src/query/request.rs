//! # Query Requests
//!
//! Requests a session sends to the server. The server owns execution; this
//! crate only needs their shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::changefeed::Document;

/// Options of a change subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedOptions {
    /// Emit `initializing`/`ready` state markers
    #[serde(default)]
    pub include_states: bool,

    /// Emit the current contents of the table before live changes
    #[serde(default)]
    pub include_initial: bool,
}

impl FeedOptions {
    /// Request state markers
    pub fn with_states(mut self) -> Self {
        self.include_states = true;
        self
    }

    /// Request initial values
    pub fn with_initial(mut self) -> Self {
        self.include_initial = true;
        self
    }
}

/// Request that opens a change feed on one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Watched table
    pub table: String,

    /// Feed options
    #[serde(default)]
    pub options: FeedOptions,
}

impl SubscriptionRequest {
    /// Subscribe to `table` with default options
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            options: FeedOptions::default(),
        }
    }

    /// Replace the options
    pub fn with_options(mut self, options: FeedOptions) -> Self {
        self.options = options;
        self
    }

    /// The query this request sends
    pub fn to_query(&self) -> Query {
        Query::Changes {
            table: self.table.clone(),
            options: self.options,
        }
    }
}

/// A request to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Query {
    /// Open a change feed
    Changes { table: String, options: FeedOptions },

    /// Insert documents; missing `id` fields are generated
    Insert { table: String, documents: Vec<Document> },

    /// Merge `patch` into the document with primary key `key`
    Update { table: String, key: Value, patch: Document },

    /// Replace (or insert) a whole document, keyed by its `id`
    Replace { table: String, document: Document },

    /// Delete the document with primary key `key`
    Delete { table: String, key: Value },

    /// Fetch one document by primary key
    Get { table: String, key: Value },

    /// Create a table
    TableCreate { name: String },

    /// Drop a table, ending every feed on it
    TableDrop { name: String },

    /// List table names
    TableList,
}

impl Query {
    /// Whether running this query opens a feed instead of returning a value
    pub fn is_feed(&self) -> bool {
        matches!(self, Query::Changes { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscription_request_query() {
        let req = SubscriptionRequest::new("posts").with_options(FeedOptions::default().with_states());
        let query = req.to_query();

        assert!(query.is_feed());
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({
                "op": "changes",
                "table": "posts",
                "options": {"include_states": true, "include_initial": false}
            })
        );
    }

    #[test]
    fn test_write_query_not_feed() {
        let query = Query::Delete {
            table: "posts".into(),
            key: json!(1),
        };
        assert!(!query.is_feed());
    }
}
