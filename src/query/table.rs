//! # Table Handle
//!
//! Named entry point for writes and change subscriptions on one table.

use serde_json::Value;

use super::request::{FeedOptions, Query, SubscriptionRequest};
use super::result::WriteResult;
use crate::changefeed::{Document, Feed, FeedError, FeedResult};
use crate::transport::Session;

/// A table reached through a session
#[derive(Debug, Clone)]
pub struct Table {
    session: Session,
    name: String,
}

impl Table {
    pub(crate) fn new(session: Session, name: impl Into<String>) -> Self {
        Self {
            session,
            name: name.into(),
        }
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscription request for this table with default options
    pub fn subscription(&self) -> SubscriptionRequest {
        SubscriptionRequest::new(self.name.clone())
    }

    /// Open a change feed
    pub async fn changes(&self) -> FeedResult<Feed> {
        self.session.subscribe(&self.subscription()).await
    }

    /// Open a change feed with options
    pub async fn changes_with(&self, options: FeedOptions) -> FeedResult<Feed> {
        let request = self.subscription().with_options(options);
        self.session.subscribe(&request).await
    }

    // ==================
    // Writes
    // ==================

    pub async fn insert(&self, document: Document) -> FeedResult<WriteResult> {
        self.insert_many(vec![document]).await
    }

    /// Insert documents in order; each emits one change record
    pub async fn insert_many(&self, documents: Vec<Document>) -> FeedResult<WriteResult> {
        self.write(Query::Insert {
            table: self.name.clone(),
            documents,
        })
        .await
    }

    /// Merge `patch` into the document with primary key `key`
    pub async fn update(&self, key: impl Into<Value>, patch: Document) -> FeedResult<WriteResult> {
        self.write(Query::Update {
            table: self.name.clone(),
            key: key.into(),
            patch,
        })
        .await
    }

    /// Replace the document with the same `id`, inserting it if absent
    pub async fn replace(&self, document: Document) -> FeedResult<WriteResult> {
        self.write(Query::Replace {
            table: self.name.clone(),
            document,
        })
        .await
    }

    pub async fn delete(&self, key: impl Into<Value>) -> FeedResult<WriteResult> {
        self.write(Query::Delete {
            table: self.name.clone(),
            key: key.into(),
        })
        .await
    }

    /// Fetch a document by primary key
    pub async fn get(&self, key: impl Into<Value>) -> FeedResult<Option<Document>> {
        let value = self
            .session
            .execute(Query::Get {
                table: self.name.clone(),
                key: key.into(),
            })
            .await?;

        Ok(match value {
            Value::Null => None,
            doc => Some(doc),
        })
    }

    async fn write(&self, query: Query) -> FeedResult<WriteResult> {
        let payload = self.session.execute(query).await?;
        serde_json::from_value(payload)
            .map_err(|e| FeedError::Internal(format!("invalid write result: {}", e)))
    }
}
