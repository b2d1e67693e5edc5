//! # Listener Set
//!
//! Ordered push-mode callbacks per event category.
//!
//! Delivery iterates a snapshot taken at delivery time, so callbacks may add
//! or remove listeners (including themselves) without skipping or repeating
//! anyone in the current round.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::errors::FeedError;
use super::record::ChangeRecord;

/// Default advisory listener threshold per category
pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// Event category a listener subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedEvent {
    /// A change record arrived
    Data,
    /// The feed hit its terminal error
    Error,
}

impl fmt::Display for FeedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedEvent::Data => write!(f, "data"),
            FeedEvent::Error => write!(f, "error"),
        }
    }
}

/// Callback for `data` events
pub type DataCallback = Arc<dyn Fn(&ChangeRecord) + Send + Sync>;

/// Callback for `error` events
pub type ErrorCallback = Arc<dyn Fn(&FeedError) + Send + Sync>;

/// A registered callback
#[derive(Clone)]
pub enum Listener {
    Data(DataCallback),
    Error(ErrorCallback),
}

impl Listener {
    /// Wrap a `data` callback
    pub fn data<F>(f: F) -> Self
    where
        F: Fn(&ChangeRecord) + Send + Sync + 'static,
    {
        Listener::Data(Arc::new(f))
    }

    /// Wrap an `error` callback
    pub fn error<F>(f: F) -> Self
    where
        F: Fn(&FeedError) + Send + Sync + 'static,
    {
        Listener::Error(Arc::new(f))
    }

    /// Category this listener belongs to
    pub fn event(&self) -> FeedEvent {
        match self {
            Listener::Data(_) => FeedEvent::Data,
            Listener::Error(_) => FeedEvent::Error,
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener({})", self.event())
    }
}

/// Handle returned on registration, used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// One registered listener as seen by a delivery round
#[derive(Debug, Clone)]
pub struct ListenerEntry {
    pub id: ListenerId,
    pub listener: Listener,
    once: bool,
    fired: Arc<AtomicBool>,
}

impl ListenerEntry {
    /// Whether this listener should be invoked now.
    ///
    /// `once` listeners answer true exactly one time across all snapshots.
    pub fn claim(&self) -> bool {
        !self.once || !self.fired.swap(true, Ordering::AcqRel)
    }

    /// Whether this is a one-shot listener
    pub fn is_once(&self) -> bool {
        self.once
    }
}

/// Ordered listeners for both categories
#[derive(Debug)]
pub struct ListenerSet {
    data: Vec<ListenerEntry>,
    error: Vec<ListenerEntry>,
    next_id: u64,
    max_listeners: usize,
    warned_data: bool,
    warned_error: bool,
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LISTENERS)
    }
}

impl ListenerSet {
    /// Create an empty set with an advisory threshold (0 = unlimited)
    pub fn new(max_listeners: usize) -> Self {
        Self {
            data: Vec::new(),
            error: Vec::new(),
            next_id: 1,
            max_listeners,
            warned_data: false,
            warned_error: false,
        }
    }

    /// Register a listener at the end of its category.
    ///
    /// The second value is true the first time the category exceeds the
    /// threshold; exceeding it never rejects the listener.
    pub fn add(&mut self, listener: Listener, once: bool) -> (ListenerId, bool) {
        let id = ListenerId(self.next_id);
        self.next_id += 1;

        let event = listener.event();
        let entry = ListenerEntry {
            id,
            listener,
            once,
            fired: Arc::new(AtomicBool::new(false)),
        };
        self.entries_mut(event).push(entry);

        let count = self.len(event);
        let max = self.max_listeners;
        let warned = match event {
            FeedEvent::Data => &mut self.warned_data,
            FeedEvent::Error => &mut self.warned_error,
        };
        let exceeded = max > 0 && count > max && !*warned;
        if exceeded {
            *warned = true;
        }

        (id, exceeded)
    }

    /// Remove a listener by id. Returns false if it was not registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        for entries in [&mut self.data, &mut self.error] {
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    /// Remove every listener of a category, or of both when `None`
    pub fn remove_all(&mut self, event: Option<FeedEvent>) -> usize {
        match event {
            Some(event) => {
                let entries = self.entries_mut(event);
                let n = entries.len();
                entries.clear();
                n
            }
            None => {
                let n = self.data.len() + self.error.len();
                self.data.clear();
                self.error.clear();
                n
            }
        }
    }

    /// Ids of the listeners in a category, in delivery order
    pub fn ids(&self, event: FeedEvent) -> Vec<ListenerId> {
        self.entries(event).iter().map(|e| e.id).collect()
    }

    /// Copy of a category for one delivery round
    pub fn snapshot(&self, event: FeedEvent) -> Vec<ListenerEntry> {
        self.entries(event).to_vec()
    }

    /// Number of listeners in a category
    pub fn len(&self, event: FeedEvent) -> usize {
        self.entries(event).len()
    }

    /// Check if no listener is registered at all
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.error.is_empty()
    }

    /// Change the advisory threshold (0 = unlimited)
    pub fn set_max_listeners(&mut self, n: usize) {
        self.max_listeners = n;
        self.warned_data = false;
        self.warned_error = false;
    }

    /// Current advisory threshold
    pub fn max_listeners(&self) -> usize {
        self.max_listeners
    }

    fn entries(&self, event: FeedEvent) -> &Vec<ListenerEntry> {
        match event {
            FeedEvent::Data => &self.data,
            FeedEvent::Error => &self.error,
        }
    }

    fn entries_mut(&mut self, event: FeedEvent) -> &mut Vec<ListenerEntry> {
        match event {
            FeedEvent::Data => &mut self.data,
            FeedEvent::Error => &mut self.error,
        }
    }
}
