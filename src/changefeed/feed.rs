//! # Feed
//!
//! A live subscription to one table's mutation stream.
//!
//! The transport side (`FeedChannel`) accepts batches and terminal
//! conditions from the session's transport loop. The consumer side (`Feed`)
//! exposes two disciplines, selected once per feed:
//!
//! - **Pull**: `pull()` suspends until a record or a terminal condition.
//! - **Push**: listeners (`on`/`once`) run on a per-feed pump task, or a
//!   `for_each` visitor runs on the caller's task.
//!
//! ## Close
//! `close()` discards buffered records, resolves outstanding pulls with
//! `FeedClosed`, and waits for any listener invocation in progress before it
//! returns. No delivery happens after it returns.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use super::buffer::{ChangeBuffer, DEFAULT_SOFT_LIMIT};
use super::errors::{FeedError, FeedResult};
use super::listeners::{FeedEvent, Listener, ListenerId, ListenerSet, DEFAULT_MAX_LISTENERS};
use super::mode::{DispatchMode, ModeController};
use super::record::ChangeRecord;
use crate::observability::FeedMetrics;

/// Identifier routing inbound batches to a feed.
///
/// Unique for the lifetime of the owning session.
pub type SubscriptionId = u64;

/// Releases a subscription on behalf of a closing feed
pub trait SubscriptionOwner: Send + Sync {
    /// Stop the server-side subscription and drop its routing entry
    fn release(&self, id: SubscriptionId) -> BoxFuture<'static, FeedResult<()>>;
}

/// Lifecycle state of a feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    /// Receiving records
    Open,
    /// Closed by the consumer, release in flight
    Draining,
    /// Terminal, closed by the consumer
    Closed,
    /// Terminal, holds the condition that ended it
    Errored,
}

impl FeedState {
    /// Whether no further records will be accepted
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FeedState::Open)
    }
}

/// Per-feed tuning
#[derive(Debug, Clone, Copy)]
pub struct FeedSettings {
    /// Buffer size that triggers a warning
    pub buffer_soft_limit: usize,
    /// Advisory listener threshold per category
    pub max_listeners: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            buffer_soft_limit: DEFAULT_SOFT_LIMIT,
            max_listeners: DEFAULT_MAX_LISTENERS,
        }
    }
}

type Waiter = oneshot::Sender<FeedResult<ChangeRecord>>;

/// Next thing a push consumer should do
enum Step {
    Data(ChangeRecord),
    Error(FeedError),
    Idle,
    Done,
}

struct FeedCore {
    state: FeedState,
    mode: ModeController,
    buffer: ChangeBuffer,
    /// Outstanding pulls; non-empty only while the buffer is empty
    waiters: VecDeque<Waiter>,
    listeners: ListenerSet,
    /// A `for_each` visitor owns push delivery
    iterating: bool,
    /// The listener pump task has been spawned
    pump_started: bool,
    terminal: Option<FeedError>,
    terminal_reported: bool,
}

impl FeedCore {
    /// The terminal condition the first time, `FeedClosed` afterwards
    fn take_terminal(&mut self) -> FeedError {
        match &self.terminal {
            Some(err) if !self.terminal_reported => {
                self.terminal_reported = true;
                err.clone()
            }
            _ => FeedError::FeedClosed,
        }
    }

    fn next_step(&mut self) -> Step {
        if matches!(self.state, FeedState::Draining | FeedState::Closed) {
            return Step::Done;
        }
        // Records buffered before an error are still delivered
        if let Some(record) = self.buffer.pop() {
            return Step::Data(record);
        }
        match self.state {
            FeedState::Errored if self.terminal_reported => Step::Done,
            FeedState::Errored => Step::Error(self.take_terminal()),
            _ => Step::Idle,
        }
    }

    /// Errored with nothing left to deliver but an error nobody listens for
    fn awaiting_error_listener(&self) -> bool {
        self.state == FeedState::Errored
            && !self.terminal_reported
            && self.buffer.is_empty()
            && self.listeners.len(FeedEvent::Error) == 0
    }

    /// Ended with nothing left to deliver
    fn is_finished(&self) -> bool {
        match self.state {
            FeedState::Open => false,
            FeedState::Draining | FeedState::Closed => true,
            FeedState::Errored => self.terminal_reported && self.buffer.is_empty(),
        }
    }

    fn claim_push(&mut self, operation: &str) -> FeedResult<()> {
        self.mode.claim(DispatchMode::Push, operation)?;
        if self.iterating {
            return Err(FeedError::mode_conflict(DispatchMode::Push, operation));
        }
        Ok(())
    }
}

/// Transport-facing half of a feed, held by the subscription registry
pub struct FeedChannel {
    id: SubscriptionId,
    table: String,
    opened_at: DateTime<Utc>,
    core: Mutex<FeedCore>,
    /// Wakes the push consumer
    wakeup: Notify,
    /// Held while a push consumer invokes callbacks
    delivery: tokio::sync::Mutex<()>,
    metrics: Arc<FeedMetrics>,
}

impl fmt::Debug for FeedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedChannel")
            .field("id", &self.id)
            .field("table", &self.table)
            .finish()
    }
}

impl FeedChannel {
    /// Create an open channel
    pub fn new(
        id: SubscriptionId,
        table: impl Into<String>,
        settings: FeedSettings,
        metrics: Arc<FeedMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            table: table.into(),
            opened_at: Utc::now(),
            core: Mutex::new(FeedCore {
                state: FeedState::Open,
                mode: ModeController::new(),
                buffer: ChangeBuffer::new(settings.buffer_soft_limit),
                waiters: VecDeque::new(),
                listeners: ListenerSet::new(settings.max_listeners),
                iterating: false,
                pump_started: false,
                terminal: None,
                terminal_reported: false,
            }),
            wakeup: Notify::new(),
            delivery: tokio::sync::Mutex::new(()),
            metrics,
        })
    }

    /// Subscription id
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> FeedState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, FeedCore> {
        // Callbacks never run under this lock, so poisoning only follows a
        // panic inside this module; the state is still consistent.
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept a batch from the transport, in server emission order.
    ///
    /// Returns the number of records accepted; batches reaching a feed that
    /// is no longer open are discarded.
    pub fn deliver(&self, records: Vec<ChangeRecord>) -> usize {
        let count = records.len();
        let mut core = self.lock();

        if core.state != FeedState::Open {
            self.metrics.add_discarded(count as u64);
            debug!(feed = self.id, count, state = ?core.state, "discarding late batch");
            return 0;
        }

        for record in records {
            let Some(record) = Self::hand_to_waiter(&mut core, record) else {
                self.metrics.increment_delivered();
                continue;
            };
            if core.buffer.push(record) {
                self.metrics.increment_buffer_warnings();
                warn!(
                    feed = self.id,
                    table = %self.table,
                    buffered = core.buffer.len(),
                    "change buffer over soft limit, consumer is falling behind"
                );
            }
        }
        drop(core);

        self.wakeup.notify_one();
        count
    }

    /// Satisfy the oldest live pull, or give the record back
    fn hand_to_waiter(core: &mut FeedCore, mut record: ChangeRecord) -> Option<ChangeRecord> {
        while let Some(waiter) = core.waiters.pop_front() {
            match waiter.send(Ok(record)) {
                Ok(()) => return None,
                // The pull was cancelled; try the next one
                Err(Ok(returned)) => record = returned,
                Err(Err(_)) => return None,
            }
        }
        Some(record)
    }

    /// Move an open feed to `Errored`.
    ///
    /// Returns false if the feed had already ended.
    pub fn fail(&self, err: FeedError) -> bool {
        let mut core = self.lock();
        if core.state != FeedState::Open {
            return false;
        }

        core.state = FeedState::Errored;
        core.terminal = Some(err.clone());

        while let Some(waiter) = core.waiters.pop_front() {
            let reported_before = core.terminal_reported;
            let outcome = core.take_terminal();
            if waiter.send(Err(outcome)).is_err() {
                core.terminal_reported = reported_before;
            }
        }
        drop(core);

        self.metrics.increment_feeds_errored();
        warn!(feed = self.id, table = %self.table, error = %err, "feed terminated");
        self.wakeup.notify_one();
        true
    }

    /// Start closing. Returns true if the subscription must be released.
    fn begin_close(&self) -> bool {
        let mut core = self.lock();
        let release = match core.state {
            FeedState::Open => {
                core.state = FeedState::Draining;
                true
            }
            FeedState::Errored => {
                // Closing an errored feed silences its pending error
                core.terminal_reported = true;
                false
            }
            FeedState::Draining | FeedState::Closed => return false,
        };

        let discarded = core.buffer.clear();
        if discarded > 0 {
            self.metrics.add_discarded(discarded as u64);
            debug!(feed = self.id, discarded, "dropping buffered records on close");
        }
        for waiter in core.waiters.drain(..) {
            let _ = waiter.send(Err(FeedError::FeedClosed));
        }
        // Callbacks may hold handles to this feed
        core.listeners.remove_all(None);
        drop(core);

        self.wakeup.notify_one();
        release
    }

    fn finish_close(&self) {
        let mut core = self.lock();
        if core.state == FeedState::Draining {
            core.state = FeedState::Closed;
            self.metrics.increment_feeds_closed();
        }
    }
}

/// Consumer handle of a feed
///
/// Clones share the same feed. When the last handle is dropped without
/// `close()`, the subscription is released in the background.
#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    channel: Arc<FeedChannel>,
    owner: Arc<dyn SubscriptionOwner>,
    runtime: Handle,
}

impl Drop for FeedInner {
    fn drop(&mut self) {
        if self.channel.begin_close() {
            let channel = Arc::clone(&self.channel);
            let release = self.owner.release(channel.id);
            self.runtime.spawn(async move {
                if let Err(e) = release.await {
                    debug!(feed = channel.id, error = %e, "release of dropped feed failed");
                }
                channel.finish_close();
            });
        }
    }
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed")
            .field("id", &self.id())
            .field("table", &self.table())
            .field("state", &self.state())
            .field("mode", &self.mode())
            .finish()
    }
}

impl Feed {
    /// Wrap a registered channel. Must be called inside a tokio runtime.
    pub fn new(channel: Arc<FeedChannel>, owner: Arc<dyn SubscriptionOwner>) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                channel,
                owner,
                runtime: Handle::current(),
            }),
        }
    }

    fn channel(&self) -> &Arc<FeedChannel> {
        &self.inner.channel
    }

    /// Subscription id
    pub fn id(&self) -> SubscriptionId {
        self.channel().id
    }

    /// Watched table
    pub fn table(&self) -> &str {
        &self.channel().table
    }

    /// When the subscription was opened
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.channel().opened_at
    }

    /// Current lifecycle state
    pub fn state(&self) -> FeedState {
        self.channel().state()
    }

    /// Selected consumption discipline
    pub fn mode(&self) -> DispatchMode {
        self.channel().lock().mode.mode()
    }

    /// Records received but not yet consumed
    pub fn buffered(&self) -> usize {
        self.channel().lock().buffer.len()
    }

    // ==================
    // Pull
    // ==================

    /// Wait for the next record.
    ///
    /// Fails immediately with `ModeConflict` if the feed is in push mode.
    /// Once the feed ends, returns its terminal condition one time and
    /// `FeedClosed` after that.
    pub async fn pull(&self) -> FeedResult<ChangeRecord> {
        let channel = self.channel();
        let receiver = {
            let mut core = channel.lock();
            core.mode.claim(DispatchMode::Pull, "pull()")?;

            if let Some(record) = core.buffer.pop() {
                channel.metrics.increment_delivered();
                return Ok(record);
            }
            match core.state {
                FeedState::Open => {}
                FeedState::Draining | FeedState::Closed => return Err(FeedError::FeedClosed),
                FeedState::Errored => return Err(core.take_terminal()),
            }

            let (tx, rx) = oneshot::channel();
            core.waiters.push_back(tx);
            rx
        };

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(FeedError::FeedClosed),
        }
    }

    /// Pull records as a stream.
    ///
    /// The stream yields the terminal error (if any) once and ends when the
    /// feed is closed.
    pub fn into_stream(self) -> impl Stream<Item = FeedResult<ChangeRecord>> {
        stream::unfold(Some(self), |feed| async move {
            let feed = feed?;
            match feed.pull().await {
                Ok(record) => Some((Ok(record), Some(feed))),
                Err(FeedError::FeedClosed) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    // ==================
    // Push
    // ==================

    /// Invoke `visitor` for each record as it arrives, on the caller's task.
    ///
    /// Returning `false` from the visitor stops iteration and leaves the
    /// feed open. A terminal error is passed to the visitor once and then
    /// returned. Fails with `ModeConflict` if the feed is in pull mode or
    /// listeners have been registered.
    pub async fn for_each<F>(&self, mut visitor: F) -> FeedResult<()>
    where
        F: FnMut(Result<&ChangeRecord, &FeedError>) -> bool,
    {
        let channel = self.channel();
        {
            let mut core = channel.lock();
            core.mode.claim(DispatchMode::Push, "for_each()")?;
            if core.pump_started || core.iterating {
                return Err(FeedError::mode_conflict(DispatchMode::Push, "for_each()"));
            }
            if matches!(core.state, FeedState::Draining | FeedState::Closed) {
                return Err(FeedError::FeedClosed);
            }
            core.iterating = true;
        }
        let _iteration = IterationGuard(channel.as_ref());

        loop {
            let delivery = channel.delivery.lock().await;
            let step = channel.lock().next_step();
            match step {
                Step::Data(record) => {
                    channel.metrics.increment_delivered();
                    if !visitor(Ok(&record)) {
                        return Ok(());
                    }
                }
                Step::Error(err) => {
                    visitor(Err(&err));
                    return Err(err);
                }
                Step::Done => return Ok(()),
                Step::Idle => {
                    drop(delivery);
                    channel.wakeup.notified().await;
                }
            }
        }
    }

    /// Register a listener. Locks the feed into push mode.
    ///
    /// Fails with `FeedClosed` once the feed has nothing left to deliver.
    pub fn on(&self, listener: Listener) -> FeedResult<ListenerId> {
        self.add_listener(listener, false, "on()")
    }

    /// Register a listener that fires at most once
    pub fn once(&self, listener: Listener) -> FeedResult<ListenerId> {
        self.add_listener(listener, true, "once()")
    }

    fn add_listener(&self, listener: Listener, once: bool, operation: &str) -> FeedResult<ListenerId> {
        let channel = self.channel();
        let event = listener.event();

        let (id, start_pump) = {
            let mut core = channel.lock();
            core.claim_push(operation)?;
            if core.is_finished() {
                return Err(FeedError::FeedClosed);
            }

            let (id, exceeded) = core.listeners.add(listener, once);
            if exceeded {
                warn!(
                    feed = channel.id,
                    event = %event,
                    count = core.listeners.len(event),
                    max = core.listeners.max_listeners(),
                    "possible listener leak: listener count exceeds threshold"
                );
            }
            let start_pump = !core.pump_started;
            core.pump_started = true;
            (id, start_pump)
        };

        if start_pump {
            self.inner.runtime.spawn(pump(Arc::clone(channel)));
        }
        channel.wakeup.notify_one();
        Ok(id)
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> FeedResult<bool> {
        let mut core = self.channel().lock();
        core.claim_push("remove_listener()")?;
        Ok(core.listeners.remove(id))
    }

    /// Remove all listeners of a category, or of both when `None`
    pub fn remove_all_listeners(&self, event: Option<FeedEvent>) -> FeedResult<usize> {
        let mut core = self.channel().lock();
        core.claim_push("remove_all_listeners()")?;
        Ok(core.listeners.remove_all(event))
    }

    /// Registered listeners of a category, in delivery order
    pub fn listeners(&self, event: FeedEvent) -> FeedResult<Vec<ListenerId>> {
        let mut core = self.channel().lock();
        core.claim_push("listeners()")?;
        Ok(core.listeners.ids(event))
    }

    /// Set the advisory listener threshold (0 = unlimited)
    pub fn set_max_listeners(&self, n: usize) -> FeedResult<()> {
        let mut core = self.channel().lock();
        core.claim_push("set_max_listeners()")?;
        core.listeners.set_max_listeners(n);
        Ok(())
    }

    // ==================
    // Close
    // ==================

    /// Close the feed and release its subscription.
    ///
    /// Buffered records are dropped. Closing an ended feed is a no-op.
    pub async fn close(&self) -> FeedResult<()> {
        let channel = self.channel();
        let release = channel.begin_close();

        // Wait out a callback already running
        drop(channel.delivery.lock().await);

        if !release {
            return Ok(());
        }

        let result = self.inner.owner.release(channel.id).await;
        channel.finish_close();
        info!(feed = channel.id, table = %channel.table, "feed closed");
        result
    }
}

struct IterationGuard<'a>(&'a FeedChannel);

impl Drop for IterationGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().iterating = false;
    }
}

/// Push delivery loop for listener mode, one task per feed
async fn pump(channel: Arc<FeedChannel>) {
    debug!(feed = channel.id, "push delivery started");

    loop {
        let delivery = channel.delivery.lock().await;
        let (step, entries) = {
            let mut core = channel.lock();
            let step = if core.awaiting_error_listener() {
                // No more data can arrive; hold the error for a late listener
                core.listeners.remove_all(Some(FeedEvent::Data));
                Step::Idle
            } else {
                core.next_step()
            };
            let entries = match step {
                Step::Data(_) => core.listeners.snapshot(FeedEvent::Data),
                Step::Error(_) => core.listeners.snapshot(FeedEvent::Error),
                Step::Idle | Step::Done => Vec::new(),
            };
            (step, entries)
        };

        match step {
            Step::Data(record) => {
                if entries.is_empty() {
                    channel.metrics.add_discarded(1);
                    continue;
                }
                channel.metrics.increment_delivered();
                for entry in entries {
                    if !entry.claim() {
                        continue;
                    }
                    if entry.is_once() {
                        channel.lock().listeners.remove(entry.id);
                    }
                    if let Listener::Data(callback) = &entry.listener {
                        callback(&record);
                    }
                }
            }
            Step::Error(err) => {
                for entry in entries {
                    if !entry.claim() {
                        continue;
                    }
                    if entry.is_once() {
                        channel.lock().listeners.remove(entry.id);
                    }
                    if let Listener::Error(callback) = &entry.listener {
                        callback(&err);
                    }
                }
                break;
            }
            Step::Done => break,
            Step::Idle => {
                drop(delivery);
                channel.wakeup.notified().await;
            }
        }
    }

    channel.lock().listeners.remove_all(None);
    debug!(feed = channel.id, "push delivery stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures_util::FutureExt;
    use futures_util::StreamExt;
    use serde_json::json;

    /// Owner that records releases instead of talking to a server
    #[derive(Default)]
    struct CountingOwner {
        released: AtomicUsize,
    }

    impl SubscriptionOwner for CountingOwner {
        fn release(&self, _id: SubscriptionId) -> BoxFuture<'static, FeedResult<()>> {
            self.released.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        }
    }

    fn open_feed() -> (Feed, Arc<FeedChannel>, Arc<CountingOwner>) {
        let channel = FeedChannel::new(1, "posts", FeedSettings::default(), Arc::new(FeedMetrics::new()));
        let owner = Arc::new(CountingOwner::default());
        let feed = Feed::new(Arc::clone(&channel), owner.clone());
        (feed, channel, owner)
    }

    fn insert(i: i64) -> ChangeRecord {
        ChangeRecord::insert(json!({ "id": i }))
    }

    #[tokio::test]
    async fn test_pull_returns_buffered_in_order() {
        let (feed, channel, _) = open_feed();
        channel.deliver(vec![insert(1), insert(2)]);
        channel.deliver(vec![insert(3)]);

        for i in 1..=3 {
            let rec = feed.pull().await.unwrap();
            assert_eq!(rec.new_val().unwrap()["id"], i);
        }
        assert_eq!(feed.mode(), DispatchMode::Pull);
    }

    #[tokio::test]
    async fn test_pending_pull_satisfied_without_buffering() {
        let (feed, channel, _) = open_feed();

        let puller = feed.clone();
        let handle = tokio::spawn(async move { puller.pull().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.deliver(vec![insert(7)]);
        let rec = handle.await.unwrap().unwrap();
        assert_eq!(rec.new_val().unwrap()["id"], 7);
        assert_eq!(feed.buffered(), 0);
    }

    #[tokio::test]
    async fn test_close_resolves_pending_pull() {
        let (feed, _, owner) = open_feed();

        let puller = feed.clone();
        let handle = tokio::spawn(async move { puller.pull().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        feed.close().await.unwrap();
        assert_eq!(handle.await.unwrap(), Err(FeedError::FeedClosed));
        assert_eq!(feed.state(), FeedState::Closed);
        assert_eq!(owner.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_discards_buffer_and_late_batches() {
        let (feed, channel, _) = open_feed();
        channel.deliver(vec![insert(1), insert(2)]);

        feed.close().await.unwrap();
        assert_eq!(channel.deliver(vec![insert(3)]), 0);
        assert_eq!(feed.pull().await, Err(FeedError::FeedClosed));
    }

    #[tokio::test]
    async fn test_close_twice_releases_once() {
        let (feed, _, owner) = open_feed();
        feed.close().await.unwrap();
        feed.close().await.unwrap();
        assert_eq!(owner.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminal_error_surfaces_once_after_buffered_records() {
        let (feed, channel, _) = open_feed();
        channel.deliver(vec![insert(1)]);
        assert!(channel.fail(FeedError::ResourceGone("posts".into())));
        assert!(!channel.fail(FeedError::ResourceGone("posts".into())));

        assert!(feed.pull().await.is_ok());
        assert_eq!(feed.pull().await, Err(FeedError::ResourceGone("posts".into())));
        assert_eq!(feed.pull().await, Err(FeedError::FeedClosed));
        assert_eq!(feed.state(), FeedState::Errored);
    }

    #[tokio::test]
    async fn test_pull_after_listener_conflicts() {
        let (feed, _, _) = open_feed();
        feed.on(Listener::data(|_| {})).unwrap();

        let err = feed.pull().await.unwrap_err();
        assert!(matches!(err, FeedError::ModeConflict { current: DispatchMode::Push, .. }));
    }

    #[tokio::test]
    async fn test_listener_after_pull_conflicts() {
        let (feed, channel, _) = open_feed();
        channel.deliver(vec![insert(1)]);
        feed.pull().await.unwrap();

        assert!(matches!(
            feed.on(Listener::data(|_| {})),
            Err(FeedError::ModeConflict { current: DispatchMode::Pull, .. })
        ));
        assert!(feed.listeners(FeedEvent::Data).is_err());
        assert!(feed.for_each(|_| true).await.is_err());
    }

    #[tokio::test]
    async fn test_listeners_receive_in_order() {
        let (feed, channel, _) = open_feed();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        feed.on(Listener::data(move |rec| {
            sink.lock().unwrap().push(rec.new_val().unwrap()["id"].as_i64().unwrap());
        }))
        .unwrap();

        channel.deliver(vec![insert(1), insert(2), insert(3)]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_once_listener_fires_once() {
        let (feed, channel, _) = open_feed();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let id = feed
            .once(Listener::data(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        feed.on(Listener::data(|_| {})).unwrap();

        channel.deliver(vec![insert(1), insert(2), insert(3)]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!feed.listeners(FeedEvent::Data).unwrap().contains(&id));
    }

    #[tokio::test]
    async fn test_single_error_event() {
        let (feed, channel, _) = open_feed();
        let errors = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&errors);
        feed.on(Listener::error(move |err| {
            assert!(matches!(err, FeedError::ResourceGone(_)));
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        channel.fail(FeedError::ResourceGone("posts".into()));
        channel.fail(FeedError::ResourceGone("posts".into()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_for_each_stops_on_false() {
        let (feed, channel, _) = open_feed();
        channel.deliver(vec![insert(1), insert(2), insert(3)]);

        let mut seen = Vec::new();
        feed.for_each(|item| {
            seen.push(item.unwrap().new_val().unwrap()["id"].as_i64().unwrap());
            seen.len() < 2
        })
        .await
        .unwrap();

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(feed.state(), FeedState::Open);
    }

    #[tokio::test]
    async fn test_for_each_rejects_listeners_while_running() {
        let (feed, channel, _) = open_feed();

        let iterating = feed.clone();
        let handle = tokio::spawn(async move { iterating.for_each(|_| true).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(feed.on(Listener::data(|_| {})), Err(FeedError::ModeConflict { .. })));

        channel.fail(FeedError::ConnectionError("reset".into()));
        assert_eq!(
            handle.await.unwrap(),
            Err(FeedError::ConnectionError("reset".into()))
        );
    }

    #[tokio::test]
    async fn test_into_stream_ends_on_close() {
        let (feed, channel, _) = open_feed();
        channel.deliver(vec![insert(1), insert(2)]);

        let closer = feed.clone();
        let mut stream = Box::pin(feed.into_stream());
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());

        closer.close().await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_last_handle_releases() {
        let (feed, channel, owner) = open_feed();
        drop(feed);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(channel.state(), FeedState::Closed);
        assert_eq!(owner.released.load(Ordering::SeqCst), 1);
    }
}
