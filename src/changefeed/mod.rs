//! # AeroDB Change Feeds
//!
//! Turns table writes into ordered change records delivered to consumers.
//!
//! ## Architecture
//!
//! - **Record**: `{old_val, new_val}` pair per mutation, plus state markers
//! - **Buffer**: per-feed FIFO with a soft high-water mark
//! - **Mode**: first-use-wins choice between pull and push consumption
//! - **Listeners**: ordered push callbacks with snapshot delivery
//! - **Feed**: the consumer handle tying these together

pub mod buffer;
pub mod errors;
pub mod feed;
pub mod listeners;
pub mod mode;
pub mod record;

pub use buffer::ChangeBuffer;
pub use errors::{FeedError, FeedResult};
pub use feed::{Feed, FeedChannel, FeedSettings, FeedState, SubscriptionId, SubscriptionOwner};
pub use listeners::{FeedEvent, Listener, ListenerId, ListenerSet};
pub use mode::{DispatchMode, ModeController};
pub use record::{ChangeKind, ChangeRecord, Document, StreamState};
