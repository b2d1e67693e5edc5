//! aerodb-changefeed - live change feeds for AeroDB document tables
//!
//! A session multiplexes queries and feeds over one connection. Each feed
//! turns a table's writes into ordered `{old_val, new_val}` records,
//! consumed either by pulling or by registered listeners.

pub mod changefeed;
pub mod cli;
pub mod config;
pub mod memory;
pub mod observability;
pub mod query;
pub mod transport;

pub use changefeed::{ChangeRecord, DispatchMode, Feed, FeedError, FeedResult, FeedState, Listener};
pub use config::ChangefeedConfig;
pub use memory::MemoryServer;
pub use query::{FeedOptions, SubscriptionRequest, Table, WriteResult};
pub use transport::{Session, Usable};
