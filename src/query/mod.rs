//! Query surface: table handles, requests and write results

mod request;
mod result;
mod table;

pub use request::{FeedOptions, Query, SubscriptionRequest};
pub use result::WriteResult;
pub use table::Table;
