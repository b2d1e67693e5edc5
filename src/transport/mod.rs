//! # Transport
//!
//! Session, wire frames and routing of inbound batches to feeds.

mod connector;
mod frame;
mod registry;
mod session;

pub use connector::{Connector, Link};
pub use frame::{ClientFrame, ErrorKind, ServerFrame};
pub use registry::{Route, RouteOutcome, SubscriptionRegistry};
pub use session::{Response, Session, Usable};
