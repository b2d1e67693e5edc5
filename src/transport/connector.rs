//! # Connector
//!
//! Boundary to whatever carries frames to the server. A `Link` is one
//! physical connection: frames out, frames in. The inbound channel closing
//! means the connection is gone.

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::frame::{ClientFrame, ServerFrame};
use crate::changefeed::FeedResult;

/// An established connection
#[derive(Debug)]
pub struct Link {
    /// Frames to the server
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    /// Frames from the server
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

/// Opens connections to a server
pub trait Connector: Send + Sync {
    /// Connect to `host:port`. Fails with `ConnectionError` when the server
    /// cannot be reached.
    fn connect(&self, host: &str, port: u16) -> BoxFuture<'static, FeedResult<Link>>;
}
