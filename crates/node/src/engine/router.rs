use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::tracker::{ConnMetadata, InboundTracker, PacketConn};

/// Combined trait for async read + write.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

pub type BoxedStream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Every accepted connection passes through here before it reaches a
/// handler. When a tracker is attached, connections are wrapped for
/// byte accounting.
#[derive(Default)]
pub struct ConnectionRouter {
    tracker: RwLock<Option<Arc<InboundTracker>>>,
}

impl ConnectionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_tracker(&self, tracker: Arc<InboundTracker>) {
        *self.tracker.write().unwrap_or_else(PoisonError::into_inner) = Some(tracker);
    }

    pub fn has_tracker(&self) -> bool {
        self.tracker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn current_tracker(&self) -> Option<Arc<InboundTracker>> {
        self.tracker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn route_stream<S>(&self, stream: S, meta: &ConnMetadata) -> BoxedStream
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self.current_tracker() {
            Some(tracker) => Box::new(tracker.wrap_stream(stream, meta)),
            None => Box::new(stream),
        }
    }

    pub fn route_packet<P>(&self, conn: P, meta: &ConnMetadata) -> Box<dyn PacketConn>
    where
        P: PacketConn + 'static,
    {
        match self.current_tracker() {
            Some(tracker) => Box::new(tracker.wrap_packet(conn, meta)),
            None => Box::new(conn),
        }
    }
}
