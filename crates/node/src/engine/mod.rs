//! The proxy engine seam. The runtime only sees [`ProxyEngine`] and
//! [`EngineFactory`]; everything protocol specific lives behind them.

pub mod identify;
pub mod inbound;
pub mod listener;
pub mod router;

use async_trait::async_trait;
use proxyfleet_common::InboundConfig;
use std::sync::Arc;
use thiserror::Error;

pub use inbound::InboundManager;
pub use listener::{ListenerEngine, ListenerEngineFactory};
pub use router::{BoxedStream, ConnectionRouter};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid inbound (tag={tag} type={kind}): {reason}")]
    InvalidInbound {
        tag: String,
        kind: String,
        reason: String,
    },
    #[error("create inbound (tag={tag} type={kind}): {source}")]
    CreateInbound {
        tag: String,
        kind: String,
        #[source]
        source: std::io::Error,
    },
    #[error("remove inbound (tag={tag}): {reason}")]
    RemoveInbound { tag: String, reason: String },
    #[error("engine already started")]
    AlreadyStarted,
}

/// A running proxy instance. `start` binds listeners, `close` releases them;
/// a closed engine is never restarted.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    async fn start(&mut self) -> Result<(), EngineError>;
    async fn close(&mut self) -> Result<(), EngineError>;
    fn router(&self) -> Arc<ConnectionRouter>;
    fn inbound_manager(&self) -> &InboundManager;
}

/// Builds an engine from inbound options without binding anything.
pub trait EngineFactory: Send + Sync {
    fn build(&self, inbounds: &[InboundConfig]) -> Result<Box<dyn ProxyEngine>, EngineError>;
}
