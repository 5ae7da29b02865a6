use async_trait::async_trait;
use proxyfleet_common::InboundConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{ConnectionRouter, EngineError, EngineFactory, InboundManager, ProxyEngine};

/// Binds one listener per inbound and drains whatever connects.
pub struct ListenerEngine {
    inbounds: InboundManager,
    router: Arc<ConnectionRouter>,
    cancel: CancellationToken,
    started: bool,
}

impl ListenerEngine {
    pub fn new(inbounds: &[InboundConfig]) -> Result<Self, EngineError> {
        Ok(Self {
            inbounds: InboundManager::new(inbounds)?,
            router: Arc::new(ConnectionRouter::new()),
            cancel: CancellationToken::new(),
            started: false,
        })
    }
}

#[async_trait]
impl ProxyEngine for ListenerEngine {
    async fn start(&mut self) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::AlreadyStarted);
        }
        self.started = true;
        self.inbounds
            .create_all(self.router.clone(), &self.cancel)
            .await
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.cancel.cancel();
        self.inbounds.remove_all().await
    }

    fn router(&self) -> Arc<ConnectionRouter> {
        self.router.clone()
    }

    fn inbound_manager(&self) -> &InboundManager {
        &self.inbounds
    }
}

#[derive(Default)]
pub struct ListenerEngineFactory;

impl EngineFactory for ListenerEngineFactory {
    fn build(&self, inbounds: &[InboundConfig]) -> Result<Box<dyn ProxyEngine>, EngineError> {
        Ok(Box::new(ListenerEngine::new(inbounds)?))
    }
}
