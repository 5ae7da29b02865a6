//! Owns the single live engine and swaps it on every configuration push.

use chrono::{DateTime, Utc};
use proxyfleet_common::{sha256_hex, InboundConfig};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::engine::{EngineError, EngineFactory, ProxyEngine};
use crate::tracker::InboundTracker;

/// What is currently running.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AppliedConfig {
    pub hash: String,
    pub applied_at: DateTime<Utc>,
    pub inbound_tags: Vec<String>,
}

pub struct Runtime {
    factory: Arc<dyn EngineFactory>,
    tracker: Arc<InboundTracker>,
    engine: Mutex<Option<Box<dyn ProxyEngine>>>,
    last_applied: RwLock<Option<AppliedConfig>>,
}

impl Runtime {
    pub fn new(factory: Arc<dyn EngineFactory>, tracker: Arc<InboundTracker>) -> Self {
        Self {
            factory,
            tracker,
            engine: Mutex::new(None),
            last_applied: RwLock::new(None),
        }
    }

    /// Replaces the running engine.
    ///
    /// The new engine is built while the old one still serves, so build
    /// errors leave the node untouched. The old engine is closed before the
    /// new one starts, so listen ports are free when it binds. If the start
    /// fails the node is left without an engine.
    pub async fn apply(
        &self,
        inbounds: &[InboundConfig],
        raw: &[u8],
    ) -> Result<AppliedConfig, EngineError> {
        let mut slot = self.engine.lock().await;

        let mut next = self.factory.build(inbounds)?;
        next.router().attach_tracker(self.tracker.clone());

        if let Some(mut previous) = slot.take() {
            if let Err(e) = previous.close().await {
                self.set_last_applied(None);
                return Err(e);
            }
        }

        if let Err(e) = next.start().await {
            if let Err(close_err) = next.close().await {
                warn!(error = %close_err, "Failed to close engine after start failure.");
            }
            self.set_last_applied(None);
            return Err(e);
        }

        let applied = AppliedConfig {
            hash: sha256_hex(raw),
            applied_at: Utc::now(),
            inbound_tags: next.inbound_manager().tags(),
        };
        *slot = Some(next);
        self.set_last_applied(Some(applied.clone()));

        info!(
            hash = %applied.hash,
            inbounds = applied.inbound_tags.len(),
            "Configuration applied."
        );
        Ok(applied)
    }

    pub fn last_applied(&self) -> Option<AppliedConfig> {
        self.last_applied
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn is_running(&self) -> bool {
        self.engine.lock().await.is_some()
    }

    /// Closes the running engine, if any.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let mut slot = self.engine.lock().await;
        if let Some(mut engine) = slot.take() {
            engine.close().await?;
        }
        Ok(())
    }

    fn set_last_applied(&self, applied: Option<AppliedConfig>) {
        *self
            .last_applied
            .write()
            .unwrap_or_else(PoisonError::into_inner) = applied;
    }
}
