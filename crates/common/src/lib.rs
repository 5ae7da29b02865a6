//! Wire types shared between the panel and the node agents.

pub mod payload;
pub mod traffic;

pub use payload::{InboundConfig, PayloadError, PayloadSummary, SyncPayload, DEFAULT_LISTEN};
pub use traffic::{InboundTrafficReport, InboundTrafficRow, InterfaceSample, TrackerMeta};

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
