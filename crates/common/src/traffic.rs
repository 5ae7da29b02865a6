//! Traffic reports served by the node's stats endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Byte deltas for one `(inbound tag, user)` bucket.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InboundTrafficRow {
    pub tag: String,
    pub user: String,
    pub uplink: u64,
    pub downlink: u64,
    pub at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerMeta {
    pub tracked_tags: usize,
    pub tracked_buckets: usize,
    pub tcp_conns: u64,
    pub udp_conns: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InboundTrafficReport {
    pub data: Vec<InboundTrafficRow>,
    pub reset: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<TrackerMeta>,
}

/// Cumulative host interface counters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSample {
    pub interface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub at: DateTime<Utc>,
}
