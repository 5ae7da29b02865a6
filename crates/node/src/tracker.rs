//! Per-inbound, per-user byte accounting for routed connections.
//!
//! Bucket registration goes through a mutex; once a connection holds its
//! bucket, every read and write is a single atomic add.

use async_trait::async_trait;
use chrono::Utc;
use proxyfleet_common::{InboundTrafficRow, TrackerMeta};
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;

pub const UNKNOWN_TAG: &str = "_unknown";

/// Who a connection belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnMetadata {
    pub inbound: String,
    pub user: String,
}

impl ConnMetadata {
    pub fn new(inbound: &str, user: &str) -> Self {
        Self {
            inbound: inbound.to_string(),
            user: user.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct BucketCounters {
    uplink: AtomicU64,
    downlink: AtomicU64,
}

impl BucketCounters {
    fn add_uplink(&self, n: usize) {
        self.uplink.fetch_add(n as u64, Ordering::AcqRel);
    }

    fn add_downlink(&self, n: usize) {
        self.downlink.fetch_add(n as u64, Ordering::AcqRel);
    }
}

type BucketMap = BTreeMap<String, BTreeMap<String, Arc<BucketCounters>>>;

#[derive(Debug, Default)]
pub struct InboundTracker {
    buckets: Mutex<BucketMap>,
    tcp_conns: AtomicU64,
    udp_conns: AtomicU64,
}

impl InboundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, meta: &ConnMetadata) -> Arc<BucketCounters> {
        let tag = if meta.inbound.is_empty() {
            UNKNOWN_TAG
        } else {
            meta.inbound.as_str()
        };
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(tag.to_string())
            .or_default()
            .entry(meta.user.clone())
            .or_default()
            .clone()
    }

    /// Wraps a stream so reads count as uplink and writes as downlink.
    pub fn wrap_stream<S>(&self, stream: S, meta: &ConnMetadata) -> TrackedStream<S> {
        let counters = self.bucket(meta);
        self.tcp_conns.fetch_add(1, Ordering::Relaxed);
        TrackedStream {
            inner: stream,
            counters,
        }
    }

    pub fn wrap_packet<P: PacketConn>(&self, conn: P, meta: &ConnMetadata) -> TrackedPacket<P> {
        let counters = self.bucket(meta);
        self.udp_conns.fetch_add(1, Ordering::Relaxed);
        TrackedPacket {
            inner: conn,
            counters,
        }
    }

    /// Counters ordered by tag, then user. With `reset` every counter is
    /// swapped to zero, so each byte shows up in exactly one snapshot.
    pub fn snapshot(&self, reset: bool) -> Vec<InboundTrafficRow> {
        let at = Utc::now();
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rows = Vec::new();
        for (tag, users) in buckets.iter() {
            for (user, counters) in users {
                let (uplink, downlink) = if reset {
                    (
                        counters.uplink.swap(0, Ordering::AcqRel),
                        counters.downlink.swap(0, Ordering::AcqRel),
                    )
                } else {
                    (
                        counters.uplink.load(Ordering::Acquire),
                        counters.downlink.load(Ordering::Acquire),
                    )
                };
                rows.push(InboundTrafficRow {
                    tag: tag.clone(),
                    user: user.clone(),
                    uplink,
                    downlink,
                    at,
                });
            }
        }
        rows
    }

    pub fn meta(&self) -> TrackerMeta {
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        TrackerMeta {
            tracked_tags: buckets.len(),
            tracked_buckets: buckets.values().map(BTreeMap::len).sum(),
            tcp_conns: self.tcp_conns.load(Ordering::Relaxed),
            udp_conns: self.udp_conns.load(Ordering::Relaxed),
        }
    }
}

pub struct TrackedStream<S> {
    inner: S,
    counters: Arc<BucketCounters>,
}

impl<S> TrackedStream<S> {
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = buf.filled().len().saturating_sub(before);
            if read > 0 {
                self.counters.add_uplink(read);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            if *written > 0 {
                self.counters.add_downlink(*written);
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Datagram transport seen by the router.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
}

#[async_trait]
impl PacketConn for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }
}

pub struct TrackedPacket<P> {
    inner: P,
    counters: Arc<BucketCounters>,
}

#[async_trait]
impl<P: PacketConn> PacketConn for TrackedPacket<P> {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, from) = self.inner.recv_from(buf).await?;
        self.counters.add_uplink(n);
        Ok((n, from))
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let n = self.inner.send_to(buf, target).await?;
        self.counters.add_downlink(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn find<'a>(rows: &'a [InboundTrafficRow], tag: &str, user: &str) -> &'a InboundTrafficRow {
        rows.iter()
            .find(|r| r.tag == tag && r.user == user)
            .expect("bucket missing from snapshot")
    }

    #[tokio::test]
    async fn snapshot_with_reset_is_exact() {
        let tracker = InboundTracker::new();
        let (client, server) = tokio::io::duplex(64);
        let mut tracked = tracker.wrap_stream(server, &ConnMetadata::new("vless-in", "alice"));
        let mut client = client;

        tracked.write_all(b"pong").await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tracked.read_exact(&mut buf).await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();

        let first = tracker.snapshot(true);
        let row = find(&first, "vless-in", "alice");
        assert_eq!((row.uplink, row.downlink), (4, 4));

        let second = tracker.snapshot(false);
        let row = find(&second, "vless-in", "alice");
        assert_eq!((row.uplink, row.downlink), (0, 0));

        let meta = tracker.meta();
        assert_eq!(meta.tcp_conns, 1);
        assert_eq!(meta.udp_conns, 0);
        assert_eq!(meta.tracked_buckets, 1);
    }

    #[tokio::test]
    async fn missing_tag_is_coerced() {
        let tracker = InboundTracker::new();
        let (_client, server) = tokio::io::duplex(16);
        let _tracked = tracker.wrap_stream(server, &ConnMetadata::default());
        let rows = tracker.snapshot(false);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tag, UNKNOWN_TAG);
        assert_eq!(rows[0].user, "");
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_tag_then_user() {
        let tracker = InboundTracker::new();
        for (tag, user) in [("b", "zed"), ("a", "mia"), ("b", "amy"), ("a", "")] {
            let (_c, s) = tokio::io::duplex(8);
            let _ = tracker.wrap_stream(s, &ConnMetadata::new(tag, user));
        }
        let order: Vec<(String, String)> = tracker
            .snapshot(false)
            .into_iter()
            .map(|r| (r.tag, r.user))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), "".to_string()),
                ("a".to_string(), "mia".to_string()),
                ("b".to_string(), "amy".to_string()),
                ("b".to_string(), "zed".to_string()),
            ]
        );
        assert_eq!(tracker.meta().tracked_tags, 2);
    }

    #[tokio::test]
    async fn connections_share_a_bucket() {
        let tracker = InboundTracker::new();
        let meta = ConnMetadata::new("trojan-in", "bob");
        let (mut c1, s1) = tokio::io::duplex(16);
        let (mut c2, s2) = tokio::io::duplex(16);
        let mut t1 = tracker.wrap_stream(s1, &meta);
        let mut t2 = tracker.wrap_stream(s2, &meta);

        c1.write_all(b"abc").await.unwrap();
        c2.write_all(b"defgh").await.unwrap();
        let mut buf = [0u8; 8];
        let n1 = t1.read(&mut buf).await.unwrap();
        let n2 = t2.read(&mut buf).await.unwrap();

        let rows = tracker.snapshot(false);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uplink, (n1 + n2) as u64);
        assert_eq!(tracker.meta().tcp_conns, 2);
    }

    #[tokio::test]
    async fn packets_are_counted() {
        let tracker = InboundTracker::new();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();
        let tracked = tracker.wrap_packet(server, &ConnMetadata::new("ss-in", "carol"));

        client.send_to(b"hello", server_addr).await.unwrap();
        let mut buf = [0u8; 32];
        let (n, from) = tracked.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(from, client_addr);
        tracked.send_to(b"hi", client_addr).await.unwrap();

        let rows = tracker.snapshot(true);
        let row = find(&rows, "ss-in", "carol");
        assert_eq!((row.uplink, row.downlink), (5, 2));
        assert_eq!(tracker.meta().udp_conns, 1);
        assert_eq!(tracker.meta().tcp_conns, 0);
    }

    #[tokio::test]
    async fn concurrent_writers_are_never_lost_across_resets() {
        let tracker = Arc::new(InboundTracker::new());
        let meta = ConnMetadata::new("mixed-in", "dave");
        let mut writers = Vec::new();
        for _ in 0..4 {
            let (client, server) = tokio::io::duplex(1024);
            let mut tracked = tracker.wrap_stream(server, &meta);
            writers.push(tokio::spawn(async move {
                let mut client = client;
                let drain = tokio::spawn(async move {
                    let mut sink = Vec::new();
                    let _ = client.read_to_end(&mut sink).await;
                });
                for _ in 0..100 {
                    tracked.write_all(&[0u8; 10]).await.unwrap();
                }
                drop(tracked);
                drain.await.unwrap();
            }));
        }

        let mut total = 0u64;
        for _ in 0..10 {
            total += tracker.snapshot(true).iter().map(|r| r.downlink).sum::<u64>();
            tokio::task::yield_now().await;
        }
        for w in writers {
            w.await.unwrap();
        }
        total += tracker.snapshot(true).iter().map(|r| r.downlink).sum::<u64>();
        assert_eq!(total, 4 * 100 * 10);
    }
}
