use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use dashmap::DashMap;
use sea_orm::DatabaseConnection;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::MonitorError;
use crate::db::entities::{node, user};
use crate::db::enums::{TriggerSource, UserStatus};
use crate::db::services::{self, NewTrafficSample, MAX_WINDOW_DAYS};
use crate::sync::SyncOrchestrator;

/// Pulls per-user deltas and interface counters from every node, debits user
/// quotas, and runs the daily quota reset and sample retention.
pub struct TrafficMonitor {
    db: DatabaseConnection,
    orchestrator: Arc<SyncOrchestrator>,
    // Last cumulative (rx, tx) seen per node.
    interface_baseline: DashMap<i32, (u64, u64)>,
    last_daily_run: Mutex<Option<NaiveDate>>,
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

/// Whether the user's monthly quota resets on `now`'s date.
pub fn reset_due(user: &user::Model, now: DateTime<Utc>) -> bool {
    if user.traffic_reset_day <= 0 {
        return false;
    }
    let today = now.date_naive();
    let day = (user.traffic_reset_day as u32).min(days_in_month(today.year(), today.month()));
    if today.day() != day {
        return false;
    }
    user.traffic_last_reset_at
        .map(|at| at.date_naive() != today)
        .unwrap_or(true)
}

/// Bytes moved since `previous`. A counter that went backwards restarted.
fn counter_delta(previous: u64, current: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        current
    }
}

impl TrafficMonitor {
    pub fn new(db: DatabaseConnection, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            db,
            orchestrator,
            interface_baseline: DashMap::new(),
            last_daily_run: Mutex::new(None),
        }
    }

    pub async fn start_periodic_collection(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        info!(interval_seconds = period.as_secs(), "Traffic monitor started.");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Traffic monitor shutting down.");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_collection_cycle(&shutdown).await {
                        error!(error = %e, "Error during traffic collection cycle.");
                    }
                    if let Err(e) = self.run_daily_maintenance(Utc::now()).await {
                        error!(error = %e, "Error during daily traffic maintenance.");
                    }
                }
            }
        }
    }

    pub async fn run_collection_cycle(&self, shutdown: &CancellationToken) -> Result<(), MonitorError> {
        let nodes = services::list_nodes(&self.db).await?;
        for node in nodes {
            if shutdown.is_cancelled() {
                break;
            }
            if !node.has_api() {
                continue;
            }
            if let Err(e) = self.collect_inbounds(&node).await {
                warn!(node_id = node.id, error = %e, "Failed to collect inbound traffic.");
            }
            if let Err(e) = self.collect_interface(&node).await {
                warn!(node_id = node.id, error = %e, "Failed to collect interface traffic.");
            }
        }
        Ok(())
    }

    async fn collect_inbounds(&self, node: &node::Model) -> Result<(), MonitorError> {
        let report = self.orchestrator.client().inbound_traffic(node, true).await?;

        let mut users: HashMap<String, Option<i32>> = HashMap::new();
        let mut debits: HashMap<i32, i64> = HashMap::new();
        let mut samples = Vec::with_capacity(report.data.len());
        for row in report.data {
            if row.uplink == 0 && row.downlink == 0 {
                continue;
            }
            let user_id = match users.get(&row.user) {
                Some(id) => *id,
                None => {
                    let id = services::get_user_by_username(&self.db, &row.user)
                        .await?
                        .map(|u| u.id);
                    users.insert(row.user.clone(), id);
                    id
                }
            };
            let upload = i64::try_from(row.uplink).unwrap_or(i64::MAX);
            let download = i64::try_from(row.downlink).unwrap_or(i64::MAX);
            if let Some(id) = user_id {
                let debit = debits.entry(id).or_default();
                *debit = debit.saturating_add(upload.saturating_add(download));
            }
            samples.push(NewTrafficSample {
                node_id: Some(node.id),
                user_id,
                inbound_tag: Some(row.tag),
                upload,
                download,
                recorded_at: row.at,
            });
        }
        let stored = services::insert_traffic_samples(&self.db, samples).await?;
        if stored > 0 {
            debug!(node_id = node.id, samples = stored, "Stored inbound traffic samples.");
        }

        let mut exceeded_groups = BTreeSet::new();
        let now = Utc::now();
        for (user_id, bytes) in debits {
            let Some(before) = services::get_user(&self.db, user_id).await? else {
                continue;
            };
            services::add_user_traffic(&self.db, user_id, bytes).await?;
            let crossed = before.traffic_limit > 0
                && before.traffic_used < before.traffic_limit
                && before.traffic_used.saturating_add(bytes) >= before.traffic_limit;
            if crossed && before.effective_status(now) == UserStatus::Active {
                info!(user_id, username = %before.username, "User reached traffic limit.");
                exceeded_groups.extend(services::list_user_group_ids(&self.db, user_id).await?);
            }
        }
        if !exceeded_groups.is_empty() {
            let groups: Vec<i32> = exceeded_groups.into_iter().collect();
            self.orchestrator
                .sync_groups(&groups, TriggerSource::AutoUserChange)
                .await;
        }
        Ok(())
    }

    async fn collect_interface(&self, node: &node::Model) -> Result<(), MonitorError> {
        let sample = self.orchestrator.client().interface_traffic(node, None).await?;
        let current = (sample.rx_bytes, sample.tx_bytes);
        let previous = self.interface_baseline.get(&node.id).map(|entry| *entry);
        let Some((prev_rx, prev_tx)) = previous else {
            self.interface_baseline.insert(node.id, current);
            return Ok(());
        };
        let rx = counter_delta(prev_rx, sample.rx_bytes);
        let tx = counter_delta(prev_tx, sample.tx_bytes);
        if rx == 0 && tx == 0 {
            self.interface_baseline.insert(node.id, current);
            return Ok(());
        }
        // The baseline only moves once the delta is stored.
        services::insert_traffic_samples(
            &self.db,
            vec![NewTrafficSample {
                node_id: Some(node.id),
                user_id: None,
                inbound_tag: None,
                upload: i64::try_from(tx).unwrap_or(i64::MAX),
                download: i64::try_from(rx).unwrap_or(i64::MAX),
                recorded_at: sample.at,
            }],
        )
        .await?;
        self.interface_baseline.insert(node.id, current);
        Ok(())
    }

    /// Monthly quota resets and sample retention, at most once per UTC day.
    pub async fn run_daily_maintenance(&self, now: DateTime<Utc>) -> Result<(), MonitorError> {
        let today = now.date_naive();
        {
            let mut last = self
                .last_daily_run
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *last == Some(today) {
                return Ok(());
            }
            *last = Some(today);
        }

        let mut restored_groups = BTreeSet::new();
        for user in services::list_users(&self.db).await? {
            if !reset_due(&user, now) {
                continue;
            }
            let was_exceeded = user.effective_status(now) == UserStatus::TrafficExceeded;
            services::reset_user_traffic(&self.db, user.id, now).await?;
            info!(user_id = user.id, username = %user.username, "Monthly traffic quota reset.");
            if was_exceeded {
                restored_groups.extend(services::list_user_group_ids(&self.db, user.id).await?);
            }
        }
        if !restored_groups.is_empty() {
            let groups: Vec<i32> = restored_groups.into_iter().collect();
            self.orchestrator
                .sync_groups(&groups, TriggerSource::AutoUserChange)
                .await;
        }

        let purged =
            services::purge_traffic_samples(&self.db, now - ChronoDuration::days(MAX_WINDOW_DAYS))
                .await?;
        if purged > 0 {
            info!(purged, "Purged old traffic samples.");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::services::{
        create_user, node_traffic_summaries, set_user_groups, update_user, NewUser, UserChanges,
    };
    use crate::db::test_db;
    use crate::sync::orchestrator::tests::{seeded_node, FakeNodeApi};
    use chrono::TimeZone;
    use proxyfleet_common::InboundTrafficRow;
    use sea_orm::ConnectionTrait;

    fn row(tag: &str, user: &str, up: u64, down: u64) -> InboundTrafficRow {
        InboundTrafficRow {
            tag: tag.to_string(),
            user: user.to_string(),
            uplink: up,
            downlink: down,
            at: Utc::now(),
        }
    }

    async fn setup() -> (DatabaseConnection, Arc<FakeNodeApi>, TrafficMonitor, node::Model) {
        let db = test_db().await;
        let node = seeded_node(&db).await;
        let client = Arc::new(FakeNodeApi::scripted(vec![]));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            db.clone(),
            client.clone(),
            10,
            CancellationToken::new(),
        ));
        (db.clone(), client, TrafficMonitor::new(db, orchestrator), node)
    }

    #[test]
    fn reset_day_is_clamped_to_month_length() {
        let mut user = crate::sync::payload::tests::user_model(1, "a", "u");
        user.traffic_reset_day = 31;
        let feb_end = Utc.with_ymd_and_hms(2026, 2, 28, 1, 0, 0).unwrap();
        assert!(reset_due(&user, feb_end));
        let feb_mid = Utc.with_ymd_and_hms(2026, 2, 14, 1, 0, 0).unwrap();
        assert!(!reset_due(&user, feb_mid));

        user.traffic_last_reset_at = Some(feb_end);
        assert!(!reset_due(&user, feb_end + ChronoDuration::hours(3)));

        user.traffic_reset_day = 0;
        assert!(!reset_due(&user, feb_end));
    }

    #[test]
    fn decreasing_counter_counts_from_zero() {
        assert_eq!(counter_delta(100, 150), 50);
        assert_eq!(counter_delta(100, 30), 30);
    }

    #[tokio::test]
    async fn inbound_rows_debit_users_and_become_samples() {
        let (db, client, monitor, _node) = setup().await;
        let alice = services::get_user_by_username(&db, "alice").await.unwrap().unwrap();
        *client.inbound_rows.lock().unwrap() = vec![
            row("vless-in", "alice", 100, 400),
            row("vless-in", "ghost", 7, 3),
            row("vless-in", "alice", 0, 0),
        ];

        monitor.run_collection_cycle(&CancellationToken::new()).await.unwrap();

        let alice = services::get_user(&db, alice.id).await.unwrap().unwrap();
        assert_eq!(alice.traffic_used, 500);
        assert!(client.inbound_rows.lock().unwrap().is_empty());

        // The unknown user's row is unattributed and counts as node-level.
        let summaries = node_traffic_summaries(&db, None).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].upload, 7);
        assert_eq!(summaries[0].download, 3);
    }

    #[tokio::test]
    async fn interface_samples_store_deltas_after_baseline() {
        let (db, client, monitor, node) = setup().await;
        let shutdown = CancellationToken::new();

        *client.counters.lock().unwrap() = (1_000, 2_000);
        monitor.run_collection_cycle(&shutdown).await.unwrap();
        assert!(node_traffic_summaries(&db, None).await.unwrap().is_empty());

        *client.counters.lock().unwrap() = (1_500, 2_100);
        monitor.run_collection_cycle(&shutdown).await.unwrap();
        let summaries = node_traffic_summaries(&db, None).await.unwrap();
        assert_eq!(summaries[0].node_id, node.id);
        assert_eq!(summaries[0].download, 500);
        assert_eq!(summaries[0].upload, 100);
    }

    #[tokio::test]
    async fn failed_interface_insert_keeps_the_baseline() {
        let (db, client, monitor, node) = setup().await;
        let shutdown = CancellationToken::new();

        *client.counters.lock().unwrap() = (1_000, 2_000);
        monitor.run_collection_cycle(&shutdown).await.unwrap();

        db.execute_unprepared("ALTER TABLE traffic_samples RENAME TO traffic_samples_offline")
            .await
            .unwrap();
        *client.counters.lock().unwrap() = (1_300, 2_050);
        monitor.run_collection_cycle(&shutdown).await.unwrap();
        assert_eq!(*monitor.interface_baseline.get(&node.id).unwrap(), (1_000, 2_000));

        db.execute_unprepared("ALTER TABLE traffic_samples_offline RENAME TO traffic_samples")
            .await
            .unwrap();
        *client.counters.lock().unwrap() = (1_800, 2_300);
        monitor.run_collection_cycle(&shutdown).await.unwrap();
        let summaries = node_traffic_summaries(&db, None).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].download, 800);
        assert_eq!(summaries[0].upload, 300);
        assert_eq!(*monitor.interface_baseline.get(&node.id).unwrap(), (1_800, 2_300));
    }

    #[tokio::test]
    async fn named_user_traffic_from_a_live_node_is_debited() {
        use crate::db::services::{create_group, create_inbound, create_node, NewInbound, NewNode};
        use crate::sync::HttpNodeClient;
        use proxyfleet_node::{
            engine::ListenerEngineFactory, runtime::Runtime, sampler::InterfaceSampler,
            tracker::InboundTracker, web as node_web,
        };
        use tokio::io::AsyncWriteExt;
        use tokio::net::{TcpListener, TcpStream};

        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(InboundTracker::new());
        let node_state = Arc::new(node_web::AppState {
            secret_key: "node-secret".to_string(),
            state_path: dir.path().join("last_config.json"),
            traffic_interface: "eth9".to_string(),
            runtime: Arc::new(Runtime::new(Arc::new(ListenerEngineFactory), tracker.clone())),
            tracker,
            sampler: InterfaceSampler::new(dir.path().join("route"), dir.path().join("dev")),
        });
        let api = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_port = api.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(api, node_web::create_router(node_state)).await });

        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let inbound_port = free.local_addr().unwrap().port();
        drop(free);

        let db = test_db().await;
        let group = create_group(&db, "g", "").await.unwrap();
        let node = create_node(
            &db,
            NewNode {
                name: "live".into(),
                api_address: "127.0.0.1".into(),
                api_port: i32::from(api_port),
                secret_key: "node-secret".into(),
                public_address: "127.0.0.1".into(),
                group_id: Some(group.id),
            },
        )
        .await
        .unwrap();
        create_inbound(
            &db,
            NewInbound {
                node_id: node.id,
                tag: "vless-in".into(),
                protocol: "vless".into(),
                listen_port: i32::from(inbound_port),
                settings: serde_json::json!({}),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let mut members = Vec::new();
        for name in ["alice", "bob"] {
            let user = create_user(&db, NewUser { username: name.into(), ..Default::default() })
                .await
                .unwrap();
            members.push(user);
        }
        for user in &members {
            set_user_groups(&db, user.id, &[group.id]).await.unwrap();
        }

        let client = Arc::new(HttpNodeClient::new(Duration::from_secs(5)).unwrap());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            db.clone(),
            client,
            10,
            CancellationToken::new(),
        ));
        orchestrator
            .sync_node(node.id, TriggerSource::ManualSyncNode, None, &CancellationToken::new())
            .await
            .unwrap();
        let monitor = TrafficMonitor::new(db.clone(), orchestrator);

        let alice = &members[0];
        let mut request = vec![0u8];
        request.extend(uuid::Uuid::parse_str(&alice.uuid).unwrap().as_bytes());
        request.extend_from_slice(b"hello");
        let mut conn = TcpStream::connect(("127.0.0.1", inbound_port)).await.unwrap();
        conn.write_all(&request).await.unwrap();
        conn.shutdown().await.unwrap();

        let mut used = 0;
        for _ in 0..50 {
            monitor.run_collection_cycle(&CancellationToken::new()).await.unwrap();
            used = services::get_user(&db, alice.id).await.unwrap().unwrap().traffic_used;
            if used == request.len() as i64 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(used, request.len() as i64);
        let bob = services::get_user(&db, members[1].id).await.unwrap().unwrap();
        assert_eq!(bob.traffic_used, 0);
    }

    #[tokio::test]
    async fn crossing_the_limit_resyncs_the_users_groups() {
        let (db, client, monitor, node) = setup().await;
        let bob = create_user(
            &db,
            NewUser { username: "bob".into(), traffic_limit: 1_000, ..Default::default() },
        )
        .await
        .unwrap();
        set_user_groups(&db, bob.id, &[node.group_id.unwrap()]).await.unwrap();

        *client.inbound_rows.lock().unwrap() = vec![row("vless-in", "bob", 600, 600)];
        monitor.run_collection_cycle(&CancellationToken::new()).await.unwrap();

        let pushes = client.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        let users = pushes[0].1.inbounds[0].extra["users"].as_array().unwrap().clone();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["name"], "alice");
    }

    #[tokio::test]
    async fn daily_maintenance_resets_quotas_once_a_day() {
        let (db, _client, monitor, _node) = setup().await;
        let now = Utc::now();
        let carol = create_user(
            &db,
            NewUser {
                username: "carol".into(),
                traffic_limit: 10,
                traffic_reset_day: now.day() as i32,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        update_user(&db, carol.id, UserChanges { traffic_used: Some(10), ..Default::default() })
            .await
            .unwrap();

        monitor.run_daily_maintenance(now).await.unwrap();
        let carol = services::get_user(&db, carol.id).await.unwrap().unwrap();
        assert_eq!(carol.traffic_used, 0);
        assert!(carol.traffic_last_reset_at.is_some());

        update_user(&db, carol.id, UserChanges { traffic_used: Some(5), ..Default::default() })
            .await
            .unwrap();
        monitor.run_daily_maintenance(now).await.unwrap();
        let carol = services::get_user(&db, carol.id).await.unwrap().unwrap();
        assert_eq!(carol.traffic_used, 5);
    }

    #[tokio::test]
    async fn daily_maintenance_purges_old_samples() {
        let (db, _client, monitor, node) = setup().await;
        let now = Utc::now();
        services::insert_traffic_samples(
            &db,
            vec![
                NewTrafficSample {
                    node_id: Some(node.id),
                    user_id: None,
                    inbound_tag: None,
                    upload: 1,
                    download: 1,
                    recorded_at: now - ChronoDuration::days(91),
                },
                NewTrafficSample {
                    node_id: Some(node.id),
                    user_id: None,
                    inbound_tag: None,
                    upload: 2,
                    download: 2,
                    recorded_at: now - ChronoDuration::days(1),
                },
            ],
        )
        .await
        .unwrap();
        monitor.run_daily_maintenance(now).await.unwrap();
        let summaries = node_traffic_summaries(&db, None).await.unwrap();
        assert_eq!(summaries[0].samples, 1);
        assert_eq!(summaries[0].upload, 2);
    }
}
