//! Traffic samples and the aggregation queries over them.

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, DbErr, EntityTrait, FromQueryResult, Set,
    Statement, Value,
};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::db::entities::traffic_sample;

#[derive(Debug, Clone)]
pub struct NewTrafficSample {
    pub node_id: Option<i32>,
    pub user_id: Option<i32>,
    pub inbound_tag: Option<String>,
    pub upload: i64,
    pub download: i64,
    pub recorded_at: DateTime<Utc>,
}

pub async fn insert_traffic_samples(
    db: &DatabaseConnection,
    samples: Vec<NewTrafficSample>,
) -> Result<u64, DbErr> {
    if samples.is_empty() {
        return Ok(0);
    }
    let count = samples.len() as u64;
    traffic_sample::Entity::insert_many(samples.into_iter().map(|s| traffic_sample::ActiveModel {
        node_id: Set(s.node_id),
        user_id: Set(s.user_id),
        inbound_tag: Set(s.inbound_tag),
        upload: Set(s.upload),
        download: Set(s.download),
        recorded_at: Set(s.recorded_at),
        ..Default::default()
    }))
    .exec_without_returning(db)
    .await?;
    Ok(count)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficBucket {
    Minute,
    Hour,
    Day,
}

impl TrafficBucket {
    fn strftime_format(self) -> &'static str {
        match self {
            TrafficBucket::Minute => "%Y-%m-%dT%H:%M:00Z",
            TrafficBucket::Hour => "%Y-%m-%dT%H:00:00Z",
            TrafficBucket::Day => "%Y-%m-%dT00:00:00Z",
        }
    }
}

impl FromStr for TrafficBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(TrafficBucket::Minute),
            "hour" => Ok(TrafficBucket::Hour),
            "day" => Ok(TrafficBucket::Day),
            other => Err(format!("invalid bucket: {other}")),
        }
    }
}

impl fmt::Display for TrafficBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrafficBucket::Minute => "minute",
            TrafficBucket::Hour => "hour",
            TrafficBucket::Day => "day",
        };
        f.write_str(name)
    }
}

pub const MAX_WINDOW_DAYS: i64 = 90;

/// Lower bound of an aggregation query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficWindow {
    All,
    Last(Duration),
}

impl TrafficWindow {
    /// `""` is the last 24h, `"all"` has no bound, `"<N>d"` is N days capped
    /// at 90, anything else is an `s`/`m`/`h` duration (`"2h"`, `"1h30m"`)
    /// of at least one minute.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Some(TrafficWindow::Last(Duration::hours(24)));
        }
        if raw.eq_ignore_ascii_case("all") {
            return Some(TrafficWindow::All);
        }
        if let Some(days) = raw.strip_suffix('d') {
            let days = days.parse::<i64>().ok().filter(|d| *d > 0)?;
            return Some(TrafficWindow::Last(Duration::days(days.min(MAX_WINDOW_DAYS))));
        }

        let mut total = 0i64;
        let mut digits = String::new();
        for c in raw.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let value = digits.parse::<i64>().ok()?;
            digits.clear();
            let unit = match c {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                _ => return None,
            };
            total = total.checked_add(value.checked_mul(unit)?)?;
        }
        if !digits.is_empty() || total < 60 {
            return None;
        }
        let capped = total.min(MAX_WINDOW_DAYS * 86_400);
        Some(TrafficWindow::Last(Duration::seconds(capped)))
    }

    pub fn since(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TrafficWindow::All => None,
            TrafficWindow::Last(span) => Some(now - span),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeTrafficSummary {
    pub node_id: i32,
    pub upload: i64,
    pub download: i64,
    pub inbound_tags: i64,
    pub samples: i64,
    pub last_recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotalTrafficSummary {
    pub upload: i64,
    pub download: i64,
    pub inbound_tags: i64,
    pub samples: i64,
    pub nodes: i64,
    pub last_recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromQueryResult)]
pub struct TrafficPoint {
    pub bucket: String,
    pub upload: i64,
    pub download: i64,
}

#[derive(Debug, FromQueryResult)]
struct NodeSummaryRow {
    node_id: i32,
    upload: i64,
    download: i64,
    inbound_tags: i64,
    samples: i64,
    last_recorded_at: Option<String>,
}

#[derive(Debug, FromQueryResult)]
struct TotalSummaryRow {
    upload: i64,
    download: i64,
    inbound_tags: i64,
    samples: i64,
    nodes: i64,
    last_recorded_at: Option<String>,
}

fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|at| at.with_timezone(&Utc))
}

/// `WHERE` clause shared by every aggregation: node-level rows only.
fn where_clause(since: Option<DateTime<Utc>>, node_id: Option<i32>) -> (String, Vec<Value>) {
    let mut sql = String::from(" WHERE user_id IS NULL");
    let mut values = Vec::new();
    if let Some(since) = since {
        sql.push_str(" AND recorded_at >= ?");
        values.push(since.into());
    }
    if let Some(node_id) = node_id {
        sql.push_str(" AND node_id = ?");
        values.push(node_id.into());
    }
    (sql, values)
}

pub async fn node_traffic_summaries(
    db: &DatabaseConnection,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<NodeTrafficSummary>, DbErr> {
    let (filter, values) = where_clause(since, None);
    let sql = format!(
        "SELECT node_id, \
         COALESCE(SUM(upload), 0) AS upload, \
         COALESCE(SUM(download), 0) AS download, \
         COUNT(DISTINCT inbound_tag) AS inbound_tags, \
         COUNT(*) AS samples, \
         MAX(recorded_at) AS last_recorded_at \
         FROM traffic_samples{filter} AND node_id IS NOT NULL \
         GROUP BY node_id ORDER BY node_id"
    );
    let rows = NodeSummaryRow::find_by_statement(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        sql,
        values,
    ))
    .all(db)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| NodeTrafficSummary {
            node_id: row.node_id,
            upload: row.upload,
            download: row.download,
            inbound_tags: row.inbound_tags,
            samples: row.samples,
            last_recorded_at: parse_timestamp(row.last_recorded_at),
        })
        .collect())
}

pub async fn total_traffic_summary(
    db: &DatabaseConnection,
    since: Option<DateTime<Utc>>,
) -> Result<TotalTrafficSummary, DbErr> {
    let (filter, values) = where_clause(since, None);
    let sql = format!(
        "SELECT COALESCE(SUM(upload), 0) AS upload, \
         COALESCE(SUM(download), 0) AS download, \
         COUNT(DISTINCT inbound_tag) AS inbound_tags, \
         COUNT(*) AS samples, \
         COUNT(DISTINCT node_id) AS nodes, \
         MAX(recorded_at) AS last_recorded_at \
         FROM traffic_samples{filter}"
    );
    let row = TotalSummaryRow::find_by_statement(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        sql,
        values,
    ))
    .one(db)
    .await?;
    Ok(match row {
        Some(row) => TotalTrafficSummary {
            upload: row.upload,
            download: row.download,
            inbound_tags: row.inbound_tags,
            samples: row.samples,
            nodes: row.nodes,
            last_recorded_at: parse_timestamp(row.last_recorded_at),
        },
        None => TotalTrafficSummary {
            upload: 0,
            download: 0,
            inbound_tags: 0,
            samples: 0,
            nodes: 0,
            last_recorded_at: None,
        },
    })
}

pub async fn traffic_timeseries(
    db: &DatabaseConnection,
    since: Option<DateTime<Utc>>,
    bucket: TrafficBucket,
    node_id: Option<i32>,
) -> Result<Vec<TrafficPoint>, DbErr> {
    let (filter, values) = where_clause(since, node_id);
    let format = bucket.strftime_format();
    let sql = format!(
        "SELECT strftime('{format}', recorded_at) AS bucket, \
         COALESCE(SUM(upload), 0) AS upload, \
         COALESCE(SUM(download), 0) AS download \
         FROM traffic_samples{filter} \
         GROUP BY bucket ORDER BY bucket"
    );
    TrafficPoint::find_by_statement(Statement::from_sql_and_values(DbBackend::Sqlite, sql, values))
        .all(db)
        .await
}

/// Deletes samples recorded before `before`.
pub async fn purge_traffic_samples(
    db: &DatabaseConnection,
    before: DateTime<Utc>,
) -> Result<u64, DbErr> {
    let result = db
        .execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "DELETE FROM traffic_samples WHERE recorded_at < ?",
            [before.into()],
        ))
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use chrono::{Duration, TimeZone};

    fn sample(node_id: i32, user_id: Option<i32>, tag: Option<&str>, at: DateTime<Utc>) -> NewTrafficSample {
        NewTrafficSample {
            node_id: Some(node_id),
            user_id,
            inbound_tag: tag.map(str::to_string),
            upload: 10,
            download: 20,
            recorded_at: at,
        }
    }

    #[test]
    fn window_boundaries() {
        assert_eq!(TrafficWindow::parse(""), Some(TrafficWindow::Last(Duration::hours(24))));
        assert_eq!(TrafficWindow::parse("all"), Some(TrafficWindow::All));
        assert_eq!(TrafficWindow::parse("59s"), None);
        assert_eq!(TrafficWindow::parse("1m"), Some(TrafficWindow::Last(Duration::minutes(1))));
        assert_eq!(TrafficWindow::parse("60s"), Some(TrafficWindow::Last(Duration::minutes(1))));
        assert_eq!(TrafficWindow::parse("2h"), Some(TrafficWindow::Last(Duration::hours(2))));
        assert_eq!(TrafficWindow::parse("1h30m"), Some(TrafficWindow::Last(Duration::minutes(90))));
        assert_eq!(TrafficWindow::parse("7d"), Some(TrafficWindow::Last(Duration::days(7))));
        assert_eq!(TrafficWindow::parse("91d"), Some(TrafficWindow::Last(Duration::days(90))));
        assert_eq!(TrafficWindow::parse("abc"), None);
        assert_eq!(TrafficWindow::parse("0d"), None);
        assert_eq!(TrafficWindow::parse("15"), None);
        assert_eq!(TrafficWindow::parse("-5m"), None);
        assert!(TrafficWindow::All.since(Utc::now()).is_none());
    }

    #[tokio::test]
    async fn summaries_only_count_node_level_rows() {
        let db = test_db().await;
        let now = Utc::now();
        insert_traffic_samples(
            &db,
            vec![
                sample(1, None, None, now - Duration::minutes(5)),
                sample(1, None, Some("vless-in"), now - Duration::minutes(4)),
                sample(1, Some(7), Some("vless-in"), now - Duration::minutes(3)),
                sample(2, None, None, now - Duration::days(3)),
            ],
        )
        .await
        .unwrap();

        let recent = node_traffic_summaries(&db, Some(now - Duration::hours(24)))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].node_id, 1);
        assert_eq!(recent[0].upload, 20);
        assert_eq!(recent[0].download, 40);
        assert_eq!(recent[0].samples, 2);
        assert_eq!(recent[0].inbound_tags, 1);
        assert!(recent[0].last_recorded_at.is_some());

        let total = total_traffic_summary(&db, None).await.unwrap();
        assert_eq!(total.samples, 3);
        assert_eq!(total.nodes, 2);
        assert_eq!(total.upload, 30);

        let empty = total_traffic_summary(&db, Some(now + Duration::hours(1))).await.unwrap();
        assert_eq!(empty.samples, 0);
        assert_eq!(empty.upload, 0);
        assert!(empty.last_recorded_at.is_none());
    }

    #[tokio::test]
    async fn timeseries_buckets_by_truncation() {
        let db = test_db().await;
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 30).unwrap();
        insert_traffic_samples(
            &db,
            vec![
                sample(1, None, None, base),
                sample(1, None, None, base + Duration::seconds(20)),
                sample(1, None, None, base + Duration::minutes(50)),
                sample(2, None, None, base),
            ],
        )
        .await
        .unwrap();

        let minutes = traffic_timeseries(&db, None, TrafficBucket::Minute, Some(1)).await.unwrap();
        assert_eq!(
            minutes,
            vec![
                TrafficPoint { bucket: "2026-03-01T10:15:00Z".into(), upload: 20, download: 40 },
                TrafficPoint { bucket: "2026-03-01T11:05:00Z".into(), upload: 10, download: 20 },
            ]
        );

        let hours = traffic_timeseries(&db, None, TrafficBucket::Hour, None).await.unwrap();
        assert_eq!(hours.len(), 2);
        assert_eq!(hours[0].upload, 30);

        let days = traffic_timeseries(&db, None, TrafficBucket::Day, None).await.unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].bucket, "2026-03-01T00:00:00Z");
    }

    #[tokio::test]
    async fn purge_drops_old_rows() {
        let db = test_db().await;
        let now = Utc::now();
        insert_traffic_samples(
            &db,
            vec![sample(1, None, None, now - Duration::days(100)), sample(1, None, None, now)],
        )
        .await
        .unwrap();
        assert_eq!(purge_traffic_samples(&db, now - Duration::days(90)).await.unwrap(), 1);
    }
}
