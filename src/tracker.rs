//! Persistent per-domain access counters for externally routed requests.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;
use tokio::task;
use tracing::{debug, info};

/// Access statistics for one external domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainAccessRecord {
    pub domain: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub request_count: u64,
    pub target_subdomain: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub total_domains: u64,
    pub total_requests: u64,
    pub active_domains_24h: u64,
}

/// Aggregate counters plus the busiest domains, as served by `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub stats: TrackerStats,
    pub top_domains: Vec<DomainAccessRecord>,
}

/// SQLite-backed tracker. Writes are serialised; reads share a lock and run
/// on their own read-only connections.
#[derive(Clone)]
pub struct DomainTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    path: PathBuf,
    gate: RwLock<()>,
    writer: Mutex<Connection>,
}

impl DomainTracker {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create tracker directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open domain tracker at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode for domain tracker")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        initialize_schema(&conn)?;

        info!(path = %path.display(), "Opened domain access tracker");
        Ok(Self {
            inner: Arc::new(TrackerInner {
                path,
                gate: RwLock::new(()),
                writer: Mutex::new(conn),
            }),
        })
    }

    /// Count one successful external routing of `domain` to `target_subdomain`.
    pub async fn record(&self, domain: &str, target_subdomain: &str) -> Result<()> {
        self.record_with(domain, target_subdomain, None).await
    }

    /// Like [`record`](Self::record) with an explicit observation time.
    pub async fn record_at(
        &self,
        domain: &str,
        target_subdomain: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        self.record_with(domain, target_subdomain, Some(seen_at)).await
    }

    async fn record_with(
        &self,
        domain: &str,
        target_subdomain: &str,
        seen_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let inner = self.inner.clone();
        let domain = domain.to_string();
        let target = target_subdomain.to_string();
        task::spawn_blocking(move || -> Result<()> {
            let _write = inner
                .gate
                .write()
                .map_err(|_| anyhow!("domain tracker lock poisoned"))?;
            let conn = inner
                .writer
                .lock()
                .map_err(|_| anyhow!("domain tracker connection poisoned"))?;
            // Timestamp taken under the lock so concurrent writers stay ordered.
            let now = seen_at.unwrap_or_else(Utc::now).timestamp_millis();
            conn.execute(
                "INSERT INTO domains (domain, first_seen, last_seen, request_count, target_subdomain)
                 VALUES (?1, ?2, ?2, 1, ?3)
                 ON CONFLICT(domain) DO UPDATE SET
                    first_seen = MIN(first_seen, excluded.first_seen),
                    last_seen = MAX(last_seen, excluded.last_seen),
                    request_count = request_count + 1,
                    target_subdomain = excluded.target_subdomain",
                params![domain, now, target],
            )
            .with_context(|| format!("Failed to record access for {domain}"))?;
            debug!(domain = %domain, target = %target, "recorded domain access");
            Ok(())
        })
        .await
        .context("Domain tracker write task failed")??;
        Ok(())
    }

    pub async fn stats(&self) -> Result<TrackerStats> {
        self.stats_at(Utc::now()).await
    }

    /// Aggregate counters, treating `now` as the query time.
    pub async fn stats_at(&self, now: DateTime<Utc>) -> Result<TrackerStats> {
        let cutoff = (now - Duration::hours(24)).timestamp_millis();
        self.read(move |conn| {
            let (total_domains, total_requests): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(request_count), 0) FROM domains",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let active: i64 = conn.query_row(
                "SELECT COUNT(*) FROM domains WHERE last_seen > ?1",
                params![cutoff],
                |row| row.get(0),
            )?;
            Ok(TrackerStats {
                total_domains: total_domains as u64,
                total_requests: total_requests as u64,
                active_domains_24h: active as u64,
            })
        })
        .await
    }

    /// Busiest domains first; ties go to the most recently seen.
    pub async fn top_domains(&self, limit: usize) -> Result<Vec<DomainAccessRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT domain, first_seen, last_seen, request_count, target_subdomain
                 FROM domains
                 ORDER BY request_count DESC, last_seen DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (domain, first_seen, last_seen, request_count, target_subdomain) = row?;
                records.push(DomainAccessRecord {
                    first_seen: from_millis(first_seen)?,
                    last_seen: from_millis(last_seen)?,
                    request_count: request_count as u64,
                    domain,
                    target_subdomain,
                });
            }
            Ok(records)
        })
        .await
    }

    pub async fn report(&self, limit: usize) -> Result<StatsReport> {
        Ok(StatsReport {
            stats: self.stats().await?,
            top_domains: self.top_domains(limit).await?,
        })
    }

    async fn read<T, F>(&self, query: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        task::spawn_blocking(move || -> Result<T> {
            let _read = inner
                .gate
                .read()
                .map_err(|_| anyhow!("domain tracker lock poisoned"))?;
            let conn = Connection::open_with_flags(
                &inner.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_context(|| {
                format!("Failed to open domain tracker at {}", inner.path.display())
            })?;
            query(&conn)
        })
        .await
        .context("Domain tracker read task failed")?
    }
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS domains (
            domain TEXT PRIMARY KEY,
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            request_count INTEGER NOT NULL DEFAULT 1,
            target_subdomain TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_domains_last_seen ON domains(last_seen);
        CREATE INDEX IF NOT EXISTS idx_domains_request_count ON domains(request_count);
        "#,
    )
    .context("Failed to create domain tracker schema")?;
    Ok(())
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| anyhow!("stored timestamp {millis} is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).expect("valid timestamp")
    }

    #[tokio::test]
    async fn first_record_creates_row() -> Result<()> {
        let dir = tempdir()?;
        let tracker = DomainTracker::open(dir.path().join("domains.sqlite"))?;

        tracker.record_at("acme.com", "sub", at(0)).await?;
        let top = tracker.top_domains(10).await?;
        assert_eq!(
            top,
            vec![DomainAccessRecord {
                domain: "acme.com".into(),
                first_seen: at(0),
                last_seen: at(0),
                request_count: 1,
                target_subdomain: "sub".into(),
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn repeat_record_increments_and_overwrites_target() -> Result<()> {
        let dir = tempdir()?;
        let tracker = DomainTracker::open(dir.path().join("domains.sqlite"))?;

        tracker.record_at("acme.com", "old", at(0)).await?;
        tracker.record_at("acme.com", "new", at(60)).await?;
        let record = tracker.top_domains(1).await?.remove(0);
        assert_eq!(record.request_count, 2);
        assert_eq!(record.first_seen, at(0));
        assert_eq!(record.last_seen, at(60));
        assert_eq!(record.target_subdomain, "new");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_are_not_lost() -> Result<()> {
        let dir = tempdir()?;
        let tracker = DomainTracker::open(dir.path().join("domains.sqlite"))?;
        let started = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.record("acme.com", "sub").await
            }));
        }
        for handle in handles {
            handle.await??;
        }
        let finished = Utc::now();

        let record = tracker.top_domains(1).await?.remove(0);
        assert_eq!(record.request_count, 32);
        assert!(record.first_seen <= record.last_seen);
        assert!(record.first_seen.timestamp_millis() >= started.timestamp_millis());
        assert!(record.last_seen.timestamp_millis() <= finished.timestamp_millis());
        Ok(())
    }

    #[tokio::test]
    async fn top_domains_orders_by_count_then_recency() -> Result<()> {
        let dir = tempdir()?;
        let tracker = DomainTracker::open(dir.path().join("domains.sqlite"))?;

        for i in 0..5 {
            tracker.record_at("a.com", "a", at(100 + i)).await?;
        }
        for i in 0..9 {
            tracker.record_at("c.com", "c", at(10 + i)).await?;
        }
        for i in 0..9 {
            tracker.record_at("b.com", "b", at(200 + i)).await?;
        }

        let top: Vec<String> = tracker
            .top_domains(2)
            .await?
            .into_iter()
            .map(|record| record.domain)
            .collect();
        assert_eq!(top, vec!["b.com", "c.com"]);
        Ok(())
    }

    #[tokio::test]
    async fn stats_count_active_domains_in_last_day() -> Result<()> {
        let dir = tempdir()?;
        let tracker = DomainTracker::open(dir.path().join("domains.sqlite"))?;
        let now = at(0) + Duration::days(10);

        tracker.record_at("stale.com", "s", now - Duration::hours(30)).await?;
        tracker.record_at("fresh.com", "f", now - Duration::hours(2)).await?;
        tracker.record_at("fresh.com", "f", now - Duration::hours(1)).await?;

        let stats = tracker.stats_at(now).await?;
        assert_eq!(
            stats,
            TrackerStats {
                total_domains: 2,
                total_requests: 3,
                active_domains_24h: 1,
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_store_reports_zeroes() -> Result<()> {
        let dir = tempdir()?;
        let tracker = DomainTracker::open(dir.path().join("domains.sqlite"))?;
        assert_eq!(tracker.stats().await?, TrackerStats::default());
        assert!(tracker.top_domains(5).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn records_survive_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("domains.sqlite");
        {
            let tracker = DomainTracker::open(&path)?;
            tracker.record_at("acme.com", "sub", at(0)).await?;
        }
        let reopened = DomainTracker::open(&path)?;
        reopened.record_at("acme.com", "sub", at(5)).await?;
        assert_eq!(reopened.top_domains(1).await?[0].request_count, 2);
        Ok(())
    }
}
