use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use showrunner_types::Event;
use tokio::sync::Notify;
use tracing::debug;

use crate::{StoreDatabase, StoreResult};

/// Durable per-topic append-only log with consumer groups. Message ids are
/// per-topic monotone sequence numbers assigned at append, so order within
/// a topic is the append order; across topics nothing is promised.
///
/// Delivery is at-least-once: a read claims messages into the group's
/// pending list, and entries that sit unacknowledged past
/// `redeliver_idle` are handed to the next reader. Handlers dedupe on
/// `event_id`.
#[derive(Clone)]
pub struct EventLog {
    db: StoreDatabase,
    appended: Arc<Notify>,
    redeliver_idle: Duration,
}

impl EventLog {
    pub fn new(db: StoreDatabase) -> Self {
        Self::with_redeliver_idle(db, Duration::from_secs(30))
    }

    pub fn with_redeliver_idle(db: StoreDatabase, redeliver_idle: Duration) -> Self {
        Self {
            db,
            appended: Arc::new(Notify::new()),
            redeliver_idle,
        }
    }

    /// Append an event under `topic`; returns the server-assigned message
    /// id. Fails only when storage is unavailable.
    pub async fn append(&self, topic: &str, event: &Event) -> StoreResult<u64> {
        let body = serde_json::to_string(event)?;
        let now_ms = Utc::now().timestamp_millis();
        let seq = {
            let conn = self.db.connection();
            let conn = conn.lock().await;
            let tx = conn.unchecked_transaction()?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM log_messages WHERE topic = ?1",
                params![topic],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO log_messages (topic, seq, event_id, body, appended_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![topic, seq, event.event_id.to_string(), body, now_ms],
            )?;
            tx.commit()?;
            seq as u64
        };
        self.appended.notify_waiters();
        Ok(seq)
    }

    /// Idempotent consumer-group creation. A new group starts at the tail
    /// of whatever is already in the topic only if `from_start` is false.
    pub async fn ensure_group(&self, topic: &str, group: &str) -> StoreResult<()> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO log_groups (topic, grp, next_seq) VALUES (?1, ?2, 1)",
            params![topic, group],
        )?;
        Ok(())
    }

    /// Blocking group read. Returns up to `batch` messages: stale pending
    /// entries first (redelivery), then fresh messages past the group
    /// cursor. Waits up to `block` for an append when nothing is ready.
    pub async fn read_group(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        batch: usize,
        block: Duration,
    ) -> StoreResult<Vec<(u64, Event)>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let messages = self.claim(topic, group, consumer, batch).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, self.appended.notified()).await;
        }
    }

    async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        batch: usize,
    ) -> StoreResult<Vec<(u64, Event)>> {
        let now_ms = Utc::now().timestamp_millis();
        let idle_before_ms = now_ms - self.redeliver_idle.as_millis() as i64;

        let conn = self.db.connection();
        let conn = conn.lock().await;
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO log_groups (topic, grp, next_seq) VALUES (?1, ?2, 1)",
            params![topic, group],
        )?;

        let mut seqs: Vec<i64> = Vec::with_capacity(batch);
        {
            // Redeliver entries whose consumer went quiet before acking.
            let mut stmt = tx.prepare(
                "SELECT seq FROM log_pending
                 WHERE topic = ?1 AND grp = ?2 AND delivered_at_ms <= ?3
                 ORDER BY seq LIMIT ?4",
            )?;
            let stale = stmt
                .query_map(params![topic, group, idle_before_ms, batch as i64], |row| {
                    row.get::<_, i64>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            for seq in &stale {
                tx.execute(
                    "UPDATE log_pending
                     SET consumer = ?1, delivered_at_ms = ?2, delivery_count = delivery_count + 1
                     WHERE topic = ?3 AND grp = ?4 AND seq = ?5",
                    params![consumer, now_ms, topic, group, seq],
                )?;
            }
            if !stale.is_empty() {
                debug!(topic, group, consumer, count = stale.len(), "redelivered stale messages");
            }
            seqs.extend(stale);
        }

        if seqs.len() < batch {
            let next_seq: i64 = tx.query_row(
                "SELECT next_seq FROM log_groups WHERE topic = ?1 AND grp = ?2",
                params![topic, group],
                |row| row.get(0),
            )?;
            let remaining = (batch - seqs.len()) as i64;
            let fresh: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT seq FROM log_messages
                     WHERE topic = ?1 AND seq >= ?2
                     ORDER BY seq LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![topic, next_seq, remaining], |row| {
                    row.get::<_, i64>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            if let Some(last) = fresh.last() {
                for seq in &fresh {
                    tx.execute(
                        "INSERT INTO log_pending
                         (topic, grp, seq, consumer, delivered_at_ms, delivery_count)
                         VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                        params![topic, group, seq, consumer, now_ms],
                    )?;
                }
                tx.execute(
                    "UPDATE log_groups SET next_seq = ?1 WHERE topic = ?2 AND grp = ?3",
                    params![last + 1, topic, group],
                )?;
            }
            seqs.extend(fresh);
        }

        let mut messages = Vec::with_capacity(seqs.len());
        for seq in &seqs {
            let body: String = tx.query_row(
                "SELECT body FROM log_messages WHERE topic = ?1 AND seq = ?2",
                params![topic, seq],
                |row| row.get(0),
            )?;
            messages.push((*seq as u64, serde_json::from_str(&body)?));
        }
        tx.commit()?;
        messages.sort_by_key(|(seq, _)| *seq);
        Ok(messages)
    }

    /// Acknowledge a delivered message; drops it from the pending list.
    pub async fn ack(&self, topic: &str, group: &str, message_id: u64) -> StoreResult<()> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        conn.execute(
            "DELETE FROM log_pending WHERE topic = ?1 AND grp = ?2 AND seq = ?3",
            params![topic, group, message_id as i64],
        )?;
        Ok(())
    }

    /// Range scan by message id, inclusive on both ends.
    pub async fn range(
        &self,
        topic: &str,
        from_id: Option<u64>,
        to_id: Option<u64>,
    ) -> StoreResult<Vec<(u64, Event)>> {
        let from = from_id.unwrap_or(0) as i64;
        let to = to_id.map(|v| v as i64).unwrap_or(i64::MAX);
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT seq, body FROM log_messages
             WHERE topic = ?1 AND seq >= ?2 AND seq <= ?3
             ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![topic, from, to], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut events = Vec::with_capacity(rows.len());
        for (seq, body) in rows {
            events.push((seq as u64, serde_json::from_str(&body)?));
        }
        Ok(events)
    }

    /// Retention: drop messages appended before `horizon`. Pending entries
    /// for trimmed messages go with them.
    pub async fn trim(&self, topic: &str, horizon: DateTime<Utc>) -> StoreResult<usize> {
        let horizon_ms = horizon.timestamp_millis();
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM log_pending WHERE topic = ?1 AND seq IN (
                 SELECT seq FROM log_messages WHERE topic = ?1 AND appended_at_ms < ?2
             )",
            params![topic, horizon_ms],
        )?;
        let trimmed = tx.execute(
            "DELETE FROM log_messages WHERE topic = ?1 AND appended_at_ms < ?2",
            params![topic, horizon_ms],
        )?;
        tx.commit()?;
        Ok(trimmed)
    }

    /// Count of unacknowledged deliveries for a group.
    pub async fn pending_count(&self, topic: &str, group: &str) -> StoreResult<u64> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let count: Option<i64> = conn
            .query_row(
                "SELECT COUNT(*) FROM log_pending WHERE topic = ?1 AND grp = ?2",
                params![topic, group],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use showrunner_types::EventType;
    use tempfile::TempDir;

    const TOPIC: &str = "event_stream:IMAGE_GENERATED";

    async fn log_with_idle(idle: Duration) -> (EventLog, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = StoreDatabase::open(&dir.path().join("showrunner.db"))
            .await
            .unwrap();
        (EventLog::with_redeliver_idle(db, idle), dir)
    }

    fn image_event(n: u32) -> Event {
        Event::new("PROJ-1", EventType::ImageGenerated, "image_gen")
            .with_payload(serde_json::json!({"index": n}))
    }

    #[tokio::test]
    async fn append_preserves_topic_order() {
        let (log, _dir) = log_with_idle(Duration::from_secs(30)).await;
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(log.append(TOPIC, &image_event(n)).await.unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let read = log
            .read_group(TOPIC, "agent_group", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        let indexes: Vec<u64> = read
            .iter()
            .map(|(_, e)| e.payload_u64("index").unwrap())
            .collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered() {
        let (log, _dir) = log_with_idle(Duration::from_millis(20)).await;
        log.append(TOPIC, &image_event(0)).await.unwrap();

        let first = log
            .read_group(TOPIC, "agent_group", "crashed", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        // "crashed" never acks. After the idle window another consumer in
        // the group picks the message up again.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = log
            .read_group(TOPIC, "agent_group", "survivor", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0, first[0].0);
        assert_eq!(second[0].1.event_id, first[0].1.event_id);

        log.ack(TOPIC, "agent_group", second[0].0).await.unwrap();
        assert_eq!(log.pending_count(TOPIC, "agent_group").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn acked_messages_stay_put_for_other_groups() {
        let (log, _dir) = log_with_idle(Duration::from_secs(30)).await;
        log.append(TOPIC, &image_event(0)).await.unwrap();
        let read = log
            .read_group(TOPIC, "agent_group", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        log.ack(TOPIC, "agent_group", read[0].0).await.unwrap();

        // A separate group maintains its own cursor from the start.
        let other = log
            .read_group(TOPIC, "replay_group", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn consumers_in_a_group_partition_messages() {
        let (log, _dir) = log_with_idle(Duration::from_secs(30)).await;
        for n in 0..4 {
            log.append(TOPIC, &image_event(n)).await.unwrap();
        }
        let a = log
            .read_group(TOPIC, "agent_group", "a", 2, Duration::ZERO)
            .await
            .unwrap();
        let b = log
            .read_group(TOPIC, "agent_group", "b", 2, Duration::ZERO)
            .await
            .unwrap();
        let mut seqs: Vec<u64> = a.iter().chain(b.iter()).map(|(seq, _)| *seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let (log, _dir) = log_with_idle(Duration::from_secs(30)).await;
        let reader = {
            let log = log.clone();
            tokio::spawn(async move {
                log.read_group(TOPIC, "agent_group", "c1", 10, Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        log.append(TOPIC, &image_event(7)).await.unwrap();
        let read = reader.await.unwrap().unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn range_scan_is_inclusive() {
        let (log, _dir) = log_with_idle(Duration::from_secs(30)).await;
        for n in 0..5 {
            log.append(TOPIC, &image_event(n)).await.unwrap();
        }
        let slice = log.range(TOPIC, Some(2), Some(4)).await.unwrap();
        assert_eq!(
            slice.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        let all = log.range(TOPIC, None, None).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn trim_drops_old_messages() {
        let (log, _dir) = log_with_idle(Duration::from_secs(30)).await;
        for n in 0..3 {
            log.append(TOPIC, &image_event(n)).await.unwrap();
        }
        let trimmed = log
            .trim(TOPIC, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(trimmed, 3);
        assert!(log.range(TOPIC, None, None).await.unwrap().is_empty());
    }
}
