use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use showrunner_types::{Event, EventType};

use crate::{StoreDatabase, StoreError, StoreResult};

/// Relational event table for long-term queries: filtered lookups, the
/// persistent side of causation chains, and per-type cost/latency
/// statistics. The stream in [`crate::EventLog`] drives delivery; this
/// table answers questions.
#[derive(Clone)]
pub struct EventArchive {
    db: StoreDatabase,
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub project_id: Option<String>,
    pub event_types: Option<Vec<EventType>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EventTypeStats {
    pub count: u64,
    pub total_cost: f64,
    pub avg_latency_ms: f64,
}

impl EventArchive {
    pub fn new(db: StoreDatabase) -> Self {
        Self { db }
    }

    /// Insert-or-ignore keeps the table append-only: the first write of an
    /// event_id wins and subsequent writes of the same id are no-ops.
    pub async fn persist(&self, event: &Event) -> StoreResult<()> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO events
             (event_id, project_id, event_type, actor, causation_id, timestamp,
              payload, blackboard_pointer, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.event_id.to_string(),
                event.project_id,
                event.event_type.as_str(),
                event.actor,
                event.causation_id.map(|id| id.to_string()),
                event.timestamp.to_rfc3339(),
                serde_json::to_string(&event.payload)?,
                event.blackboard_pointer,
                serde_json::to_string(&event.metadata)?,
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, event_id: &str) -> StoreResult<Event> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        conn.query_row(
            "SELECT event_id, project_id, event_type, actor, causation_id, timestamp,
                    payload, blackboard_pointer, metadata
             FROM events WHERE event_id = ?1",
            params![event_id],
            row_to_event,
        )
        .optional()?
        .ok_or_else(|| StoreError::EventNotFound(event_id.to_string()))
    }

    pub async fn query(&self, query: &EventQuery) -> StoreResult<Vec<Event>> {
        let mut sql = String::from(
            "SELECT event_id, project_id, event_type, actor, causation_id, timestamp,
                    payload, blackboard_pointer, metadata
             FROM events WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(project_id) = &query.project_id {
            sql.push_str(&format!(" AND project_id = ?{}", args.len() + 1));
            args.push(project_id.clone());
        }
        if let Some(types) = &query.event_types {
            if !types.is_empty() {
                let placeholders: Vec<String> = types
                    .iter()
                    .enumerate()
                    .map(|(i, _)| format!("?{}", args.len() + 1 + i))
                    .collect();
                sql.push_str(&format!(" AND event_type IN ({})", placeholders.join(", ")));
                args.extend(types.iter().map(|t| t.as_str().to_string()));
            }
        }
        if let Some(since) = &query.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len() + 1));
            args.push(since.to_rfc3339());
        }
        if let Some(until) = &query.until {
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len() + 1));
            args.push(until.to_rfc3339());
        }
        sql.push_str(" ORDER BY timestamp ASC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(args.iter()), row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Walk `causation_id` pointers back to the root. Returned oldest
    /// first; the traced event itself is last.
    pub async fn causation_chain(&self, event_id: &str) -> StoreResult<Vec<Event>> {
        let mut chain = Vec::new();
        let mut current = Some(event_id.to_string());
        while let Some(id) = current {
            let event = match self.get(&id).await {
                Ok(event) => event,
                Err(StoreError::EventNotFound(_)) if !chain.is_empty() => break,
                Err(err) => return Err(err),
            };
            current = event.causation_id.map(|c| c.to_string());
            chain.push(event);
        }
        chain.reverse();
        Ok(chain)
    }

    pub async fn statistics(
        &self,
        project_id: &str,
    ) -> StoreResult<HashMap<String, EventTypeStats>> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT event_type,
                    COUNT(*),
                    COALESCE(SUM(json_extract(metadata, '$.cost.amount')), 0.0),
                    COALESCE(AVG(json_extract(metadata, '$.latency_ms')), 0.0)
             FROM events WHERE project_id = ?1
             GROUP BY event_type",
        )?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    EventTypeStats {
                        count: row.get::<_, i64>(1)? as u64,
                        total_cost: row.get::<_, f64>(2)?,
                        avg_latency_ms: row.get::<_, f64>(3)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().collect())
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let event_id: String = row.get(0)?;
    let event_type: String = row.get(2)?;
    let causation_id: Option<String> = row.get(4)?;
    let timestamp: String = row.get(5)?;
    let payload: String = row.get(6)?;
    let metadata: String = row.get(8)?;

    Ok(Event {
        event_id: event_id.parse().map_err(|_| invalid_row())?,
        project_id: row.get(1)?,
        event_type: EventType::parse(&event_type).ok_or_else(invalid_row)?,
        actor: row.get(3)?,
        causation_id: match causation_id {
            Some(raw) => Some(raw.parse().map_err(|_| invalid_row())?),
            None => None,
        },
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|_| invalid_row())?
            .with_timezone(&Utc),
        payload: serde_json::from_str(&payload).map_err(|_| invalid_row())?,
        blackboard_pointer: row.get(7)?,
        metadata: serde_json::from_str(&metadata).map_err(|_| invalid_row())?,
    })
}

fn invalid_row() -> rusqlite::Error {
    rusqlite::Error::InvalidQuery
}

#[cfg(test)]
mod tests {
    use super::*;
    use showrunner_types::Money;
    use tempfile::TempDir;

    async fn archive() -> (EventArchive, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = StoreDatabase::open(&dir.path().join("showrunner.db"))
            .await
            .unwrap();
        (EventArchive::new(db), dir)
    }

    #[tokio::test]
    async fn persisted_events_are_immutable() {
        let (archive, _dir) = archive().await;
        let event = Event::new("PROJ-1", EventType::ImageGenerated, "image_gen")
            .with_payload(serde_json::json!({"artifact_url": "s3://a/1.png"}));
        archive.persist(&event).await.unwrap();

        // A second write under the same id changes nothing.
        let mut tampered = event.clone();
        tampered.payload = serde_json::json!({"artifact_url": "s3://a/evil.png"});
        archive.persist(&tampered).await.unwrap();

        let stored = archive.get(&event.event_id.to_string()).await.unwrap();
        assert_eq!(stored.payload, event.payload);
        let again = archive.get(&event.event_id.to_string()).await.unwrap();
        assert_eq!(stored, again);
    }

    #[tokio::test]
    async fn query_filters_by_project_type_and_window() {
        let (archive, _dir) = archive().await;
        let e1 = Event::new("PROJ-1", EventType::SceneWritten, "script_writer");
        let e2 = Event::new("PROJ-1", EventType::ImageGenerated, "image_gen");
        let e3 = Event::new("PROJ-2", EventType::ImageGenerated, "image_gen");
        for e in [&e1, &e2, &e3] {
            archive.persist(e).await.unwrap();
        }

        let found = archive
            .query(&EventQuery {
                project_id: Some("PROJ-1".to_string()),
                event_types: Some(vec![EventType::ImageGenerated]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].event_id, e2.event_id);

        let windowed = archive
            .query(&EventQuery {
                project_id: Some("PROJ-1".to_string()),
                until: Some(Utc::now() - chrono::Duration::hours(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(windowed.is_empty());
    }

    #[tokio::test]
    async fn causation_chain_walks_to_the_root() {
        let (archive, _dir) = archive().await;
        let root = Event::new("PROJ-1", EventType::SceneWritten, "script_writer");
        let mid = Event::new("PROJ-1", EventType::ShotPlanned, "shot_director").caused_by(&root);
        let leaf = Event::new("PROJ-1", EventType::KeyframeRequested, "shot_director")
            .caused_by(&mid);
        for e in [&root, &mid, &leaf] {
            archive.persist(e).await.unwrap();
        }

        let chain = archive
            .causation_chain(&leaf.event_id.to_string())
            .await
            .unwrap();
        let ids: Vec<_> = chain.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![root.event_id, mid.event_id, leaf.event_id]);
    }

    #[tokio::test]
    async fn statistics_aggregate_cost_per_type() {
        let (archive, _dir) = archive().await;
        for n in 0..3 {
            let mut event = Event::new("PROJ-1", EventType::ImageGenerated, "image_gen")
                .with_cost(Money::usd(10.0));
            event.metadata.latency_ms = Some(100 + n);
            archive.persist(&event).await.unwrap();
        }
        let stats = archive.statistics("PROJ-1").await.unwrap();
        let images = &stats["IMAGE_GENERATED"];
        assert_eq!(images.count, 3);
        assert!((images.total_cost - 30.0).abs() < 1e-9);
        assert!((images.avg_latency_ms - 101.0).abs() < 1e-9);
    }
}
