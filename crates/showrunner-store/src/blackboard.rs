use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use showrunner_types::{
    ArtifactMeta, Budget, GlobalSpec, Money, ProjectDoc, ProjectStatus, QualityTier, Shot,
};
use tracing::{debug, warn};

use crate::{DocumentCache, StoreDatabase, StoreError, StoreResult};

/// How many times a mutating helper re-reads and re-applies its patch
/// before surfacing the version conflict to the caller.
const CONFLICT_RETRY_BUDGET: u32 = 3;

/// Single source of truth for project state. Writes go to the database
/// first and invalidate the cache; reads try the cache and fall back to
/// the database. Every write bumps the document version by one and is
/// serialized through the version column.
#[derive(Clone)]
pub struct Blackboard {
    db: StoreDatabase,
    cache: DocumentCache,
}

/// Budget snapshots around one cost increment, used by the budget
/// controller to detect threshold crossings on the edge.
#[derive(Debug, Clone)]
pub struct CostReceipt {
    pub before: Budget,
    pub after: Budget,
}

impl Blackboard {
    pub fn new(db: StoreDatabase, cache_ttl: Duration) -> Self {
        Self {
            db,
            cache: DocumentCache::new(cache_ttl),
        }
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    fn project_key(project_id: &str) -> String {
        format!("project:{project_id}")
    }

    fn shot_key(project_id: &str, shot_id: &str) -> String {
        format!("project:{project_id}:shot:{shot_id}")
    }

    pub async fn create_project(
        &self,
        project_id: &str,
        global_spec: GlobalSpec,
        budget: Budget,
    ) -> StoreResult<ProjectDoc> {
        let doc = ProjectDoc::new(project_id, global_spec, budget);
        let body = serde_json::to_string(&doc)?;
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO projects (project_id, status, version, doc, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                doc.project_id,
                doc.status.as_str(),
                doc.version as i64,
                body,
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::ProjectExists(project_id.to_string()));
        }
        drop(conn);
        self.cache
            .put(Self::project_key(project_id), serde_json::to_value(&doc)?)
            .await;
        Ok(doc)
    }

    /// Cache-aside read. Cache misses are not errors; the database is
    /// authoritative.
    pub async fn get_project(&self, project_id: &str) -> StoreResult<ProjectDoc> {
        if let Some(cached) = self.cache.get(&Self::project_key(project_id)).await {
            match serde_json::from_value(cached) {
                Ok(doc) => return Ok(doc),
                Err(err) => {
                    warn!(project_id, %err, "evicting undecodable cache entry");
                    self.cache.invalidate(&Self::project_key(project_id)).await;
                }
            }
        }
        let doc = self.get_project_uncached(project_id).await?;
        self.cache
            .put(Self::project_key(project_id), serde_json::to_value(&doc)?)
            .await;
        Ok(doc)
    }

    /// Strictly consistent read straight from the database.
    pub async fn get_project_uncached(&self, project_id: &str) -> StoreResult<ProjectDoc> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT doc FROM projects WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::ProjectNotFound(project_id.to_string())),
        }
    }

    pub async fn list_projects(&self) -> StoreResult<Vec<ProjectDoc>> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT doc FROM projects ORDER BY created_at")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut docs = Vec::with_capacity(bodies.len());
        for body in bodies {
            docs.push(serde_json::from_str(&body)?);
        }
        Ok(docs)
    }

    /// Optimistic write: persists `doc` iff the stored version still equals
    /// `expected_version`. The stored document gets `expected_version + 1`.
    pub async fn update_project(
        &self,
        doc: &mut ProjectDoc,
        expected_version: u64,
    ) -> StoreResult<u64> {
        doc.version = expected_version + 1;
        doc.updated_at = Utc::now();
        let body = serde_json::to_string(&doc)?;
        let updated = {
            let conn = self.db.connection();
            let conn = conn.lock().await;
            conn.execute(
                "UPDATE projects SET status = ?1, version = ?2, doc = ?3, updated_at = ?4
                 WHERE project_id = ?5 AND version = ?6",
                params![
                    doc.status.as_str(),
                    doc.version as i64,
                    body,
                    doc.updated_at.to_rfc3339(),
                    doc.project_id,
                    expected_version as i64,
                ],
            )?
        };
        if updated == 0 {
            // Distinguish a lost race from a missing project.
            let _ = self.get_project_uncached(&doc.project_id).await?;
            return Err(StoreError::VersionConflict {
                project_id: doc.project_id.clone(),
                expected: expected_version,
            });
        }
        self.cache.evict_prefix(&Self::project_key(&doc.project_id)).await;
        self.cache
            .put(
                Self::project_key(&doc.project_id),
                serde_json::to_value(&*doc)?,
            )
            .await;
        Ok(doc.version)
    }

    /// Read-patch-write loop with a bounded retry budget. The patch runs
    /// against a fresh snapshot on every attempt, so losers of a race
    /// re-apply on the winner's document.
    pub async fn mutate<F, T>(&self, project_id: &str, mut patch: F) -> StoreResult<(ProjectDoc, T)>
    where
        F: FnMut(&mut ProjectDoc) -> StoreResult<T>,
    {
        let mut attempt = 0;
        loop {
            let mut doc = self.get_project_uncached(project_id).await?;
            let expected = doc.version;
            let out = patch(&mut doc)?;
            match self.update_project(&mut doc, expected).await {
                Ok(_) => return Ok((doc, out)),
                Err(StoreError::VersionConflict { .. }) if attempt < CONFLICT_RETRY_BUDGET => {
                    attempt += 1;
                    debug!(project_id, attempt, "version conflict, re-applying patch");
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn get_global_spec(&self, project_id: &str) -> StoreResult<GlobalSpec> {
        Ok(self.get_project(project_id).await?.global_spec)
    }

    pub async fn get_budget(&self, project_id: &str) -> StoreResult<Budget> {
        Ok(self.get_project(project_id).await?.budget)
    }

    pub async fn get_shot(&self, project_id: &str, shot_id: &str) -> StoreResult<Shot> {
        if let Some(cached) = self.cache.get(&Self::shot_key(project_id, shot_id)).await {
            if let Ok(shot) = serde_json::from_value(cached) {
                return Ok(shot);
            }
        }
        let doc = self.get_project(project_id).await?;
        let shot = doc
            .shots
            .get(shot_id)
            .cloned()
            .ok_or_else(|| StoreError::ShotNotFound {
                project_id: project_id.to_string(),
                shot_id: shot_id.to_string(),
            })?;
        self.cache
            .put(
                Self::shot_key(project_id, shot_id),
                serde_json::to_value(&shot)?,
            )
            .await;
        Ok(shot)
    }

    pub async fn get_all_shots(&self, project_id: &str) -> StoreResult<Vec<Shot>> {
        let doc = self.get_project(project_id).await?;
        let mut shots: Vec<Shot> = doc.shots.into_values().collect();
        shots.sort_by_key(|s| s.index);
        Ok(shots)
    }

    pub async fn update_shot(&self, project_id: &str, shot: Shot) -> StoreResult<ProjectDoc> {
        let shot_id = shot.shot_id.clone();
        let (doc, _) = self
            .mutate(project_id, |doc| {
                doc.shots.insert(shot_id.clone(), shot.clone());
                Ok(())
            })
            .await?;
        self.cache
            .put(
                Self::shot_key(project_id, &shot_id),
                serde_json::to_value(doc.shots.get(&shot_id))?,
            )
            .await;
        Ok(doc)
    }

    pub async fn get_dna_bank(&self, project_id: &str) -> StoreResult<BTreeMap<String, Value>> {
        Ok(self.get_project(project_id).await?.dna_bank)
    }

    /// The fingerprint blob is opaque to the core; it is stored verbatim.
    pub async fn update_dna_bank(
        &self,
        project_id: &str,
        character_id: &str,
        entry: Value,
    ) -> StoreResult<ProjectDoc> {
        let (doc, _) = self
            .mutate(project_id, |doc| {
                doc.dna_bank.insert(character_id.to_string(), entry.clone());
                Ok(())
            })
            .await?;
        Ok(doc)
    }

    /// Budget increment through the optimistic path. `spent` is
    /// monotonically non-decreasing: negative amounts are rejected.
    pub async fn add_cost(
        &self,
        project_id: &str,
        amount: f64,
        note: &str,
    ) -> StoreResult<CostReceipt> {
        if amount < 0.0 {
            return Err(StoreError::Invalid(format!(
                "cost increment must be non-negative, got {amount}"
            )));
        }
        let note = note.to_string();
        let (_, receipt) = self
            .mutate(project_id, |doc| {
                let before = doc.budget.clone();
                doc.budget.spent.amount += amount;
                let slot = doc
                    .budget
                    .breakdown
                    .entry(note.clone())
                    .or_insert_with(|| Money::usd(0.0));
                slot.amount += amount;
                Ok(CostReceipt {
                    before,
                    after: doc.budget.clone(),
                })
            })
            .await?;
        Ok(receipt)
    }

    pub async fn register_artifact(
        &self,
        project_id: &str,
        url: &str,
        metadata: ArtifactMeta,
    ) -> StoreResult<ProjectDoc> {
        let (doc, _) = self
            .mutate(project_id, |doc| {
                doc.artifact_index.insert(url.to_string(), metadata.clone());
                Ok(())
            })
            .await?;
        Ok(doc)
    }

    /// Status change with legal-transition check. Setting the status the
    /// document already has is a no-op, not an error.
    pub async fn update_project_status(
        &self,
        project_id: &str,
        new_status: ProjectStatus,
    ) -> StoreResult<ProjectDoc> {
        let (doc, _) = self
            .mutate(project_id, |doc| {
                if doc.status == new_status {
                    return Ok(());
                }
                if !doc.status.can_transition(new_status) {
                    return Err(StoreError::IllegalStatusTransition {
                        from: doc.status,
                        to: new_status,
                    });
                }
                doc.status = new_status;
                Ok(())
            })
            .await?;
        Ok(doc)
    }

    pub async fn set_quality_tier(
        &self,
        project_id: &str,
        tier: QualityTier,
    ) -> StoreResult<ProjectDoc> {
        let (doc, _) = self
            .mutate(project_id, |doc| {
                doc.global_spec.quality_tier = tier;
                Ok(())
            })
            .await?;
        Ok(doc)
    }

    pub async fn set_failure_reason(
        &self,
        project_id: &str,
        reason: &str,
    ) -> StoreResult<ProjectDoc> {
        let (doc, _) = self
            .mutate(project_id, |doc| {
                doc.failure_reason = Some(reason.to_string());
                Ok(())
            })
            .await?;
        Ok(doc)
    }

    pub async fn mark_processed(&self, handler: &str, event_id: &str) -> StoreResult<bool> {
        self.db.mark_processed(handler, event_id).await
    }

    pub async fn is_processed(&self, handler: &str, event_id: &str) -> StoreResult<bool> {
        self.db.is_processed(handler, event_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use showrunner_types::ShotStatus;
    use tempfile::TempDir;

    async fn blackboard() -> (Blackboard, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = StoreDatabase::open(&dir.path().join("showrunner.db"))
            .await
            .unwrap();
        (Blackboard::new(db, Duration::from_secs(3600)), dir)
    }

    fn spec(tier: QualityTier) -> GlobalSpec {
        serde_json::from_value(serde_json::json!({
            "title": "Rain and Warmth",
            "duration_seconds": 30.0,
            "quality_tier": tier.as_str(),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_rejects_duplicate_project_ids() {
        let (bb, _dir) = blackboard().await;
        bb.create_project("PROJ-1", spec(QualityTier::Balanced), Budget::allocated(90.0))
            .await
            .unwrap();
        let err = bb
            .create_project("PROJ-1", spec(QualityTier::Balanced), Budget::allocated(90.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ProjectExists(_)));
    }

    #[tokio::test]
    async fn missing_project_surfaces_not_found() {
        let (bb, _dir) = blackboard().await;
        let err = bb.get_project("NOPE").await.unwrap_err();
        assert!(matches!(err, StoreError::ProjectNotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_writers_race_one_wins() {
        let (bb, _dir) = blackboard().await;
        bb.create_project("PROJ-1", spec(QualityTier::Balanced), Budget::allocated(90.0))
            .await
            .unwrap();

        let mut a = bb.get_project_uncached("PROJ-1").await.unwrap();
        let mut b = a.clone();
        let expected = a.version;

        a.global_spec.mood = Some("wistful".to_string());
        bb.update_project(&mut a, expected).await.unwrap();

        b.global_spec.mood = Some("bright".to_string());
        let err = bb.update_project(&mut b, expected).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        // The loser re-reads and retries with the fresh version.
        let mut fresh = bb.get_project_uncached("PROJ-1").await.unwrap();
        fresh.global_spec.mood = Some("bright".to_string());
        let current = fresh.version;
        bb.update_project(&mut fresh, current).await.unwrap();
        assert_eq!(fresh.version, expected + 2);
    }

    #[tokio::test]
    async fn mutate_retries_through_conflicts() {
        let (bb, _dir) = blackboard().await;
        bb.create_project("PROJ-1", spec(QualityTier::Balanced), Budget::allocated(90.0))
            .await
            .unwrap();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let bb = bb.clone();
            handles.push(tokio::spawn(async move {
                bb.add_cost("PROJ-1", 10.0, "IMAGE_GENERATED").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let budget = bb.get_budget("PROJ-1").await.unwrap();
        assert!((budget.spent.amount - 40.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn add_cost_is_monotone() {
        let (bb, _dir) = blackboard().await;
        bb.create_project("PROJ-1", spec(QualityTier::Balanced), Budget::allocated(90.0))
            .await
            .unwrap();
        let receipt = bb.add_cost("PROJ-1", 10.0, "IMAGE_GENERATED").await.unwrap();
        assert_eq!(receipt.before.spent.amount, 0.0);
        assert_eq!(receipt.after.spent.amount, 10.0);
        assert!(bb.add_cost("PROJ-1", -5.0, "refund").await.is_err());
        let budget = bb.get_budget("PROJ-1").await.unwrap();
        assert_eq!(budget.spent.amount, 10.0);
        assert_eq!(budget.breakdown["IMAGE_GENERATED"].amount, 10.0);
    }

    #[tokio::test]
    async fn shots_round_trip_and_enumerate_in_index_order() {
        let (bb, _dir) = blackboard().await;
        bb.create_project("PROJ-1", spec(QualityTier::Balanced), Budget::allocated(90.0))
            .await
            .unwrap();
        for id in ["S02", "S01"] {
            let shot: Shot = serde_json::from_value(serde_json::json!({
                "shot_id": id,
                "index": if id == "S01" { 1 } else { 2 },
                "status": "INIT",
                "duration_seconds": 6.0,
            }))
            .unwrap();
            bb.update_shot("PROJ-1", shot).await.unwrap();
        }
        let shots = bb.get_all_shots("PROJ-1").await.unwrap();
        assert_eq!(shots.len(), 2);
        assert_eq!(shots[0].shot_id, "S01");
        assert_eq!(bb.get_shot("PROJ-1", "S02").await.unwrap().status, ShotStatus::Init);
        assert!(matches!(
            bb.get_shot("PROJ-1", "S99").await.unwrap_err(),
            StoreError::ShotNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn status_transitions_are_checked() {
        let (bb, _dir) = blackboard().await;
        bb.create_project("PROJ-1", spec(QualityTier::Balanced), Budget::allocated(90.0))
            .await
            .unwrap();
        bb.update_project_status("PROJ-1", ProjectStatus::Active)
            .await
            .unwrap();
        let err = bb
            .update_project_status("PROJ-1", ProjectStatus::Created)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalStatusTransition { .. }));
        bb.update_project_status("PROJ-1", ProjectStatus::Failed)
            .await
            .unwrap();
        // Terminal: nothing moves.
        assert!(bb
            .update_project_status("PROJ-1", ProjectStatus::Active)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn cache_serves_reads_and_is_invalidated_by_writes() {
        let (bb, _dir) = blackboard().await;
        bb.create_project("PROJ-1", spec(QualityTier::High), Budget::allocated(135.0))
            .await
            .unwrap();
        let first = bb.get_project("PROJ-1").await.unwrap();
        assert_eq!(first.global_spec.quality_tier, QualityTier::High);

        bb.set_quality_tier("PROJ-1", QualityTier::Balanced)
            .await
            .unwrap();
        let second = bb.get_project("PROJ-1").await.unwrap();
        assert_eq!(second.global_spec.quality_tier, QualityTier::Balanced);
    }
}
