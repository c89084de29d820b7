use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use showrunner_types::{ApprovalRequest, ApprovalStatus};

use crate::{StoreDatabase, StoreError, StoreResult};

/// Approval records on the blackboard side of the store. These rows are
/// the durable source of truth for pause state; the in-process paused set
/// is rebuilt from them at startup.
#[derive(Clone)]
pub struct ApprovalRepo {
    db: StoreDatabase,
}

impl ApprovalRepo {
    pub fn new(db: StoreDatabase) -> Self {
        Self { db }
    }

    pub async fn create(&self, request: &ApprovalRequest) -> StoreResult<()> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO approvals (approval_id, project_id, status, record, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request.approval_id,
                request.project_id,
                status_str(request.status),
                serde_json::to_string(request)?,
                request.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, approval_id: &str) -> StoreResult<ApprovalRequest> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT record FROM approvals WHERE approval_id = ?1",
                params![approval_id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::ApprovalNotFound(approval_id.to_string())),
        }
    }

    pub async fn save(&self, request: &ApprovalRequest) -> StoreResult<()> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE approvals SET status = ?1, record = ?2 WHERE approval_id = ?3",
            params![
                status_str(request.status),
                serde_json::to_string(request)?,
                request.approval_id
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::ApprovalNotFound(request.approval_id.clone()));
        }
        Ok(())
    }

    pub async fn list_for_project(&self, project_id: &str) -> StoreResult<Vec<ApprovalRequest>> {
        self.list_where("project_id = ?1", project_id).await
    }

    pub async fn list_pending(&self) -> StoreResult<Vec<ApprovalRequest>> {
        self.list_where("status = ?1", status_str(ApprovalStatus::Pending))
            .await
    }

    /// Pending requests whose timeout horizon has passed as of `now`.
    pub async fn list_pending_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<ApprovalRequest>> {
        let pending = self.list_pending().await?;
        Ok(pending
            .into_iter()
            .filter(|request| request.expired_at() <= now)
            .collect())
    }

    async fn list_where(
        &self,
        clause: &str,
        arg: &str,
    ) -> StoreResult<Vec<ApprovalRequest>> {
        let sql = format!(
            "SELECT record FROM approvals WHERE {clause} ORDER BY created_at, approval_id"
        );
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let bodies = stmt
            .query_map(params![arg], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut requests = Vec::with_capacity(bodies.len());
        for body in bodies {
            requests.push(serde_json::from_str(&body)?);
        }
        Ok(requests)
    }
}

fn status_str(status: ApprovalStatus) -> &'static str {
    match status {
        ApprovalStatus::Pending => "PENDING",
        ApprovalStatus::Approved => "APPROVED",
        ApprovalStatus::Rejected => "REJECTED",
        ApprovalStatus::Revision => "REVISION",
        ApprovalStatus::Timeout => "TIMEOUT",
    }
}
