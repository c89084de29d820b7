use rusqlite::{params, OptionalExtension};
use showrunner_types::{TaskRecord, TaskStatus};

use crate::{StoreDatabase, StoreError, StoreResult};

/// Task rows for the scheduler. The serialized record is the source of
/// truth; the status column exists for the scheduler's filtered scans.
#[derive(Clone)]
pub struct TaskRepo {
    db: StoreDatabase,
}

impl TaskRepo {
    pub fn new(db: StoreDatabase) -> Self {
        Self { db }
    }

    pub async fn create(&self, task: &TaskRecord) -> StoreResult<()> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (task_id, project_id, assigned_to, status, record, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task.task_id,
                task.project_id,
                task.assigned_to,
                task.status.as_str(),
                serde_json::to_string(task)?,
                task.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> StoreResult<TaskRecord> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT record FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::TaskNotFound(task_id.to_string())),
        }
    }

    pub async fn save(&self, task: &TaskRecord) -> StoreResult<()> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE tasks SET status = ?1, record = ?2 WHERE task_id = ?3",
            params![
                task.status.as_str(),
                serde_json::to_string(task)?,
                task.task_id
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::TaskNotFound(task.task_id.clone()));
        }
        Ok(())
    }

    pub async fn list_for_project(&self, project_id: &str) -> StoreResult<Vec<TaskRecord>> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT record FROM tasks WHERE project_id = ?1 ORDER BY created_at, task_id",
        )?;
        let bodies = stmt
            .query_map(params![project_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut tasks = Vec::with_capacity(bodies.len());
        for body in bodies {
            tasks.push(serde_json::from_str(&body)?);
        }
        Ok(tasks)
    }

    /// Projects that still have live (non-terminal) tasks; the scheduler's
    /// tick set.
    pub async fn projects_with_live_tasks(&self) -> StoreResult<Vec<String>> {
        let conn = self.db.connection();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT project_id FROM tasks
             WHERE status NOT IN (?1, ?2) ORDER BY project_id",
        )?;
        let projects = stmt
            .query_map(
                params![TaskStatus::Completed.as_str(), TaskStatus::Cancelled.as_str()],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(projects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn repo() -> (TaskRepo, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = StoreDatabase::open(&dir.path().join("showrunner.db"))
            .await
            .unwrap();
        (TaskRepo::new(db), dir)
    }

    #[tokio::test]
    async fn round_trips_records() {
        let (repo, _dir) = repo().await;
        let task = TaskRecord::new("T1", "PROJ-1", "image_gen")
            .with_dependencies(vec!["T0".to_string()])
            .with_lock("dna:C1");
        repo.create(&task).await.unwrap();
        let loaded = repo.get("T1").await.unwrap();
        assert_eq!(loaded.dependencies, vec!["T0"]);
        assert!(loaded.requires_lock);
        assert!(matches!(
            repo.get("T9").await.unwrap_err(),
            StoreError::TaskNotFound(_)
        ));
    }

    #[tokio::test]
    async fn live_task_scan_skips_terminal_projects() {
        let (repo, _dir) = repo().await;
        let mut done = TaskRecord::new("T1", "PROJ-done", "video_gen");
        done.status = TaskStatus::Completed;
        repo.create(&done).await.unwrap();
        repo.create(&TaskRecord::new("T2", "PROJ-live", "video_gen"))
            .await
            .unwrap();

        assert_eq!(
            repo.projects_with_live_tasks().await.unwrap(),
            vec!["PROJ-live".to_string()]
        );
    }
}
