use async_trait::async_trait;
use rusqlite::{OptionalExtension, Row, params};

use super::Database;
use super::types::{Account, NewTask, Task, TaskLog, TaskPatch};
use crate::core::error::{EngineError, EngineResult};

/// Read side of the relational task store, as the engine consumes it.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_enabled(&self) -> EngineResult<Vec<Task>>;
    async fn get(&self, id: i64) -> EngineResult<Option<Task>>;
}

const TASK_COLUMNS: &str = "t.id, t.name, t.cron, t.enabled, t.account_id, a.account_name, \
     t.last_run_at, t.created_at, t.updated_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        cron: row.get(2)?,
        enabled: row.get::<_, i64>(3)? != 0,
        account_id: row.get(4)?,
        account_name: row.get(5)?,
        last_run_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

#[derive(Clone)]
pub struct SqliteTaskStore {
    db: Database,
}

impl SqliteTaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> EngineResult<Vec<Task>> {
        let db = self.db.conn().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t JOIN accounts a ON a.id = t.account_id ORDER BY t.id"
        ))?;
        let rows = stmt.query_map([], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    pub async fn create(&self, new: NewTask) -> EngineResult<Task> {
        validate_name(&new.name)?;
        let id = {
            let db = self.db.conn().lock().await;
            ensure_account(&db, new.account_id)?;
            db.execute(
                "INSERT INTO tasks (name, cron, enabled, account_id) VALUES (?1, ?2, ?3, ?4)",
                params![new.name.trim(), new.cron.trim(), new.enabled, new.account_id],
            )?;
            db.last_insert_rowid()
        };
        self.require(id).await
    }

    pub async fn update(&self, id: i64, patch: TaskPatch) -> EngineResult<Task> {
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        {
            let db = self.db.conn().lock().await;
            if let Some(account_id) = patch.account_id {
                ensure_account(&db, account_id)?;
            }
            let changed = db.execute(
                "UPDATE tasks SET
                    name = COALESCE(?2, name),
                    cron = COALESCE(?3, cron),
                    enabled = COALESCE(?4, enabled),
                    account_id = COALESCE(?5, account_id),
                    updated_at = CURRENT_TIMESTAMP
                 WHERE id = ?1",
                params![
                    id,
                    patch.name.as_deref().map(str::trim),
                    patch.cron.as_deref().map(str::trim),
                    patch.enabled,
                    patch.account_id
                ],
            )?;
            if changed == 0 {
                return Err(EngineError::NotFound(format!("task {id}")));
            }
        }
        self.require(id).await
    }

    /// Deletes the task; its `task_logs` rows go with it.
    pub async fn delete(&self, id: i64) -> EngineResult<bool> {
        let db = self.db.conn().lock().await;
        db.execute("DELETE FROM task_logs WHERE task_id = ?1", params![id])?;
        let rows = db.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub async fn create_account(&self, account_name: &str) -> EngineResult<Account> {
        let account_name = account_name.trim();
        if account_name.is_empty() {
            return Err(EngineError::InvalidInput(
                "account_name must not be empty".to_string(),
            ));
        }
        let db = self.db.conn().lock().await;
        let exists: Option<i64> = db
            .query_row(
                "SELECT id FROM accounts WHERE account_name = ?1",
                params![account_name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(EngineError::InvalidInput(format!(
                "account '{account_name}' already exists"
            )));
        }
        db.execute(
            "INSERT INTO accounts (account_name) VALUES (?1)",
            params![account_name],
        )?;
        let id = db.last_insert_rowid();
        let account = db.query_row(
            "SELECT id, account_name, created_at FROM accounts WHERE id = ?1",
            params![id],
            |row| {
                Ok(Account {
                    id: row.get(0)?,
                    account_name: row.get(1)?,
                    created_at: row.get(2)?,
                })
            },
        )?;
        Ok(account)
    }

    pub async fn list_accounts(&self) -> EngineResult<Vec<Account>> {
        let db = self.db.conn().lock().await;
        let mut stmt =
            db.prepare("SELECT id, account_name, created_at FROM accounts ORDER BY account_name")?;
        let rows = stmt.query_map([], |row| {
            Ok(Account {
                id: row.get(0)?,
                account_name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    /// Newest first.
    pub async fn list_logs(&self, task_id: i64, limit: usize) -> EngineResult<Vec<TaskLog>> {
        let db = self.db.conn().lock().await;
        let mut stmt = db.prepare(
            "SELECT id, task_id, status, message, log_path, output, started_at, finished_at
             FROM task_logs WHERE task_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![task_id, limit as i64], |row| {
            Ok(TaskLog {
                id: row.get(0)?,
                task_id: row.get(1)?,
                status: row.get(2)?,
                message: row.get(3)?,
                log_path: row.get(4)?,
                output: row.get(5)?,
                started_at: row.get(6)?,
                finished_at: row.get(7)?,
            })
        })?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        Ok(logs)
    }

    async fn require(&self, id: i64) -> EngineResult<Task> {
        TaskStore::get(self, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task {id}")))
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn list_enabled(&self) -> EngineResult<Vec<Task>> {
        let db = self.db.conn().lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t JOIN accounts a ON a.id = t.account_id
             WHERE t.enabled = 1 ORDER BY t.id"
        ))?;
        let rows = stmt.query_map([], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    async fn get(&self, id: i64) -> EngineResult<Option<Task>> {
        let db = self.db.conn().lock().await;
        let task = db
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks t JOIN accounts a ON a.id = t.account_id
                     WHERE t.id = ?1"
                ),
                params![id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }
}

fn ensure_account(db: &rusqlite::Connection, account_id: i64) -> EngineResult<()> {
    let found: Option<i64> = db
        .query_row(
            "SELECT id FROM accounts WHERE id = ?1",
            params![account_id],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(EngineError::NotFound(format!("account {account_id}"))),
    }
}

fn validate_name(name: &str) -> EngineResult<()> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "task name must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_account() -> (SqliteTaskStore, Account) {
        let store = SqliteTaskStore::new(Database::open_in_memory().unwrap());
        let account = store.create_account("alice").await.unwrap();
        (store, account)
    }

    #[tokio::test]
    async fn create_then_list_enabled_joins_account() {
        let (store, account) = store_with_account().await;
        let task = store
            .create(NewTask {
                name: "checkin".to_string(),
                cron: "08:30".to_string(),
                account_id: account.id,
                enabled: true,
            })
            .await
            .unwrap();
        assert_eq!(task.account_name, "alice");

        store
            .create(NewTask {
                name: "paused".to_string(),
                cron: "0 * * * *".to_string(),
                account_id: account.id,
                enabled: false,
            })
            .await
            .unwrap();

        let enabled = store.list_enabled().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, task.id);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn create_rejects_unknown_account() {
        let (store, _) = store_with_account().await;
        let err = store
            .create(NewTask {
                name: "x".to_string(),
                cron: "08:30".to_string(),
                account_id: 99,
                enabled: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn partial_update_keeps_other_fields() {
        let (store, account) = store_with_account().await;
        let task = store
            .create(NewTask {
                name: "checkin".to_string(),
                cron: "08:30".to_string(),
                account_id: account.id,
                enabled: true,
            })
            .await
            .unwrap();

        let updated = store
            .update(
                task.id,
                TaskPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.cron, "08:30");
        assert_eq!(updated.name, "checkin");

        let missing = store.update(999, TaskPatch::default()).await.unwrap_err();
        assert!(matches!(missing, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_went_away() {
        let (store, account) = store_with_account().await;
        let task = store
            .create(NewTask {
                name: "checkin".to_string(),
                cron: "08:30".to_string(),
                account_id: account.id,
                enabled: true,
            })
            .await
            .unwrap();
        assert!(store.delete(task.id).await.unwrap());
        assert!(!store.delete(task.id).await.unwrap());
        assert!(store.get(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_account_is_rejected() {
        let (store, _) = store_with_account().await;
        assert!(store.create_account("alice").await.is_err());
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);
    }
}
